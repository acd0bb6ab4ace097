//! Guard rails around the external scanner: reserved-range blacklists and
//! advisory checks on scan scope and cadence.

use std::path::Path;

use ipnet::Ipv4Net;
use tracing::{info, warn};

use super::ZmapConfig;

/// Commonly excluded reserved and special-purpose IPv4 ranges.
pub fn default_blacklist_ranges() -> &'static [&'static str] {
    &[
        "0.0.0.0/8",          // "this" network (RFC 1122)
        "10.0.0.0/8",         // private (RFC 1918)
        "100.64.0.0/10",      // shared address space (RFC 6598)
        "127.0.0.0/8",        // loopback (RFC 1122)
        "169.254.0.0/16",     // link local (RFC 3927)
        "172.16.0.0/12",      // private (RFC 1918)
        "192.0.0.0/24",       // IETF protocol assignments (RFC 6890)
        "192.0.2.0/24",       // TEST-NET-1 (RFC 5737)
        "192.168.0.0/16",     // private (RFC 1918)
        "198.18.0.0/15",      // benchmarking (RFC 2544)
        "198.51.100.0/24",    // TEST-NET-2 (RFC 5737)
        "203.0.113.0/24",     // TEST-NET-3 (RFC 5737)
        "224.0.0.0/4",        // multicast (RFC 3171)
        "240.0.0.0/4",        // reserved (RFC 1112)
        "255.255.255.255/32", // limited broadcast (RFC 919)
    ]
}

/// Load CIDR ranges from a blacklist file, skipping comments and lines that
/// fail to parse.
pub fn load_blacklist(path: &str) -> std::io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    let mut ranges = Vec::new();
    for (num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.parse::<Ipv4Net>().is_err() {
            warn!("invalid CIDR at {path}:{}: {line}", num + 1);
            continue;
        }
        ranges.push(line.to_string());
    }
    info!("loaded {} CIDR ranges from blacklist {path}", ranges.len());
    Ok(ranges)
}

/// Write a blacklist file seeded with the default reserved ranges.
pub fn create_blacklist_file(path: &str) -> std::io::Result<()> {
    if let Some(dir) = Path::new(path).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let mut out = String::from("# CIDR ranges excluded from scanning\n# one per line, # for comments\n\n");
    for cidr in default_blacklist_ranges() {
        out.push_str(cidr);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    info!("created default blacklist file: {path}");
    Ok(())
}

/// Reject malformed target ranges and warn about very broad ones. An empty
/// list means the whole IPv4 space; that is allowed but loudly flagged.
pub fn validate_targets(ranges: &[String]) -> Result<(), String> {
    if ranges.is_empty() {
        warn!("no target ranges specified - the scanner will sweep the entire IPv4 space");
        warn!("set zmap.target_ranges to limit scan scope");
        return Ok(());
    }

    for cidr in ranges {
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| format!("invalid CIDR: {cidr}"))?;
        let size = 1u64 << (32 - net.prefix_len());
        if size > 16_777_216 {
            warn!("large network scan: {cidr} ({size} addresses); ensure you are authorized");
        }
    }
    Ok(())
}

/// Non-fatal configuration advisories.
pub fn advisory_checks(config: &ZmapConfig) {
    if config.rate_limit > 50_000 {
        warn!(
            "high scan rate: {} pps may trigger network security alerts",
            config.rate_limit
        );
    }
    if config.blacklist.is_empty() {
        warn!("no blacklist files configured; reserved ranges will not be excluded");
    }
    if config.cooldown_seconds < 300 {
        warn!(
            "short scan cooldown: {}s; recommended 3600s",
            config.cooldown_seconds
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ranges_are_valid_cidrs() {
        for cidr in default_blacklist_ranges() {
            cidr.parse::<Ipv4Net>().unwrap();
        }
    }

    #[test]
    fn load_skips_comments_and_invalid_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.txt");
        std::fs::write(&path, "# comment\n\n10.0.0.0/8\nnot-a-cidr\n192.168.0.0/16\n").unwrap();

        let ranges = load_blacklist(path.to_str().unwrap()).unwrap();
        assert_eq!(ranges, vec!["10.0.0.0/8", "192.168.0.0/16"]);
    }

    #[test]
    fn created_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bl/zmap.txt");
        create_blacklist_file(path.to_str().unwrap()).unwrap();
        let ranges = load_blacklist(path.to_str().unwrap()).unwrap();
        assert_eq!(ranges.len(), default_blacklist_ranges().len());
    }

    #[test]
    fn validate_rejects_bad_cidr_and_allows_empty() {
        assert!(validate_targets(&[]).is_ok());
        assert!(validate_targets(&["192.0.2.0/24".into()]).is_ok());
        assert!(validate_targets(&["bogus".into()]).is_err());
    }
}

//! Raw SOCKS4/SOCKS5 client exchanges over an established TCP stream.
//!
//! Both run without authentication; targets are sent as hostnames so the
//! proxy resolves them (ATYP=domain for v5, the 0.0.0.1 marker for v4).

use anyhow::{bail, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Negotiate a SOCKS5 no-auth tunnel to `host:port`.
pub async fn socks5_tunnel(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    if host.len() > 255 {
        bail!("target hostname too long");
    }

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await?;
    if method != [0x05, 0x00] {
        bail!("socks5 method rejected");
    }

    let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x05 {
        bail!("socks5 malformed reply");
    }
    if reply[1] != 0x00 {
        bail!("socks5 connect refused: {:#04x}", reply[1]);
    }
    Ok(())
}

/// Negotiate a SOCKS4a tunnel to `host:port`.
pub async fn socks4_tunnel(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&port.to_be_bytes());
    // 0.0.0.1 destination marks the 4a form; the hostname trails the user id.
    req.extend_from_slice(&[0, 0, 0, 1]);
    req.push(0);
    req.extend_from_slice(host.as_bytes());
    req.push(0);
    stream.write_all(&req).await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x5a {
        bail!("socks4 connect refused: {:#04x}", reply[1]);
    }
    Ok(())
}

/// Issue a plain HTTP/1.1 GET through an established tunnel and return the
/// response status code.
pub async fn http_get_via_tunnel(stream: &mut TcpStream, host: &str, path: &str) -> Result<u16> {
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;

    let mut buf = [0u8; 256];
    let mut filled = 0;
    loop {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].contains(&b'\n') || filled == buf.len() {
            break;
        }
    }

    parse_status_line(&buf[..filled])
}

fn parse_status_line(head: &[u8]) -> Result<u16> {
    let line = std::str::from_utf8(head).unwrap_or("");
    if !line.starts_with("HTTP/1.") {
        bail!("not an HTTP response");
    }
    match line.split_whitespace().nth(1).and_then(|s| s.parse::<u16>().ok()) {
        Some(code) => Ok(code),
        None => bail!("malformed status line"),
    }
}

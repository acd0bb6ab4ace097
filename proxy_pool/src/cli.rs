use clap::Parser;

/// Command line options
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the JSON configuration document
    #[arg(long = "config", default_value = "config.json")]
    pub config: String,

    /// Log level filter, overriding the configured logging.level
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

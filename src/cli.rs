use clap::Parser;
use std::path::PathBuf;

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "HTTP:   rouille 3.6\n",
    "Images: image 0.25 (PNG)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Demo host: serves a test pattern window to browsers
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Plugin option as NAME=VALUE (can be specified multiple times)
    #[arg(short = 'o', long = "option", value_name = "NAME=VALUE", value_parser = parse_option)]
    pub options: Vec<(String, String)>,

    /// Print the supported plugin options and exit
    #[arg(long = "list-options")]
    pub list_options: bool,

    /// Number of windows to keep open
    #[arg(short = 'w', long = "windows", value_name = "N", default_value = "1")]
    pub windows: u64,

    /// Enable debug logging to file (default: frameway.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

/// Split `NAME=VALUE`; the value may be empty or contain further `=`.
fn parse_option(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

//! Plugin configuration parsed from `(name, value)` option pairs.
//!
//! # Options
//!
//! | Name               | Value                       | Default          |
//! |--------------------|-----------------------------|------------------|
//! | `http-listen-addr` | `IP:PORT`                   | `127.0.0.1:8080` |
//! | `http-max-threads` | positive integer            | `100`            |
//! | `http-auth`        | `USER:PASSWORD`, `env`, ``  | disabled         |
//! | `default-quality`  | rejected (not implemented)  |                  |
//!
//! Options are validated one at a time; the first bad one aborts parsing and
//! the error names it.
//!
//! # Used by
//!
//! - `core::context` - `Context::init()` builds its [`Config`] here
//! - `main.rs` - prints [`option_docs()`] for `--list-options`

use anyhow::{Result, anyhow, bail};
use std::net::SocketAddr;

pub const DEFAULT_HTTP_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_HTTP_MAX_THREADS: usize = 100;

/// Environment variable read when `http-auth` is set to `env`.
pub const HTTP_AUTH_ENV_VAR: &str = "HTTP_AUTH_CREDENTIALS";

/// Validated plugin configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub http_listen_addr: SocketAddr,
    pub http_max_threads: usize,
    /// `user:password` expected in HTTP Basic auth, `None` disables auth
    pub http_auth_credentials: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            http_max_threads: DEFAULT_HTTP_MAX_THREADS,
            http_auth_credentials: None,
        }
    }
}

impl Config {
    /// Parse option pairs on top of the defaults.
    ///
    /// Stops at the first unrecognized or invalid option.
    pub fn from_options<N, V>(options: impl IntoIterator<Item = (N, V)>) -> Result<Self>
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Config::default();

        for (name, value) in options {
            let name = name.as_ref();
            let value = value.as_ref();

            match name {
                "default-quality" => {
                    bail!("Option default-quality supported but not implemented");
                }
                "http-listen-addr" => {
                    config.http_listen_addr = value
                        .parse()
                        .map_err(|_| anyhow!("Invalid value '{}' for option http-listen-addr", value))?;
                }
                "http-max-threads" => {
                    config.http_max_threads = match value.parse::<usize>() {
                        Ok(n) if n > 0 => n,
                        _ => bail!("Invalid value '{}' for option http-max-threads", value),
                    };
                }
                "http-auth" => {
                    config.http_auth_credentials = parse_http_auth(value)?;
                }
                _ => bail!("Unrecognized option '{}'", name),
            }
        }

        Ok(config)
    }
}

/// Parse `http-auth`: empty disables auth, `env` reads [`HTTP_AUTH_ENV_VAR`].
fn parse_http_auth(value: &str) -> Result<Option<String>> {
    if value.is_empty() {
        return Ok(None);
    }

    let credentials = if value == "env" {
        std::env::var(HTTP_AUTH_ENV_VAR).map_err(|_| {
            anyhow!(
                "Option http-auth set to 'env' but environment variable {} is missing",
                HTTP_AUTH_ENV_VAR
            )
        })?
    } else {
        value.to_string()
    };

    // USER:PASSWORD with both parts nonempty
    match credentials.find(':') {
        Some(pos) if pos > 0 && pos + 1 < credentials.len() => Ok(Some(credentials)),
        _ => bail!("Invalid value for option http-auth"),
    }
}

/// Documentation row for one supported option
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionDoc {
    pub name: &'static str,
    pub value_placeholder: &'static str,
    pub description: &'static str,
    pub default_note: String,
}

/// Documentation for all options accepted by [`Config::from_options`].
pub fn option_docs() -> Vec<OptionDoc> {
    vec![
        OptionDoc {
            name: "default-quality",
            value_placeholder: "QUALITY",
            description: "initial image quality for each session (10..100 or PNG)",
            default_note: "default: PNG".to_string(),
        },
        OptionDoc {
            name: "http-listen-addr",
            value_placeholder: "IP:PORT",
            description: "bind address and port for the HTTP server",
            default_note: format!("default: {}", DEFAULT_HTTP_LISTEN_ADDR),
        },
        OptionDoc {
            name: "http-max-threads",
            value_placeholder: "COUNT",
            description: "maximum number of HTTP server threads",
            default_note: format!("default: {}", DEFAULT_HTTP_MAX_THREADS),
        },
        OptionDoc {
            name: "http-auth",
            value_placeholder: "USER:PASSWORD",
            description: "if nonempty, the client is required to authenticate using HTTP basic \
                          authentication with given username and password; if the special value \
                          'env' is specified, the value is read from the environment variable \
                          HTTP_AUTH_CREDENTIALS",
            default_note: "default empty".to_string(),
        },
    ]
}

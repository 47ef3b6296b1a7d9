//! Connection bootstrap file.
//!
//! Plain text, one `Key:Value` pair per line, keys matched without regard to
//! case:
//!
//! ```text
//! ServerAddress:192.168.1.20
//! RendezvousPort:13331
//! AutoStart:false
//! ```
//!
//! A missing or malformed file is never fatal. Missing files are replaced
//! with the defaults; bad lines are skipped and reported as warnings.

use crate::DEFAULT_RENDEZVOUS_PORT;
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Host of the rendezvous server.
    pub server_address: String,
    pub rendezvous_port: u16,
    /// Start the session without waiting for the user, and exit when it stops.
    pub auto_start: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            rendezvous_port: DEFAULT_RENDEZVOUS_PORT,
            auto_start: false,
        }
    }
}

impl ConnectionConfig {
    /// Parse leniently, returning the config and a warning per skipped line.
    pub fn parse(text: &str) -> (Self, Vec<String>) {
        let mut config = Self::default();
        let mut warnings = Vec::new();

        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                warnings.push(format!("line {}: expected Key:Value, got {line:?}", number + 1));
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "serveraddress" => config.server_address = value.to_string(),
                "rendezvousport" => match value.parse() {
                    Ok(port) => config.rendezvous_port = port,
                    Err(_) => warnings.push(format!("line {}: invalid port {value:?}", number + 1)),
                },
                "autostart" => match parse_bool(value) {
                    Some(flag) => config.auto_start = flag,
                    None => warnings.push(format!("line {}: invalid flag {value:?}", number + 1)),
                },
                other => warnings.push(format!("line {}: unknown key {other:?}", number + 1)),
            }
        }

        (config, warnings)
    }

    /// Read the file, or write the defaults when it does not exist.
    pub fn load_or_init(path: &Path) -> Result<(Self, Vec<String>), ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save(path)?;
                Ok((config, Vec::new()))
            }
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, self.to_string()).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

impl fmt::Display for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ServerAddress:{}", self.server_address)?;
        writeln!(f, "RendezvousPort:{}", self.rendezvous_port)?;
        writeln!(f, "AutoStart:{}", self.auto_start)
    }
}

impl FromStr for ConnectionConfig {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s).0)
    }
}

/// I/O failure reading or writing the connection file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: String, source: io::Error },
}

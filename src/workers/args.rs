//! Command-line arguments and `config.toml`.
//!
//! CLI values override those from the file. The file is looked up in the
//! working directory first, then in the data directory.

use crate::core::config::{default_ice_servers, IceServerConfig, DEFAULT_RELAY_URL};
use crate::utils::data_dir;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Linkdrop - peer-to-peer file transfer between devices in a relay room.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Signaling relay WebSocket URL.
    #[clap(long, global = true)]
    pub relay: Option<String>,

    /// Name announced to other devices.
    #[clap(long, global = true)]
    pub name: Option<String>,

    /// Extra STUN/TURN URL (repeatable). Replaces the configured list.
    #[clap(long = "ice-server", global = true)]
    pub ice_servers: Vec<String>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory for logs and configuration. Defaults to ~/.linkdrop/
    #[clap(long, global = true)]
    pub conf: Option<PathBuf>,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Send a file to a device in the room.
    Send {
        file: PathBuf,
        /// Target device id or name.
        #[clap(long)]
        to: String,
    },
    /// Wait for incoming files and save them.
    Receive {
        #[clap(long, default_value = ".")]
        out: PathBuf,
        /// Exit after the first received file.
        #[clap(long)]
        once: bool,
    },
    /// List devices currently in the room.
    Devices,
}

/// Contents of `config.toml`. Every key is optional.
#[derive(Deserialize, Default, Debug, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub relay: Option<String>,
    pub name: Option<String>,
    pub verbose: Option<u8>,
    pub ice_servers: Vec<IceServerConfig>,
}

/// Fully resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub command: Command,
    pub relay: String,
    pub name: Option<String>,
    pub verbose: u8,
    pub data_dir: PathBuf,
    pub ice_servers: Vec<IceServerConfig>,
}

impl Args {
    /// Parse the command line and merge it over `config.toml`.
    pub fn load() -> Result<Settings> {
        let mut cli = Args::parse();
        cli.conf = cli.conf.map(Self::resolve_path);
        let data_dir = data_dir::resolve(cli.conf.as_deref())?;

        let file = [PathBuf::from("config.toml"), data_dir.join("config.toml")]
            .iter()
            .find(|p| p.exists())
            .map(|p| FileConfig::load(p))
            .transpose()?
            .unwrap_or_default();

        Ok(Self::merge(file, cli, data_dir))
    }

    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    fn merge(file: FileConfig, cli: Args, data_dir: PathBuf) -> Settings {
        let ice_servers = if !cli.ice_servers.is_empty() {
            cli.ice_servers.into_iter().map(IceServerConfig::stun).collect()
        } else if !file.ice_servers.is_empty() {
            file.ice_servers
        } else {
            default_ice_servers()
        };
        Settings {
            command: cli.command,
            relay: cli
                .relay
                .or(file.relay)
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            name: cli.name.or(file.name),
            verbose: if cli.verbose > 0 {
                cli.verbose
            } else {
                file.verbose.unwrap_or(0)
            },
            data_dir,
            ice_servers,
        }
    }
}

impl FileConfig {
    fn load(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parse {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
relay = "wss://relay.example.org"
name = "office-pc"
verbose = 1

[[ice_servers]]
urls = ["stun:stun.example.org:3478"]

[[ice_servers]]
urls = ["turn:turn.example.org:3478"]
username = "alice"
credential = "secret"
"#;

    fn cli(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_file_config_parses_ice_servers() {
        let file: FileConfig = toml::from_str(FILE).unwrap();
        assert_eq!(file.ice_servers.len(), 2);
        assert_eq!(file.ice_servers[1].username, "alice");
        assert_eq!(file.ice_servers[0].credential, "");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: FileConfig = toml::from_str(FILE).unwrap();
        let args = cli(&[
            "linkdrop",
            "send",
            "a.txt",
            "--to",
            "phone",
            "--relay",
            "ws://localhost:9000",
            "-vv",
        ]);
        let s = Args::merge(file, args, PathBuf::from("/data"));
        assert_eq!(s.relay, "ws://localhost:9000");
        assert_eq!(s.name.as_deref(), Some("office-pc"));
        assert_eq!(s.verbose, 2);
        assert_eq!(s.ice_servers.len(), 2);
        assert_eq!(
            s.command,
            Command::Send {
                file: PathBuf::from("a.txt"),
                to: "phone".into()
            }
        );
    }

    #[test]
    fn test_defaults_without_file() {
        let args = cli(&["linkdrop", "receive", "--ice-server", "stun:local:3478"]);
        let s = Args::merge(FileConfig::default(), args, PathBuf::from("/data"));
        assert_eq!(s.relay, DEFAULT_RELAY_URL);
        assert_eq!(s.verbose, 0);
        assert_eq!(s.ice_servers, vec![IceServerConfig::stun("stun:local:3478")]);
        assert_eq!(
            s.command,
            Command::Receive {
                out: PathBuf::from("."),
                once: false
            }
        );
    }

    #[test]
    fn test_default_ice_servers_fallback() {
        let args = cli(&["linkdrop", "devices"]);
        let s = Args::merge(FileConfig::default(), args, PathBuf::from("/data"));
        assert_eq!(s.ice_servers, default_ice_servers());
    }
}

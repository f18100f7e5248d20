//! Command-line and config-file handling.
//!
//! `<ip> <port>` are positional but may also come from the INI-style
//! `storage-server.conf` inside the data dir; CLI values win over the
//! file. The daemon RPC port defaults by network.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Exit code for a port collision with the daemon RPC port.
pub const EXIT_INVALID_PORT: i32 = 2;

const CONFIG_FILE_NAME: &str = "storage-server.conf";

#[derive(Parser, Debug, Default)]
#[command(
    name = "storage-server",
    version,
    about = "Service node storage server",
    arg_required_else_help = false
)]
pub struct Args {
    /// IP to listen on
    pub ip: Option<String>,

    /// Port to listen on
    pub port: Option<u16>,

    /// Path to persistent data (defaults to ~/.arqma/storage)
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Path to a custom config file (defaults to `storage-server.conf`
    /// inside the data dir)
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long)]
    pub log_level: Option<String>,

    /// RPC IP of the local chain daemon
    #[arg(long)]
    pub arqmad_rpc_ip: Option<String>,

    /// RPC port of the local chain daemon
    #[arg(long)]
    pub arqmad_rpc_port: Option<u16>,

    /// Start in stagenet mode
    #[arg(long)]
    pub stagenet: bool,

    /// Ignore the initialization readiness check
    #[arg(long)]
    pub force_start: bool,
}

/// Fully resolved options after merging CLI, config file and defaults.
#[derive(Debug, Clone)]
pub struct Options {
    pub ip: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub arqmad_rpc_ip: String,
    pub arqmad_rpc_port: u16,
    pub stagenet: bool,
    pub force_start: bool,
}

fn default_data_dir(stagenet: bool) -> Result<PathBuf> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("could not determine the home directory, pass --data-dir"))?;
    let base = home.join(".arqma");
    Ok(if stagenet {
        base.join("stagenet").join("storage")
    } else {
        base.join("storage")
    })
}

/// Parse an INI-style `key=value` file. `#` and `;` start comments.
fn parse_config_file(path: &Path) -> Result<HashMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("could not read config file {}", path.display()))?;
    let mut values = HashMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("{}:{}: expected key=value", path.display(), lineno + 1))?;
        values.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(values)
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw, "1" | "true" | "yes" | "on")
}

impl Options {
    pub fn resolve(args: Args) -> Result<Self> {
        let mut stagenet = args.stagenet;

        // the data dir must be known before the default config path is
        let data_dir = match &args.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir(stagenet)?,
        };

        let file_values = match &args.config_file {
            Some(path) => {
                if !path.exists() {
                    bail!("path provided in --config-file does not exist");
                }
                parse_config_file(path)?
            }
            None => {
                let default_path = data_dir.join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    parse_config_file(&default_path)?
                } else {
                    HashMap::new()
                }
            }
        };

        let from_file = |key: &str| file_values.get(key).cloned();

        if !stagenet {
            stagenet = from_file("stagenet").map(|v| parse_bool(&v)).unwrap_or(false);
        }
        let params = common::NetworkParams::new(if stagenet {
            common::Network::Stagenet
        } else {
            common::Network::Mainnet
        });

        let ip = args
            .ip
            .or_else(|| from_file("ip"))
            .ok_or_else(|| anyhow!("address and/or port missing"))?;
        let port = match args.port {
            Some(port) => port,
            None => from_file("port")
                .ok_or_else(|| anyhow!("address and/or port missing"))?
                .parse()
                .context("invalid port in config file")?,
        };

        let arqmad_rpc_ip = args
            .arqmad_rpc_ip
            .or_else(|| from_file("arqmad-rpc-ip"))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let arqmad_rpc_port = match args.arqmad_rpc_port {
            Some(port) => port,
            None => match from_file("arqmad-rpc-port") {
                Some(raw) => raw.parse().context("invalid arqmad-rpc-port")?,
                None => params.default_daemon_rpc_port,
            },
        };

        let log_level = args
            .log_level
            .or_else(|| from_file("log-level"))
            .unwrap_or_else(|| "info".to_string());

        let force_start = args.force_start
            || from_file("force-start")
                .map(|v| parse_bool(&v))
                .unwrap_or(false);

        Ok(Self {
            ip,
            port,
            data_dir,
            log_level,
            arqmad_rpc_ip,
            arqmad_rpc_port,
            stagenet,
            force_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(ip: Option<&str>, port: Option<u16>) -> Args {
        Args {
            ip: ip.map(str::to_string),
            port,
            data_dir: Some(PathBuf::from("/tmp/test-storage")),
            ..Args::default()
        }
    }

    #[test]
    fn test_defaults_resolve_by_network() {
        let opts = Options::resolve(args(Some("1.2.3.4"), Some(22021))).unwrap();
        assert_eq!(opts.arqmad_rpc_ip, "127.0.0.1");
        assert_eq!(opts.arqmad_rpc_port, 19994);
        assert_eq!(opts.log_level, "info");
        assert!(!opts.force_start);

        let mut stage = args(Some("1.2.3.4"), Some(22021));
        stage.stagenet = true;
        let opts = Options::resolve(stage).unwrap();
        assert_eq!(opts.arqmad_rpc_port, 39994);
    }

    #[test]
    fn test_missing_ip_or_port_fails() {
        assert!(Options::resolve(args(None, Some(22021))).is_err());
        assert!(Options::resolve(args(Some("1.2.3.4"), None)).is_err());
    }

    #[test]
    fn test_config_file_fills_unset_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# listener").unwrap();
        writeln!(file, "ip = 9.8.7.6").unwrap();
        writeln!(file, "port = 22021").unwrap();
        writeln!(file, "arqmad-rpc-port = 12345").unwrap();
        writeln!(file, "force-start = true").unwrap();

        let mut a = args(None, None);
        a.config_file = Some(path);
        let opts = Options::resolve(a).unwrap();
        assert_eq!(opts.ip, "9.8.7.6");
        assert_eq!(opts.port, 22021);
        assert_eq!(opts.arqmad_rpc_port, 12345);
        assert!(opts.force_start);
    }

    #[test]
    fn test_cli_wins_over_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.conf");
        std::fs::write(&path, "ip=9.8.7.6\nport=1111\n").unwrap();

        let mut a = args(Some("1.2.3.4"), Some(22021));
        a.config_file = Some(path);
        let opts = Options::resolve(a).unwrap();
        assert_eq!(opts.ip, "1.2.3.4");
        assert_eq!(opts.port, 22021);
    }

    #[test]
    fn test_nonexistent_config_file_is_an_error() {
        let mut a = args(Some("1.2.3.4"), Some(22021));
        a.config_file = Some(PathBuf::from("/does/not/exist.conf"));
        assert!(Options::resolve(a).is_err());
    }
}

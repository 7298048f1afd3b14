//! Configuration (§6, SPEC_FULL §10): command-line options and the
//! bootstrap file format nodes use to discover each other's address.

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("num-routes must be greater than 0")]
    InvalidNumRoutes,
    #[error("failed to read predecessor file {path}: {source}")]
    PredFileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("predecessor file {path} is malformed: expected \"<ip> <port>\"")]
    PredFileMalformed { path: PathBuf },
    #[error("failed to write bootstrap file {path}: {source}")]
    CfgFileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Command-line options (§6 "Configuration").
#[derive(Debug, Parser)]
#[command(name = "dht-node", about = "A chord-style DHT node")]
pub struct Config {
    /// Bind address for this node's UDP socket.
    #[arg(long)]
    pub my_ip: SocketAddr,

    /// Routing table capacity; must be greater than 0.
    #[arg(long)]
    pub num_routes: usize,

    /// Path this node writes its own "<ip> <port>" bootstrap line to.
    #[arg(long)]
    pub cfg_file: PathBuf,

    /// Enable the read-through reply cache.
    #[arg(long, default_value_t = false)]
    pub cache: bool,

    /// Echo every received/sent packet and routing table change to the log.
    #[arg(long, default_value_t = false)]
    pub debug: bool,

    /// Predecessor's bootstrap file; when set, this node joins an existing
    /// ring instead of starting a new one.
    #[arg(long)]
    pub pred_file: Option<PathBuf>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_routes == 0 {
            return Err(ConfigError::InvalidNumRoutes);
        }
        Ok(())
    }

    /// Writes this node's `<ip> <port>` bootstrap line (§6 "Bootstrap").
    pub fn write_bootstrap_file(&self) -> Result<(), ConfigError> {
        let contents = format!("{} {}\n", self.my_ip.ip(), self.my_ip.port());
        fs::write(&self.cfg_file, contents).map_err(|source| ConfigError::CfgFileWrite {
            path: self.cfg_file.clone(),
            source,
        })
    }

    /// Reads a predecessor's bootstrap address out of `pred_file`.
    pub fn read_predecessor(&self) -> Result<Option<SocketAddr>, ConfigError> {
        let Some(path) = &self.pred_file else {
            return Ok(None);
        };
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::PredFileRead {
            path: path.clone(),
            source,
        })?;
        let (ip, port) = contents
            .trim()
            .split_once(' ')
            .ok_or_else(|| ConfigError::PredFileMalformed { path: path.clone() })?;
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| ConfigError::PredFileMalformed { path: path.clone() })?;
        Ok(Some(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(cfg_file: PathBuf) -> Config {
        Config {
            my_ip: "127.0.0.1:9000".parse().unwrap(),
            num_routes: 4,
            cfg_file,
            cache: false,
            debug: false,
            pred_file: None,
        }
    }

    #[test]
    fn validate_rejects_zero_num_routes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = base_config(dir.path().join("a.cfg"));
        cfg.num_routes = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidNumRoutes)));
    }

    #[test]
    fn validate_accepts_positive_num_routes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path().join("a.cfg"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn write_then_read_bootstrap_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("a.cfg");
        let cfg = base_config(cfg_path.clone());
        cfg.write_bootstrap_file().unwrap();

        let mut joiner = base_config(dir.path().join("b.cfg"));
        joiner.pred_file = Some(cfg_path);
        let pred = joiner.read_predecessor().unwrap();
        assert_eq!(pred, Some("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn read_predecessor_is_none_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = base_config(dir.path().join("a.cfg"));
        assert_eq!(cfg.read_predecessor().unwrap(), None);
    }

    #[test]
    fn read_predecessor_errors_on_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let pred_path = dir.path().join("bad.cfg");
        fs::write(&pred_path, "not-an-address\n").unwrap();
        let mut cfg = base_config(dir.path().join("a.cfg"));
        cfg.pred_file = Some(pred_path);
        assert!(matches!(cfg.read_predecessor(), Err(ConfigError::PredFileMalformed { .. })));
    }
}

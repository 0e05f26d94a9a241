//! Node configuration: CLI flags over an optional TOML file over defaults.
//!
//! The config file lives at `<datadir>/coinbasechain.toml` and mirrors the
//! CLI flags. Unknown keys are a startup error, not a silent ignore.

use crate::consensus::params::{ChainParams, Network};
use crate::errors::{NodeError, NodeResult};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

pub const CONFIG_FILE: &str = "coinbasechain.toml";

#[derive(Debug, Clone, Parser)]
#[command(name = "coinbasechain", version, about = "Headers-only proof-of-work blockchain node")]
pub struct Cli {
    /// Data directory (headers, peers, ban list, anchors)
    #[arg(long)]
    pub datadir: Option<PathBuf>,

    /// Accept inbound connections
    #[arg(long)]
    pub listen: Option<bool>,

    /// P2P listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// RPC listen port
    #[arg(long)]
    pub rpc_port: Option<u16>,

    /// Validation worker threads (0 = one per core)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Use the regression test chain
    #[arg(long, default_value_t = false)]
    pub regtest: bool,

    /// Use the test network
    #[arg(long, default_value_t = false)]
    pub testnet: bool,

    /// Log level: error, warn, info, debug, trace
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Per-component debug logging (repeatable), e.g. --debug net
    #[arg(long)]
    pub debug: Vec<String>,

    /// Connect to this peer at startup (repeatable), host:port
    #[arg(long)]
    pub connect: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<bool>,
    port: Option<u16>,
    rpc_port: Option<u16>,
    threads: Option<usize>,
    loglevel: Option<String>,
    debug: Option<Vec<String>>,
    connect: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub datadir: PathBuf,
    pub listen: bool,
    pub port: u16,
    pub rpc_port: u16,
    pub threads: usize,
    pub loglevel: String,
    pub debug: Vec<String>,
    pub connect: Vec<String>,
}

impl Config {
    pub fn resolve(cli: Cli) -> NodeResult<Config> {
        let network = match (cli.regtest, cli.testnet) {
            (true, true) => {
                return Err(NodeError::Config(
                    "--regtest and --testnet are mutually exclusive".into(),
                ))
            }
            (true, false) => Network::Regtest,
            (false, true) => Network::Testnet,
            (false, false) => Network::Mainnet,
        };
        let params = ChainParams::for_network(network);

        let datadir = match cli.datadir {
            Some(dir) => dir,
            None => default_datadir(network),
        };
        std::fs::create_dir_all(&datadir)
            .map_err(|e| NodeError::Config(format!("cannot create datadir: {e}")))?;

        let file = load_file_config(&datadir)?;

        let threads = cli
            .threads
            .or(file.threads)
            .filter(|&t| t > 0)
            .unwrap_or_else(num_cpus::get);

        Ok(Config {
            network,
            datadir,
            listen: cli.listen.or(file.listen).unwrap_or(true),
            port: cli.port.or(file.port).unwrap_or(params.default_port),
            rpc_port: cli
                .rpc_port
                .or(file.rpc_port)
                .unwrap_or(params.default_rpc_port),
            threads,
            loglevel: cli
                .loglevel
                .or(file.loglevel)
                .unwrap_or_else(|| "info".into()),
            debug: if cli.debug.is_empty() {
                file.debug.unwrap_or_default()
            } else {
                cli.debug
            },
            connect: if cli.connect.is_empty() {
                file.connect.unwrap_or_default()
            } else {
                cli.connect
            },
        })
    }

    pub fn params(&self) -> ChainParams {
        ChainParams::for_network(self.network)
    }

    /// Directive string for tracing's EnvFilter: the base level plus any
    /// per-component debug overrides.
    pub fn log_filter(&self) -> String {
        let mut filter = self.loglevel.clone();
        for component in &self.debug {
            filter.push_str(&format!(",coinbasechain::{component}=debug"));
        }
        filter
    }
}

fn default_datadir(network: Network) -> PathBuf {
    let base = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coinbasechain");
    match network {
        Network::Mainnet => base,
        Network::Testnet => base.join("testnet"),
        Network::Regtest => base.join("regtest"),
    }
}

fn load_file_config(datadir: &std::path::Path) -> NodeResult<FileConfig> {
    let path = datadir.join(CONFIG_FILE);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(e) => return Err(NodeError::Config(format!("cannot read {CONFIG_FILE}: {e}"))),
    };
    toml::from_str(&text).map_err(|e| NodeError::Config(format!("bad {CONFIG_FILE}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("coinbasechain").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_for_regtest() {
        let dir = tempfile::tempdir().unwrap();
        let args = ["--regtest", "--datadir", dir.path().to_str().unwrap()];
        let config = Config::resolve(cli(&args)).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.port, 29590);
        assert_eq!(config.rpc_port, 29591);
        assert!(config.listen);
        assert!(config.threads > 0);
    }

    #[test]
    fn both_networks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let args = [
            "--regtest",
            "--testnet",
            "--datadir",
            dir.path().to_str().unwrap(),
        ];
        assert!(Config::resolve(cli(&args)).is_err());
    }

    #[test]
    fn file_config_applies_and_cli_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "port = 1111\nloglevel = \"debug\"\n",
        )
        .unwrap();
        let args = [
            "--regtest",
            "--datadir",
            dir.path().to_str().unwrap(),
            "--port",
            "2222",
        ];
        let config = Config::resolve(cli(&args)).unwrap();
        assert_eq!(config.port, 2222); // cli beats file
        assert_eq!(config.loglevel, "debug"); // file beats default
    }

    #[test]
    fn unknown_file_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "no_such_option = true\n").unwrap();
        let args = ["--regtest", "--datadir", dir.path().to_str().unwrap()];
        assert!(Config::resolve(cli(&args)).is_err());
    }

    #[test]
    fn debug_components_in_filter() {
        let dir = tempfile::tempdir().unwrap();
        let args = [
            "--regtest",
            "--datadir",
            dir.path().to_str().unwrap(),
            "--debug",
            "net",
            "--debug",
            "chain",
        ];
        let config = Config::resolve(cli(&args)).unwrap();
        let filter = config.log_filter();
        assert!(filter.contains("coinbasechain::net=debug"));
        assert!(filter.contains("coinbasechain::chain=debug"));
    }
}

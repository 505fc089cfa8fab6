use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use fluxd_consensus::params::Network;

use crate::logging;

const DEFAULT_DATA_DIR: &str = "data";
const CONF_FILE_NAME: &str = "flux.conf";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    ImportMulti {
        requests: String,
        options: Option<String>,
    },
    WalletInfo,
    NotifyTx {
        raw_tx: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log: logging::LogConfig,
    pub debug_categories: Vec<String>,
    pub zmq_wallet_raw_tx: Option<String>,
    pub zmq_wallet_hash_tx: Option<String>,
    pub command: Command,
}

#[derive(Clone, Debug)]
pub enum CliAction {
    PrintHelp,
    Run(Box<Config>),
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut debug_categories: Vec<String> = Vec::new();
    let mut zmq_wallet_raw_tx: Option<String> = None;
    let mut zmq_wallet_hash_tx: Option<String> = None;
    let mut positional: Vec<String> = Vec::new();

    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" | "help" => return Ok(CliAction::PrintHelp),
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
                network_set = true;
            }
            "--testnet" => {
                network = Network::Testnet;
                network_set = true;
            }
            "--regtest" => {
                network = Network::Regtest;
                network_set = true;
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--no-log-timestamps" => log_timestamps = false,
            "--debug" => debug_categories.push(next_value(&mut args, "--debug")?),
            "--zmqpubwalletrawtx" => {
                zmq_wallet_raw_tx = Some(next_value(&mut args, "--zmqpubwalletrawtx")?);
            }
            "--zmqpubwallethashtx" => {
                zmq_wallet_hash_tx = Some(next_value(&mut args, "--zmqpubwallethashtx")?);
            }
            other if other.starts_with("--") => {
                return Err(format!("unknown option {other}\n{}", usage()));
            }
            _ => positional.push(arg),
        }
    }

    let command = parse_command(positional)?;

    let data_dir_set = data_dir.is_some();
    let mut data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));

    if let Some(conf) = load_flux_conf(&conf_path)? {
        for (key, values) in &conf {
            let Some(value) = values.last() else {
                continue;
            };
            match key.as_str() {
                "testnet" | "regtest" if !network_set => {
                    let enabled = parse_conf_bool(value)
                        .ok_or_else(|| format!("invalid {key} value '{value}' in conf"))?;
                    if enabled {
                        network = if key == "testnet" {
                            Network::Testnet
                        } else {
                            Network::Regtest
                        };
                    }
                }
                "datadir" if !data_dir_set => {
                    data_dir = PathBuf::from(value);
                }
                "loglevel" if !log_level_set => {
                    log_level = logging::Level::parse(value)
                        .ok_or_else(|| format!("invalid loglevel '{value}' in conf"))?;
                }
                "logformat" if !log_format_set => {
                    log_format = logging::Format::parse(value)
                        .ok_or_else(|| format!("invalid logformat '{value}' in conf"))?;
                }
                "debug" => debug_categories.extend(values.iter().cloned()),
                "zmqpubwalletrawtx" if zmq_wallet_raw_tx.is_none() => {
                    zmq_wallet_raw_tx = Some(value.clone());
                }
                "zmqpubwallethashtx" if zmq_wallet_hash_tx.is_none() => {
                    zmq_wallet_hash_tx = Some(value.clone());
                }
                _ => {}
            }
        }
    }

    Ok(CliAction::Run(Box::new(Config {
        backend,
        data_dir,
        conf_path,
        network,
        log: logging::LogConfig {
            level: log_level,
            format: log_format,
            timestamps: log_timestamps,
        },
        debug_categories,
        zmq_wallet_raw_tx,
        zmq_wallet_hash_tx,
        command,
    })))
}

fn next_value<I>(args: &mut I, option: &str) -> Result<String, String>
where
    I: Iterator<Item = String>,
{
    args.next()
        .ok_or_else(|| format!("missing value for {option}\n{}", usage()))
}

fn parse_command(positional: Vec<String>) -> Result<Command, String> {
    let mut positional = positional.into_iter();
    let Some(name) = positional.next() else {
        return Err(format!("missing command\n{}", usage()));
    };
    let rest: Vec<String> = positional.collect();
    match (name.as_str(), rest.len()) {
        ("importmulti", 1 | 2) => {
            let mut rest = rest.into_iter();
            let requests = rest.next().unwrap_or_default();
            Ok(Command::ImportMulti {
                requests,
                options: rest.next(),
            })
        }
        ("walletinfo", 0) => Ok(Command::WalletInfo),
        ("notifytx", 1) => Ok(Command::NotifyTx {
            raw_tx: rest.into_iter().next().unwrap_or_default(),
        }),
        ("importmulti" | "walletinfo" | "notifytx", _) => {
            Err(format!("wrong number of arguments for {name}\n{}", usage()))
        }
        _ => Err(format!("unknown command {name}\n{}", usage())),
    }
}

pub fn load_flux_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  fluxd-wallet [options] <command> [args]",
        "",
        "Commands:",
        "  importmulti <requests-json> [options-json]  Import keys, addresses and scripts",
        "  walletinfo                                  Print wallet counters as JSON",
        "  notifytx <rawtx-hex>                        Run the wallet notifiers once and print messages",
        "  help                                        Print this help and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/flux.conf)",
        "  --network  mainnet|testnet|regtest (default: mainnet)",
        "  --testnet  Alias for --network testnet",
        "  --regtest  Alias for --network regtest",
        "  --backend  Storage backend to use: memory|fjall (default: fjall)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --debug  Enable a debug category, e.g. zmq (repeatable)",
        "  --zmqpubwalletrawtx  Enable the walletrawtx notifier for <address>",
        "  --zmqpubwallethashtx  Enable the wallethashtx notifier for <address>",
    ]
    .join("\n")
}

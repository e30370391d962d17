/*!
config.rs - explicit runtime configuration.

`Config` is built once from the global command-line flags, optionally filled in from a
YAML file (`--config` / `IOTHUB_DEVICE_CONFIG`), and handed to every command.

Precedence: command-line flag > config file > built-in default.

The file may hold the x509 fields, transport, CA bundle and output settings. It can
not hold the connection string; that only ever comes from the environment.

Example file:
  transport: mqtt
  device_id: dev-1
  hostname: myhub.azure-devices.net
  tls_cert: /etc/iothub/dev-1.pem
  tls_key: /etc/iothub/dev-1.key
  compress: true
*/

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::session::auth::AuthInputs;

pub const CONFIG_ENV: &str = "IOTHUB_DEVICE_CONFIG";
pub const DEFAULT_TRANSPORT: &str = "mqtt";
pub const DEFAULT_CA_FILE: &str = "/etc/ssl/certs/ca-certificates.crt";

/* ---- Command-line flags ---- */

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Transport to use <mqtt|amqp|http> [default: mqtt]
    #[arg(long, global = true, value_name = "NAME")]
    pub transport: Option<String>,

    /// Compress data (remove JSON indentations)
    #[arg(long, global = true)]
    pub compress: bool,

    /// Path to x509 cert file
    #[arg(long = "tls-cert", global = true, value_name = "PATH")]
    pub tls_cert: Option<String>,

    /// Path to x509 key file
    #[arg(long = "tls-key", global = true, value_name = "PATH")]
    pub tls_key: Option<String>,

    /// Device id, required for x509
    #[arg(long = "device-id", global = true, value_name = "ID")]
    pub device_id: Option<String>,

    /// Hostname to connect to, required for x509
    #[arg(long, global = true, value_name = "HOST")]
    pub hostname: Option<String>,

    /// PEM bundle used to verify the hub certificate
    #[arg(long = "ca-file", global = true, value_name = "PATH")]
    pub ca_file: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, global = true, env = CONFIG_ENV, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/* ---- Config file ---- */

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub transport: Option<String>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub device_id: Option<String>,
    pub hostname: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub compress: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            Error::config(format!("failed to parse config file {}: {e}", path.display()))
        })
    }
}

/* ---- Resolved configuration ---- */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Transport name, resolved later by the transport selector.
    pub transport: String,
    pub auth: AuthInputs,
    pub ca_file: PathBuf,
    pub compress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: DEFAULT_TRANSPORT.to_string(),
            auth: AuthInputs::default(),
            ca_file: PathBuf::from(DEFAULT_CA_FILE),
            compress: false,
        }
    }
}

impl Config {
    /// Build from flags, loading the config file they point at (if any).
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(args, file))
    }

    /// Flag values win; the file only fills what the flags left unset.
    pub fn merge(args: &GlobalArgs, file: FileConfig) -> Self {
        let defaults = Config::default();
        Config {
            transport: args
                .transport
                .clone()
                .or(file.transport)
                .unwrap_or(defaults.transport),
            auth: AuthInputs {
                tls_cert: args.tls_cert.clone().or(file.tls_cert),
                tls_key: args.tls_key.clone().or(file.tls_key),
                device_id: args.device_id.clone().or(file.device_id),
                hostname: args.hostname.clone().or(file.hostname),
            },
            ca_file: args
                .ca_file
                .clone()
                .or(file.ca_file)
                .unwrap_or(defaults.ca_file),
            compress: args.compress || file.compress.unwrap_or(defaults.compress),
        }
    }
}

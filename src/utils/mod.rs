//! Utilities: logging setup (level from -v / --debug), JSON record output,
//! KEY VALUE argument pairs.
//!
//! Key items:
//!   init_logging / derive_level
//!   output::{render_json, write_record}
//!   args::pairs_to_map

/// Logging helpers.
pub mod logging {
    use tracing_subscriber::EnvFilter;

    #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
    pub enum LogLevel {
        Warn = 0,
        Info = 1,
        Debug = 2,
        Trace = 3,
    }

    impl LogLevel {
        pub fn as_str(&self) -> &'static str {
            match self {
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    /// `-v` count to level; `--debug` means at least `Debug`.
    pub fn derive_level(verbose: u8, debug: bool) -> LogLevel {
        let level = match verbose {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        };
        if debug {
            level.max(LogLevel::Debug)
        } else {
            level
        }
    }

    /// Filter directive: our own crate at `level`, the MQTT client only when debugging.
    pub fn filter_directive(level: LogLevel, debug: bool) -> String {
        let mqtt = if debug { level.as_str() } else { "warn" };
        format!("warn,iothub_device={},rumqttc={mqtt}", level.as_str())
    }

    /// Install the global subscriber. Logs go to stderr; stdout carries records only.
    /// `RUST_LOG` takes precedence over the derived level.
    pub fn init_logging(level: LogLevel, debug: bool) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(filter_directive(level, debug)));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    }
}

pub use logging::{derive_level, init_logging};

/// Record output. Each record is one self-contained JSON document.
pub mod output {
    use serde::Serialize;
    use tokio::io::{AsyncWrite, AsyncWriteExt};

    use crate::error::{Error, Result};

    /// Render `value` as JSON, indented unless `compress`.
    pub fn render_json<T: Serialize + ?Sized>(value: &T, compress: bool) -> Result<String> {
        let rendered = if compress {
            serde_json::to_string(value)
        } else {
            serde_json::to_string_pretty(value)
        };
        rendered.map_err(|source| Error::Encode {
            what: "record",
            source,
        })
    }

    /// Render and write one record followed by a newline, flushing immediately.
    pub async fn write_record<W, T>(out: &mut W, value: &T, compress: bool) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
        T: Serialize + ?Sized,
    {
        let mut text = render_json(value, compress)?;
        text.push('\n');
        out.write_all(text.as_bytes()).await.map_err(Error::Output)?;
        out.flush().await.map_err(Error::Output)
    }
}

/// Positional KEY VALUE pairs.
pub mod args {
    use std::collections::BTreeMap;

    use crate::error::{Error, Result};

    /// Fold `[k1, v1, k2, v2, ...]` into a map; later duplicates win.
    pub fn pairs_to_map(args: &[String]) -> Result<BTreeMap<String, String>> {
        if args.len() % 2 != 0 {
            return Err(Error::InvalidUsage(format!(
                "expected KEY VALUE pairs, got an odd number of arguments ({})",
                args.len()
            )));
        }
        Ok(args
            .chunks_exact(2)
            .map(|kv| (kv[0].clone(), kv[1].clone()))
            .collect())
    }
}

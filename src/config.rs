//! Typed process configuration: environment variables, with an optional
//! TOML file layered underneath via the `config` crate.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "gpushare-scheduler-extender")]
pub struct Config {
    /// HTTP listen port.
    #[arg(long, env = "PORT", default_value_t = 39999)]
    pub port: u16,

    /// Reconciler worker pool size.
    #[arg(long, env = "THREADNESS", default_value_t = num_cpus::get())]
    pub threadness: usize,

    /// `trace` | `debug` | `info` | `warn` | `error`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Path to cluster credentials; empty uses in-cluster config.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Optional TOML file layered under the environment variables above.
    #[arg(long, env = "GPUSHARE_CONFIG")]
    pub gpushare_config: Option<PathBuf>,
}

/// Values a TOML file (named by `GPUSHARE_CONFIG`) may override. Any field
/// left out of the file keeps the CLI/env-derived value.
#[derive(Deserialize, Default)]
struct FileOverrides {
    port: Option<u16>,
    threadness: Option<usize>,
    log_level: Option<String>,
}

impl Config {
    /// Parses CLI args/env vars, then layers an optional TOML file on top
    /// if `GPUSHARE_CONFIG` points at one.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = Config::parse();
        if let Some(path) = &cfg.gpushare_config {
            let settings = config::Config::builder()
                .add_source(config::File::from(path.as_path()))
                .build()?;
            let overrides: FileOverrides = settings.try_deserialize().unwrap_or_default();
            if let Some(port) = overrides.port {
                cfg.port = port;
            }
            if let Some(threadness) = overrides.threadness {
                cfg.threadness = threadness;
            }
            if let Some(log_level) = overrides.log_level {
                cfg.log_level = log_level;
            }
        }
        Ok(cfg)
    }
}

//! Configuration for the simulation server.
//!
//! Sources are merged in increasing priority:
//!
//! 1. the YAML file named by `-f/--config` (optional, skipped when absent)
//! 2. `MCHPAY_`-prefixed environment variables, e.g. `MCHPAY_API_KEY`, `MCHPAY_NOTIFY_DELAY_SECS`
//! 3. command-line flags
//!
//! ```yaml
//! addr: "0.0.0.0:18080"
//! api_key: "192006250b4c09247ec02edce69f6a2d"
//! notify_delay_secs: 10
//! # optional; unset leaves callback POSTs on the HTTP client's defaults
//! notify_timeout_secs: 30
//! ```
//!
//! The server refuses to start without an API key.

use std::time::Duration;

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Simulated merchant payment API with delayed result notifications")]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "MCHPAY_CONFIG", default_value = "mchpay.yaml")]
    pub config: String,

    /// Address to listen on
    #[arg(long)]
    pub addr: Option<String>,

    /// Shared secret used to verify requests and sign responses
    #[arg(long)]
    pub api_key: Option<String>,

    /// Seconds to wait before pushing the payment-result notification
    #[arg(long)]
    pub notify_delay_secs: Option<u64>,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Flags given on the command line, layered over file and environment.
#[derive(Serialize)]
struct CliOverrides<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    addr: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notify_delay_secs: Option<u64>,
}

impl<'a> From<&'a Args> for CliOverrides<'a> {
    fn from(args: &'a Args) -> Self {
        Self {
            addr: args.addr.as_deref(),
            api_key: args.api_key.as_deref(),
            notify_delay_secs: args.notify_delay_secs,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Socket address to bind, e.g. "0.0.0.0:18080"
    pub addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub notify_delay_secs: u64,
    /// Timeout for each callback POST
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:18080".to_string(),
            api_key: None,
            notify_delay_secs: 10,
            notify_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // MCHPAY_CONFIG names the file itself and is not a config key
            .merge(Env::prefixed("MCHPAY_").ignore(&["config"]))
            .merge(Serialized::defaults(CliOverrides::from(args)))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Config {
                message: "api_key is required: pass --api-key, set MCHPAY_API_KEY, or add api_key to the config file".to_string(),
            });
        }
        if self.notify_timeout_secs == Some(0) {
            return Err(Error::Config {
                message: "notify_timeout_secs must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn api_key(&self) -> &str {
        self.api_key.as_deref().unwrap_or_default()
    }

    pub fn notify_delay(&self) -> Duration {
        Duration::from_secs(self.notify_delay_secs)
    }

    pub fn notify_timeout(&self) -> Option<Duration> {
        self.notify_timeout_secs.map(Duration::from_secs)
    }
}

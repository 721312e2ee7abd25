use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use omx_api::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TracingConfig {
    pub enable: bool,
    pub span_level: String,
    pub output_dir: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            enable: false,
            span_level: "info".to_owned(),
            output_dir: "/tmp/omx-trace".to_owned(),
        }
    }
}

/// Resources of one endpoint, fixed when it is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointConfig {
    /// Requests the application may have outstanding at once.
    pub request_pool_capacity: usize,
    pub exp_eventq_entries: usize,
    /// Also the number of receive queue pages.
    pub unexp_eventq_entries: usize,
    pub sendq_entries: usize,
    pub connect_timeout_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            request_pool_capacity: 1024,
            exp_eventq_entries: 1024,
            unexp_eventq_entries: 1024,
            sendq_entries: 1024,
            connect_timeout_ms: 1000,
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let queue_ok = |n: usize| n > 0 && n.is_power_of_two();
        if self.request_pool_capacity == 0
            || !queue_ok(self.exp_eventq_entries)
            || !queue_ok(self.unexp_eventq_entries)
            || self.sendq_entries == 0
            || self.sendq_entries > u16::MAX as usize
        {
            return Err(Error::EndpointParamBadValue);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub tracing: TracingConfig,
    pub endpoint: EndpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_owned(),
            tracing: TracingConfig::default(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl Config {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = match config {
            Some(content) => toml::from_str(content)?,
            None => Config::default(),
        };
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config
            .endpoint
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid endpoint parameters: {}", e))?;
        Ok(config)
    }
}

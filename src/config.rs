use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub optimizer: OptimizerConfig,
    pub horizon: HorizonConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            request_timeout_secs: 60,
            enable_cors: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OptimizerConfig {
    /// Numerical tolerance for invariant checks on solved matrices.
    pub tolerance: f64,
    /// Windows longer than this are logged as potentially slow.
    pub large_window_warning_steps: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            large_window_warning_steps: crate::optimizer::DEFAULT_LARGE_WINDOW_STEPS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HorizonConfig {
    /// Shortest lookahead accepted for moving horizon requests, in hours.
    pub min_lookahead_hours: usize,
}

impl Default for HorizonConfig {
    fn default() -> Self {
        Self {
            min_lookahead_hours: 24,
        }
    }
}

impl Config {
    /// Built-in defaults, then `config/default.toml`, then `LSO__` environment
    /// variables (`LSO__SERVER__PORT=9000`).
    pub fn load() -> Result<Self> {
        let figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("LSO__").split("__"));
        let cfg: Config = figment.extract().context("failed to load configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("server.request_timeout_secs must be non-zero");
        }
        if !(self.optimizer.tolerance.is_finite() && self.optimizer.tolerance > 0.0) {
            anyhow::bail!("optimizer.tolerance must be positive");
        }
        if self.horizon.min_lookahead_hours == 0 {
            anyhow::bail!("horizon.min_lookahead_hours must be at least 1");
        }
        Ok(())
    }
}

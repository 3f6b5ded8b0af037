use serde::Deserialize;

use crate::hierarchy::DEFAULT_MAX_TREE_DEPTH;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    pub database_url: String,
    /// Shared secret the payment gateway signs confirmations with.
    pub payment_webhook_secret: String,
    /// Hard bound on ancestor walks; deeper chains are treated as corrupt.
    #[serde(default = "default_max_tree_depth")]
    pub max_tree_depth: usize,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
}

fn default_server_port() -> u16 {
    8000
}

fn default_max_tree_depth() -> usize {
    DEFAULT_MAX_TREE_DEPTH
}

fn default_database_max_connections() -> u32 {
    8
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?;
        config.try_deserialize()
    }
}

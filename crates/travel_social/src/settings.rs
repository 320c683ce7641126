use std::time::Duration;

use config::{Config, Environment};
use serde::Deserialize;

use crate::{services::follow_service::DEFAULT_STATUS_TIMEOUT, store::RetryPolicy};

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub environment: Option<String>,
    pub port: Option<u16>,
    /// Without it the service runs on the in-memory store.
    pub redis_url: Option<String>,
    pub transaction_max_attempts: Option<u32>,
    pub follow_status_timeout_secs: Option<u64>,
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        match self.transaction_max_attempts {
            Some(attempts) => RetryPolicy::default().with_max_attempts(attempts),
            None => RetryPolicy::default(),
        }
    }

    pub fn follow_status_timeout(&self) -> Duration {
        self.follow_status_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STATUS_TIMEOUT)
    }

    pub fn is_production(&self) -> bool {
        self.environment.as_deref() == Some("PROD")
    }
}

pub fn load_settings() -> Result<Settings, config::ConfigError> {
    from_environment(Environment::default())
}

fn from_environment(environment: Environment) -> Result<Settings, config::ConfigError> {
    Config::builder()
        .add_source(environment.try_parsing(true))
        .build()?
        .try_deserialize()
}

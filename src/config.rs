use std::time::Duration;

use anyhow::{bail, Result};
use clap::Args;

use crate::store::RetryPolicy;

/// Record store connection settings, from flags or the environment.
#[derive(Clone, Debug, Args)]
pub struct StoreArgs {
    /// NocoDB server, e.g. https://nocodb.example.org
    #[arg(long, env = "NOCODB_URL", global = true)]
    pub nocodb_url: Option<String>,

    #[arg(long, env = "NOCODB_API_TOKEN", global = true, hide_env_values = true)]
    pub nocodb_api_token: Option<String>,

    #[arg(long, env = "NOCODB_BASE_ID", global = true)]
    pub nocodb_base_id: Option<String>,

    /// Per-request timeout
    #[arg(long, env = "NOCODB_TIMEOUT_SECS", default_value_t = 30, global = true)]
    pub nocodb_timeout_secs: u64,

    /// Attempts per request when the store fails transiently
    #[arg(long, env = "NOCODB_MAX_ATTEMPTS", default_value_t = 4, global = true)]
    pub nocodb_max_attempts: u32,

    #[arg(long, env = "NOCODB_SCHEMA_TTL_SECS", default_value_t = 300, global = true)]
    pub nocodb_schema_ttl_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_token: String,
    pub base_id: String,
    pub timeout: Duration,
    pub schema_ttl: Duration,
    pub retry: RetryPolicy,
}

fn required(value: &Option<String>, env: &str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(x) if !x.is_empty() => Ok(x.to_string()),
        _ => bail!("{env} is not set"),
    }
}

impl StoreArgs {
    pub fn resolve(&self) -> Result<StoreConfig> {
        if self.nocodb_timeout_secs == 0 {
            bail!("NOCODB_TIMEOUT_SECS must be positive");
        }
        Ok(StoreConfig {
            base_url: required(&self.nocodb_url, "NOCODB_URL")?
                .trim_end_matches('/')
                .to_string(),
            api_token: required(&self.nocodb_api_token, "NOCODB_API_TOKEN")?,
            base_id: required(&self.nocodb_base_id, "NOCODB_BASE_ID")?,
            timeout: Duration::from_secs(self.nocodb_timeout_secs),
            schema_ttl: Duration::from_secs(self.nocodb_schema_ttl_secs),
            retry: self.retry(),
        })
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.nocodb_max_attempts.max(1),
            ..Default::default()
        }
    }
}

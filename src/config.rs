//! Application configuration.
//!
//! Built once at startup from the environment (optionally seeded by a `.env`
//! file) and shared read-only afterwards.

use crate::batch::BatchConfig;
use crate::retry::{RetryPolicies, RetryPolicy, DEFAULT_CALL_TIMEOUT};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;

/// Everything the service needs to talk to the warehouse and run batches.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub warehouse: WarehouseConfig,
    pub batch: BatchConfig,
    pub retry: RetryPolicies,
    /// How long the interactive run waits for OCR + summary.
    pub ocr_timeout: Duration,
    /// Model used for summaries and prompt generation.
    pub completion_model: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Base URL of the SQL API, e.g. `https://acct.example.com`.
    pub base_url: String,
    /// Base URL of the stage upload gateway.
    pub stage_upload_url: String,
    pub account: String,
    pub user: String,
    pub database: Option<String>,
    pub schema: Option<String>,
    pub warehouse: Option<String>,
    pub role: Option<String>,
    pub auth: WarehouseAuth,
    pub statement_timeout: Duration,
}

#[derive(Clone)]
pub enum WarehouseAuth {
    /// Pre-issued bearer token (OAuth or programmatic access token).
    Token(String),
    /// RSA key pair; a JWT is minted and refreshed locally.
    KeyPair {
        private_key_pem: String,
        public_key_fingerprint: String,
    },
}

impl std::fmt::Debug for WarehouseAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WarehouseAuth::Token(_) => f.write_str("Token(<redacted>)"),
            WarehouseAuth::KeyPair {
                public_key_fingerprint,
                ..
            } => write!(f, "KeyPair({})", public_key_fingerprint),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let require = |key: &str| get(key).ok_or_else(|| anyhow!("{} not set", key));

        let base_url = require("WAREHOUSE_URL")?.trim_end_matches('/').to_string();
        let stage_upload_url = get("WAREHOUSE_STAGE_UPLOAD_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("{}/api/v2/stages", base_url));

        let auth = match (get("WAREHOUSE_TOKEN"), get("WAREHOUSE_PRIVATE_KEY_PATH")) {
            (Some(token), _) => WarehouseAuth::Token(token),
            (None, Some(path)) => {
                let private_key_pem = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read private key: {}", path))?;
                WarehouseAuth::KeyPair {
                    private_key_pem,
                    public_key_fingerprint: require("WAREHOUSE_PUBLIC_KEY_FP")?,
                }
            }
            (None, None) => {
                anyhow::bail!("Set WAREHOUSE_TOKEN or WAREHOUSE_PRIVATE_KEY_PATH")
            }
        };

        let warehouse = WarehouseConfig {
            base_url,
            stage_upload_url,
            account: require("WAREHOUSE_ACCOUNT")?,
            user: require("WAREHOUSE_USER")?,
            database: get("WAREHOUSE_DATABASE"),
            schema: get("WAREHOUSE_SCHEMA"),
            warehouse: get("WAREHOUSE_NAME"),
            role: get("WAREHOUSE_ROLE"),
            auth,
            statement_timeout: secs(&get, "WAREHOUSE_STATEMENT_TIMEOUT_SECS", 180)?,
        };

        let call_timeout = secs(
            &get,
            "AI_CALL_TIMEOUT_SECS",
            DEFAULT_CALL_TIMEOUT.as_secs(),
        )?;
        let defaults = RetryPolicies::default();
        let retry = RetryPolicies {
            classify: policy(&get, "CLASSIFY", defaults.classify, call_timeout)?,
            extract: policy(&get, "EXTRACT", defaults.extract, call_timeout)?,
            parse: policy(&get, "PARSE", defaults.parse, call_timeout)?,
            summarize: policy(&get, "SUMMARIZE", defaults.summarize, call_timeout)?,
            generate: policy(&get, "GENERATE", defaults.generate, call_timeout)?,
        };

        let mut batch = BatchConfig::default();
        if let Some(n) = parsed::<usize, _>(&get, "BATCH_CONCURRENCY")? {
            batch.concurrency = n;
        }
        if let Some(ms) = parsed::<u64, _>(&get, "BATCH_RENDER_INTERVAL_MS")? {
            batch.render_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parsed::<usize, _>(&get, "PERSIST_WRITERS")? {
            batch.persist_writers = n.max(1);
        }
        batch.extract = retry.extract;

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            warehouse,
            batch,
            retry,
            ocr_timeout: secs(&get, "OCR_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT.as_secs())?,
            completion_model: get("COMPLETION_MODEL").unwrap_or_else(|| "mistral-7b".to_string()),
            max_upload_bytes: parsed::<usize, _>(&get, "MAX_UPLOAD_MB")?.unwrap_or(100) * 1024 * 1024,
        })
    }
}

fn parsed<T, G>(get: &G, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow!("Invalid {}={:?}: {}", key, raw, e))
        })
        .transpose()
}

fn secs<G>(get: &G, key: &str, default: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(Duration::from_secs(parsed(get, key)?.unwrap_or(default)))
}

/// `{PREFIX}_ATTEMPTS` and `{PREFIX}_BACKOFF_MS` override a default policy.
fn policy<G>(get: &G, prefix: &str, default: RetryPolicy, timeout: Duration) -> Result<RetryPolicy>
where
    G: Fn(&str) -> Option<String>,
{
    let attempts = parsed(get, &format!("{}_ATTEMPTS", prefix))?.unwrap_or(default.attempts);
    let backoff = parsed(get, &format!("{}_BACKOFF_MS", prefix))?
        .map(Duration::from_millis)
        .unwrap_or(default.backoff);
    Ok(RetryPolicy::fixed(attempts, backoff, timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("WAREHOUSE_URL", "https://acct.example.com/"),
        ("WAREHOUSE_ACCOUNT", "ACCT"),
        ("WAREHOUSE_USER", "INTAKE"),
        ("WAREHOUSE_TOKEN", "secret"),
    ];

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(BASE)).unwrap();
        assert_eq!(config.warehouse.base_url, "https://acct.example.com");
        assert_eq!(
            config.warehouse.stage_upload_url,
            "https://acct.example.com/api/v2/stages"
        );
        assert_eq!(config.retry.classify.attempts, 5);
        assert_eq!(config.retry.classify.backoff, Duration::from_millis(500));
        assert_eq!(config.retry.extract.attempts, 1);
        assert_eq!(config.batch.render_interval, Duration::from_millis(150));
        assert!((2..=8).contains(&config.batch.concurrency));
        assert_eq!(config.ocr_timeout, Duration::from_secs(120));
        assert_eq!(config.max_upload_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("BATCH_CONCURRENCY", "3"),
            ("EXTRACT_ATTEMPTS", "2"),
            ("EXTRACT_BACKOFF_MS", "250"),
            ("AI_CALL_TIMEOUT_SECS", "30"),
            ("WAREHOUSE_ROLE", ""),
        ]);
        let config = AppConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.batch.concurrency, 3);
        assert_eq!(config.batch.extract.attempts, 2);
        assert_eq!(config.batch.extract.backoff, Duration::from_millis(250));
        assert_eq!(config.retry.parse.timeout, Duration::from_secs(30));
        assert!(config.warehouse.role.is_none());
    }

    #[test]
    fn test_missing_credentials() {
        let pairs: Vec<_> = BASE
            .iter()
            .copied()
            .filter(|(k, _)| *k != "WAREHOUSE_TOKEN")
            .collect();
        let err = AppConfig::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(err.to_string().contains("WAREHOUSE_TOKEN"));
    }

    #[test]
    fn test_invalid_number() {
        let mut pairs = BASE.to_vec();
        pairs.push(("BATCH_CONCURRENCY", "many"));
        assert!(AppConfig::from_lookup(lookup(&pairs)).is_err());
    }
}

//! Engine configuration, read from `FINFLOW_*` environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use finflow_financing::FinancingPolicy;

use crate::workers::RetryPolicy;

pub const ENV_MAX_OFFER_REVISIONS: &str = "FINFLOW_MAX_OFFER_REVISIONS";
pub const ENV_DEFAULT_GRACE_PERIOD_DAYS: &str = "FINFLOW_DEFAULT_GRACE_PERIOD_DAYS";
pub const ENV_DISPATCH_RETRIES: &str = "FINFLOW_DISPATCH_RETRIES";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "FINFLOW_SWEEP_INTERVAL_SECS";
pub const ENV_BIND_ADDR: &str = "FINFLOW_BIND_ADDR";
pub const ENV_NOTIFICATION_MAX_ATTEMPTS: &str = "FINFLOW_NOTIFICATION_MAX_ATTEMPTS";
/// Unset keeps events in memory; set, they are persisted in Postgres.
pub const ENV_DATABASE_URL: &str = "FINFLOW_DATABASE_URL";
pub const ENV_DATABASE_MAX_CONNECTIONS: &str = "FINFLOW_DATABASE_MAX_CONNECTIONS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Offers allowed in one negotiation chain (first offer included).
    pub max_offer_revisions: u8,
    /// Days past the repayment due date before a default may be confirmed.
    pub default_grace_period_days: u32,
    /// Conflict retries for append-only submissions.
    pub dispatch_retries: u32,
    pub sweep_interval: Duration,
    pub bind_addr: SocketAddr,
    /// Delivery attempts per notification before it is dead-lettered.
    pub notification_max_attempts: u32,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let policy = FinancingPolicy::default();
        Self {
            max_offer_revisions: policy.max_offer_revisions,
            default_grace_period_days: policy.default_grace_period_days,
            dispatch_retries: 3,
            sweep_interval: Duration::from_secs(60),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            notification_max_attempts: RetryPolicy::default().max_attempts,
            database_url: None,
            database_max_connections: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_offer_revisions =
            parse_or(&lookup, ENV_MAX_OFFER_REVISIONS, defaults.max_offer_revisions)?;
        if max_offer_revisions == 0 {
            return Err(ConfigError::OutOfRange {
                var: ENV_MAX_OFFER_REVISIONS,
                reason: "at least one offer must be allowed".to_string(),
            });
        }

        let sweep_secs: u64 = parse_or(
            &lookup,
            ENV_SWEEP_INTERVAL_SECS,
            defaults.sweep_interval.as_secs(),
        )?;
        if sweep_secs == 0 {
            return Err(ConfigError::OutOfRange {
                var: ENV_SWEEP_INTERVAL_SECS,
                reason: "sweep interval must be positive".to_string(),
            });
        }

        let notification_max_attempts = parse_or(
            &lookup,
            ENV_NOTIFICATION_MAX_ATTEMPTS,
            defaults.notification_max_attempts,
        )?;
        if notification_max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                var: ENV_NOTIFICATION_MAX_ATTEMPTS,
                reason: "at least one delivery attempt is needed".to_string(),
            });
        }

        let database_max_connections = parse_or(
            &lookup,
            ENV_DATABASE_MAX_CONNECTIONS,
            defaults.database_max_connections,
        )?;
        if database_max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                var: ENV_DATABASE_MAX_CONNECTIONS,
                reason: "the pool needs at least one connection".to_string(),
            });
        }

        Ok(Self {
            max_offer_revisions,
            default_grace_period_days: parse_or(
                &lookup,
                ENV_DEFAULT_GRACE_PERIOD_DAYS,
                defaults.default_grace_period_days,
            )?,
            dispatch_retries: parse_or(&lookup, ENV_DISPATCH_RETRIES, defaults.dispatch_retries)?,
            sweep_interval: Duration::from_secs(sweep_secs),
            bind_addr: parse_or(&lookup, ENV_BIND_ADDR, defaults.bind_addr)?,
            notification_max_attempts,
            database_url: lookup(ENV_DATABASE_URL)
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty()),
            database_max_connections,
        })
    }

    pub fn notification_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.notification_max_attempts,
            ..RetryPolicy::default()
        }
    }

    /// Policy stamped onto newly drafted invoices.
    pub fn policy(&self) -> FinancingPolicy {
        FinancingPolicy {
            max_offer_revisions: self.max_offer_revisions,
            default_grace_period_days: self.default_grace_period_days,
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
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
        move |k| map.get(k).cloned()
    }

    #[test]
    fn unset_variables_keep_documented_defaults() {
        let cfg = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.max_offer_revisions, 3);
        assert_eq!(cfg.default_grace_period_days, 30);
        assert_eq!(cfg.dispatch_retries, 3);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(cfg.notification_max_attempts, 5);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.database_max_connections, 10);
    }

    #[test]
    fn database_url_selects_persistence_and_blank_means_memory() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            (ENV_DATABASE_URL, " postgres://finflow@localhost/finflow "),
            (ENV_DATABASE_MAX_CONNECTIONS, "4"),
            (ENV_NOTIFICATION_MAX_ATTEMPTS, "8"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.database_url.as_deref(),
            Some("postgres://finflow@localhost/finflow")
        );
        assert_eq!(cfg.database_max_connections, 4);
        assert_eq!(cfg.notification_retry().max_attempts, 8);

        let cfg = EngineConfig::from_lookup(lookup(&[(ENV_DATABASE_URL, "  ")])).unwrap();
        assert_eq!(cfg.database_url, None);

        let err = EngineConfig::from_lookup(lookup(&[(ENV_NOTIFICATION_MAX_ATTEMPTS, "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange { var: ENV_NOTIFICATION_MAX_ATTEMPTS, .. }
        ));
    }

    #[test]
    fn overrides_flow_into_the_policy() {
        let cfg = EngineConfig::from_lookup(lookup(&[
            (ENV_MAX_OFFER_REVISIONS, "5"),
            (ENV_DEFAULT_GRACE_PERIOD_DAYS, " 10 "),
            (ENV_BIND_ADDR, "127.0.0.1:9000"),
        ]))
        .unwrap();
        assert_eq!(cfg.policy().max_offer_revisions, 5);
        assert_eq!(cfg.policy().default_grace_period_days, 10);
        assert_eq!(cfg.bind_addr.port(), 9000);
    }

    #[test]
    fn garbage_and_zero_values_are_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_DISPATCH_RETRIES, "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: ENV_DISPATCH_RETRIES, .. }));

        let err = EngineConfig::from_lookup(lookup(&[(ENV_MAX_OFFER_REVISIONS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }
}

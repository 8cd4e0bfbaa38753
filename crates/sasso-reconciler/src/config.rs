// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for sasso-reconciler.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use sasso_core::addressing::Ipv4Subnet;

/// Driver set the binary wires the workers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// In-process drivers that record calls without touching infrastructure.
    Memory,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Reconciler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store URL (`sqlite:...` or `postgres://...`)
    pub database_url: String,
    /// Backend drivers
    pub backend: BackendKind,
    /// Range gateway subnets are allocated from
    pub usable_subnet: Ipv4Subnet,
    /// Prefix length of allocated subnets
    pub new_subnet_prefix: u8,
    /// Grace delay before each worker's first cycle
    pub startup_delay: Duration,
    /// Router worker period
    pub network_poll_interval: Duration,
    /// Hypervisor worker period
    pub vm_poll_interval: Duration,
    /// DNS worker period
    pub dns_poll_interval: Duration,
    /// Notifier period
    pub notify_poll_interval: Duration,
    /// Tickets processed per router cycle
    pub ticket_batch_size: i64,
    /// Gate notifications through the token buckets
    pub notify_rate_limits: bool,
    /// Minute bucket refill rate
    pub notify_max_per_minute: u64,
    /// Day bucket refill rate
    pub notify_max_per_day: u64,
    /// Telegram Bot API base URL
    pub telegram_api_url: String,
    /// Zone port forwards enter from
    pub firewall_external_zone: String,
    /// Public address used as the NAT reflection original destination
    pub firewall_public_ip: Option<Ipv4Addr>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url =
            lookup("SASSO_DATABASE_URL").ok_or(ConfigError::MissingEnvVar("SASSO_DATABASE_URL"))?;

        let firewall_public_ip = match lookup("SASSO_FIREWALL_PUBLIC_IP") {
            Some(raw) => Some(parse_value("SASSO_FIREWALL_PUBLIC_IP", &raw)?),
            None => None,
        };

        Ok(Self {
            database_url,
            backend: lookup("SASSO_BACKEND")
                .as_deref()
                .unwrap_or("memory")
                .parse()?,
            usable_subnet: parsed(&lookup, "SASSO_USABLE_SUBNET", "10.0.0.0/16")?,
            new_subnet_prefix: parsed(&lookup, "SASSO_NEW_SUBNET_PREFIX", "24")?,
            startup_delay: seconds(&lookup, "SASSO_STARTUP_DELAY_SECS", 10)?,
            network_poll_interval: seconds(&lookup, "SASSO_NETWORK_POLL_INTERVAL_SECS", 5)?,
            vm_poll_interval: seconds(&lookup, "SASSO_VM_POLL_INTERVAL_SECS", 10)?,
            dns_poll_interval: seconds(&lookup, "SASSO_DNS_POLL_INTERVAL_SECS", 10)?,
            notify_poll_interval: seconds(&lookup, "SASSO_NOTIFY_POLL_INTERVAL_SECS", 30)?,
            ticket_batch_size: parsed(&lookup, "SASSO_TICKET_BATCH_SIZE", "50")?,
            notify_rate_limits: lookup("SASSO_NOTIFY_RATE_LIMITS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            notify_max_per_minute: parsed(&lookup, "SASSO_NOTIFY_MAX_PER_MINUTE", "20")?,
            notify_max_per_day: parsed(&lookup, "SASSO_NOTIFY_MAX_PER_DAY", "1000")?,
            telegram_api_url: lookup("SASSO_TELEGRAM_API_URL")
                .unwrap_or_else(|| "https://api.telegram.org".to_string()),
            firewall_external_zone: lookup("SASSO_FIREWALL_EXTERNAL_ZONE")
                .unwrap_or_else(|| "net".to_string()),
            firewall_public_ip,
        })
    }
}

fn parse_value<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
    })
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: &str,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(raw) => parse_value(var, &raw),
        None => parse_value(var, default),
    }
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = match lookup(var) {
        Some(raw) => parse_value(var, &raw)?,
        None => default,
    };
    Ok(Duration::from_secs(secs))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {var}: {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
    /// `SASSO_BACKEND` names a driver set this build does not have.
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("SASSO_DATABASE_URL", "sqlite::memory:")]))
            .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.usable_subnet.to_string(), "10.0.0.0/16");
        assert_eq!(config.new_subnet_prefix, 24);
        assert_eq!(config.startup_delay, Duration::from_secs(10));
        assert_eq!(config.network_poll_interval, Duration::from_secs(5));
        assert_eq!(config.vm_poll_interval, Duration::from_secs(10));
        assert_eq!(config.dns_poll_interval, Duration::from_secs(10));
        assert_eq!(config.notify_poll_interval, Duration::from_secs(30));
        assert_eq!(config.ticket_batch_size, 50);
        assert!(config.notify_rate_limits);
        assert_eq!(config.notify_max_per_minute, 20);
        assert_eq!(config.notify_max_per_day, 1000);
        assert_eq!(config.telegram_api_url, "https://api.telegram.org");
        assert_eq!(config.firewall_external_zone, "net");
        assert!(config.firewall_public_ip.is_none());
    }

    #[test]
    fn test_missing_database_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("SASSO_DATABASE_URL")));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SASSO_DATABASE_URL", "postgres://localhost/sasso"),
            ("SASSO_USABLE_SUBNET", "172.16.0.0/12"),
            ("SASSO_NEW_SUBNET_PREFIX", "26"),
            ("SASSO_STARTUP_DELAY_SECS", "0"),
            ("SASSO_NOTIFY_RATE_LIMITS", "false"),
            ("SASSO_FIREWALL_PUBLIC_IP", "203.0.113.7"),
        ]))
        .unwrap();

        assert_eq!(config.usable_subnet.to_string(), "172.16.0.0/12");
        assert_eq!(config.new_subnet_prefix, 26);
        assert_eq!(config.startup_delay, Duration::ZERO);
        assert!(!config.notify_rate_limits);
        assert_eq!(
            config.firewall_public_ip,
            Some(Ipv4Addr::new(203, 0, 113, 7))
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[
            ("SASSO_DATABASE_URL", "sqlite::memory:"),
            ("SASSO_VM_POLL_INTERVAL_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var: "SASSO_VM_POLL_INTERVAL_SECS", .. }
        ));

        let err = Config::from_lookup(lookup(&[
            ("SASSO_DATABASE_URL", "sqlite::memory:"),
            ("SASSO_USABLE_SUBNET", "10.0.0.0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unsupported_backend() {
        let err = Config::from_lookup(lookup(&[
            ("SASSO_DATABASE_URL", "sqlite::memory:"),
            ("SASSO_BACKEND", "proxmox"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedBackend(name) if name == "proxmox"));
    }
}

use crate::cleanup::CleanupConfig;
use crate::dispatcher::DispatcherConfig;
use crate::processor::InboxConfig;
use crate::routing;
use event_bus::{NatsTopology, RetryConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for the retention windows (about a century)
pub const MAX_RETENTION_DAYS: i64 = 36_500;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    InMemory,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: BusType,
    pub nats_url: String,
    pub host: String,
    pub port: u16,
    pub worker_id: String,

    pub outbox_poll_interval_secs: u64,
    pub outbox_batch_size: i64,
    pub outbox_max_retry_count: i32,
    pub outbox_claim_lease_secs: u64,
    pub publish_retry_attempts: u32,
    pub publish_retry_base_ms: u64,
    pub publish_retry_max_ms: u64,

    pub inbox_queues: Vec<String>,
    pub inbox_prefetch_count: usize,
    pub inbox_max_delivery_attempts: i32,
    pub inbox_claim_lease_secs: u64,
    /// Broker redelivery timeout for unacknowledged deliveries; longer than the claim lease
    pub inbox_ack_wait_secs: u64,
    pub inbox_redelivery_base_ms: u64,
    pub inbox_redelivery_max_ms: u64,
    pub message_ttl_ms: u64,
    pub dead_letter_subject: String,

    pub outbox_retention_days: i64,
    pub inbox_retention_days: i64,
    pub cleanup_interval_secs: u64,
    pub cleanup_batch_size: i64,
    pub cleanup_outbox_enabled: bool,
    pub cleanup_inbox_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bus_type = match lookup("BUS_TYPE")
            .unwrap_or_else(|| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            other => {
                return Err(ConfigError::Invalid {
                    key: "BUS_TYPE",
                    value: other.to_string(),
                    reason: "expected nats or inmemory".to_string(),
                })
            }
        };

        let nats_url = lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse(&lookup, "PORT", 8095)?;

        let worker_id = lookup("WORKER_ID")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| format!("event-relay-{}", uuid::Uuid::new_v4().simple()));

        let inbox_queues = match lookup("INBOX_QUEUES") {
            Some(raw) => {
                let queues: Vec<String> = raw
                    .split(',')
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect();
                if queues.is_empty() {
                    return Err(ConfigError::Invalid {
                        key: "INBOX_QUEUES",
                        value: raw,
                        reason: "at least one queue is required".to_string(),
                    });
                }
                queues
            }
            None => InboxConfig::default().queues,
        };

        let retention_days = parse_bounded(&lookup, "RETENTION_DAYS", 30, MAX_RETENTION_DAYS)?;

        let inbox_claim_lease_secs: u64 =
            parse_positive(&lookup, "INBOX_CLAIM_LEASE_SECONDS", 300)?;
        let inbox_ack_wait_secs: u64 = parse_positive(
            &lookup,
            "INBOX_ACK_WAIT_SECONDS",
            inbox_claim_lease_secs.saturating_add(30),
        )?;
        if inbox_ack_wait_secs <= inbox_claim_lease_secs {
            return Err(ConfigError::Invalid {
                key: "INBOX_ACK_WAIT_SECONDS",
                value: inbox_ack_wait_secs.to_string(),
                reason: format!(
                    "must exceed INBOX_CLAIM_LEASE_SECONDS ({inbox_claim_lease_secs})"
                ),
            });
        }

        Ok(Config {
            database_url,
            bus_type,
            nats_url,
            host,
            port,
            worker_id,
            outbox_poll_interval_secs: parse_positive(&lookup, "OUTBOX_POLL_INTERVAL_SECONDS", 10)?,
            outbox_batch_size: parse_positive(&lookup, "OUTBOX_BATCH_SIZE", 100)?,
            outbox_max_retry_count: parse_positive(&lookup, "OUTBOX_MAX_RETRY_COUNT", 3)?,
            outbox_claim_lease_secs: parse_positive(&lookup, "OUTBOX_CLAIM_LEASE_SECONDS", 60)?,
            publish_retry_attempts: parse_positive(&lookup, "PUBLISH_RETRY_ATTEMPTS", 3)?,
            publish_retry_base_ms: parse(&lookup, "PUBLISH_RETRY_BASE_MS", 2_000)?,
            publish_retry_max_ms: parse(&lookup, "PUBLISH_RETRY_MAX_MS", 30_000)?,
            inbox_queues,
            inbox_prefetch_count: parse_positive(&lookup, "INBOX_PREFETCH_COUNT", 10)?,
            inbox_max_delivery_attempts: parse_positive(&lookup, "INBOX_MAX_DELIVERY_ATTEMPTS", 5)?,
            inbox_claim_lease_secs,
            inbox_ack_wait_secs,
            inbox_redelivery_base_ms: parse(&lookup, "INBOX_RETRY_BASE_MS", 1_000)?,
            inbox_redelivery_max_ms: parse(&lookup, "INBOX_RETRY_MAX_MS", 30_000)?,
            message_ttl_ms: parse_positive(&lookup, "MESSAGE_TTL_MS", 86_400_000)?,
            dead_letter_subject: lookup("DEAD_LETTER_SUBJECT")
                .unwrap_or_else(|| "lendtech.dlq".to_string()),
            outbox_retention_days: parse_bounded(
                &lookup,
                "OUTBOX_RETENTION_DAYS",
                retention_days,
                MAX_RETENTION_DAYS,
            )?,
            inbox_retention_days: parse_bounded(
                &lookup,
                "INBOX_RETENTION_DAYS",
                retention_days,
                MAX_RETENTION_DAYS,
            )?,
            cleanup_interval_secs: parse_positive(&lookup, "CLEANUP_INTERVAL_SECONDS", 86_400)?,
            cleanup_batch_size: parse_positive(&lookup, "CLEANUP_BATCH_SIZE", 500)?,
            cleanup_outbox_enabled: parse_bool(&lookup, "CLEANUP_OUTBOX_ENABLED", true)?,
            cleanup_inbox_enabled: parse_bool(&lookup, "CLEANUP_INBOX_ENABLED", true)?,
        })
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_id: self.worker_id.clone(),
            batch_size: self.outbox_batch_size,
            poll_interval: Duration::from_secs(self.outbox_poll_interval_secs),
            max_retry_count: self.outbox_max_retry_count,
            claim_lease: Duration::from_secs(self.outbox_claim_lease_secs),
            retry: RetryConfig {
                max_attempts: self.publish_retry_attempts,
                initial_backoff: Duration::from_millis(self.publish_retry_base_ms),
                max_backoff: Duration::from_millis(self.publish_retry_max_ms),
            },
        }
    }

    pub fn inbox(&self) -> InboxConfig {
        InboxConfig {
            queues: self.inbox_queues.clone(),
            prefetch_count: self.inbox_prefetch_count,
            max_delivery_attempts: self.inbox_max_delivery_attempts,
            claim_lease: Duration::from_secs(self.inbox_claim_lease_secs),
            redelivery: RetryConfig {
                max_attempts: u32::try_from(self.inbox_max_delivery_attempts).unwrap_or(u32::MAX),
                initial_backoff: Duration::from_millis(self.inbox_redelivery_base_ms),
                max_backoff: Duration::from_millis(self.inbox_redelivery_max_ms),
            },
        }
    }

    pub fn cleanup(&self) -> CleanupConfig {
        CleanupConfig {
            interval: Duration::from_secs(self.cleanup_interval_secs),
            outbox_retention_days: self.outbox_retention_days,
            inbox_retention_days: self.inbox_retention_days,
            outbox_enabled: self.cleanup_outbox_enabled,
            inbox_enabled: self.cleanup_inbox_enabled,
            batch_size: self.cleanup_batch_size,
        }
    }

    /// JetStream streams covering the inbox queues and every routed queue
    pub fn nats_topology(&self) -> NatsTopology {
        let mut subjects = routing::QueueRouter::default().queues();
        for queue in &self.inbox_queues {
            if !subjects.contains(queue) {
                subjects.push(queue.clone());
            }
        }

        NatsTopology {
            subjects,
            dead_letter_subject: self.dead_letter_subject.clone(),
            message_ttl: Duration::from_millis(self.message_ttl_ms),
            prefetch_count: i64::try_from(self.inbox_prefetch_count).unwrap_or(i64::MAX),
            ack_wait: Duration::from_secs(self.inbox_ack_wait_secs),
            ..NatsTopology::default()
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value = parse(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_bounded<F>(
    lookup: &F,
    key: &'static str,
    default: i64,
    max: i64,
) -> Result<i64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_positive(lookup, key, default)?;
    if value > max {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: format!("must be at most {max}"),
        });
    }
    Ok(value)
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected true or false".to_string(),
            }),
        },
    }
}

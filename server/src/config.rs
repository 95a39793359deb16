use std::collections::HashSet;
use std::time::Duration;

/// Immutable process configuration, read once at startup from the
/// environment and passed to every component as an explicit handle.
#[derive(Clone, Debug)]
pub struct Config {
    /// Postgres URL; when unset the in-memory store is used.
    pub database_url: Option<String>,
    /// Broker URL; only `memory:` is currently backed by an implementation.
    pub broker_url: String,
    pub allowed_model_configs: AllowList,
    pub allowed_compat_hashes: AllowList,
    /// Pending without worker pickup.
    pub timeout_schedule: Duration,
    /// No packet during streaming.
    pub timeout_stall: Duration,
    /// Expected worker heartbeat interval; two missed windows terminate.
    pub heartbeat_interval: Duration,
    /// Worker fails to acknowledge a cancel.
    pub cancel_ack_timeout: Duration,
    pub compliance_interval: Duration,
    /// Token queues linger this long after their `end` packet.
    pub token_queue_ttl: Duration,
    /// When set, client bearer tokens must be `user_id.hmac_hex`.
    pub auth_secret: Option<String>,
    /// Administrative worker seeding, `api_key:name[:trusted]` entries.
    pub seed_worker_api_keys: Vec<SeedWorker>,
    pub safety_retry: SafetyRetryMode,
}

/// One `SEED_WORKER_API_KEYS` entry. Trusted workers anchor the compliance
/// reference signature for their compat hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedWorker {
    pub api_key: String,
    pub name: String,
    pub trusted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllowList {
    Any,
    Only(HashSet<String>),
}

impl AllowList {
    pub fn parse(raw: &str) -> Self {
        if raw.trim() == "*" {
            AllowList::Any
        } else {
            AllowList::Only(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            )
        }
    }

    pub fn allows(&self, value: &str) -> bool {
        match self {
            AllowList::Any => true,
            AllowList::Only(set) => set.contains(value),
        }
    }
}

/// Whether a safety rewrite is replayed on the same stream or surfaced as a
/// terminal event for the client to re-subscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SafetyRetryMode {
    Surface,
    Seamless,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

fn parse_seed_workers(raw: &str) -> Vec<SeedWorker> {
    raw.split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(':');
            let api_key = parts.next()?.trim();
            let name = parts.next()?.trim();
            if api_key.is_empty() {
                return None;
            }
            Some(SeedWorker {
                api_key: api_key.to_string(),
                name: name.to_string(),
                trusted: parts.next().is_some_and(|t| t.trim() == "trusted"),
            })
        })
        .collect()
}

fn secs(key: &str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid {
                key: key.into(),
                value: raw,
            }),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let seed_worker_api_keys = parse_seed_workers(
            &std::env::var("SEED_WORKER_API_KEYS").unwrap_or_default(),
        );

        let safety_retry = match std::env::var("SAFETY_RETRY").as_deref() {
            Ok("seamless") => SafetyRetryMode::Seamless,
            Ok("surface") | Err(_) => SafetyRetryMode::Surface,
            Ok(other) => {
                return Err(ConfigError::Invalid {
                    key: "SAFETY_RETRY".into(),
                    value: other.into(),
                });
            }
        };

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            broker_url: std::env::var("BROKER_URL").unwrap_or_else(|_| "memory:".into()),
            allowed_model_configs: AllowList::parse(
                &std::env::var("ALLOWED_MODEL_CONFIGS").unwrap_or_else(|_| "*".into()),
            ),
            allowed_compat_hashes: AllowList::parse(
                &std::env::var("ALLOWED_COMPAT_HASHES").unwrap_or_else(|_| "*".into()),
            ),
            timeout_schedule: secs("TIMEOUT_SCHEDULE_SECS", 60)?,
            timeout_stall: secs("TIMEOUT_STALL_SECS", 30)?,
            heartbeat_interval: secs("HEARTBEAT_SECS", 10)?,
            cancel_ack_timeout: secs("CANCEL_ACK_SECS", 5)?,
            compliance_interval: secs("COMPLIANCE_INTERVAL_SECS", 3600)?,
            token_queue_ttl: secs("TOKEN_QUEUE_TTL_SECS", 30)?,
            auth_secret: std::env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty()),
            seed_worker_api_keys,
            safety_retry,
        })
    }

    /// Finite defaults for tests; no message is ever permanently pending.
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            broker_url: "memory:".into(),
            allowed_model_configs: AllowList::Any,
            allowed_compat_hashes: AllowList::Any,
            timeout_schedule: Duration::from_millis(500),
            timeout_stall: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(200),
            cancel_ack_timeout: Duration::from_millis(200),
            compliance_interval: Duration::from_secs(3600),
            token_queue_ttl: Duration::from_secs(5),
            auth_secret: None,
            seed_worker_api_keys: Vec::new(),
            safety_retry: SafetyRetryMode::Surface,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_star_allows_everything() {
        let list = AllowList::parse("*");
        assert!(list.allows("m1"));
        assert!(list.allows("anything"));
    }

    #[test]
    fn allow_list_csv_is_exact() {
        let list = AllowList::parse("m1, m2");
        assert!(list.allows("m1"));
        assert!(list.allows("m2"));
        assert!(!list.allows("m3"));
    }

    #[test]
    fn seed_workers_parse_the_optional_trust_flag() {
        let seeds = parse_seed_workers("k1:alpha:trusted, k2:beta, :broken");
        assert_eq!(
            seeds,
            vec![
                SeedWorker {
                    api_key: "k1".into(),
                    name: "alpha".into(),
                    trusted: true,
                },
                SeedWorker {
                    api_key: "k2".into(),
                    name: "beta".into(),
                    trusted: false,
                },
            ]
        );
    }
}

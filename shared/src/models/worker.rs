use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Registered generation worker. Created administratively; never deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    /// Opaque credential presented once at connect.
    pub api_key: String,
    pub name: String,
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub in_compliance_check: bool,
    #[serde(default)]
    pub next_compliance_check: Option<DateTime<Utc>>,
}

impl Worker {
    pub fn new(api_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            api_key: api_key.into(),
            name: name.into(),
            trusted: false,
            in_compliance_check: false,
            // Due immediately so a fresh worker gets its first canary.
            next_compliance_check: Some(Utc::now()),
        }
    }
}

/// Capability a worker advertises at connect. Reduced to the compat hash
/// server-side; a session only ever serves one hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub model_config_name: String,
    #[serde(default)]
    pub max_parallel: Option<u32>,
    #[serde(default)]
    pub hardware: Option<String>,
}

impl WorkerConfig {
    pub fn compat_hash(&self) -> String {
        super::params::compat_hash(&self.model_config_name)
    }
}

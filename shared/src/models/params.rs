use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingParameters {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub typical_p: f32,
    pub repetition_penalty: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    pub max_new_tokens: u32,
    pub do_sample: bool,
}

impl Default for SamplingParameters {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 50,
            top_p: 0.95,
            typical_p: 0.5,
            repetition_penalty: 1.2,
            seed: None,
            max_new_tokens: 1024,
            do_sample: true,
        }
    }
}

/// Everything a worker needs to produce one assistant message. Immutable
/// once attached to a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkParameters {
    pub model_config_name: String,
    #[serde(default)]
    pub sampling: SamplingParameters,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<serde_json::Value>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_profile: Option<String>,
    /// Set by a safety rewrite: the worker substitutes this for the last
    /// prompter turn.
    #[serde(default)]
    pub safe_prompt_replacement: Option<String>,
}

impl WorkParameters {
    pub fn for_model(model_config_name: impl Into<String>) -> Self {
        Self {
            model_config_name: model_config_name.into(),
            sampling: SamplingParameters::default(),
            stop_sequences: Vec::new(),
            plugins: Vec::new(),
            system_prompt: None,
            user_profile: None,
            safe_prompt_replacement: None,
        }
    }

    /// Matching key between work and workers. Only the model-config name
    /// participates: identical hashes are fungible across workers, and
    /// sampling settings never fragment the queues.
    pub fn compat_hash(&self) -> String {
        compat_hash(&self.model_config_name)
    }
}

pub fn compat_hash(model_config_name: &str) -> String {
    let digest = Sha256::digest(model_config_name.as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_hash_is_deterministic() {
        assert_eq!(compat_hash("m1"), compat_hash("m1"));
        assert_ne!(compat_hash("m1"), compat_hash("m2"));
    }

    #[test]
    fn sampling_does_not_influence_hash() {
        let mut a = WorkParameters::for_model("m1");
        let mut b = WorkParameters::for_model("m1");
        a.sampling.temperature = 0.1;
        a.stop_sequences.push("</s>".into());
        b.sampling.seed = Some(42);
        assert_eq!(a.compat_hash(), b.compat_hash());
    }
}

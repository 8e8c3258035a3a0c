use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Candidate values per variable, as produced by the model.
pub type VariableOptions = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionsCacheKey {
    pub prompt_hash: String,
}

impl OptionsCacheKey {
    pub fn new(model: &str, prompt: &str) -> Self {
        Self {
            prompt_hash: compute_prompt_hash(model, prompt),
        }
    }
}

/// On-disk cache of generated variable options, so repeated runs against the
/// same pathway skip the expensive generation request.
pub struct OptionsCache {
    cache_dir: PathBuf,
}

impl OptionsCache {
    pub async fn new() -> Result<Self> {
        Self::at(get_cache_directory()?).await
    }

    pub async fn at(cache_dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&cache_dir)
            .await
            .context("Failed to create cache directory")?;

        Ok(Self { cache_dir })
    }

    pub async fn get(&self, key: &OptionsCacheKey) -> Option<VariableOptions> {
        match cacache::read(&self.cache_dir, &key.prompt_hash).await {
            Ok(data) => serde_json::from_slice(&data).ok(),
            Err(_) => None,
        }
    }

    pub async fn insert(&self, key: &OptionsCacheKey, value: &VariableOptions) {
        if let Ok(serialized) = serde_json::to_vec(value) {
            if let Err(error) = cacache::write(&self.cache_dir, &key.prompt_hash, serialized).await
            {
                tracing::debug!(%error, "failed to write variable options to cache");
            }
        }
    }
}

fn get_cache_directory() -> Result<PathBuf> {
    let cache_base = dirs::cache_dir().context("Failed to determine cache directory")?;
    Ok(cache_base.join(env!("CARGO_CRATE_NAME")))
}

fn compute_prompt_hash(model: &str, prompt: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0]);
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

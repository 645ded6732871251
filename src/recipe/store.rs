use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::Recipe;
use crate::storage::KvBackend;

const KEY_PREFIX: &str = "recipe:";

/// Persisted per-domain recipes. Saves overwrite whole recipes
/// (last-write-wins, no merge); per-key serialization is the backing
/// store's job.
pub struct RecipeStore {
    kv: Arc<dyn KvBackend>,
}

impl RecipeStore {
    pub fn new(kv: Arc<dyn KvBackend>) -> Self {
        Self { kv }
    }

    fn key(domain: &str) -> String {
        format!("{}{}", KEY_PREFIX, domain)
    }

    /// Stored recipe for a domain. A record that no longer parses is
    /// treated as absent so the caller regenerates instead of crashing.
    pub async fn load(&self, domain: &str) -> Result<Option<Recipe>> {
        let Some(raw) = self.kv.get(&Self::key(domain)).await? else {
            return Ok(None);
        };

        match serde_json::from_str::<Recipe>(&raw) {
            Ok(recipe) => Ok(Some(recipe)),
            Err(e) => {
                warn!(domain, "Stored recipe is unreadable, treating as absent: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn save(&self, recipe: &Recipe) -> Result<()> {
        let raw = serde_json::to_string(recipe).context("Failed to serialize recipe")?;
        self.kv.set(&Self::key(&recipe.domain), &raw, None).await?;
        debug!(domain = recipe.domain.as_str(), "Saved recipe");
        Ok(())
    }

    pub async fn delete(&self, domain: &str) -> Result<()> {
        self.kv.delete(&Self::key(domain)).await
    }

    /// Every domain with a stored recipe
    pub async fn domains(&self) -> Result<Vec<String>> {
        let keys = self.kv.keys(&format!("{}*", KEY_PREFIX)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(|d| d.to_string()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{ExtractionRule, MediaRules};
    use crate::storage::MemoryKv;
    use std::collections::HashMap;

    fn recipe(domain: &str) -> Recipe {
        Recipe {
            domain: domain.to_string(),
            use_headless: false,
            use_proxy: false,
            timeout: 30,
            user_agent: None,
            proxy_config: None,
            retry_count: 3,
            extraction_rules: HashMap::from([(
                "title".to_string(),
                ExtractionRule::css("h1"),
            )]),
            media_rules: MediaRules {
                images: ExtractionRule::css("img").with_attribute("src"),
                videos: ExtractionRule::css("video").with_attribute("src"),
                embeds: ExtractionRule::css("iframe").with_attribute("src"),
            },
            headers: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn save_then_load_returns_equal_recipe() {
        let store = RecipeStore::new(Arc::new(MemoryKv::new()));
        let original = recipe("example.com");
        store.save(&original).await.unwrap();

        let loaded = store.load("example.com").await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn load_missing_domain_is_none() {
        let store = RecipeStore::new(Arc::new(MemoryKv::new()));
        assert!(store.load("nowhere.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_recipe_is_treated_as_absent() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("recipe:broken.example", "{not json", None)
            .await
            .unwrap();

        let store = RecipeStore::new(kv);
        assert!(store.load("broken.example").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_previous_recipe() {
        let store = RecipeStore::new(Arc::new(MemoryKv::new()));
        store.save(&recipe("example.com")).await.unwrap();

        let mut updated = recipe("example.com");
        updated.use_headless = true;
        store.save(&updated).await.unwrap();

        let loaded = store.load("example.com").await.unwrap().unwrap();
        assert!(loaded.use_headless);
    }
}

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::info;

use crate::server::app::{AppServer, Stage};
use crate::services::GenericService;
use crate::shared::models::{AppState, QueryOptions};
use crate::shared::store::Document;

/// Application-specific setup run once the routes exist and before the
/// socket layer is attached.
#[async_trait]
pub trait BootstrapHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, state: &AppState) -> Result<()>;
}

/// Create backing storage for every registered model.
pub struct EnsureCollections;

#[async_trait]
impl BootstrapHook for EnsureCollections {
    fn name(&self) -> &'static str {
        "ensure-collections"
    }

    async fn run(&self, state: &AppState) -> Result<()> {
        for model in state.registry.models() {
            model.ensure_collection().await?;
        }
        Ok(())
    }
}

/// Insert the configured seed records into models that have none yet.
pub struct SeedRecords;

#[async_trait]
impl BootstrapHook for SeedRecords {
    fn name(&self) -> &'static str {
        "seed-records"
    }

    async fn run(&self, state: &AppState) -> Result<()> {
        for (model_name, records) in &state.config.seed {
            let service = GenericService::new(state.registry.clone(), model_name)
                .map_err(|e| anyhow!("Cannot seed records: {e}"))?;

            let existing = service
                .get_record(
                    &Document::new(),
                    None,
                    QueryOptions {
                        limit: Some(1),
                        ..Default::default()
                    },
                )
                .await?;
            if !existing.is_empty() {
                info!("{} already has records, skipping seed", model_name);
                continue;
            }

            for record in records {
                service.create_record(record.clone()).await?;
            }
            info!("Seeded {} {} records", records.len(), model_name);
        }
        Ok(())
    }
}

pub fn default_hooks() -> Vec<Box<dyn BootstrapHook>> {
    vec![Box::new(EnsureCollections), Box::new(SeedRecords)]
}

/// Step g: run every hook to completion, in order.
pub async fn bootstrap(server: &mut AppServer, hooks: &[Box<dyn BootstrapHook>]) -> Result<()> {
    server.expect_next(Stage::Bootstrapped)?;

    let state = server.state().clone();
    for hook in hooks {
        info!("Running bootstrap hook '{}'", hook.name());
        hook.run(&state)
            .await
            .map_err(|e| e.context(format!("bootstrap hook '{}' failed", hook.name())))?;
    }

    server.advance(Stage::Bootstrapped)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::config::AppConfig;
    use crate::shared::models::{ModelDefinition, ModelRegistry};
    use crate::shared::store::{DocumentStore, FindOptions, MemoryStore};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn state_with_seed(seed: BTreeMap<String, Vec<Document>>) -> AppState {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let registry =
            ModelRegistry::new(vec![ModelDefinition::new("User")], store.clone()).unwrap();
        AppState {
            store,
            registry: Arc::new(registry),
            config: Arc::new(AppConfig {
                seed,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_seed_runs_once() {
        let mut seed = BTreeMap::new();
        seed.insert(
            "User".to_string(),
            vec![json!({"name": "root"}).as_object().cloned().unwrap()],
        );
        let state = state_with_seed(seed);

        SeedRecords.run(&state).await.unwrap();
        SeedRecords.run(&state).await.unwrap();

        let users = state
            .store
            .find("users", &Document::new(), &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0]["createdAt"].is_i64());
    }

    #[tokio::test]
    async fn test_seed_for_unknown_model_fails() {
        let mut seed = BTreeMap::new();
        seed.insert("Ghost".to_string(), Vec::new());
        let state = state_with_seed(seed);
        let err = SeedRecords.run(&state).await.unwrap_err();
        assert!(err.to_string().contains("Ghost"));
    }
}

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Map;
use thiserror::Error;

use super::model::Model;
use crate::shared::store::{validate_collection_name, Document, DocumentStore};

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Model name must not be empty")]
    EmptyName,
    #[error("Model '{0}' is registered more than once")]
    Duplicate(String),
    #[error("Model '{model}' has an invalid collection name '{collection}'")]
    InvalidCollection { model: String, collection: String },
    #[error("Model '{model}' field '{field}' references unknown model '{target}'")]
    UnknownReference {
        model: String,
        field: String,
        target: String,
    },
}

/// Schema-level description of one model, as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    /// Backing collection. Defaults to the lowercased, pluralised name.
    #[serde(default)]
    pub collection: Option<String>,
    /// Maintain `createdAt` / `updatedAt` automatically.
    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub defaults: Document,
    /// Field path -> referenced model name, used when populating.
    #[serde(default)]
    pub references: BTreeMap<String, String>,
}

fn default_timestamps() -> bool {
    true
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: None,
            timestamps: true,
            required: Vec::new(),
            defaults: Map::new(),
            references: BTreeMap::new(),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn with_required(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_reference(mut self, field: impl Into<String>, model: impl Into<String>) -> Self {
        self.references.insert(field.into(), model.into());
        self
    }

    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub fn collection_name(&self) -> String {
        if let Some(collection) = self.collection.as_deref().map(str::trim) {
            if !collection.is_empty() {
                return collection.to_string();
            }
        }
        let lower = self.name.trim().to_lowercase();
        if lower.ends_with('s') {
            lower
        } else {
            format!("{lower}s")
        }
    }
}

/// Immutable mapping from model name to its collection handle. Built once at
/// startup and shared behind an `Arc`.
pub struct ModelRegistry {
    models: HashMap<String, Model>,
}

impl ModelRegistry {
    pub fn new(
        definitions: Vec<ModelDefinition>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<Self, RegistryError> {
        let mut collections: HashMap<String, String> = HashMap::new();
        for definition in &definitions {
            let name = definition.name.trim();
            if name.is_empty() {
                return Err(RegistryError::EmptyName);
            }
            let collection = definition.collection_name();
            if validate_collection_name(&collection).is_err() {
                return Err(RegistryError::InvalidCollection {
                    model: name.to_string(),
                    collection,
                });
            }
            if collections.insert(name.to_string(), collection).is_some() {
                return Err(RegistryError::Duplicate(name.to_string()));
            }
        }

        let mut models = HashMap::with_capacity(definitions.len());
        for definition in definitions {
            let name = definition.name.trim().to_string();
            let mut references = HashMap::new();
            for (field, target) in &definition.references {
                let Some(collection) = collections.get(target.trim()) else {
                    return Err(RegistryError::UnknownReference {
                        model: name.clone(),
                        field: field.clone(),
                        target: target.clone(),
                    });
                };
                references.insert(field.clone(), collection.clone());
            }
            let collection = collections.get(&name).cloned().unwrap_or_default();
            models.insert(
                name,
                Model::new(Arc::new(definition), collection, references, store.clone()),
            );
        }

        Ok(Self { models })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

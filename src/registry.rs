//! Decoding of raw entity traits into typed payloads.
//!
//! A [`TraitRegistry`] is populated once at startup through its builder and is
//! read-only afterwards; components that need typed traits receive it through
//! their constructors.

use crate::models::{Entity, EntityId, EntityTrait, OperationId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

pub const COLLECTION_TYPE: &str = "workspace.Collection";
pub const CHILD_OF_TYPE: &str = "workspace.ChildOf";
pub const TASK_TYPE: &str = "workspace.Task";
pub const NOTE_TYPE: &str = "workspace.Note";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionTrait {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildOfTrait {
    pub container_id: EntityId,
    pub weight: f64,
}

impl ChildOfTrait {
    pub fn to_entity_trait(&self, trait_id: impl Into<String>) -> EntityTrait {
        EntityTrait::new(
            trait_id,
            CHILD_OF_TYPE,
            json!({ "containerId": self.container_id.as_str(), "weight": self.weight }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTrait {
    pub name: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteTrait {
    pub name: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraitPayload {
    Collection(CollectionTrait),
    ChildOf(ChildOfTrait),
    Task(TaskTrait),
    Note(NoteTrait),
    Unknown { message_type: String },
}

/// A decoded `ChildOf` trait together with the identity and version of the trait carrying it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRelation {
    pub trait_id: String,
    pub version: OperationId,
    pub container_id: EntityId,
    pub weight: f64,
}

type Decoder = Box<dyn Fn(&Value) -> Result<TraitPayload, serde_json::Error> + Send + Sync>;

#[derive(Default)]
pub struct TraitRegistryBuilder {
    decoders: HashMap<String, Decoder>,
}

impl TraitRegistryBuilder {
    pub fn register<T>(mut self, message_type: &str, wrap: fn(T) -> TraitPayload) -> Self
    where
        T: DeserializeOwned + 'static,
    {
        let decoder: Decoder = Box::new(move |value: &Value| T::deserialize(value).map(wrap));
        self.decoders.insert(message_type.to_string(), decoder);
        self
    }

    pub fn build(self) -> TraitRegistry {
        TraitRegistry {
            decoders: self.decoders,
        }
    }
}

pub struct TraitRegistry {
    decoders: HashMap<String, Decoder>,
}

impl std::fmt::Debug for TraitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("TraitRegistry").field("types", &types).finish()
    }
}

impl TraitRegistry {
    pub fn builder() -> TraitRegistryBuilder {
        TraitRegistryBuilder::default()
    }

    pub fn with_defaults() -> Self {
        Self::builder()
            .register(COLLECTION_TYPE, TraitPayload::Collection)
            .register(CHILD_OF_TYPE, TraitPayload::ChildOf)
            .register(TASK_TYPE, TraitPayload::Task)
            .register(NOTE_TYPE, TraitPayload::Note)
            .build()
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.decoders.contains_key(message_type)
    }

    /// Unregistered or malformed traits come back as [`TraitPayload::Unknown`].
    pub fn decode(&self, entity_trait: &EntityTrait) -> TraitPayload {
        let Some(decoder) = self.decoders.get(&entity_trait.message_type) else {
            return TraitPayload::Unknown {
                message_type: entity_trait.message_type.clone(),
            };
        };
        match decoder(&entity_trait.data) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(
                    trait_id = %entity_trait.id,
                    message_type = %entity_trait.message_type,
                    error = %error,
                    "malformed trait payload"
                );
                TraitPayload::Unknown {
                    message_type: entity_trait.message_type.clone(),
                }
            }
        }
    }

    pub fn child_relations(&self, entity: &Entity) -> Vec<ChildRelation> {
        entity
            .traits
            .iter()
            .filter_map(|entity_trait| match self.decode(entity_trait) {
                TraitPayload::ChildOf(child_of) => Some(ChildRelation {
                    trait_id: entity_trait.id.clone(),
                    version: entity_trait.version(),
                    container_id: child_of.container_id,
                    weight: child_of.weight,
                }),
                _ => None,
            })
            .collect()
    }

    pub fn relation_to(&self, entity: &Entity, container_id: &EntityId) -> Option<ChildRelation> {
        self.child_relations(entity)
            .into_iter()
            .find(|relation| &relation.container_id == container_id)
    }

    pub fn is_container(&self, entity: &Entity) -> bool {
        entity
            .traits
            .iter()
            .any(|entity_trait| matches!(self.decode(entity_trait), TraitPayload::Collection(_)))
    }

    /// Name of the first named trait (collection, task or note).
    pub fn display_name(&self, entity: &Entity) -> Option<String> {
        entity
            .traits
            .iter()
            .find_map(|entity_trait| match self.decode(entity_trait) {
                TraitPayload::Collection(collection) => Some(collection.name),
                TraitPayload::Task(task) => Some(task.name),
                TraitPayload::Note(note) => Some(note.name),
                TraitPayload::ChildOf(_) | TraitPayload::Unknown { .. } => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_registered_and_unknown_traits() {
        let registry = TraitRegistry::with_defaults();
        let collection = EntityTrait::new("c", COLLECTION_TYPE, json!({ "name": "Inbox" }));
        let custom = EntityTrait::new("x", "mail.Thread", json!({ "subject": "hi" }));

        assert_eq!(
            registry.decode(&collection),
            TraitPayload::Collection(CollectionTrait {
                name: "Inbox".to_string(),
                description: String::new(),
            })
        );
        assert_eq!(
            registry.decode(&custom),
            TraitPayload::Unknown {
                message_type: "mail.Thread".to_string()
            }
        );
    }

    #[test]
    fn malformed_payload_decodes_to_unknown() {
        let registry = TraitRegistry::with_defaults();
        let broken = EntityTrait::new("p", CHILD_OF_TYPE, json!({ "weight": "heavy" }));
        assert!(matches!(registry.decode(&broken), TraitPayload::Unknown { .. }));
    }

    #[test]
    fn child_relations_carry_trait_version() {
        let registry = TraitRegistry::with_defaults();
        let mut relation = ChildOfTrait {
            container_id: EntityId::from("inbox"),
            weight: 12.0,
        }
        .to_entity_trait("child_of_inbox");
        relation.creation_operation_id = 4;
        relation.modification_operation_id = Some(7);
        let entity = Entity::new("e1")
            .with_trait(EntityTrait::new("n", NOTE_TYPE, json!({ "name": "Groceries" })))
            .with_trait(relation);

        let relations = registry.child_relations(&entity);
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].container_id.as_str(), "inbox");
        assert_eq!(relations[0].version, 7);
        assert_eq!(registry.display_name(&entity).as_deref(), Some("Groceries"));
    }

    #[test]
    fn builder_only_knows_what_was_registered() {
        let registry = TraitRegistry::builder()
            .register(TASK_TYPE, TraitPayload::Task)
            .build();
        assert!(registry.is_registered(TASK_TYPE));
        assert!(!registry.is_registered(COLLECTION_TYPE));
    }
}

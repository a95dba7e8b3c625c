use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type OperationId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        Self(format!("et{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTrait {
    pub id: String,
    pub message_type: String,
    pub data: Value,
    #[serde(default)]
    pub creation_operation_id: OperationId,
    #[serde(default)]
    pub modification_operation_id: Option<OperationId>,
}

impl EntityTrait {
    pub fn new(id: impl Into<String>, message_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            message_type: message_type.into(),
            data,
            creation_operation_id: 0,
            modification_operation_id: None,
        }
    }

    /// Operation that last wrote this trait.
    pub fn version(&self) -> OperationId {
        self.modification_operation_id
            .unwrap_or(self.creation_operation_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub traits: Vec<EntityTrait>,
    pub last_operation_id: OperationId,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            traits: Vec::new(),
            last_operation_id: 0,
        }
    }

    pub fn with_trait(mut self, entity_trait: EntityTrait) -> Self {
        self.last_operation_id = self.last_operation_id.max(entity_trait.version());
        self.traits.push(entity_trait);
        self
    }

    pub fn with_operation(mut self, operation_id: OperationId) -> Self {
        self.last_operation_id = operation_id;
        self
    }

    pub fn trait_by_id(&self, trait_id: &str) -> Option<&EntityTrait> {
        self.traits.iter().find(|entity_trait| entity_trait.id == trait_id)
    }

    pub fn traits_of_type<'a>(
        &'a self,
        message_type: &'a str,
    ) -> impl Iterator<Item = &'a EntityTrait> + 'a {
        self.traits
            .iter()
            .filter(move |entity_trait| entity_trait.message_type == message_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum QueryPredicate {
    AllOfType { message_type: String },
    ChildOf { container_id: EntityId },
    Ids { ids: Vec<EntityId> },
}

/// Covers the half-open range `(after_token, before_token]` in query order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paging {
    pub after_token: Option<PageToken>,
    pub before_token: Option<PageToken>,
    pub count: u32,
}

impl Paging {
    pub fn first(count: u32) -> Self {
        Self {
            after_token: None,
            before_token: None,
            count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOrdering {
    pub descending: bool,
}

impl Default for QueryOrdering {
    fn default() -> Self {
        Self { descending: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub predicate: QueryPredicate,
    pub paging: Paging,
    #[serde(default)]
    pub ordering: QueryOrdering,
}

impl Query {
    pub fn new(predicate: QueryPredicate, count: u32) -> Self {
        Self {
            predicate,
            paging: Paging::first(count),
            ordering: QueryOrdering::default(),
        }
    }

    pub fn children_of(container_id: impl Into<EntityId>, count: u32) -> Self {
        Self::new(
            QueryPredicate::ChildOf {
                container_id: container_id.into(),
            },
            count,
        )
    }

    pub fn all_of_type(message_type: impl Into<String>, count: u32) -> Self {
        Self::new(
            QueryPredicate::AllOfType {
                message_type: message_type.into(),
            },
            count,
        )
    }

    /// Same predicate and ordering over a different page range.
    pub fn with_paging(&self, paging: Paging) -> Self {
        Self {
            predicate: self.predicate.clone(),
            paging,
            ordering: self.ordering,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPage {
    pub entities: Vec<Entity>,
    pub next_page_token: Option<PageToken>,
    pub prev_page_token: Option<PageToken>,
    pub estimated_count: u64,
}

impl ResultPage {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_full(&self, requested: u32) -> bool {
        self.entities.len() == requested as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MutationRequest {
    PutTrait {
        entity_id: EntityId,
        entity_trait: EntityTrait,
    },
    DeleteTrait {
        entity_id: EntityId,
        trait_id: String,
    },
    DeleteEntity {
        entity_id: EntityId,
    },
}

impl MutationRequest {
    pub fn entity_id(&self) -> &EntityId {
        match self {
            Self::PutTrait { entity_id, .. }
            | Self::DeleteTrait { entity_id, .. }
            | Self::DeleteEntity { entity_id } => entity_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub operation_id: OperationId,
    pub entity_ids: Vec<EntityId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trait_version_prefers_modification() {
        let mut entity_trait = EntityTrait::new("t1", "workspace.Note", json!({ "name": "a" }));
        entity_trait.creation_operation_id = 3;
        assert_eq!(entity_trait.version(), 3);
        entity_trait.modification_operation_id = Some(9);
        assert_eq!(entity_trait.version(), 9);
    }

    #[test]
    fn with_paging_keeps_predicate_and_ordering() {
        let query = Query::children_of("inbox", 2);
        let next = query.with_paging(Paging {
            after_token: Some(PageToken::new("t2")),
            before_token: None,
            count: 2,
        });
        assert_eq!(next.predicate, query.predicate);
        assert_eq!(next.ordering, query.ordering);
        assert_eq!(next.paging.after_token, Some(PageToken::new("t2")));
    }

    #[test]
    fn mutation_request_uses_tagged_json() {
        let request = MutationRequest::DeleteEntity {
            entity_id: EntityId::from("e1"),
        };
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["type"], "delete-entity");
        assert_eq!(value["entityId"], "e1");
    }
}

use crate::errors::{AppError, AppResult};
use crate::hierarchy::HierarchyResolver;
use crate::models::{Entity, EntityId, MutationRequest, MutationResult};
use crate::registry::ChildOfTrait;
use crate::settings::LiveDataSettings;
use crate::store::EntityStore;
use crate::weights::{compute_weight, DropPosition, WeightRequest, WeightRules};
use std::sync::Arc;

/// Where an entity was dropped: relative to `over`, a child of `parent_id`
/// listed between `previous` (above) and `next` (below). For
/// [`DropPosition::Into`] the entity goes into `over` itself.
#[derive(Debug, Clone, Copy)]
pub struct DropTarget<'a> {
    pub parent_id: &'a EntityId,
    pub over: &'a Entity,
    pub previous: Option<&'a Entity>,
    pub next: Option<&'a Entity>,
    pub position: DropPosition,
}

/// Turns a drop gesture into the `ChildOf` mutations that persist it.
pub struct DropPlanner {
    resolver: Arc<HierarchyResolver>,
    rules: WeightRules,
}

impl DropPlanner {
    pub fn new(resolver: Arc<HierarchyResolver>, settings: &LiveDataSettings) -> Self {
        Self {
            resolver,
            rules: WeightRules::from(settings),
        }
    }

    pub fn rules(&self) -> &WeightRules {
        &self.rules
    }

    /// `source_parent` is the container the entity is dragged out of; when it
    /// differs from the destination the old relation is removed.
    pub fn plan(
        &self,
        moving: &Entity,
        source_parent: Option<&EntityId>,
        target: &DropTarget<'_>,
        now_millis: i64,
    ) -> AppResult<Vec<MutationRequest>> {
        let registry = self.resolver.registry();
        let destination = match target.position {
            DropPosition::Into => &target.over.id,
            DropPosition::Before | DropPosition::After => target.parent_id,
        };
        if self.resolver.would_create_cycle(&moving.id, destination) {
            tracing::debug!(
                moving = %moving.id,
                destination = %destination,
                "refusing drop that creates a cycle"
            );
            return Err(AppError::Policy(format!(
                "Moving '{}' into '{}' would make it its own ancestor",
                moving.id, destination
            )));
        }

        let weight_in_parent = |entity: &Entity| {
            registry
                .relation_to(entity, target.parent_id)
                .map(|relation| relation.weight)
        };
        let over = match target.position {
            DropPosition::Into => weight_in_parent(target.over).unwrap_or_default(),
            DropPosition::Before | DropPosition::After => {
                weight_in_parent(target.over).ok_or_else(|| {
                    AppError::Policy(format!(
                        "'{}' is not a child of '{}'",
                        target.over.id, target.parent_id
                    ))
                })?
            }
        };
        let request = WeightRequest {
            over,
            previous: target.previous.and_then(weight_in_parent),
            next: target.next.and_then(weight_in_parent),
            position: target.position,
        };
        let weight = compute_weight(&request, &self.rules, now_millis);

        let trait_id = registry
            .relation_to(moving, destination)
            .map(|relation| relation.trait_id)
            .unwrap_or_else(|| format!("child_of_{}", destination));
        let mut requests = vec![MutationRequest::PutTrait {
            entity_id: moving.id.clone(),
            entity_trait: ChildOfTrait {
                container_id: destination.clone(),
                weight,
            }
            .to_entity_trait(trait_id),
        }];

        if let Some(source) = source_parent.filter(|source| *source != destination) {
            if let Some(relation) = registry.relation_to(moving, source) {
                requests.push(MutationRequest::DeleteTrait {
                    entity_id: moving.id.clone(),
                    trait_id: relation.trait_id,
                });
            }
        }
        Ok(requests)
    }

    pub fn plan_now(
        &self,
        moving: &Entity,
        source_parent: Option<&EntityId>,
        target: &DropTarget<'_>,
    ) -> AppResult<Vec<MutationRequest>> {
        self.plan(moving, source_parent, target, chrono::Utc::now().timestamp_millis())
    }

    /// Sends the requests in order, stopping at the first failure.
    pub async fn apply(
        store: &dyn EntityStore,
        requests: Vec<MutationRequest>,
    ) -> AppResult<Vec<MutationResult>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(store.mutate(request).await?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::{DropPlanner, DropTarget};
    use crate::hierarchy::HierarchyResolver;
    use crate::models::{Entity, EntityId, EntityTrait, MutationRequest};
    use crate::registry::{ChildOfTrait, TraitRegistry, TraitPayload, COLLECTION_TYPE, NOTE_TYPE};
    use crate::settings::LiveDataSettings;
    use crate::store::ManualStore;
    use crate::weights::DropPosition;
    use serde_json::json;
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000_000;

    fn child_of(container: &str, weight: f64) -> EntityTrait {
        ChildOfTrait {
            container_id: EntityId::from(container),
            weight,
        }
        .to_entity_trait(format!("child_of_{}", container))
    }

    fn note(id: &str, container: &str, weight: f64) -> Entity {
        Entity::new(id)
            .with_trait(EntityTrait::new("note", NOTE_TYPE, json!({ "name": id })))
            .with_trait(child_of(container, weight))
    }

    fn collection(id: &str, parent: Option<&str>) -> Entity {
        let entity = Entity::new(id).with_trait(EntityTrait::new(
            "collection",
            COLLECTION_TYPE,
            json!({ "name": id }),
        ));
        match parent {
            Some(parent) => entity.with_trait(child_of(parent, 1.0)),
            None => entity,
        }
        .with_operation(1)
    }

    fn planner() -> DropPlanner {
        let settings = LiveDataSettings::default();
        let registry = Arc::new(TraitRegistry::with_defaults());
        let resolver = Arc::new(HierarchyResolver::new(registry, &settings));
        resolver.ingest(&[
            collection("inbox", None),
            collection("projects", None),
            collection("alpha", Some("projects")),
        ]);
        DropPlanner::new(resolver, &settings)
    }

    fn put_weight(request: &MutationRequest) -> (String, f64) {
        let MutationRequest::PutTrait { entity_trait, .. } = request else {
            panic!("expected put trait");
        };
        let registry = TraitRegistry::with_defaults();
        let TraitPayload::ChildOf(child_of) = registry.decode(entity_trait) else {
            panic!("expected child of");
        };
        (entity_trait.id.clone(), child_of.weight)
    }

    #[test]
    fn reorder_within_parent_reuses_relation() {
        let planner = planner();
        let inbox = EntityId::from("inbox");
        let moving = note("m", "inbox", 5.0);
        let over = note("o", "inbox", 20.0);
        let previous = note("p", "inbox", 30.0);

        let requests = planner
            .plan(
                &moving,
                Some(&inbox),
                &DropTarget {
                    parent_id: &inbox,
                    over: &over,
                    previous: Some(&previous),
                    next: None,
                    position: DropPosition::Before,
                },
                NOW,
            )
            .expect("plan");
        assert_eq!(requests.len(), 1);
        assert_eq!(put_weight(&requests[0]), ("child_of_inbox".to_string(), 25.0));
    }

    #[test]
    fn move_between_parents_drops_old_relation() {
        let planner = planner();
        let inbox = EntityId::from("inbox");
        let projects = EntityId::from("projects");
        let moving = note("m", "inbox", 5.0);
        let alpha = collection("alpha", Some("projects"));

        let requests = planner
            .plan(
                &moving,
                Some(&inbox),
                &DropTarget {
                    parent_id: &projects,
                    over: &alpha,
                    previous: None,
                    next: None,
                    position: DropPosition::Into,
                },
                NOW,
            )
            .expect("plan");
        assert_eq!(requests.len(), 2);
        assert_eq!(put_weight(&requests[0]), ("child_of_alpha".to_string(), NOW as f64));
        assert_eq!(
            requests[1],
            MutationRequest::DeleteTrait {
                entity_id: EntityId::from("m"),
                trait_id: "child_of_inbox".to_string(),
            }
        );
    }

    #[test]
    fn into_descendant_is_refused() {
        let planner = planner();
        let root = EntityId::from("root");
        let projects = collection("projects", None);
        let alpha = collection("alpha", Some("projects"));

        let error = planner
            .plan(
                &projects,
                None,
                &DropTarget {
                    parent_id: &root,
                    over: &alpha,
                    previous: None,
                    next: None,
                    position: DropPosition::Into,
                },
                NOW,
            )
            .expect_err("cycle");
        assert!(error.to_string().starts_with("POLICY_DENIED"));
    }

    #[test]
    fn over_outside_parent_is_refused() {
        let planner = planner();
        let inbox = EntityId::from("inbox");
        let moving = note("m", "inbox", 5.0);
        let stranger = note("s", "projects", 5.0);

        let result = planner.plan(
            &moving,
            Some(&inbox),
            &DropTarget {
                parent_id: &inbox,
                over: &stranger,
                previous: None,
                next: None,
                position: DropPosition::After,
            },
            NOW,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn apply_sends_requests_in_order() {
        let store = ManualStore::new();
        let requests = vec![
            MutationRequest::DeleteTrait {
                entity_id: EntityId::from("m"),
                trait_id: "a".to_string(),
            },
            MutationRequest::DeleteTrait {
                entity_id: EntityId::from("m"),
                trait_id: "b".to_string(),
            },
        ];
        let results = DropPlanner::apply(store.as_ref(), requests.clone()).await.expect("apply");
        assert_eq!(results.len(), 2);
        assert_eq!(store.mutations(), requests);
    }
}

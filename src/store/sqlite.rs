use super::{EntityStore, MutationFuture, SnapshotSink, SubscriptionEvent, SubscriptionId};
use crate::errors::{AppError, AppResult};
use crate::models::{
    Entity, EntityId, EntityTrait, MutationRequest, MutationResult, OperationId, PageToken, Query,
    QueryPredicate, ResultPage,
};
use crate::registry::{TraitRegistry, CHILD_OF_TYPE};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Reference entity store on SQLite.
///
/// Understands the three built-in predicates, orders `ChildOf` queries by
/// relation weight and everything else by last operation id, then entity id.
/// Page tokens are `<ordering value>|<entity id>`. Every mutation re-runs all
/// live queries and pushes a fresh snapshot to each.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    registry: Arc<TraitRegistry>,
    subscriptions: Mutex<SubscriptionTable>,
    db_path: Option<PathBuf>,
}

#[derive(Default)]
struct SubscriptionTable {
    next_id: SubscriptionId,
    entries: BTreeMap<SubscriptionId, (Query, SnapshotSink)>,
}

#[derive(Debug, Clone, PartialEq)]
struct OrderKey {
    value: f64,
    entity_id: String,
}

impl OrderKey {
    fn token(&self) -> PageToken {
        PageToken::new(format!("{}|{}", self.value, self.entity_id))
    }

    fn parse(token: &PageToken) -> AppResult<Self> {
        let invalid = || AppError::Policy(format!("Invalid page token '{}'", token.as_str()));
        let (value, entity_id) = token.as_str().split_once('|').ok_or_else(invalid)?;
        let value = value.parse::<f64>().map_err(|_| invalid())?;
        Ok(Self {
            value,
            entity_id: entity_id.to_string(),
        })
    }

    /// `Less` when `self` comes first in query order.
    fn cmp_in_order(&self, other: &Self, descending: bool) -> Ordering {
        let ascending = self
            .value
            .total_cmp(&other.value)
            .then_with(|| self.entity_id.cmp(&other.entity_id));
        if descending {
            ascending.reverse()
        } else {
            ascending
        }
    }
}

impl SqliteStore {
    pub fn new(path: &Path, registry: Arc<TraitRegistry>) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, registry, Some(path.to_path_buf()))
    }

    pub fn in_memory(registry: Arc<TraitRegistry>) -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, registry, None)
    }

    fn from_connection(
        conn: Connection,
        registry: Arc<TraitRegistry>,
        db_path: Option<PathBuf>,
    ) -> AppResult<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            registry,
            subscriptions: Mutex::new(SubscriptionTable::default()),
            db_path,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn lock_conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, SubscriptionTable> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes every trait of `entity`, one operation per trait, and notifies subscribers once.
    pub fn insert_entity(&self, entity: &Entity) -> AppResult<MutationResult> {
        let mut last = None;
        {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction()?;
            for entity_trait in &entity.traits {
                last = Some(put_trait(&tx, &entity.id, entity_trait)?);
            }
            tx.commit()?;
        }
        self.refresh_subscriptions();
        let operation_id = last.ok_or_else(|| {
            AppError::Policy(format!("Entity '{}' has no traits to insert", entity.id))
        })?;
        Ok(MutationResult {
            operation_id,
            entity_ids: vec![entity.id.clone()],
        })
    }

    /// Inserts a new entity under a freshly generated id.
    pub fn create_entity(&self, traits: Vec<EntityTrait>) -> AppResult<MutationResult> {
        let mut entity = Entity::new(EntityId::generate());
        for entity_trait in traits {
            entity = entity.with_trait(entity_trait);
        }
        self.insert_entity(&entity)
    }

    pub fn get_entity(&self, entity_id: &EntityId) -> AppResult<Option<Entity>> {
        let conn = self.lock_conn()?;
        load_entity(&conn, entity_id.as_str())
    }

    pub fn apply(&self, request: &MutationRequest) -> AppResult<MutationResult> {
        let operation_id = {
            let mut conn = self.lock_conn()?;
            let tx = conn.transaction()?;
            let operation_id = match request {
                MutationRequest::PutTrait {
                    entity_id,
                    entity_trait,
                } => put_trait(&tx, entity_id, entity_trait)?,
                MutationRequest::DeleteTrait { entity_id, trait_id } => {
                    require_entity(&tx, entity_id)?;
                    let operation_id = record_operation(&tx, entity_id, "delete-trait")?;
                    tx.execute(
                        "DELETE FROM entity_traits WHERE entity_id = ?1 AND trait_id = ?2",
                        params![entity_id.as_str(), trait_id],
                    )?;
                    touch_entity(&tx, entity_id, operation_id)?;
                    operation_id
                }
                MutationRequest::DeleteEntity { entity_id } => {
                    require_entity(&tx, entity_id)?;
                    let operation_id = record_operation(&tx, entity_id, "delete-entity")?;
                    tx.execute(
                        "DELETE FROM entity_traits WHERE entity_id = ?1",
                        params![entity_id.as_str()],
                    )?;
                    tx.execute("DELETE FROM entities WHERE id = ?1", params![entity_id.as_str()])?;
                    operation_id
                }
            };
            tx.commit()?;
            operation_id
        };

        tracing::debug!(
            entity_id = %request.entity_id(),
            operation_id,
            "applied mutation"
        );
        self.refresh_subscriptions();
        Ok(MutationResult {
            operation_id,
            entity_ids: vec![request.entity_id().clone()],
        })
    }

    pub fn execute_query(&self, query: &Query) -> AppResult<ResultPage> {
        let candidates = {
            let conn = self.lock_conn()?;
            load_candidates(&conn, &query.predicate)?
        };

        let mut keyed: Vec<(OrderKey, Entity)> = candidates
            .into_iter()
            .filter_map(|entity| {
                let value = self.ordering_value(&entity, &query.predicate)?;
                let key = OrderKey {
                    value,
                    entity_id: entity.id.as_str().to_string(),
                };
                Some((key, entity))
            })
            .collect();
        let descending = query.ordering.descending;
        keyed.sort_by(|(a, _), (b, _)| a.cmp_in_order(b, descending));
        let estimated_count = keyed.len() as u64;

        let after = query.paging.after_token.as_ref().map(OrderKey::parse).transpose()?;
        let before = query.paging.before_token.as_ref().map(OrderKey::parse).transpose()?;
        let mut in_range = keyed.into_iter().filter(|(key, _)| {
            let after_ok = after
                .as_ref()
                .map_or(true, |bound| key.cmp_in_order(bound, descending) == Ordering::Greater);
            let before_ok = before
                .as_ref()
                .map_or(true, |bound| key.cmp_in_order(bound, descending) != Ordering::Greater);
            after_ok && before_ok
        });

        let page: Vec<(OrderKey, Entity)> =
            (&mut in_range).take(query.paging.count as usize).collect();
        let has_more = in_range.next().is_some();
        let next_page_token = if has_more {
            page.last().map(|(key, _)| key.token())
        } else {
            None
        };
        let prev_page_token = if after.is_some() {
            page.first().map(|(key, _)| key.token())
        } else {
            None
        };

        Ok(ResultPage {
            entities: page.into_iter().map(|(_, entity)| entity).collect(),
            next_page_token,
            prev_page_token,
            estimated_count,
        })
    }

    fn ordering_value(&self, entity: &Entity, predicate: &QueryPredicate) -> Option<f64> {
        match predicate {
            QueryPredicate::ChildOf { container_id } => self
                .registry
                .relation_to(entity, container_id)
                .map(|relation| relation.weight),
            QueryPredicate::AllOfType { .. } | QueryPredicate::Ids { .. } => {
                Some(entity.last_operation_id as f64)
            }
        }
    }

    fn event_for(&self, query: &Query) -> SubscriptionEvent {
        match self.execute_query(query) {
            Ok(page) => SubscriptionEvent::Snapshot(page),
            Err(error) => {
                tracing::warn!(error = %error, "live query failed");
                SubscriptionEvent::Failed(error.to_string())
            }
        }
    }

    fn refresh_subscriptions(&self) {
        let live: Vec<(SubscriptionId, Query, SnapshotSink)> = self
            .lock_subscriptions()
            .entries
            .iter()
            .map(|(id, (query, sink))| (*id, query.clone(), Arc::clone(sink)))
            .collect();
        for (subscription_id, query, sink) in live {
            tracing::trace!(subscription_id, "pushing snapshot");
            sink(self.event_for(&query));
        }
    }
}

impl EntityStore for SqliteStore {
    fn subscribe(&self, query: Query, sink: SnapshotSink) -> AppResult<SubscriptionId> {
        // Validate tokens up front so a bad query fails the call instead of the stream.
        if let Some(token) = &query.paging.after_token {
            OrderKey::parse(token)?;
        }
        if let Some(token) = &query.paging.before_token {
            OrderKey::parse(token)?;
        }

        let subscription_id = {
            let mut table = self.lock_subscriptions();
            table.next_id += 1;
            let id = table.next_id;
            table.entries.insert(id, (query.clone(), Arc::clone(&sink)));
            id
        };
        sink(self.event_for(&query));
        Ok(subscription_id)
    }

    fn unsubscribe(&self, subscription_id: SubscriptionId) {
        self.lock_subscriptions().entries.remove(&subscription_id);
    }

    fn mutate(&self, request: MutationRequest) -> MutationFuture {
        let result = self.apply(&request);
        Box::pin(async move { result })
    }
}

fn record_operation(
    tx: &Transaction<'_>,
    entity_id: &EntityId,
    kind: &str,
) -> AppResult<OperationId> {
    tx.execute(
        "INSERT INTO operations (entity_id, kind, applied_at) VALUES (?1, ?2, ?3)",
        params![entity_id.as_str(), kind, Utc::now().to_rfc3339()],
    )?;
    Ok(tx.last_insert_rowid() as OperationId)
}

fn touch_entity(
    tx: &Transaction<'_>,
    entity_id: &EntityId,
    operation_id: OperationId,
) -> AppResult<()> {
    tx.execute(
        "INSERT INTO entities (id, last_operation_id) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET last_operation_id = excluded.last_operation_id",
        params![entity_id.as_str(), operation_id as i64],
    )?;
    Ok(())
}

fn require_entity(tx: &Transaction<'_>, entity_id: &EntityId) -> AppResult<()> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM entities WHERE id = ?1",
            params![entity_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    match exists {
        Some(_) => Ok(()),
        None => Err(AppError::NotFound(format!("Entity '{}' not found", entity_id))),
    }
}

fn put_trait(
    tx: &Transaction<'_>,
    entity_id: &EntityId,
    entity_trait: &EntityTrait,
) -> AppResult<OperationId> {
    let operation_id = record_operation(tx, entity_id, "put-trait")?;
    touch_entity(tx, entity_id, operation_id)?;

    let updated = tx.execute(
        "UPDATE entity_traits
         SET message_type = ?3, data_json = ?4, modification_operation_id = ?5
         WHERE entity_id = ?1 AND trait_id = ?2",
        params![
            entity_id.as_str(),
            entity_trait.id,
            entity_trait.message_type,
            entity_trait.data,
            operation_id as i64,
        ],
    )?;
    if updated == 0 {
        tx.execute(
            "INSERT INTO entity_traits (
               entity_id, trait_id, position, message_type, data_json, creation_operation_id
             ) VALUES (
               ?1, ?2,
               (SELECT COALESCE(MAX(position) + 1, 0) FROM entity_traits WHERE entity_id = ?1),
               ?3, ?4, ?5
             )",
            params![
                entity_id.as_str(),
                entity_trait.id,
                entity_trait.message_type,
                entity_trait.data,
                operation_id as i64,
            ],
        )?;
    }
    Ok(operation_id)
}

fn load_candidates(conn: &Connection, predicate: &QueryPredicate) -> AppResult<Vec<Entity>> {
    let ids: Vec<String> = match predicate {
        QueryPredicate::AllOfType { message_type } => {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT entity_id FROM entity_traits
                 WHERE message_type = ?1",
            )?;
            let rows = stmt.query_map(params![message_type], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        QueryPredicate::ChildOf { container_id } => {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT entity_id FROM entity_traits
                 WHERE message_type = ?1 AND json_extract(data_json, '$.containerId') = ?2",
            )?;
            let rows = stmt.query_map(params![CHILD_OF_TYPE, container_id.as_str()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        QueryPredicate::Ids { ids } => ids.iter().map(|id| id.as_str().to_string()).collect(),
    };

    let mut entities = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(entity) = load_entity(conn, &id)? {
            entities.push(entity);
        }
    }
    Ok(entities)
}

fn load_entity(conn: &Connection, entity_id: &str) -> AppResult<Option<Entity>> {
    let last_operation_id: Option<i64> = conn
        .query_row(
            "SELECT last_operation_id FROM entities WHERE id = ?1",
            params![entity_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(last_operation_id) = last_operation_id else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT trait_id, message_type, data_json, creation_operation_id, modification_operation_id
         FROM entity_traits
         WHERE entity_id = ?1
         ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![entity_id], |row| {
        Ok(EntityTrait {
            id: row.get(0)?,
            message_type: row.get(1)?,
            data: row.get::<_, Value>(2)?,
            creation_operation_id: row.get::<_, i64>(3)? as OperationId,
            modification_operation_id: row
                .get::<_, Option<i64>>(4)?
                .map(|value| value as OperationId),
        })
    })?;
    let traits = rows.collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Entity {
        id: EntityId::from(entity_id),
        traits,
        last_operation_id: last_operation_id as OperationId,
    }))
}

//! Boundary to the entity store.
//!
//! The store owns entities and evaluates queries. Everything in this crate
//! reaches it only through [`EntityStore`]: live subscriptions that push full
//! result snapshots, and mutations that return once the store has applied them.

pub mod manual;
pub mod sqlite;

use crate::errors::AppResult;
use crate::models::{MutationRequest, MutationResult, Query, ResultPage};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use manual::ManualStore;
pub use sqlite::SqliteStore;

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Snapshot(ResultPage),
    Failed(String),
}

pub type SnapshotSink = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;
pub type MutationFuture = Pin<Box<dyn Future<Output = AppResult<MutationResult>> + Send>>;

pub trait EntityStore: Send + Sync {
    /// Registers a live query. The sink may be invoked before this returns, and
    /// is invoked again for every change until the subscription is released.
    fn subscribe(&self, query: Query, sink: SnapshotSink) -> AppResult<SubscriptionId>;

    /// Unknown or already released ids are ignored.
    fn unsubscribe(&self, subscription_id: SubscriptionId);

    fn mutate(&self, request: MutationRequest) -> MutationFuture;
}

/// Owned live subscription, released on [`Subscription::cancel`] or drop.
pub struct Subscription {
    id: SubscriptionId,
    store: Arc<dyn EntityStore>,
    active: AtomicBool,
}

impl Subscription {
    pub fn open(store: &Arc<dyn EntityStore>, query: Query, sink: SnapshotSink) -> AppResult<Self> {
        let id = store.subscribe(query, sink)?;
        Ok(Self {
            id,
            store: Arc::clone(store),
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            tracing::debug!(subscription_id = self.id, "releasing subscription");
            self.store.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

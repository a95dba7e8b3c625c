use super::{EntityStore, MutationFuture, SnapshotSink, SubscriptionEvent, SubscriptionId};
use crate::errors::AppResult;
use crate::models::{MutationRequest, MutationResult, OperationId, Query, ResultPage};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Store whose snapshots are pushed by hand. Records every subscribed query and
/// every mutation so UI flows can be driven and inspected without an engine.
#[derive(Default)]
pub struct ManualStore {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    next_subscription_id: SubscriptionId,
    next_operation_id: OperationId,
    subscriptions: BTreeMap<SubscriptionId, (Query, SnapshotSink)>,
    history: Vec<(SubscriptionId, Query)>,
    mutations: Vec<MutationRequest>,
}

impl ManualStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn active_subscriptions(&self) -> Vec<(SubscriptionId, Query)> {
        self.lock()
            .subscriptions
            .iter()
            .map(|(id, (query, _))| (*id, query.clone()))
            .collect()
    }

    /// Every query ever subscribed, in subscription order.
    pub fn subscribed_queries(&self) -> Vec<(SubscriptionId, Query)> {
        self.lock().history.clone()
    }

    pub fn last_subscription_id(&self) -> Option<SubscriptionId> {
        self.lock().history.last().map(|(id, _)| *id)
    }

    pub fn mutations(&self) -> Vec<MutationRequest> {
        self.lock().mutations.clone()
    }

    /// Returns `false` when the subscription is not live.
    pub fn push(&self, subscription_id: SubscriptionId, page: ResultPage) -> bool {
        self.emit(subscription_id, SubscriptionEvent::Snapshot(page))
    }

    pub fn fail(&self, subscription_id: SubscriptionId, message: &str) -> bool {
        self.emit(subscription_id, SubscriptionEvent::Failed(message.to_string()))
    }

    fn emit(&self, subscription_id: SubscriptionId, event: SubscriptionEvent) -> bool {
        let sink = {
            let state = self.lock();
            match state.subscriptions.get(&subscription_id) {
                Some((_, sink)) => Arc::clone(sink),
                None => return false,
            }
        };
        sink(event);
        true
    }
}

impl EntityStore for ManualStore {
    fn subscribe(&self, query: Query, sink: SnapshotSink) -> AppResult<SubscriptionId> {
        let mut state = self.lock();
        state.next_subscription_id += 1;
        let id = state.next_subscription_id;
        state.history.push((id, query.clone()));
        state.subscriptions.insert(id, (query, sink));
        Ok(id)
    }

    fn unsubscribe(&self, subscription_id: SubscriptionId) {
        self.lock().subscriptions.remove(&subscription_id);
    }

    fn mutate(&self, request: MutationRequest) -> MutationFuture {
        let result = {
            let mut state = self.lock();
            state.next_operation_id += 1;
            let entity_ids = vec![request.entity_id().clone()];
            state.mutations.push(request);
            MutationResult {
                operation_id: state.next_operation_id,
                entity_ids,
            }
        };
        Box::pin(async move { Ok(result) })
    }
}

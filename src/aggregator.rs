//! Growable, deduplicated view over chained live page subscriptions.
//!
//! A [`WindowedQuery`] starts with one window (one live subscription). Each
//! [`WindowedQuery::expand`] appends a window starting at the last window's
//! continuation token and re-pins the previous last window so its far
//! boundary stays at the split point while its count is enlarged. Every
//! window keeps receiving full snapshots; the aggregate is recomputed from the
//! latest snapshot of each window on every read.

use crate::models::{Entity, EntityId, Paging, Query, ResultPage};
use crate::settings::LiveDataSettings;
use crate::store::{EntityStore, SnapshotSink, Subscription, SubscriptionEvent};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;

pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

pub struct WindowedQuery {
    shared: Arc<Shared>,
}

struct Shared {
    store: Arc<dyn EntityStore>,
    repin_page_count: u32,
    on_change: ChangeListener,
    revisions: watch::Sender<u64>,
    state: Mutex<AggregatorState>,
}

#[derive(Default)]
struct AggregatorState {
    windows: Vec<Window>,
    freed: bool,
    next_generation: u64,
    revision: u64,
    last_error: Option<String>,
}

struct Window {
    query: Query,
    page: Option<Arc<ResultPage>>,
    /// Identifies the subscription currently feeding this window. Pushes
    /// tagged with any other generation are stale and dropped.
    generation: u64,
    subscription: Option<Subscription>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSummary {
    pub query: Query,
    pub received: bool,
    pub entity_count: usize,
}

impl WindowedQuery {
    pub fn open<F>(
        store: Arc<dyn EntityStore>,
        query: Query,
        settings: &LiveDataSettings,
        on_change: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (revisions, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            store,
            repin_page_count: settings.repin_page_count,
            on_change: Arc::new(on_change),
            revisions,
            state: Mutex::new(AggregatorState::default()),
        });

        let generation = {
            let mut state = shared.lock();
            let generation = state.allocate_generation();
            state.windows.push(Window {
                query: query.clone(),
                page: None,
                generation,
                subscription: None,
            });
            generation
        };
        tracing::debug!(count = query.paging.count, "opening first window");
        let subscription = Shared::subscribe_window(&shared, generation, query);
        shared.install(generation, subscription);

        Self { shared }
    }

    /// Requests one more page. Returns `false` (and changes nothing) unless the
    /// last window has received a full page carrying a continuation token.
    pub fn expand(&self) -> bool {
        let plan = {
            let mut state = self.shared.lock();
            if state.freed {
                return false;
            }
            let Some(last) = state.windows.last() else {
                return false;
            };
            let Some(page) = &last.page else {
                tracing::debug!("expand ignored: last window has not received a snapshot");
                return false;
            };
            let Some(split) = page.next_page_token.clone() else {
                tracing::debug!("expand ignored: no next page");
                return false;
            };
            let page_size = last.query.paging.count;
            if !page.is_full(page_size) {
                tracing::debug!(
                    received = page.entities.len(),
                    page_size,
                    "expand ignored: partial page"
                );
                return false;
            }

            let next_query = last.query.with_paging(Paging {
                after_token: Some(split.clone()),
                before_token: None,
                count: page_size,
            });
            let repinned_query = last.query.with_paging(Paging {
                after_token: last.query.paging.after_token.clone(),
                before_token: Some(split),
                count: self.shared.repin_page_count.max(page_size),
            });

            let repin_generation = state.allocate_generation();
            let next_generation = state.allocate_generation();
            let last_index = state.windows.len() - 1;
            let replaced = {
                let window = &mut state.windows[last_index];
                window.query = repinned_query.clone();
                window.generation = repin_generation;
                window.subscription.take()
            };
            state.windows.push(Window {
                query: next_query.clone(),
                page: None,
                generation: next_generation,
                subscription: None,
            });
            tracing::debug!(window = last_index + 1, "expanding with new window");

            (replaced, next_generation, next_query, repin_generation, repinned_query)
        };
        let (replaced, next_generation, next_query, repin_generation, repinned_query) = plan;

        let subscription = Shared::subscribe_window(&self.shared, next_generation, next_query);
        self.shared.install(next_generation, subscription);

        let subscription = Shared::subscribe_window(&self.shared, repin_generation, repinned_query);
        self.shared.install(repin_generation, subscription);

        drop(replaced);
        true
    }

    /// Fresh deduplicated concatenation of every window's latest snapshot.
    pub fn results(&self) -> AggregateResults {
        let state = self.shared.lock();
        AggregateResults {
            pages: state
                .windows
                .iter()
                .filter_map(|window| window.page.clone())
                .collect(),
        }
    }

    /// `true` once any window has received its first snapshot.
    pub fn has_results(&self) -> bool {
        self.shared
            .lock()
            .windows
            .iter()
            .any(|window| window.page.is_some())
    }

    pub fn window_count(&self) -> usize {
        self.shared.lock().windows.len()
    }

    pub fn windows(&self) -> Vec<WindowSummary> {
        self.shared
            .lock()
            .windows
            .iter()
            .map(|window| WindowSummary {
                query: window.query.clone(),
                received: window.page.is_some(),
                entity_count: window.page.as_ref().map_or(0, |page| page.entities.len()),
            })
            .collect()
    }

    /// Most recent subscription failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    pub fn revision(&self) -> u64 {
        self.shared.lock().revision
    }

    /// Receiver that observes the revision bumped on every change notification.
    pub fn watch_revisions(&self) -> watch::Receiver<u64> {
        self.shared.revisions.subscribe()
    }

    pub fn is_freed(&self) -> bool {
        self.shared.lock().freed
    }

    /// Releases every subscription. Safe to call more than once.
    pub fn free(&self) {
        let subscriptions: Vec<Subscription> = {
            let mut state = self.shared.lock();
            if state.freed {
                return;
            }
            state.freed = true;
            state
                .windows
                .iter_mut()
                .filter_map(|window| window.subscription.take())
                .collect()
        };
        tracing::debug!(released = subscriptions.len(), "freeing windowed query");
        for subscription in subscriptions {
            subscription.cancel();
        }
    }
}

impl Drop for WindowedQuery {
    fn drop(&mut self) {
        self.free();
    }
}

impl AggregatorState {
    fn allocate_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn subscribe_window(shared: &Arc<Self>, generation: u64, query: Query) -> Option<Subscription> {
        let weak: Weak<Self> = Arc::downgrade(shared);
        let sink: SnapshotSink = Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_event(generation, event);
            }
        });
        match Subscription::open(&shared.store, query, sink) {
            Ok(subscription) => Some(subscription),
            Err(error) => {
                shared.on_event(generation, SubscriptionEvent::Failed(error.to_string()));
                None
            }
        }
    }

    /// Hands the subscription to its window, or releases it when the window is
    /// gone or the query was freed in the meantime.
    fn install(&self, generation: u64, subscription: Option<Subscription>) {
        let Some(subscription) = subscription else {
            return;
        };
        let leftover = {
            let mut state = self.lock();
            if state.freed {
                Some(subscription)
            } else {
                match state
                    .windows
                    .iter_mut()
                    .find(|window| window.generation == generation)
                {
                    Some(window) => {
                        window.subscription = Some(subscription);
                        None
                    }
                    None => Some(subscription),
                }
            }
        };
        drop(leftover);
    }

    fn on_event(&self, generation: u64, event: SubscriptionEvent) {
        let revision = {
            let mut state = self.lock();
            if state.freed {
                return;
            }
            let Some(index) = state
                .windows
                .iter()
                .position(|window| window.generation == generation)
            else {
                tracing::trace!(generation, "dropping stale snapshot");
                return;
            };
            match event {
                SubscriptionEvent::Snapshot(page) => {
                    tracing::trace!(
                        window = index,
                        entities = page.entities.len(),
                        "window snapshot"
                    );
                    state.windows[index].page = Some(Arc::new(page));
                }
                SubscriptionEvent::Failed(message) => {
                    tracing::warn!(window = index, error = %message, "window subscription failed");
                    state.windows[index].page = Some(Arc::new(ResultPage::empty()));
                    state.last_error = Some(message);
                }
            }
            state.revision += 1;
            state.revision
        };
        self.revisions.send_replace(revision);
        (self.on_change)();
    }
}

/// Snapshot of the windows' pages at the time of [`WindowedQuery::results`].
///
/// Iteration is lazy and restartable: every call to [`AggregateResults::iter`]
/// walks the pages from the start. When the first entity of a window is the
/// entity last yielded before it, it is skipped.
#[derive(Debug, Clone, Default)]
pub struct AggregateResults {
    pages: Vec<Arc<ResultPage>>,
}

impl AggregateResults {
    pub fn from_pages(pages: Vec<ResultPage>) -> Self {
        Self {
            pages: pages.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn iter(&self) -> AggregateIter<'_> {
        AggregateIter {
            pages: &self.pages,
            page_index: 0,
            entity_index: 0,
            last_id: None,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.iter().map(|entity| entity.id.clone()).collect()
    }

    pub fn to_vec(&self) -> Vec<Entity> {
        self.iter().cloned().collect()
    }
}

impl<'a> IntoIterator for &'a AggregateResults {
    type Item = &'a Entity;
    type IntoIter = AggregateIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct AggregateIter<'a> {
    pages: &'a [Arc<ResultPage>],
    page_index: usize,
    entity_index: usize,
    last_id: Option<&'a EntityId>,
}

impl<'a> Iterator for AggregateIter<'a> {
    type Item = &'a Entity;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let page = self.pages.get(self.page_index)?;
            let Some(entity) = page.entities.get(self.entity_index) else {
                self.page_index += 1;
                self.entity_index = 0;
                continue;
            };
            let window_head = self.entity_index == 0;
            self.entity_index += 1;
            if window_head && self.last_id == Some(&entity.id) {
                continue;
            }
            self.last_id = Some(&entity.id);
            return Some(entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregateResults, WindowedQuery};
    use crate::models::{Entity, EntityId, PageToken, Query, ResultPage};
    use crate::settings::LiveDataSettings;
    use crate::store::{EntityStore, ManualStore};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn page(ids: &[&str], next: Option<&str>) -> ResultPage {
        ResultPage {
            entities: ids.iter().map(|id| Entity::new(*id)).collect(),
            next_page_token: next.map(PageToken::new),
            prev_page_token: None,
            estimated_count: ids.len() as u64,
        }
    }

    fn ids(results: &AggregateResults) -> Vec<String> {
        results.iter().map(|entity| entity.id.as_str().to_string()).collect()
    }

    fn open(store: &Arc<ManualStore>, count: u32) -> (WindowedQuery, Arc<AtomicUsize>) {
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        let dyn_store: Arc<dyn EntityStore> = store.clone();
        let query = WindowedQuery::open(
            dyn_store,
            Query::children_of("inbox", count),
            &LiveDataSettings::default(),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        (query, changes)
    }

    #[test]
    fn first_snapshot_notifies_and_marks_results() {
        let store = ManualStore::new();
        let (query, changes) = open(&store, 2);
        assert!(!query.has_results());
        assert!(query.results().is_empty());

        let id = store.last_subscription_id().expect("subscribed");
        store.push(id, page(&[], None));
        assert!(query.has_results());
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert_eq!(query.revision(), 1);
    }

    #[test]
    fn expand_is_noop_without_full_page_and_token() {
        let store = ManualStore::new();
        let (query, _) = open(&store, 2);
        assert!(!query.expand(), "no snapshot yet");

        let id = store.last_subscription_id().expect("subscribed");
        store.push(id, page(&["e1"], Some("t1")));
        assert!(!query.expand(), "partial page");

        store.push(id, page(&["e1", "e2"], None));
        assert!(!query.expand(), "no next token");
        assert_eq!(query.window_count(), 1);
        assert_eq!(store.active_subscriptions().len(), 1);
    }

    #[test]
    fn expand_chains_next_window_and_repins_previous() {
        let store = ManualStore::new();
        let (query, _) = open(&store, 2);
        let first = store.last_subscription_id().expect("subscribed");
        store.push(first, page(&["e1", "e2"], Some("t2")));

        assert!(query.expand());
        assert_eq!(query.window_count(), 2);

        let active = store.active_subscriptions();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|(id, _)| *id != first), "original subscription released");

        let windows = query.windows();
        assert_eq!(windows[0].query.paging.before_token, Some(PageToken::new("t2")));
        assert_eq!(windows[0].query.paging.count, 1000);
        assert!(windows[0].received, "previous snapshot kept while re-pinning");
        assert_eq!(windows[1].query.paging.after_token, Some(PageToken::new("t2")));
        assert_eq!(windows[1].query.paging.count, 2);
        assert!(!windows[1].received);
    }

    #[test]
    fn stale_pushes_from_replaced_subscription_are_dropped() {
        let store = ManualStore::new();
        let (query, _) = open(&store, 2);
        let first = store.last_subscription_id().expect("subscribed");
        store.push(first, page(&["e1", "e2"], Some("t2")));
        query.expand();

        assert!(!store.push(first, page(&["x"], None)));
        assert_eq!(ids(&query.results()), vec!["e1", "e2"]);
    }

    #[test]
    fn boundary_duplicate_is_yielded_once() {
        let results = AggregateResults::from_pages(vec![
            page(&["a", "b"], Some("b")),
            page(&["b", "c"], Some("c")),
            page(&[], None),
            page(&["c", "d"], None),
        ]);
        assert_eq!(ids(&results), vec!["a", "b", "c", "d"]);
        assert_eq!(ids(&results), vec!["a", "b", "c", "d"], "iteration restarts");
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn failure_reports_empty_window_and_error() {
        let store = ManualStore::new();
        let (query, changes) = open(&store, 2);
        let id = store.last_subscription_id().expect("subscribed");
        store.push(id, page(&["e1"], None));
        store.fail(id, "engine unavailable");

        assert_eq!(changes.load(Ordering::SeqCst), 2);
        assert!(query.has_results());
        assert!(query.results().is_empty());
        assert_eq!(query.last_error().as_deref(), Some("engine unavailable"));
    }

    #[test]
    fn free_releases_subscriptions_and_silences_callbacks() {
        let store = ManualStore::new();
        let (query, changes) = open(&store, 2);
        let first = store.last_subscription_id().expect("subscribed");
        store.push(first, page(&["e1", "e2"], Some("t2")));
        query.expand();
        let live = store.active_subscriptions();
        assert_eq!(live.len(), 2);

        query.free();
        query.free();
        assert!(query.is_freed());
        assert!(store.active_subscriptions().is_empty());
        for (id, _) in live {
            assert!(!store.push(id, page(&["late"], None)));
        }
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        assert!(!query.expand());
    }

    #[test]
    fn drop_frees_subscriptions() {
        let store = ManualStore::new();
        let (query, _) = open(&store, 2);
        assert_eq!(store.active_subscriptions().len(), 1);
        drop(query);
        assert!(store.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn revision_watch_observes_snapshots() {
        let store = ManualStore::new();
        let (query, _) = open(&store, 2);
        let mut revisions = query.watch_revisions();
        let id = store.last_subscription_id().expect("subscribed");

        store.push(id, page(&["e1"], None));
        revisions.changed().await.expect("sender alive");
        assert_eq!(*revisions.borrow(), 1);
    }

    fn chained_pages(chunks: &[(usize, bool)]) -> (Vec<ResultPage>, Vec<String>) {
        let mut pages = Vec::new();
        let mut expected: Vec<String> = Vec::new();
        let mut next_id = 0usize;
        for (size, overlap) in chunks {
            let mut entities = Vec::new();
            if *overlap {
                if let Some(last) = expected.last() {
                    entities.push(Entity::new(EntityId::new(last.clone())));
                }
            }
            for _ in 0..*size {
                let id = format!("e{:03}", next_id);
                next_id += 1;
                entities.push(Entity::new(EntityId::new(id.clone())));
                expected.push(id);
            }
            pages.push(ResultPage {
                entities,
                ..ResultPage::default()
            });
        }
        (pages, expected)
    }

    proptest! {
        #[test]
        fn concatenation_keeps_window_order_without_boundary_duplicates(
            chunks in prop::collection::vec((0usize..5, any::<bool>()), 1..8)
        ) {
            let (pages, expected) = chained_pages(&chunks);
            let results = AggregateResults::from_pages(pages);
            prop_assert_eq!(ids(&results), expected);
        }
    }
}

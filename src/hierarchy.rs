//! Ancestor chains over the collection graph.
//!
//! Containers are pushed in through [`HierarchyResolver::ingest`] (usually by a
//! [`ContainerFeed`]) and never fetched. Chains are resolved recursively with
//! the current lineage threaded through the recursion, so a container that
//! would close a cycle is left out instead of recursed into. Within one
//! resolution each container is expanded once unless its subtree was cut by
//! the lineage of the caller. Resolved chains are cached per entity id, keyed
//! by the versions of the entity's own `ChildOf` traits, and dropped whenever
//! a container they depended on changes.

use crate::errors::AppResult;
use crate::models::{Entity, EntityId, OperationId, Query};
use crate::registry::{ChildRelation, TraitRegistry, COLLECTION_TYPE};
use crate::settings::LiveDataSettings;
use crate::store::{EntityStore, SnapshotSink, Subscription, SubscriptionEvent};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: EntityId,
    pub name: String,
    pub version: OperationId,
    pub relations: Vec<ChildRelation>,
    pub entity: Arc<Entity>,
}

impl Container {
    pub fn from_entity(entity: &Entity, registry: &TraitRegistry) -> Self {
        Self {
            id: entity.id.clone(),
            name: registry
                .display_name(entity)
                .unwrap_or_else(|| entity.id.as_str().to_string()),
            version: entity.last_operation_id,
            relations: registry.child_relations(entity),
            entity: Arc::new(entity.clone()),
        }
    }
}

#[derive(Debug)]
pub struct Ancestor {
    pub container: Arc<Container>,
    /// Sorted by depth, then name, then id.
    pub parents: Vec<Arc<Ancestor>>,
    /// Fewest hops from this container to a container with no known parent.
    pub depth: usize,
}

impl Ancestor {
    pub fn id(&self) -> &EntityId {
        &self.container.id
    }

    pub fn min_parent(&self) -> Option<&Arc<Ancestor>> {
        self.parents.first()
    }
}

#[derive(Debug)]
pub struct AncestorChain {
    pub entity_id: EntityId,
    pub parents: Vec<Arc<Ancestor>>,
    dependencies: HashSet<EntityId>,
}

impl AncestorChain {
    pub fn min_parent(&self) -> Option<&Arc<Ancestor>> {
        self.parents.first()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    /// Every container id referenced while resolving, resolved or not.
    pub fn depends_on(&self, container_id: &EntityId) -> bool {
        self.dependencies.contains(container_id)
    }

    pub fn contains(&self, container_id: &EntityId) -> bool {
        let mut seen = HashSet::new();
        let mut stack: Vec<&Arc<Ancestor>> = self.parents.iter().collect();
        while let Some(node) = stack.pop() {
            if node.id() == container_id {
                return true;
            }
            if seen.insert(node.id()) {
                stack.extend(node.parents.iter());
            }
        }
        false
    }

    /// Distinct container ids anywhere in the chain.
    pub fn ancestor_ids(&self) -> HashSet<EntityId> {
        let mut ids = HashSet::new();
        let mut stack: Vec<&Arc<Ancestor>> = self.parents.iter().collect();
        while let Some(node) = stack.pop() {
            if ids.insert(node.id().clone()) {
                stack.extend(node.parents.iter());
            }
        }
        ids
    }

    /// Canonical path from the root down to the entity's minimal parent.
    pub fn breadcrumb(&self, virtual_root_id: &EntityId) -> Vec<Arc<Container>> {
        self.min_parent()
            .map(|parent| flatten_hierarchy(parent, virtual_root_id))
            .unwrap_or_default()
    }
}

/// Follows `min_parent` pointers up from `ancestor`, stopping before the
/// virtual root, and returns the containers root-first.
pub fn flatten_hierarchy(
    ancestor: &Arc<Ancestor>,
    virtual_root_id: &EntityId,
) -> Vec<Arc<Container>> {
    let mut path = Vec::new();
    let mut current = Some(ancestor);
    while let Some(node) = current {
        if node.id() == virtual_root_id {
            break;
        }
        path.push(Arc::clone(&node.container));
        current = node.min_parent();
    }
    path.reverse();
    path
}

/// `(trait id, version)` of each `ChildOf` trait the chain was built from.
type ChainKey = Vec<(String, OperationId)>;

type ContainerMap = HashMap<EntityId, Arc<Container>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub changed: usize,
    pub removed: usize,
    pub invalidated: usize,
}

impl IngestReport {
    pub fn is_noop(&self) -> bool {
        self.changed == 0 && self.removed == 0
    }
}

#[derive(Default)]
struct ResolverState {
    containers: Arc<ContainerMap>,
    /// Bumped by every ingest that changes `containers`.
    generation: u64,
    chains: HashMap<EntityId, (ChainKey, Arc<AncestorChain>)>,
}

pub struct HierarchyResolver {
    registry: Arc<TraitRegistry>,
    virtual_root_id: EntityId,
    state: Mutex<ResolverState>,
    listeners: Mutex<Vec<ChangeListener>>,
    recomputations: AtomicU64,
}

impl HierarchyResolver {
    pub fn new(registry: Arc<TraitRegistry>, settings: &LiveDataSettings) -> Self {
        Self {
            registry,
            virtual_root_id: settings.virtual_root_id.clone(),
            state: Mutex::new(ResolverState::default()),
            listeners: Mutex::new(Vec::new()),
            recomputations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &Arc<TraitRegistry> {
        &self.registry
    }

    pub fn virtual_root_id(&self) -> &EntityId {
        &self.virtual_root_id
    }

    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    /// Applies a full snapshot of the known containers. Containers whose
    /// version token is unchanged are skipped; containers missing from the
    /// snapshot are dropped. Cached chains that depended on any changed or
    /// dropped container are invalidated.
    pub fn ingest(&self, containers: &[Entity]) -> IngestReport {
        let report = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let known = Arc::make_mut(&mut state.containers);
            let mut touched: HashSet<EntityId> = HashSet::new();
            let mut incoming: HashSet<&EntityId> = HashSet::with_capacity(containers.len());
            let mut report = IngestReport::default();

            for entity in containers {
                incoming.insert(&entity.id);
                let unchanged = known
                    .get(&entity.id)
                    .is_some_and(|current| current.version == entity.last_operation_id);
                if unchanged {
                    continue;
                }
                known.insert(
                    entity.id.clone(),
                    Arc::new(Container::from_entity(entity, &self.registry)),
                );
                touched.insert(entity.id.clone());
                report.changed += 1;
            }

            let removed: Vec<EntityId> = known
                .keys()
                .filter(|id| !incoming.contains(id))
                .cloned()
                .collect();
            for id in removed {
                known.remove(&id);
                touched.insert(id);
                report.removed += 1;
            }

            if !touched.is_empty() {
                state.generation += 1;
                let before = state.chains.len();
                state
                    .chains
                    .retain(|_, (_, chain)| !touched.iter().any(|id| chain.depends_on(id)));
                report.invalidated = before - state.chains.len();
            }
            report
        };

        if !report.is_noop() {
            tracing::debug!(
                changed = report.changed,
                removed = report.removed,
                invalidated = report.invalidated,
                "container cache updated"
            );
            self.notify();
        }
        report
    }

    pub fn get_container(&self, container_id: &EntityId) -> Option<Arc<Container>> {
        self.lock().containers.get(container_id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn cached_chain_count(&self) -> usize {
        self.lock().chains.len()
    }

    /// Number of chains computed instead of served from the cache.
    pub fn recomputations(&self) -> u64 {
        self.recomputations.load(Ordering::SeqCst)
    }

    /// Resolves the ancestors of `entity`. The walk runs on a snapshot of the
    /// container map with the resolver unlocked; the result is cached only if
    /// no ingest landed in the meantime. Entities without `ChildOf` traits
    /// are never cached.
    pub fn resolve(&self, entity: &Entity) -> Arc<AncestorChain> {
        let relations = self.registry.child_relations(entity);
        let key: ChainKey = relations
            .iter()
            .map(|relation| (relation.trait_id.clone(), relation.version))
            .collect();

        let (containers, generation) = {
            let state = self.lock();
            if let Some((cached_key, chain)) = state.chains.get(&entity.id) {
                if *cached_key == key {
                    return Arc::clone(chain);
                }
            }
            (Arc::clone(&state.containers), state.generation)
        };

        self.recomputations.fetch_add(1, Ordering::SeqCst);
        let mut walk = ParentWalk::new(&containers, &entity.id);
        let parents = walk.resolve(&relations);
        let chain = Arc::new(AncestorChain {
            entity_id: entity.id.clone(),
            parents,
            dependencies: walk.dependencies,
        });
        tracing::trace!(entity_id = %entity.id, "resolved ancestor chain");

        let mut state = self.lock();
        if relations.is_empty() {
            state.chains.remove(&entity.id);
        } else if state.generation == generation {
            state.chains.insert(entity.id.clone(), (key, Arc::clone(&chain)));
        }
        chain
    }

    pub fn flatten(&self, ancestor: &Arc<Ancestor>) -> Vec<Arc<Container>> {
        flatten_hierarchy(ancestor, &self.virtual_root_id)
    }

    pub fn breadcrumb(&self, entity: &Entity) -> Vec<Arc<Container>> {
        self.resolve(entity).breadcrumb(&self.virtual_root_id)
    }

    /// Whether placing `moving_id` into `target_id` would make a container its
    /// own ancestor. Used to refuse such drops before any mutation is sent.
    pub fn would_create_cycle(&self, moving_id: &EntityId, target_id: &EntityId) -> bool {
        if moving_id == target_id {
            return true;
        }
        match self.get_container(target_id) {
            Some(target) => self.resolve(&target.entity).contains(moving_id),
            None => false,
        }
    }

    fn notify(&self) {
        let listeners: Vec<ChangeListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener();
        }
    }
}

/// One ancestor walk. A container is memoized once its subtree resolved
/// without touching the lineage guard; such a subtree holds no cycle, so it
/// reads the same from every path that reaches it.
struct ParentWalk<'a> {
    containers: &'a ContainerMap,
    lineage: HashSet<EntityId>,
    memo: HashMap<EntityId, Arc<Ancestor>>,
    dependencies: HashSet<EntityId>,
}

impl<'a> ParentWalk<'a> {
    fn new(containers: &'a ContainerMap, entity_id: &EntityId) -> Self {
        Self {
            containers,
            lineage: HashSet::from([entity_id.clone()]),
            memo: HashMap::new(),
            dependencies: HashSet::new(),
        }
    }

    fn resolve(&mut self, relations: &[ChildRelation]) -> Vec<Arc<Ancestor>> {
        self.resolve_level(relations).0
    }

    /// Returns the sorted parents and whether the lineage guard cut anything below.
    fn resolve_level(&mut self, relations: &[ChildRelation]) -> (Vec<Arc<Ancestor>>, bool) {
        let mut parents: Vec<Arc<Ancestor>> = Vec::with_capacity(relations.len());
        let mut cut = false;
        for relation in relations {
            let container_id = &relation.container_id;
            self.dependencies.insert(container_id.clone());
            if self.lineage.contains(container_id) {
                tracing::trace!(
                    container_id = %container_id,
                    "skipping container already in lineage"
                );
                cut = true;
                continue;
            }
            if parents.iter().any(|parent| parent.id() == container_id) {
                continue;
            }
            if let Some(known) = self.memo.get(container_id) {
                parents.push(Arc::clone(known));
                continue;
            }
            let Some(container) = self.containers.get(container_id) else {
                continue;
            };

            self.lineage.insert(container_id.clone());
            let (grand_parents, inner_cut) = self.resolve_level(&container.relations);
            self.lineage.remove(container_id);

            let depth = grand_parents
                .iter()
                .map(|parent| parent.depth + 1)
                .min()
                .unwrap_or(0);
            let ancestor = Arc::new(Ancestor {
                container: Arc::clone(container),
                parents: grand_parents,
                depth,
            });
            if inner_cut {
                cut = true;
            } else {
                self.memo.insert(container_id.clone(), Arc::clone(&ancestor));
            }
            parents.push(ancestor);
        }

        parents.sort_by(|a, b| {
            a.depth
                .cmp(&b.depth)
                .then_with(|| a.container.name.cmp(&b.container.name))
                .then_with(|| a.container.id.cmp(&b.container.id))
        });
        (parents, cut)
    }
}

/// Keeps a resolver fed from a live "all containers" subscription.
pub struct ContainerFeed {
    subscription: Subscription,
}

impl ContainerFeed {
    pub fn all_containers_query() -> Query {
        Query::all_of_type(COLLECTION_TYPE, u32::MAX)
    }

    pub fn attach(
        store: Arc<dyn EntityStore>,
        resolver: &Arc<HierarchyResolver>,
        query: Query,
    ) -> AppResult<Self> {
        let weak: Weak<HierarchyResolver> = Arc::downgrade(resolver);
        let sink: SnapshotSink = Arc::new(move |event| {
            let Some(resolver) = weak.upgrade() else {
                return;
            };
            match event {
                SubscriptionEvent::Snapshot(page) => {
                    resolver.ingest(&page.entities);
                }
                SubscriptionEvent::Failed(message) => {
                    tracing::warn!(
                        error = %message,
                        "container feed failed; keeping cached containers"
                    );
                }
            }
        });
        let subscription = Subscription::open(&store, query, sink)?;
        Ok(Self { subscription })
    }

    pub fn cancel(&self) {
        self.subscription.cancel();
    }
}

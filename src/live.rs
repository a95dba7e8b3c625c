use crate::aggregator::WindowedQuery;
use crate::errors::AppResult;
use crate::hierarchy::{ContainerFeed, HierarchyResolver};
use crate::models::{EntityId, Query};
use crate::registry::TraitRegistry;
use crate::reorder::DropPlanner;
use crate::settings::LiveDataSettings;
use crate::store::EntityStore;
use std::sync::Arc;

/// Process-wide wiring of the data layer: one store, one registry, one
/// resolver kept current by its container feed. Queries opened from here are
/// owned by the caller and released when dropped.
pub struct LiveData {
    settings: LiveDataSettings,
    registry: Arc<TraitRegistry>,
    store: Arc<dyn EntityStore>,
    resolver: Arc<HierarchyResolver>,
    feed: ContainerFeed,
}

impl LiveData {
    pub fn start(
        store: Arc<dyn EntityStore>,
        registry: Arc<TraitRegistry>,
        settings: LiveDataSettings,
    ) -> AppResult<Self> {
        settings.validate()?;
        let resolver = Arc::new(HierarchyResolver::new(Arc::clone(&registry), &settings));
        let feed = ContainerFeed::attach(
            Arc::clone(&store),
            &resolver,
            ContainerFeed::all_containers_query(),
        )?;
        tracing::info!(
            page_size = settings.default_page_size,
            repin_page_count = settings.repin_page_count,
            "live data layer started"
        );
        Ok(Self {
            settings,
            registry,
            store,
            resolver,
            feed,
        })
    }

    pub fn settings(&self) -> &LiveDataSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<TraitRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<HierarchyResolver> {
        &self.resolver
    }

    pub fn open_query<F>(&self, query: Query, on_change: F) -> WindowedQuery
    where
        F: Fn() + Send + Sync + 'static,
    {
        WindowedQuery::open(Arc::clone(&self.store), query, &self.settings, on_change)
    }

    /// Children of a container, heaviest first, one default-sized page to start.
    pub fn open_children<F>(&self, container_id: &EntityId, on_change: F) -> WindowedQuery
    where
        F: Fn() + Send + Sync + 'static,
    {
        let query = Query::children_of(container_id.clone(), self.settings.default_page_size);
        self.open_query(query, on_change)
    }

    pub fn drop_planner(&self) -> DropPlanner {
        DropPlanner::new(Arc::clone(&self.resolver), &self.settings)
    }

    pub fn shutdown(&self) {
        self.feed.cancel();
    }
}

pub mod aggregator;
pub mod errors;
pub mod hierarchy;
pub mod live;
pub mod models;
pub mod registry;
pub mod reorder;
pub mod settings;
pub mod store;
pub mod weights;

pub use crate::aggregator::{AggregateResults, WindowedQuery};
pub use crate::errors::{AppError, AppResult};
pub use crate::hierarchy::{
    flatten_hierarchy, Ancestor, AncestorChain, Container, ContainerFeed, HierarchyResolver,
};
pub use crate::live::LiveData;
pub use crate::models::{Entity, EntityId, EntityTrait, MutationRequest, Paging, Query, ResultPage};
pub use crate::registry::TraitRegistry;
pub use crate::reorder::{DropPlanner, DropTarget};
pub use crate::settings::LiveDataSettings;
pub use crate::store::{EntityStore, Subscription};
pub use crate::weights::{compute_weight, DropPosition, WeightRequest, WeightRules};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs JSON logging to a daily rolling file under `log_dir`. `RUST_LOG`
/// wins over `default_filter` when set.
pub fn init_tracing(log_dir: &Path, default_filter: &str) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "live-data.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}

#[cfg(test)]
mod tests {
    use crate::settings::LiveDataSettings;

    #[test]
    fn tracing_writes_to_rolling_file_in_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let settings = LiveDataSettings {
            log_filter: "debug".to_string(),
            ..LiveDataSettings::default()
        };

        settings.init_tracing(&log_dir).expect("init tracing");
        tracing::info!("tracing installed");

        let names: Vec<String> = std::fs::read_dir(&log_dir)
            .expect("log dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|name| name.starts_with("live-data.log")));
        assert!(settings.init_tracing(&log_dir).is_err(), "global subscriber is set once");
    }
}

use crate::errors::{AppError, AppResult};
use crate::models::EntityId;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PINNED_WEIGHT: f64 = 5_000_000_000_000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LiveDataSettings {
    pub default_page_size: u32,
    /// Count given to a window once a later window has been opened after it.
    pub repin_page_count: u32,
    pub pinned_weight: f64,
    pub weight_increment: f64,
    pub virtual_root_id: EntityId,
    pub log_filter: String,
}

impl Default for LiveDataSettings {
    fn default() -> Self {
        Self {
            default_page_size: 50,
            repin_page_count: 1000,
            pinned_weight: DEFAULT_PINNED_WEIGHT,
            weight_increment: 1.0,
            virtual_root_id: EntityId::from("favorites"),
            log_filter: "info".to_string(),
        }
    }
}

impl LiveDataSettings {
    /// Reads settings from a `.yaml`/`.yml` or `.json` file. Missing keys take defaults.
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|value| value.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let settings: Self = match extension.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&raw)?,
            "json" => {
                serde_json::from_str(&raw).map_err(|error| AppError::Config(error.to_string()))?
            }
            other => {
                return Err(AppError::Config(format!(
                    "Unsupported settings format '{}': expected yaml or json",
                    other
                )))
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Installs file logging with `log_filter` as the default filter.
    pub fn init_tracing(&self, log_dir: &Path) -> AppResult<()> {
        crate::init_tracing(log_dir, &self.log_filter)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.default_page_size == 0 {
            return Err(AppError::Config("defaultPageSize must be at least 1".to_string()));
        }
        if self.repin_page_count < self.default_page_size {
            return Err(AppError::Config(format!(
                "repinPageCount ({}) must not be smaller than defaultPageSize ({})",
                self.repin_page_count, self.default_page_size
            )));
        }
        if !self.pinned_weight.is_finite() || self.pinned_weight <= 0.0 {
            return Err(AppError::Config(
                "pinnedWeight must be a positive finite number".to_string(),
            ));
        }
        if !self.weight_increment.is_finite() || self.weight_increment <= 0.0 {
            return Err(AppError::Config(
                "weightIncrement must be a positive finite number".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::LiveDataSettings;
    use std::io::Write;

    #[test]
    fn yaml_overrides_merge_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("live-data.yaml");
        let mut file = std::fs::File::create(&path).expect("create");
        writeln!(file, "repinPageCount: 200\nvirtualRootId: root").expect("write");

        let settings = LiveDataSettings::load(&path).expect("load");
        assert_eq!(settings.repin_page_count, 200);
        assert_eq!(settings.virtual_root_id.as_str(), "root");
        assert_eq!(settings.default_page_size, 50);
    }

    #[test]
    fn rejects_zero_page_size() {
        let settings = LiveDataSettings {
            default_page_size: 0,
            ..LiveDataSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("live-data.toml");
        std::fs::write(&path, "x = 1").expect("write");
        assert!(LiveDataSettings::load(&path).is_err());
    }
}

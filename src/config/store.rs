use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration loaded from an optional TOML file
///
/// Uses `ArcSwap` for lock-free reads, so handlers can fetch the
/// configuration without contending with startup overrides.
#[derive(Clone)]
pub struct ConfigStore {
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Store holding `config`, not tied to any file
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            cache: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Load configuration from `path`
    ///
    /// A missing file is not an error: defaults are used.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str::<AppConfig>(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path.display());
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::in_memory(config))
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Apply runtime-only changes such as command line overrides
    ///
    /// The backing file is never rewritten.
    pub fn override_with<F>(&self, f: F) -> Arc<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.cache.load_full()).clone();
        f(&mut config);
        let config = Arc::new(config);
        self.cache.store(config.clone());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(&dir.path().join("absent.toml")).await.unwrap();

        let config = store.get();
        assert_eq!(config.web.bind_address, "0.0.0.0");
        assert_eq!(config.web.http_port, 8080);
        assert_eq!(config.transform.detector, DetectorKind::None);
    }

    #[tokio::test]
    async fn test_partial_file_and_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("face-relay.toml");
        tokio::fs::write(
            &path,
            r#"
[web]
http_port = 9000

[transform]
detector = "fixed"
fixed_regions = [{ x = 10, y = 20, width = 30, height = 40 }]
"#,
        )
        .await
        .unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        let config = store.get();
        assert_eq!(config.web.http_port, 9000);
        assert_eq!(config.web.bind_address, "0.0.0.0");
        assert_eq!(config.transform.detector, DetectorKind::Fixed);
        assert_eq!(config.transform.fixed_regions.len(), 1);
        assert_eq!(config.webrtc.max_sessions, 8);

        let overridden = store.override_with(|c| c.web.http_port = 9100);
        assert_eq!(overridden.web.http_port, 9100);
        assert_eq!(store.get().web.http_port, 9100);

        // overrides stay in memory
        let reloaded = ConfigStore::load(&path).await.unwrap();
        assert_eq!(reloaded.get().web.http_port, 9000);
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        tokio::fs::write(&path, "web = 3").await.unwrap();

        assert!(matches!(
            ConfigStore::load(&path).await,
            Err(AppError::Config(_))
        ));
    }
}

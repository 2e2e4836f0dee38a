use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use toml_edit::{DocumentMut, Item, value};

use crate::retry::DEFAULT_MAX_ATTEMPTS;

/// Default on-disk config filename
pub const DEFAULT_CONFIG_PATH: &str = "report-photos.toml";

const EXAMPLE_CONFIG: &str = include_str!("../../report-photos.example.toml");

pub const DEFAULT_COMPRESS_THRESHOLD: u64 = 8 * 1024 * 1024;
pub const DEFAULT_SCHEDULER_INTERVAL_MS: u64 = 300;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_RECONCILE_SECS: u64 = 30;

/// Strongly typed representation of the configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    pub env: Option<String>,
    pub server: Option<Server>,
    pub logging: Option<Logging>,
    pub backend: Backend,
    #[serde(default)]
    pub upload: Upload,
    /// Bounds applied when an oversized photo is re-encoded before upload.
    pub image_limits: Option<ImageLimits>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Server {
    pub bind_address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Logging {
    pub filter: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Backend {
    pub base_url: String,
    /// Project key sent as `apikey` alongside the user's bearer token.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub storage_bucket: String,
    #[serde(default = "default_photos_table")]
    pub photos_table: String,
    #[serde(default = "default_metrics_table")]
    pub metrics_table: String,
    #[serde(default = "default_optimize_function")]
    pub optimize_function: String,
}

fn default_photos_table() -> String {
    "report_photos".into()
}

fn default_metrics_table() -> String {
    "photo_metrics".into()
}

fn default_optimize_function() -> String {
    "optimize-photo".into()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Upload {
    pub max_attempts: Option<u32>,
    /// Files larger than this are re-encoded locally first.
    pub compress_threshold_bytes: Option<u64>,
    pub scheduler_interval_ms: Option<u64>,
    pub chunk_size_bytes: Option<usize>,
    /// Cron schedule for the persisted-metadata reconciliation pass.
    pub reconcile_cron: Option<croner::Cron>,
    /// Used when no cron is configured.
    pub reconcile_interval_secs: Option<u64>,
}

impl Default for Upload {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            compress_threshold_bytes: Some(DEFAULT_COMPRESS_THRESHOLD),
            scheduler_interval_ms: Some(DEFAULT_SCHEDULER_INTERVAL_MS),
            chunk_size_bytes: Some(DEFAULT_CHUNK_SIZE),
            reconcile_cron: None,
            reconcile_interval_secs: Some(DEFAULT_RECONCILE_SECS),
        }
    }
}

impl Upload {
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1)
    }

    pub fn compress_threshold(&self) -> u64 {
        self.compress_threshold_bytes
            .unwrap_or(DEFAULT_COMPRESS_THRESHOLD)
    }

    /// Resting interval of the scheduler loop, kept within 250–500 ms.
    pub fn scheduler_interval(&self) -> std::time::Duration {
        let ms = self
            .scheduler_interval_ms
            .unwrap_or(DEFAULT_SCHEDULER_INTERVAL_MS)
            .clamp(250, 500);
        std::time::Duration::from_millis(ms)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size_bytes.unwrap_or(DEFAULT_CHUNK_SIZE).max(1024)
    }

    pub fn reconcile_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.reconcile_interval_secs
                .unwrap_or(DEFAULT_RECONCILE_SECS)
                .max(1),
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// JPEG quality 1–100 for re-encoded photos.
    pub jpeg_quality: Option<u8>,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_width: Some(2560),
            max_height: Some(2560),
            jpeg_quality: Some(82),
        }
    }
}

/// Internal manager state kept behind an `Arc<RwLock<_>>`.
#[derive(Debug)]
pub struct ConfigManager {
    path: PathBuf,
    doc: DocumentMut,
}

pub type SharedConfig = Arc<RwLock<ConfigManager>>;

impl ConfigManager {
    /// Load existing config file. If the file does not exist, creates it from the embedded example.
    pub async fn load(path: Option<PathBuf>) -> Result<SharedConfig> {
        let path = path
            .or_else(|| std::env::var_os("REPORT_PHOTOS_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            fs::write(&path, EXAMPLE_CONFIG)
                .await
                .with_context(|| format!("writing example config to {}", path.display()))?;
            tracing::warn!(path = %path.display(), "config not found; wrote example config, edit backend settings before uploading");
        }

        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_text(path, &text)
    }

    pub fn from_text(path: PathBuf, text: &str) -> Result<SharedConfig> {
        let doc = text
            .parse::<DocumentMut>()
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(Arc::new(RwLock::new(Self { path, doc })))
    }

    /// Convert current document to strongly typed struct.
    pub async fn to_struct(cfg: &SharedConfig) -> Result<Config> {
        let guard = cfg.read().await;
        let typed: Config = toml_edit::de::from_document(guard.doc.clone())?;
        Ok(typed)
    }

    /// Update upload tuning. Only provided values are changed.
    pub async fn update_upload(
        cfg: &SharedConfig,
        compress_threshold_bytes: Option<u64>,
        max_attempts: Option<u32>,
    ) -> Result<()> {
        if max_attempts == Some(0) {
            bail!("max_attempts must be at least 1");
        }
        let mut guard = cfg.write().await;
        let upload = guard.doc["upload"].or_insert(Item::Table(toml_edit::Table::new()));
        if let Item::Table(tbl) = upload {
            if let Some(v) = compress_threshold_bytes {
                tbl["compress_threshold_bytes"] = value(v as i64);
            }
            if let Some(v) = max_attempts {
                tbl["max_attempts"] = value(v as i64);
            }
            Ok(())
        } else {
            bail!("upload is not a table");
        }
    }

    /// Update re-encode bounds. Only provided values are changed.
    pub async fn update_image_limits(
        cfg: &SharedConfig,
        max_width: Option<u32>,
        max_height: Option<u32>,
        jpeg_quality: Option<u8>,
    ) -> Result<()> {
        if let Some(q) = jpeg_quality
            && !(1..=100).contains(&q)
        {
            bail!("jpeg_quality must be within 1..=100");
        }
        let mut guard = cfg.write().await;
        let limits = guard.doc["image_limits"].or_insert(Item::Table(toml_edit::Table::new()));
        if let Item::Table(tbl) = limits {
            if let Some(v) = max_width {
                tbl["max_width"] = value(v as i64);
            }
            if let Some(v) = max_height {
                tbl["max_height"] = value(v as i64);
            }
            if let Some(v) = jpeg_quality {
                tbl["jpeg_quality"] = value(v as i64);
            }
            Ok(())
        } else {
            bail!("image_limits is not a table");
        }
    }

    /// Atomic write of current document to disk (best-effort durability via rename).
    pub async fn save(cfg: &SharedConfig) -> Result<()> {
        let (path, contents) = {
            let guard = cfg.read().await;
            (guard.path.clone(), guard.doc.to_string())
        };
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)
            .await
            .with_context(|| format!("writing tmp config {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming tmp config to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
# hand-written comment survives edits
[backend]
base_url = "https://backend.example"
storage_bucket = "photos"
"#;

    fn shared(text: &str) -> SharedConfig {
        ConfigManager::from_text(PathBuf::from("test.toml"), text).unwrap()
    }

    #[tokio::test]
    async fn minimal_config_uses_defaults() {
        let cfg = ConfigManager::to_struct(&shared(MINIMAL)).await.unwrap();
        assert_eq!(cfg.backend.photos_table, "report_photos");
        assert_eq!(cfg.backend.optimize_function, "optimize-photo");
        assert_eq!(cfg.upload.max_attempts(), 3);
        assert_eq!(cfg.upload.compress_threshold(), 8 * 1024 * 1024);
        assert_eq!(cfg.upload.scheduler_interval().as_millis(), 300);
        assert!(cfg.image_limits.is_none());
    }

    #[tokio::test]
    async fn scheduler_interval_is_clamped() {
        let text = format!("{MINIMAL}\n[upload]\nscheduler_interval_ms = 5\n");
        let cfg = ConfigManager::to_struct(&shared(&text)).await.unwrap();
        assert_eq!(cfg.upload.scheduler_interval().as_millis(), 250);
        assert_eq!(cfg.upload.max_attempts(), 3);
    }

    #[tokio::test]
    async fn upload_edits_keep_comments() {
        let cfg = shared(MINIMAL);
        ConfigManager::update_upload(&cfg, Some(1024), Some(5))
            .await
            .unwrap();
        ConfigManager::update_image_limits(&cfg, Some(800), None, Some(70))
            .await
            .unwrap();
        let typed = ConfigManager::to_struct(&cfg).await.unwrap();
        assert_eq!(typed.upload.compress_threshold(), 1024);
        assert_eq!(typed.upload.max_attempts(), 5);
        let limits = typed.image_limits.unwrap();
        assert_eq!(limits.max_width, Some(800));
        assert_eq!(limits.max_height, None);
        assert_eq!(limits.jpeg_quality, Some(70));
        assert!(cfg.read().await.doc.to_string().contains("hand-written comment"));
    }

    #[tokio::test]
    async fn rejects_bad_values() {
        let cfg = shared(MINIMAL);
        assert!(ConfigManager::update_upload(&cfg, None, Some(0)).await.is_err());
        assert!(
            ConfigManager::update_image_limits(&cfg, None, None, Some(0))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn example_config_parses() {
        let cfg = ConfigManager::to_struct(&shared(EXAMPLE_CONFIG)).await.unwrap();
        assert!(!cfg.backend.base_url.is_empty());
        assert!(cfg.image_limits.is_some());
    }
}

//! Last-known-good snapshot persistence
//!
//! The inverter poller hands every published snapshot to a
//! [`SnapshotStore`]. At startup a recent enough snapshot is served until
//! the first live cycle completes. Nothing depends on the store for
//! correctness.

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::telemetry::TelemetrySnapshot;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durability sink for published snapshots
pub trait SnapshotStore: Send + Sync {
    fn load_last_known_good(&self) -> Result<Option<TelemetrySnapshot>>;
    fn store_snapshot(&self, snapshot: &TelemetrySnapshot) -> Result<()>;
}

/// On-disk envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSnapshot {
    version: String,
    snapshot: TelemetrySnapshot,
}

/// Snapshot kept as one JSON file
pub struct JsonFileStore {
    path: PathBuf,
    max_age: Duration,
    logger: StructuredLogger,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P, max_age: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_age,
            logger: get_logger("persistence"),
        }
    }

    /// `None` when persistence is disabled.
    pub fn from_config(config: &PersistenceConfig) -> Option<Self> {
        config.enabled.then(|| {
            Self::new(
                &config.cache_file,
                Duration::seconds(config.max_age_secs as i64),
            )
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn load_last_known_good(&self) -> Result<Option<TelemetrySnapshot>> {
        if !self.path.exists() {
            self.logger.info("No cached snapshot found");
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let stored: StoredSnapshot = serde_json::from_str(&contents)?;
        let age = Utc::now() - stored.snapshot.timestamp;
        if age > self.max_age {
            self.logger.info(&format!(
                "Ignoring cached snapshot from {} ({}s old)",
                stored.snapshot.timestamp,
                age.num_seconds()
            ));
            return Ok(None);
        }

        self.logger.info(&format!(
            "Loaded cached snapshot from {} (written by {})",
            stored.snapshot.timestamp, stored.version
        ));
        Ok(Some(stored.snapshot))
    }

    fn store_snapshot(&self, snapshot: &TelemetrySnapshot) -> Result<()> {
        let stored = StoredSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            snapshot: snapshot.clone(),
        };
        let contents = serde_json::to_string_pretty(&stored)?;

        // Write beside the target and rename so a reader never sees half a file
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        self.logger.debug("Saved snapshot to disk");
        Ok(())
    }
}

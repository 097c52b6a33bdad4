//! Configuration module for campipe
//!
//! A [`PipelineConfig`] describes one camera session: engine timing, the
//! frame selector, the monitor, dual-sensor tunables, feature flags, the
//! connection table for the hardware variant and the configured client
//! streams. It is stored as TOML.
//!
//! # Config Location
//!
//! The default file lives in the platform config directory:
//! - **Linux**: `~/.config/campipe/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/campipe/pipeline.toml`
//! - **Windows**: `%APPDATA%\campipe\pipeline.toml`
//!
//! # Example
//!
//! ```toml
//! [pipeline]
//! batch_size = 1
//! settle_frames = 0
//!
//! [features]
//! face_detection = true
//! reprocessing = true
//!
//! [[connections]]
//! from = "sensor"
//! to = "bayer"
//! mode = "memory_mediated"
//! ```

use crate::error::{CampipeError, Result};
use crate::pipeline::dual::DualConfig;
use crate::pipeline::frame::DualRole;
use crate::pipeline::monitor::MonitorSettings;
use crate::pipeline::plan::{GraphCompiler, GraphKey};
use crate::pipeline::reconciler::ReconcilerSettings;
use crate::pipeline::stage::{ConnectionTable, FeatureFlags};
use crate::pipeline::worker::WorkerSettings;
use crate::types::{PixelFormat, Size, StreamConfig, StreamKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name under the platform config dir
pub const APP_DIR: &str = "campipe";

/// Default config filename
pub const CONFIG_FILE: &str = "pipeline.toml";

/// Default sensor resolution
pub const DEFAULT_SENSOR_SIZE: Size = Size::new(4000, 3000);

/// Default frame selector depth
pub const DEFAULT_HOLD_COUNT: usize = 4;

/// Default pacing wait in milliseconds
pub const DEFAULT_PACING_TIMEOUT_MS: u64 = 100;

/// Default lane queue poll in milliseconds
pub const DEFAULT_POLL_MS: u64 = 50;

/// Default result-delivery wait in milliseconds
pub const DEFAULT_RESULT_TIMEOUT_MS: u64 = 500;

/// Default flush drain timeout in milliseconds
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 1000;

/// Default still-capture selection timeout in milliseconds
pub const DEFAULT_CAPTURE_TIMEOUT_MS: u64 = 300;

/// Path of the default config file, if the platform has a config dir
pub fn default_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

/// Engine timing and batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Requests carried by one frame
    pub batch_size: usize,
    /// Filler frames built before requests are consumed
    pub settle_frames: u64,
    pub pacing_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub result_timeout_ms: u64,
    pub flush_timeout_ms: u64,
    pub capture_timeout_ms: u64,
    /// How long the sync lane waits for the other half of a pair
    pub pair_timeout_ms: u64,
    pub sensor_size: Size,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            batch_size: 1,
            settle_frames: 0,
            pacing_timeout_ms: DEFAULT_PACING_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_MS,
            result_timeout_ms: DEFAULT_RESULT_TIMEOUT_MS,
            flush_timeout_ms: DEFAULT_FLUSH_TIMEOUT_MS,
            capture_timeout_ms: DEFAULT_CAPTURE_TIMEOUT_MS,
            pair_timeout_ms: 100,
            sensor_size: DEFAULT_SENSOR_SIZE,
        }
    }
}

/// Frame selector settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    /// Retain raw frames for still capture
    pub enabled: bool,
    pub hold_count: usize,
}

impl Default for SelectorSection {
    fn default() -> Self {
        Self {
            enabled: true,
            hold_count: DEFAULT_HOLD_COUNT,
        }
    }
}

/// Monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub interval_ms: u64,
    pub stage_stall_ticks: u32,
    pub result_stall_ticks: u32,
}

impl Default for MonitorSection {
    fn default() -> Self {
        let d = MonitorSettings::default();
        Self {
            interval_ms: d.interval.as_millis() as u64,
            stage_stall_ticks: d.stage_stall_ticks,
            result_stall_ticks: d.result_stall_ticks,
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub selector: SelectorSection,
    pub monitor: MonitorSection,
    /// Used when `features.dual_sensor` is set
    pub dual: DualConfig,
    pub features: FeatureFlags,
    pub connections: ConnectionTable,
    pub streams: Vec<StreamConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineSection::default(),
            selector: SelectorSection::default(),
            monitor: MonitorSection::default(),
            dual: DualConfig::default(),
            features: FeatureFlags {
                reprocessing: true,
                ..Default::default()
            },
            connections: ConnectionTable::default_single(),
            streams: vec![
                StreamConfig::new(StreamKind::Preview, Size::new(1920, 1080), PixelFormat::Nv21),
                StreamConfig::new(StreamKind::Callback, Size::new(1280, 720), PixelFormat::Nv21),
                StreamConfig::new(StreamKind::Still, DEFAULT_SENSOR_SIZE, PixelFormat::Nv21),
            ],
        }
    }
}

impl PipelineConfig {
    /// Dual-sensor preset: both chains wired, sync and fusion through memory
    pub fn dual() -> Self {
        let mut config = Self::default();
        config.features.dual_sensor = true;
        config.connections = ConnectionTable::default_dual();
        config
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CampipeError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        toml::from_str(&content).map_err(|e| {
            CampipeError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Load from the default location, returning defaults on any error
    pub fn load_or_default() -> Self {
        let Some(path) = default_path().filter(|p| p.exists()) else {
            return Self::default();
        };
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load pipeline config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save as TOML, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CampipeError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            CampipeError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    /// Check the config before a session uses it
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.batch_size == 0 {
            return Err(CampipeError::Config("batch_size must be at least 1".into()));
        }
        if self.pipeline.sensor_size.is_empty() {
            return Err(CampipeError::Config("sensor_size must be non-empty".into()));
        }
        if self.selector.enabled && self.selector.hold_count == 0 {
            return Err(CampipeError::Config(
                "selector.hold_count must be at least 1 when the selector is enabled".into(),
            ));
        }
        if self.dual.min_sync_zoom > self.dual.max_sync_zoom {
            return Err(CampipeError::Config(
                "dual.min_sync_zoom must not exceed dual.max_sync_zoom".into(),
            ));
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if stream.size.is_empty() {
                return Err(CampipeError::Config(format!("stream {} has an empty size", stream.kind)));
            }
            if self.streams[..i].iter().any(|s| s.kind == stream.kind) {
                return Err(CampipeError::Config(format!("stream {} configured twice", stream.kind)));
            }
        }
        let wants_still = self.streams.iter().any(|s| s.kind == StreamKind::Still);
        if wants_still && !(self.features.reprocessing && self.selector.enabled) {
            return Err(CampipeError::Config(
                "the still stream needs features.reprocessing and an enabled selector".into(),
            ));
        }

        for key in self.graph_keys() {
            GraphCompiler::compile(&self.connections, &self.features, key, 0)
                .map_err(|e| CampipeError::Config(format!("connections: {}", e)))?;
        }
        Ok(())
    }

    /// Every graph a session with this config may build
    pub fn graph_keys(&self) -> Vec<GraphKey> {
        let mut keys = if self.features.dual_sensor {
            vec![
                GraphKey::preview(DualRole::Primary, false),
                GraphKey::preview(DualRole::Secondary, false),
                GraphKey::preview(DualRole::Primary, true),
                GraphKey::preview(DualRole::Secondary, true),
            ]
        } else {
            vec![GraphKey::preview(DualRole::Single, false)]
        };
        if self.features.reprocessing {
            keys.push(GraphKey::reprocessing());
        }
        keys
    }

    pub fn stream(&self, kind: StreamKind) -> Option<&StreamConfig> {
        self.streams.iter().find(|s| s.kind == kind)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.flush_timeout_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.result_timeout_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.capture_timeout_ms)
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            batch_size: self.pipeline.batch_size,
            settle_frames: self.pipeline.settle_frames,
            pacing_timeout: Duration::from_millis(self.pipeline.pacing_timeout_ms),
            retain_raw: self.selector.enabled,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll: Duration::from_millis(self.pipeline.poll_interval_ms),
            pair_timeout: Duration::from_millis(self.pipeline.pair_timeout_ms),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_millis(self.monitor.interval_ms),
            stage_stall_ticks: self.monitor.stage_stall_ticks,
            result_stall_ticks: self.monitor.result_stall_ticks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::StageId;
    use crate::pipeline::stage::ConnectionMode;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        PipelineConfig::default().validate().unwrap();
        PipelineConfig::dual().validate().unwrap();
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = PipelineConfig::dual();
        config.pipeline.batch_size = 2;
        config.dual.force_synchronized = true;
        config.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [pipeline]
            batch_size = 3

            [selector]
            hold_count = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.pipeline.batch_size, 3);
        assert_eq!(config.pipeline.flush_timeout_ms, DEFAULT_FLUSH_TIMEOUT_MS);
        assert_eq!(config.selector.hold_count, 8);
        assert!(config.selector.enabled);
        assert_eq!(config.connections, ConnectionTable::default_single());
    }

    #[test]
    fn test_connections_from_toml() {
        let config: PipelineConfig = toml::from_str(
            r#"
            [[connections]]
            from = "sensor"
            to = "bayer"
            mode = "direct_chain"

            [[connections]]
            from = "bayer"
            to = "isp"
            mode = "direct_chain"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.connections.mode(StageId::Sensor, StageId::Bayer),
            ConnectionMode::DirectChain
        );
        assert_eq!(
            config.connections.mode(StageId::Isp, StageId::Mcsc),
            ConnectionMode::None
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.features.reprocessing = false;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.features.dual_sensor = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connections"));
    }

    #[test]
    fn test_default_path_ends_with_file() {
        if let Some(path) = default_path() {
            assert!(path.ends_with(Path::new(APP_DIR).join(CONFIG_FILE)));
        }
    }
}

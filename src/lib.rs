//! # campipe: camera frame-pipeline orchestration
//!
//! The control plane of a multi-stage camera pipeline. Client capture requests
//! are turned into hardware frames, routed through a graph of processing
//! stages (sensor, Bayer front-end, ISP, multi-scaler, face detector,
//! distortion corrector and, in dual-sensor setups, a second sensor chain
//! with sync and fusion stages) and returned to the client in request order.
//!
//! ## Architecture
//!
//! - **Pipeline**: graph builder, reconciliation loop, lane workers, result
//!   delivery, frame selector, dual-sensor coordinator and monitor
//! - **HAL**: the traits the engine drives hardware through, plus an
//!   in-memory simulator behind the `sim-hardware` feature
//! - **Config**: TOML pipeline configuration with validation
//! - **Communication**: crossbeam channels between every engine thread
//!
//! ## Configuration
//!
//! The default configuration file lives in the platform config directory:
//!
//! - **Linux**: `~/.config/campipe/pipeline.toml`
//! - **macOS**: `~/Library/Application Support/campipe/pipeline.toml`
//! - **Windows**: `%APPDATA%\campipe\pipeline.toml`
//!
//! ## Example
//!
//! ```ignore
//! use campipe::{
//!     config::PipelineConfig,
//!     hal::sim::{SimHardware, SimSensorClock},
//!     pipeline::{CameraId, CaptureRequest, ClientEvent, Session},
//!     types::StreamKind,
//! };
//! use std::sync::Arc;
//!
//! let sim = SimHardware::default();
//! let clock = Arc::new(SimSensorClock::new(30));
//! let (session, bridge) = Session::open(CameraId(0), PipelineConfig::default(), sim.hardware(clock))?;
//! session.start()?;
//!
//! let key = session.submit_request(CaptureRequest::new([StreamKind::Preview]))?;
//! while let Some(event) = bridge.recv_timeout(std::time::Duration::from_secs(1)) {
//!     if let ClientEvent::RequestComplete { key: done, status } = event {
//!         assert_eq!(done, key);
//!         println!("{key}: {status:?}");
//!         break;
//!     }
//! }
//! session.close();
//! ```

pub mod config;
pub mod error;
pub mod hal;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{CampipeError, Result};
pub use pipeline::{
    CameraId, CaptureRequest, ClientBridge, ClientEvent, DeviceState, RequestKey, RequestStatus,
    Session, SessionRegistry,
};
pub use types::{PixelFormat, Rect, Size, StreamConfig, StreamKind};

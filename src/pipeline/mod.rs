//! Frame-pipeline orchestration engine.
//!
//! Client requests become hardware frames that move through a graph of
//! processing stages. Stages joined by a direct chain run as one lane; a
//! memory-mediated link starts a new lane with its own completion queue and
//! worker thread.
//!
//! # Architecture
//!
//! ```text
//! submit_request ──► [RequestQueue] ──► reconciler ──► [FrameFactory] ──► lane 0 ──► lane 1 ──► ... ──► delivery ──► ClientBridge
//!                                          │                                │                            ▲
//!                                          ├── OperationCoordinator (dual)  └── FrameSelector ──► capture ┘
//!                                          └── PacingSource
//! ```
//!
//! # Design
//!
//! - **Data-driven stages**: one static descriptor table, one connection table per session.
//! - **Compiled plans**: graph resolution is cached per `GraphKey` and shared by every frame.
//! - **Move-only frames**: a `Frame` is owned by exactly one queue or thread at a time.
//! - **Ordered completion**: `RequestTracker` releases `RequestComplete` in key order.
//! - **Single fatal path**: only the monitor moves the device into `Error`.

pub mod bridge;
pub mod capture;
pub mod delivery;
pub mod dual;
pub mod error;
pub mod factory;
pub mod frame;
pub mod id;
pub mod monitor;
pub mod network;
pub mod plan;
pub mod port;
pub mod reconciler;
pub mod request;
pub mod selector;
pub mod session;
pub mod stage;
pub mod state;
pub mod thread;
pub mod worker;

pub use bridge::{ClientBridge, ClientEvent, EventSender, RequestStatus};
pub use delivery::DeliveryStats;
pub use dual::{DualConfig, OperationCoordinator, OperationMode};
pub use error::{PipelineError, PipelineResult};
pub use factory::{FrameFactory, FrameSpec, SlotRequest};
pub use frame::{DualRole, EntityState, Frame, FrameKind, FrameMetadata};
pub use id::{CameraId, FrameCount, RequestKey, StageId};
pub use monitor::{HealthSnapshot, MonitorSettings};
pub use plan::{GraphKey, GraphPlan, PipelineKind};
pub use port::{PortDescriptor, PortKind};
pub use request::{CaptureRequest, RequestParams};
pub use selector::{FrameSelector, HistoryEntry, SelectPolicy, SelectorStats};
pub use session::{Session, SessionRegistry};
pub use stage::{ConnectionMode, ConnectionTable, FeatureFlags};
pub use state::DeviceState;

//! Identity types for the pipeline.
//!
//! Frame counts and request keys are monotonic newtypes over `u64`;
//! [`StageId`] is a closed enum whose discriminant doubles as an index into
//! per-stage tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware processing stages known to the engine.
///
/// The declaration order is a valid topological order of the default wiring:
/// every stage appears after its upstream stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Sensor capture (primary chain)
    Sensor,
    /// Bayer front-end / 3A statistics
    Bayer,
    /// Image signal processor
    Isp,
    /// Multi-context scaler
    Mcsc,
    /// Geometric distortion corrector
    Gdc,
    /// Face / feature detector
    Vra,
    SensorSecondary,
    BayerSecondary,
    IspSecondary,
    McscSecondary,
    /// Pairs primary and secondary frames by frame count
    Sync,
    /// Blends a synchronized pair into one output
    Fusion,
    BayerReprocessing,
    IspReprocessing,
    McscReprocessing,
}

impl StageId {
    pub const COUNT: usize = 15;

    pub const ALL: [StageId; Self::COUNT] = [
        StageId::Sensor,
        StageId::Bayer,
        StageId::Isp,
        StageId::Mcsc,
        StageId::Gdc,
        StageId::Vra,
        StageId::SensorSecondary,
        StageId::BayerSecondary,
        StageId::IspSecondary,
        StageId::McscSecondary,
        StageId::Sync,
        StageId::Fusion,
        StageId::BayerReprocessing,
        StageId::IspReprocessing,
        StageId::McscReprocessing,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            StageId::Sensor => "sensor",
            StageId::Bayer => "bayer",
            StageId::Isp => "isp",
            StageId::Mcsc => "mcsc",
            StageId::Gdc => "gdc",
            StageId::Vra => "vra",
            StageId::SensorSecondary => "sensor_secondary",
            StageId::BayerSecondary => "bayer_secondary",
            StageId::IspSecondary => "isp_secondary",
            StageId::McscSecondary => "mcsc_secondary",
            StageId::Sync => "sync",
            StageId::Fusion => "fusion",
            StageId::BayerReprocessing => "bayer_reprocessing",
            StageId::IspReprocessing => "isp_reprocessing",
            StageId::McscReprocessing => "mcsc_reprocessing",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Monotonic frame number, also used as the device command sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct FrameCount(pub u64);

impl FrameCount {
    #[inline]
    pub fn next(self) -> FrameCount {
        FrameCount(self.0 + 1)
    }
}

impl fmt::Debug for FrameCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

impl fmt::Display for FrameCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Client request sequence number, assigned in arrival order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RequestKey(pub u64);

impl RequestKey {
    #[inline]
    pub fn next(self) -> RequestKey {
        RequestKey(self.0 + 1)
    }
}

impl fmt::Debug for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Logical camera identifier used by the session registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "camera{}", self.0)
    }
}

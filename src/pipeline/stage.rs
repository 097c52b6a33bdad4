//! Stage descriptor table and connection-mode table.
//!
//! The descriptor table is static knowledge: which stages exist, which chain
//! they belong to, which stage may feed them and which ports they expose.
//! The [`ConnectionTable`] is configuration: how each stage pair is linked
//! for the current hardware variant. Different SoC variants are different
//! table instances rather than different code paths.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::StageId;
use crate::pipeline::port::{PortDescriptor, PortKind};
use crate::types::StreamKind;
use serde::{Deserialize, Serialize};

/// How two adjacent stages hand data to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Hardware-internal hand-off, no software queue between the stages.
    DirectChain,
    /// Software dequeues the upstream buffer and queues it to the downstream stage.
    MemoryMediated,
    /// The downstream stage is absent.
    #[default]
    None,
}

impl ConnectionMode {
    pub fn is_present(self) -> bool {
        self != ConnectionMode::None
    }
}

/// Which sensor chain (or pipeline) a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Primary,
    Secondary,
    /// Shared by both chains while synchronized.
    Dual,
    /// Only on the primary chain while synchronized.
    DualPrimary,
    Reprocessing,
}

/// Session feature switches consumed by the graph builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub face_detection: bool,
    pub distortion_correction: bool,
    pub dual_sensor: bool,
    pub reprocessing: bool,
}

/// A feature a stage depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    FaceDetection,
    DistortionCorrection,
    DualSensor,
    Reprocessing,
}

impl FeatureFlags {
    pub fn enables(&self, feature: Feature) -> bool {
        match feature {
            Feature::FaceDetection => self.face_detection,
            Feature::DistortionCorrection => self.distortion_correction,
            Feature::DualSensor => self.dual_sensor,
            Feature::Reprocessing => self.reprocessing,
        }
    }
}

/// Static description of one stage.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    pub id: StageId,
    pub chain: Chain,
    /// Stages that may feed this one. Empty for roots.
    pub upstream: &'static [StageId],
    pub feature: Option<Feature>,
    /// Side branch that only runs when a frame asks for its output.
    pub optional: bool,
    pub ports: &'static [PortDescriptor],
}

impl StageDescriptor {
    pub fn is_root(&self) -> bool {
        self.upstream.is_empty()
    }

    pub fn port(&self, index: u8) -> Option<&PortDescriptor> {
        self.ports.iter().find(|p| p.index == index)
    }

    pub fn port_for_stream(&self, stream: StreamKind) -> Option<&PortDescriptor> {
        self.ports.iter().find(|p| p.stream == Some(stream))
    }
}

/// Port index of the sensor raw output on every sensor stage.
pub const RAW_PORT: u8 = 0;

const SENSOR_PORTS: &[PortDescriptor] =
    &[PortDescriptor::stream("raw", RAW_PORT, PortKind::Raw, StreamKind::Raw).feeding(StageId::Bayer)];
const BAYER_PORTS: &[PortDescriptor] = &[
    PortDescriptor::internal("bayer", 0, PortKind::Raw, StageId::Isp),
    PortDescriptor {
        name: "stats",
        index: 1,
        kind: PortKind::Metadata,
        stream: None,
        feeds: None,
    },
];
const ISP_PORTS: &[PortDescriptor] = &[PortDescriptor::internal("yuv", 0, PortKind::Image, StageId::Mcsc)];
const MCSC_PORTS: &[PortDescriptor] = &[
    PortDescriptor::stream("preview", 0, PortKind::Image, StreamKind::Preview).feeding(StageId::Sync),
    PortDescriptor::stream("callback", 1, PortKind::Image, StreamKind::Callback),
    PortDescriptor::stream("video", 2, PortKind::Image, StreamKind::Video).feeding(StageId::Gdc),
    PortDescriptor::internal("downscale", 3, PortKind::Image, StageId::Vra),
];
const GDC_PORTS: &[PortDescriptor] =
    &[PortDescriptor::stream("video", 0, PortKind::Image, StreamKind::Video)];
const VRA_PORTS: &[PortDescriptor] = &[PortDescriptor {
    name: "faces",
    index: 0,
    kind: PortKind::Metadata,
    stream: None,
    feeds: None,
}];
const SENSOR_SECONDARY_PORTS: &[PortDescriptor] = &[PortDescriptor::stream(
    "raw",
    RAW_PORT,
    PortKind::Raw,
    StreamKind::Raw,
)
.feeding(StageId::BayerSecondary)];
const BAYER_SECONDARY_PORTS: &[PortDescriptor] =
    &[PortDescriptor::internal("bayer", 0, PortKind::Raw, StageId::IspSecondary)];
const ISP_SECONDARY_PORTS: &[PortDescriptor] =
    &[PortDescriptor::internal("yuv", 0, PortKind::Image, StageId::McscSecondary)];
const MCSC_SECONDARY_PORTS: &[PortDescriptor] = &[
    PortDescriptor::stream("preview", 0, PortKind::Image, StreamKind::Preview).feeding(StageId::Sync),
    PortDescriptor::stream("callback", 1, PortKind::Image, StreamKind::Callback),
];
const SYNC_PORTS: &[PortDescriptor] = &[PortDescriptor::internal("synced", 0, PortKind::Image, StageId::Fusion)];
const FUSION_PORTS: &[PortDescriptor] =
    &[PortDescriptor::stream("preview", 0, PortKind::Image, StreamKind::Preview)];
const BAYER_REPROCESSING_PORTS: &[PortDescriptor] =
    &[PortDescriptor::internal("bayer", 0, PortKind::Raw, StageId::IspReprocessing)];
const ISP_REPROCESSING_PORTS: &[PortDescriptor] =
    &[PortDescriptor::internal("yuv", 0, PortKind::Image, StageId::McscReprocessing)];
const MCSC_REPROCESSING_PORTS: &[PortDescriptor] =
    &[PortDescriptor::stream("still", 0, PortKind::Image, StreamKind::Still)];

/// The stage descriptor table, in `StageId::ALL` order.
pub const STAGE_TABLE: [StageDescriptor; StageId::COUNT] = [
    StageDescriptor {
        id: StageId::Sensor,
        chain: Chain::Primary,
        upstream: &[],
        feature: None,
        optional: false,
        ports: SENSOR_PORTS,
    },
    StageDescriptor {
        id: StageId::Bayer,
        chain: Chain::Primary,
        upstream: &[StageId::Sensor],
        feature: None,
        optional: false,
        ports: BAYER_PORTS,
    },
    StageDescriptor {
        id: StageId::Isp,
        chain: Chain::Primary,
        upstream: &[StageId::Bayer],
        feature: None,
        optional: false,
        ports: ISP_PORTS,
    },
    StageDescriptor {
        id: StageId::Mcsc,
        chain: Chain::Primary,
        upstream: &[StageId::Isp],
        feature: None,
        optional: false,
        ports: MCSC_PORTS,
    },
    StageDescriptor {
        id: StageId::Gdc,
        chain: Chain::Primary,
        upstream: &[StageId::Mcsc],
        feature: Some(Feature::DistortionCorrection),
        optional: true,
        ports: GDC_PORTS,
    },
    StageDescriptor {
        id: StageId::Vra,
        chain: Chain::Primary,
        upstream: &[StageId::Mcsc],
        feature: Some(Feature::FaceDetection),
        optional: true,
        ports: VRA_PORTS,
    },
    StageDescriptor {
        id: StageId::SensorSecondary,
        chain: Chain::Secondary,
        upstream: &[],
        feature: Some(Feature::DualSensor),
        optional: false,
        ports: SENSOR_SECONDARY_PORTS,
    },
    StageDescriptor {
        id: StageId::BayerSecondary,
        chain: Chain::Secondary,
        upstream: &[StageId::SensorSecondary],
        feature: Some(Feature::DualSensor),
        optional: false,
        ports: BAYER_SECONDARY_PORTS,
    },
    StageDescriptor {
        id: StageId::IspSecondary,
        chain: Chain::Secondary,
        upstream: &[StageId::BayerSecondary],
        feature: Some(Feature::DualSensor),
        optional: false,
        ports: ISP_SECONDARY_PORTS,
    },
    StageDescriptor {
        id: StageId::McscSecondary,
        chain: Chain::Secondary,
        upstream: &[StageId::IspSecondary],
        feature: Some(Feature::DualSensor),
        optional: false,
        ports: MCSC_SECONDARY_PORTS,
    },
    StageDescriptor {
        id: StageId::Sync,
        chain: Chain::Dual,
        upstream: &[StageId::Mcsc, StageId::McscSecondary],
        feature: Some(Feature::DualSensor),
        optional: false,
        ports: SYNC_PORTS,
    },
    StageDescriptor {
        id: StageId::Fusion,
        chain: Chain::DualPrimary,
        upstream: &[StageId::Sync],
        feature: Some(Feature::DualSensor),
        optional: false,
        ports: FUSION_PORTS,
    },
    StageDescriptor {
        id: StageId::BayerReprocessing,
        chain: Chain::Reprocessing,
        upstream: &[],
        feature: Some(Feature::Reprocessing),
        optional: false,
        ports: BAYER_REPROCESSING_PORTS,
    },
    StageDescriptor {
        id: StageId::IspReprocessing,
        chain: Chain::Reprocessing,
        upstream: &[StageId::BayerReprocessing],
        feature: Some(Feature::Reprocessing),
        optional: false,
        ports: ISP_REPROCESSING_PORTS,
    },
    StageDescriptor {
        id: StageId::McscReprocessing,
        chain: Chain::Reprocessing,
        upstream: &[StageId::IspReprocessing],
        feature: Some(Feature::Reprocessing),
        optional: false,
        ports: MCSC_REPROCESSING_PORTS,
    },
];

/// Look up the static descriptor of a stage.
#[inline]
pub fn descriptor(id: StageId) -> &'static StageDescriptor {
    &STAGE_TABLE[id.index()]
}

/// One configured link between two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub from: StageId,
    pub to: StageId,
    pub mode: ConnectionMode,
}

impl Link {
    pub const fn new(from: StageId, to: StageId, mode: ConnectionMode) -> Self {
        Self { from, to, mode }
    }
}

/// Per-configuration connection modes between stage pairs.
///
/// Pairs without an entry are `ConnectionMode::None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionTable {
    links: Vec<Link>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_links(links: impl IntoIterator<Item = Link>) -> Self {
        let mut table = Self::new();
        for link in links {
            table.set(link.from, link.to, link.mode);
        }
        table
    }

    /// Typical single-sensor wiring: sensor dumps raw to memory, the
    /// front-end/ISP/scaler run on-the-fly, side branches read from memory.
    pub fn default_single() -> Self {
        use ConnectionMode::*;
        Self::from_links([
            Link::new(StageId::Sensor, StageId::Bayer, MemoryMediated),
            Link::new(StageId::Bayer, StageId::Isp, DirectChain),
            Link::new(StageId::Isp, StageId::Mcsc, DirectChain),
            Link::new(StageId::Mcsc, StageId::Gdc, MemoryMediated),
            Link::new(StageId::Mcsc, StageId::Vra, MemoryMediated),
            Link::new(StageId::BayerReprocessing, StageId::IspReprocessing, DirectChain),
            Link::new(StageId::IspReprocessing, StageId::McscReprocessing, DirectChain),
        ])
    }

    /// Single-sensor wiring plus the secondary chain and the sync/fusion stages.
    pub fn default_dual() -> Self {
        use ConnectionMode::*;
        let mut table = Self::default_single();
        table.set(StageId::SensorSecondary, StageId::BayerSecondary, MemoryMediated);
        table.set(StageId::BayerSecondary, StageId::IspSecondary, DirectChain);
        table.set(StageId::IspSecondary, StageId::McscSecondary, DirectChain);
        table.set(StageId::Mcsc, StageId::Sync, MemoryMediated);
        table.set(StageId::McscSecondary, StageId::Sync, MemoryMediated);
        table.set(StageId::Sync, StageId::Fusion, MemoryMediated);
        table
    }

    /// Set (or replace) the mode of a link.
    pub fn set(&mut self, from: StageId, to: StageId, mode: ConnectionMode) {
        if let Some(link) = self.links.iter_mut().find(|l| l.from == from && l.to == to) {
            link.mode = mode;
        } else {
            self.links.push(Link::new(from, to, mode));
        }
    }

    pub fn mode(&self, from: StageId, to: StageId) -> ConnectionMode {
        self.links
            .iter()
            .find(|l| l.from == from && l.to == to)
            .map(|l| l.mode)
            .unwrap_or(ConnectionMode::None)
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Check per-table invariants that do not depend on a graph key:
    /// links must follow the descriptor table and all present inbound
    /// links of a stage must share one mode.
    pub fn validate(&self) -> PipelineResult<()> {
        for link in &self.links {
            if !descriptor(link.to).upstream.contains(&link.from) {
                return Err(PipelineError::InconsistentTable {
                    stage: link.to,
                    reason: format!("{} cannot feed {}", link.from, link.to),
                });
            }
        }

        for stage in StageId::ALL {
            let mut modes = self
                .links
                .iter()
                .filter(|l| l.to == stage && l.mode.is_present())
                .map(|l| l.mode);
            if let Some(first) = modes.next() {
                if modes.any(|m| m != first) {
                    return Err(PipelineError::InconsistentTable {
                        stage,
                        reason: "inbound links mix direct-chain and memory-mediated modes".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Stages that own a lane (completion queue + worker) under this table:
    /// roots, and every stage with a memory-mediated input.
    pub fn lane_leaders(&self) -> Vec<StageId> {
        StageId::ALL
            .iter()
            .copied()
            .filter(|&stage| {
                descriptor(stage).is_root()
                    || self
                        .links
                        .iter()
                        .any(|l| l.to == stage && l.mode == ConnectionMode::MemoryMediated)
            })
            .collect()
    }

    /// `leader` followed by every stage joined to it through direct-chain links.
    pub fn lane_members(&self, leader: StageId) -> Vec<StageId> {
        let mut members = vec![leader];
        let mut i = 0;
        while i < members.len() {
            let from = members[i];
            for link in &self.links {
                if link.from == from
                    && link.mode == ConnectionMode::DirectChain
                    && !members.contains(&link.to)
                {
                    members.push(link.to);
                }
            }
            i += 1;
        }
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_in_stage_order() {
        for (i, desc) in STAGE_TABLE.iter().enumerate() {
            assert_eq!(desc.id.index(), i);
            for up in desc.upstream {
                assert!(up.index() < i, "{} must come after {}", desc.id, up);
            }
        }
    }

    #[test]
    fn test_ports_feed_declared_downstream() {
        for desc in STAGE_TABLE.iter() {
            for port in desc.ports {
                if let Some(target) = port.feeds {
                    assert!(
                        descriptor(target).upstream.contains(&desc.id),
                        "{}:{} feeds {} which does not list it upstream",
                        desc.id,
                        port.name,
                        target
                    );
                }
            }
        }
    }

    #[test]
    fn test_default_tables_validate() {
        ConnectionTable::default_single().validate().unwrap();
        ConnectionTable::default_dual().validate().unwrap();
    }

    #[test]
    fn test_missing_link_is_none() {
        let table = ConnectionTable::default_single();
        assert_eq!(table.mode(StageId::Mcsc, StageId::Sync), ConnectionMode::None);
        assert_eq!(
            table.mode(StageId::Bayer, StageId::Isp),
            ConnectionMode::DirectChain
        );
    }

    #[test]
    fn test_validate_rejects_undeclared_link() {
        let table = ConnectionTable::from_links([Link::new(
            StageId::Sensor,
            StageId::Isp,
            ConnectionMode::DirectChain,
        )]);
        assert!(matches!(
            table.validate(),
            Err(PipelineError::InconsistentTable { stage: StageId::Isp, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_mixed_inbound_modes() {
        let mut table = ConnectionTable::default_dual();
        table.set(StageId::McscSecondary, StageId::Sync, ConnectionMode::DirectChain);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_lane_leaders_default_single() {
        let leaders = ConnectionTable::default_single().lane_leaders();
        assert!(leaders.contains(&StageId::Sensor));
        assert!(leaders.contains(&StageId::Bayer));
        assert!(!leaders.contains(&StageId::Isp));
        assert!(!leaders.contains(&StageId::Mcsc));
        assert!(leaders.contains(&StageId::Gdc));
        assert!(leaders.contains(&StageId::Vra));
        assert!(leaders.contains(&StageId::BayerReprocessing));
    }

    #[test]
    fn test_lane_members_follow_direct_chain() {
        let table = ConnectionTable::default_single();
        assert_eq!(
            table.lane_members(StageId::Bayer),
            vec![StageId::Bayer, StageId::Isp, StageId::Mcsc]
        );
        assert_eq!(table.lane_members(StageId::Gdc), vec![StageId::Gdc]);
    }

    #[test]
    fn test_set_replaces_existing_link() {
        let mut table = ConnectionTable::default_single();
        let before = table.links().len();
        table.set(StageId::Bayer, StageId::Isp, ConnectionMode::MemoryMediated);
        assert_eq!(table.links().len(), before);
        assert_eq!(
            table.mode(StageId::Bayer, StageId::Isp),
            ConnectionMode::MemoryMediated
        );
    }
}

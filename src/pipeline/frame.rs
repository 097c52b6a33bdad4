//! Frames and per-stage entities.
//!
//! A [`Frame`] is one hardware command: it carries the request keys it
//! serves (one per batch slot), an [`Entity`] for every stage of its plan,
//! and a [`NodeGroup`] parameter snapshot. Frames are moved between queues,
//! never cloned, so exactly one thread touches a frame at any time.

use crate::hal::buffer::{Buffer, BufferTag};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{FrameCount, RequestKey, StageId};
use crate::pipeline::plan::GraphPlan;
use crate::pipeline::stage::ConnectionMode;
use crate::types::{PixelFormat, Rect, Size, StreamKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Why a frame exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Carries client requests on the preview pipeline.
    Preview,
    /// Carries a still capture on the reprocessing pipeline.
    Reprocessing,
    /// Filler that keeps the sensor fed when no request is ready.
    Internal,
    /// Warm-up frame on a chain leaving standby.
    Transition,
    /// Feature-extraction only frame.
    Vision,
}

impl FrameKind {
    /// Frames whose outputs reach the client.
    pub fn is_client_visible(self) -> bool {
        matches!(self, FrameKind::Preview | FrameKind::Reprocessing)
    }
}

/// Sensor chain a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DualRole {
    Single,
    Primary,
    Secondary,
}

impl DualRole {
    /// The opposite chain in a dual configuration.
    pub fn other(self) -> Option<DualRole> {
        match self {
            DualRole::Single => None,
            DualRole::Primary => Some(DualRole::Secondary),
            DualRole::Secondary => Some(DualRole::Primary),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Requested,
    Processing,
    Done,
    Skipped,
}

impl EntityState {
    pub fn name(self) -> &'static str {
        match self {
            EntityState::Requested => "requested",
            EntityState::Processing => "processing",
            EntityState::Done => "done",
            EntityState::Skipped => "skipped",
        }
    }
}

/// A buffer position on an entity: output port (or source index) and batch slot.
#[derive(Debug)]
pub struct BufferSlot {
    pub port: u8,
    pub batch: usize,
    pub tag: BufferTag,
    pub buffer: Option<Buffer>,
    /// The buffer could not be acquired or the hardware reported it bad.
    pub error: bool,
}

impl BufferSlot {
    pub fn new(port: u8, batch: usize, tag: BufferTag) -> Self {
        Self {
            port,
            batch,
            tag,
            buffer: None,
            error: false,
        }
    }

    pub fn stream(&self) -> Option<StreamKind> {
        match self.tag {
            BufferTag::Stream(kind) => Some(kind),
            BufferTag::Stage { .. } => None,
        }
    }

    /// Filled, or given up on.
    pub fn is_settled(&self) -> bool {
        self.buffer.is_some() || self.error
    }
}

/// Per-stage record inside a frame.
#[derive(Debug)]
pub struct Entity {
    pub stage: StageId,
    pub state: EntityState,
    pub upstream: Option<StageId>,
    pub link: ConnectionMode,
    /// Lane leader.
    pub group: StageId,
    /// Buffers supplied from outside the frame (reprocessing source, paired image).
    pub src: Vec<BufferSlot>,
    pub dst: Vec<BufferSlot>,
}

impl Entity {
    pub fn is_active(&self) -> bool {
        self.state != EntityState::Skipped
    }
}

/// Geometry and format of one output port for this frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PortParams {
    pub stage: StageId,
    pub port: u8,
    pub size: Size,
    pub format: PixelFormat,
}

/// Parameter snapshot taken when the frame is built.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeGroup {
    pub crop: Rect,
    pub zoom_ratio: f32,
    pub ports: Vec<PortParams>,
}

impl NodeGroup {
    pub fn port(&self, stage: StageId, port: u8) -> Option<&PortParams> {
        self.ports.iter().find(|p| p.stage == stage && p.port == port)
    }
}

/// Metadata gathered while the frame moves through the network.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    pub sensor_timestamp_ns: Option<u64>,
    pub faces: Option<u32>,
    pub sharpness: Option<f32>,
    /// Frame count of the secondary image fused into this frame.
    pub paired_with: Option<FrameCount>,
}

/// One hardware command and everything it carries.
#[derive(Debug)]
pub struct Frame {
    pub count: FrameCount,
    pub kind: FrameKind,
    pub role: DualRole,
    /// Request served by each batch slot.
    pub requests: Vec<RequestKey>,
    /// Flush generation the frame was built in.
    pub generation: u64,
    pub plan: Arc<GraphPlan>,
    /// Hand the raw sensor buffer to the frame selector once it is consumed.
    pub retain_raw: bool,
    pub metadata: FrameMetadata,
    /// Buffers the hardware has dequeued, awaiting re-targeting by the worker.
    pub dequeued: Vec<Buffer>,
    pub created: Instant,
    entities: Vec<Entity>,
    node_group: NodeGroup,
}

impl Frame {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        count: FrameCount,
        kind: FrameKind,
        role: DualRole,
        requests: Vec<RequestKey>,
        generation: u64,
        plan: Arc<GraphPlan>,
        entities: Vec<Entity>,
        node_group: NodeGroup,
    ) -> Self {
        Self {
            count,
            kind,
            role,
            requests,
            generation,
            plan,
            retain_raw: false,
            metadata: FrameMetadata::default(),
            dequeued: Vec::new(),
            created: Instant::now(),
            entities,
            node_group,
        }
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut [Entity] {
        &mut self.entities
    }

    pub fn entity(&self, stage: StageId) -> Option<&Entity> {
        self.entities.iter().find(|e| e.stage == stage)
    }

    pub fn entity_mut(&mut self, stage: StageId) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| e.stage == stage)
    }

    pub fn lane_entities(&self, leader: StageId) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(move |e| e.group == leader)
    }

    pub fn lane_entities_mut(&mut self, leader: StageId) -> impl Iterator<Item = &mut Entity> {
        self.entities.iter_mut().filter(move |e| e.group == leader)
    }

    pub fn node_group(&self) -> &NodeGroup {
        &self.node_group
    }

    /// Once any entity has left `Requested` the snapshot is fixed.
    pub fn is_frozen(&self) -> bool {
        self.entities
            .iter()
            .any(|e| matches!(e.state, EntityState::Processing | EntityState::Done))
    }

    pub fn node_group_mut(&mut self) -> PipelineResult<&mut NodeGroup> {
        if let Some(entity) = self
            .entities
            .iter()
            .find(|e| matches!(e.state, EntityState::Processing | EntityState::Done))
        {
            return Err(PipelineError::EntityState {
                frame: self.count,
                stage: entity.stage,
                state: entity.state.name(),
            });
        }
        Ok(&mut self.node_group)
    }

    /// Request served by `batch`, if any.
    pub fn request(&self, batch: usize) -> Option<RequestKey> {
        self.requests.get(batch).copied()
    }

    /// Next lane after `after` (or the first lane) with work left for this frame.
    pub fn next_lane(&self, after: Option<StageId>) -> Option<StageId> {
        let start = match after {
            Some(leader) => self.plan.lanes.iter().position(|&l| l == leader)? + 1,
            None => 0,
        };
        self.plan.lanes[start..].iter().copied().find(|&leader| {
            self.lane_entities(leader)
                .any(|e| e.state == EntityState::Requested)
        })
    }

    /// Move every `from` entity of the lane to `to`.
    pub fn set_lane_state(&mut self, leader: StageId, from: EntityState, to: EntityState) {
        for entity in self.lane_entities_mut(leader) {
            if entity.state == from {
                entity.state = to;
            }
        }
    }

    /// Put a dequeued buffer back into the slot it was queued on.
    ///
    /// Hands the buffer back if no matching empty slot exists.
    pub fn retarget(&mut self, buffer: Buffer) -> Result<(), Buffer> {
        let Some(stage) = buffer.stage else {
            return Err(buffer);
        };
        let Some(slot) = self.entity_mut(stage).and_then(|e| {
            e.dst
                .iter_mut()
                .find(|s| s.port == buffer.hw_port && s.batch == buffer.batch && s.buffer.is_none())
        }) else {
            return Err(buffer);
        };
        if buffer.is_error() {
            slot.error = true;
        }
        slot.buffer = Some(buffer);
        Ok(())
    }

    /// Mark every client stream slot that has not failed yet as failed.
    ///
    /// Returns the (request, stream) pairs that changed.
    pub fn fail_streams(&mut self) -> Vec<(RequestKey, StreamKind)> {
        let mut failed = Vec::new();
        let requests = self.requests.clone();
        for entity in &mut self.entities {
            for slot in entity.dst.iter_mut().filter(|s| !s.error) {
                if let Some(stream) = slot.stream() {
                    slot.error = true;
                    if let Some(&key) = requests.get(slot.batch) {
                        failed.push((key, stream));
                    }
                }
            }
        }
        failed
    }

    /// Take every buffer the frame holds, including dequeued ones.
    pub fn take_buffers(&mut self) -> Vec<Buffer> {
        let mut out: Vec<Buffer> = self.dequeued.drain(..).collect();
        for entity in &mut self.entities {
            for slot in entity.src.iter_mut().chain(entity.dst.iter_mut()) {
                if let Some(buffer) = slot.buffer.take() {
                    out.push(buffer);
                }
            }
        }
        out
    }

    /// Number of buffers currently attached.
    pub fn buffer_count(&self) -> usize {
        self.dequeued.len()
            + self
                .entities
                .iter()
                .flat_map(|e| e.src.iter().chain(e.dst.iter()))
                .filter(|s| s.buffer.is_some())
                .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::buffer::BufferId;
    use crate::pipeline::plan::{GraphCompiler, GraphKey};
    use crate::pipeline::stage::{ConnectionTable, FeatureFlags};

    fn frame() -> Frame {
        let plan = Arc::new(
            GraphCompiler::compile(
                &ConnectionTable::default_single(),
                &FeatureFlags::default(),
                GraphKey::preview(DualRole::Single, false),
                0,
            )
            .unwrap(),
        );
        let entities = plan
            .stages
            .iter()
            .map(|s| Entity {
                stage: s.stage,
                state: EntityState::Requested,
                upstream: s.upstream,
                link: s.link,
                group: s.group,
                src: Vec::new(),
                dst: if s.stage == StageId::Mcsc {
                    vec![BufferSlot::new(0, 0, BufferTag::Stream(StreamKind::Preview))]
                } else {
                    Vec::new()
                },
            })
            .collect();
        Frame::new(
            FrameCount(1),
            FrameKind::Preview,
            DualRole::Single,
            vec![RequestKey(7)],
            0,
            plan,
            entities,
            NodeGroup::default(),
        )
    }

    #[test]
    fn test_next_lane_walks_plan() {
        let mut f = frame();
        assert_eq!(f.next_lane(None), Some(StageId::Sensor));
        f.set_lane_state(StageId::Sensor, EntityState::Requested, EntityState::Done);
        assert_eq!(f.next_lane(Some(StageId::Sensor)), Some(StageId::Bayer));
        f.set_lane_state(StageId::Bayer, EntityState::Requested, EntityState::Done);
        assert_eq!(f.next_lane(Some(StageId::Bayer)), None);
    }

    #[test]
    fn test_node_group_freezes() {
        let mut f = frame();
        f.node_group_mut().unwrap().zoom_ratio = 2.0;
        f.set_lane_state(
            StageId::Sensor,
            EntityState::Requested,
            EntityState::Processing,
        );
        assert!(f.is_frozen());
        assert!(f.node_group_mut().is_err());
        assert_eq!(f.node_group().zoom_ratio, 2.0);
    }

    #[test]
    fn test_retarget_matches_port_and_batch() {
        let mut f = frame();
        let mut buf = Buffer::new(BufferId(1), BufferTag::Stream(StreamKind::Preview));
        buf.target(StageId::Mcsc, 0, 0);
        f.retarget(buf).unwrap();
        assert_eq!(f.buffer_count(), 1);

        let mut stray = Buffer::new(BufferId(2), BufferTag::Stream(StreamKind::Preview));
        stray.target(StageId::Mcsc, 5, 0);
        assert!(f.retarget(stray).is_err());
    }

    #[test]
    fn test_fail_streams_reports_once() {
        let mut f = frame();
        assert_eq!(
            f.fail_streams(),
            vec![(RequestKey(7), StreamKind::Preview)]
        );
        assert!(f.fail_streams().is_empty());
    }
}

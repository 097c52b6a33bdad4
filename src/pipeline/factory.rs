//! Frame factory: turns a graph plan plus per-frame parameters into a Frame.
//!
//! The plan fixes which stages exist and how they are grouped into lanes.
//! The factory decides, per frame, which of those stages actually run
//! (everything on the path to the plan's terminal stage, plus the producers of
//! the requested streams and the face detector when asked for) and which
//! buffer slots each running stage needs.

use crate::hal::buffer::BufferTag;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::frame::{
    BufferSlot, DualRole, Entity, EntityState, Frame, FrameKind, NodeGroup, PortParams,
};
use crate::pipeline::id::{FrameCount, RequestKey, StageId};
use crate::pipeline::plan::{GraphKey, GraphPlan, PlanCache};
use crate::pipeline::port::PortKind;
use crate::pipeline::request::RequestParams;
use crate::pipeline::stage::{
    descriptor, ConnectionMode, ConnectionTable, FeatureFlags, RAW_PORT,
};
use crate::types::{PixelFormat, Rect, Size, StreamConfig, StreamKind};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One batch slot of a frame and the streams its request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRequest {
    pub key: RequestKey,
    pub streams: Vec<StreamKind>,
}

/// Everything the factory needs to build one frame.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub count: FrameCount,
    pub kind: FrameKind,
    pub key: GraphKey,
    pub generation: u64,
    pub slots: Vec<SlotRequest>,
    pub params: RequestParams,
    pub retain_raw: bool,
}

impl FrameSpec {
    /// Filler frame with no client outputs.
    pub fn internal(count: FrameCount, key: GraphKey, generation: u64) -> Self {
        Self {
            count,
            kind: FrameKind::Internal,
            key,
            generation,
            slots: Vec::new(),
            params: RequestParams::default(),
            retain_raw: false,
        }
    }
}

pub struct FrameFactory {
    cache: Mutex<PlanCache>,
    streams: Mutex<Vec<StreamConfig>>,
    sensor_size: Size,
    next_count: AtomicU64,
}

impl FrameFactory {
    pub fn new(table: ConnectionTable, flags: FeatureFlags, sensor_size: Size) -> Self {
        Self {
            cache: Mutex::new(PlanCache::new(table, flags)),
            streams: Mutex::new(Vec::new()),
            sensor_size,
            next_count: AtomicU64::new(1),
        }
    }

    fn cache(&self) -> MutexGuard<'_, PlanCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn sensor_size(&self) -> Size {
        self.sensor_size
    }

    pub fn set_streams(&self, streams: Vec<StreamConfig>) {
        *self.streams.lock().unwrap_or_else(|e| e.into_inner()) = streams;
    }

    pub fn stream_config(&self, kind: StreamKind) -> Option<StreamConfig> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.kind == kind)
            .copied()
    }

    /// Replace table and flags; cached plans are dropped.
    pub fn reconfigure(&self, table: ConnectionTable, flags: FeatureFlags) {
        self.cache().reconfigure(table, flags);
    }

    pub fn flags(&self) -> FeatureFlags {
        *self.cache().flags()
    }

    pub fn table(&self) -> ConnectionTable {
        self.cache().table().clone()
    }

    pub fn generation(&self) -> u64 {
        self.cache().generation()
    }

    pub fn plan(&self, key: GraphKey) -> PipelineResult<Arc<GraphPlan>> {
        self.cache().plan(key)
    }

    /// Allocate the next device command sequence number.
    pub fn next_count(&self) -> FrameCount {
        FrameCount(self.next_count.fetch_add(1, Ordering::Relaxed))
    }

    /// Build a frame. Fails only if the plan for `spec.key` cannot be compiled.
    pub fn build(&self, spec: FrameSpec) -> PipelineResult<Frame> {
        let plan = self.plan(spec.key)?;

        let requested: BTreeSet<StreamKind> = spec
            .slots
            .iter()
            .flat_map(|s| s.streams.iter().copied())
            .filter(|&s| plan.producer(s).is_some())
            .collect();

        let mut required: BTreeSet<StageId> = plan.ancestry(plan.terminal).into_iter().collect();
        for &stream in &requested {
            if let Some(producer) = plan.producer(stream) {
                required.extend(plan.ancestry(producer));
            }
        }
        if spec.params.face_detect && plan.contains(StageId::Vra) {
            required.extend(plan.ancestry(StageId::Vra));
        }

        let retain_raw = spec.retain_raw && spec.kind.is_client_visible();
        let mut entities = Vec::with_capacity(plan.stages.len());
        let mut node_group = NodeGroup {
            crop: spec.params.crop.unwrap_or(Rect::full(self.sensor_size)),
            zoom_ratio: spec.params.zoom_ratio,
            ports: Vec::new(),
        };

        for ps in &plan.stages {
            let desc = descriptor(ps.stage);
            let active = required.contains(&ps.stage);
            let mut dst = Vec::new();
            let mut src = Vec::new();

            if active {
                for port in desc.ports {
                    let mut slots = Vec::new();

                    if let Some(stream) = port.stream {
                        if requested.contains(&stream) && plan.producer(stream) == Some(ps.stage) {
                            for (batch, slot) in spec.slots.iter().enumerate() {
                                if slot.streams.contains(&stream) {
                                    slots.push(BufferSlot::new(
                                        port.index,
                                        batch,
                                        BufferTag::Stream(stream),
                                    ));
                                }
                            }
                        }
                    }

                    let internal = BufferTag::Stage {
                        stage: ps.stage,
                        port: port.index,
                    };
                    if slots.is_empty() {
                        let feeds_memory = port.feeds.is_some_and(|down| {
                            required.contains(&down)
                                && plan.stage(down).is_some_and(|d| {
                                    d.upstream == Some(ps.stage)
                                        && d.link == ConnectionMode::MemoryMediated
                                })
                        });
                        let retained = retain_raw
                            && desc.is_root()
                            && port.index == RAW_PORT
                            && port.kind == PortKind::Raw;
                        if feeds_memory || retained {
                            slots.push(BufferSlot::new(port.index, 0, internal));
                        }
                    }

                    if !slots.is_empty() {
                        node_group.ports.push(self.port_params(ps.stage, port.index, port.kind, port.stream));
                    }
                    dst.extend(slots);
                }

                if ps.stage == StageId::BayerReprocessing {
                    src.push(BufferSlot::new(
                        0,
                        0,
                        BufferTag::Stage {
                            stage: StageId::Sensor,
                            port: RAW_PORT,
                        },
                    ));
                }
                if ps.stage == StageId::Fusion {
                    src.push(BufferSlot::new(
                        0,
                        0,
                        BufferTag::Stage {
                            stage: StageId::McscSecondary,
                            port: 0,
                        },
                    ));
                }
            }

            entities.push(Entity {
                stage: ps.stage,
                state: if active {
                    EntityState::Requested
                } else {
                    EntityState::Skipped
                },
                upstream: ps.upstream,
                link: ps.link,
                group: ps.group,
                src,
                dst,
            });
        }

        let requests = spec.slots.iter().map(|s| s.key).collect();
        let mut frame = Frame::new(
            spec.count,
            spec.kind,
            spec.key.role,
            requests,
            spec.generation,
            plan,
            entities,
            node_group,
        );
        frame.retain_raw = retain_raw;
        tracing::trace!(
            frame = %frame.count,
            kind = ?frame.kind,
            role = ?frame.role,
            requests = frame.requests.len(),
            "Built frame"
        );
        Ok(frame)
    }

    fn port_params(
        &self,
        stage: StageId,
        port: u8,
        kind: PortKind,
        stream: Option<StreamKind>,
    ) -> PortParams {
        let configured = stream.and_then(|s| self.stream_config(s));
        let (size, format) = match configured {
            Some(cfg) => (cfg.size, cfg.format),
            None => match kind {
                PortKind::Raw => (self.sensor_size, PixelFormat::Raw10),
                _ => (self.sensor_size, PixelFormat::Nv21),
            },
        };
        PortParams {
            stage,
            port,
            size,
            format,
        }
    }
}

/// Which role a frame takes when the session is not dual.
pub fn single_key() -> GraphKey {
    GraphKey::preview(DualRole::Single, false)
}

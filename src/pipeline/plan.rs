//! Graph plan compilation and caching.
//!
//! A [`GraphPlan`] is the static shape of every frame built for one
//! [`GraphKey`]: the active stages in topological order, how each is linked to
//! its upstream, and which lane (completion queue + worker) it runs in. Plans
//! depend only on the connection table, the feature flags and the key, so
//! they are compiled once and cached; replacing the table bumps the cache
//! generation and drops every cached plan.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::frame::DualRole;
use crate::pipeline::id::StageId;
use crate::pipeline::stage::{descriptor, Chain, ConnectionMode, ConnectionTable, FeatureFlags};
use crate::types::StreamKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Which pipeline a frame runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    Preview,
    Reprocessing,
}

/// Cache key for compiled plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphKey {
    pub pipeline: PipelineKind,
    pub role: DualRole,
    /// Both sensor chains are paired through the sync stage.
    pub synchronized: bool,
}

impl GraphKey {
    pub const fn preview(role: DualRole, synchronized: bool) -> Self {
        Self {
            pipeline: PipelineKind::Preview,
            role,
            synchronized,
        }
    }

    pub const fn reprocessing() -> Self {
        Self {
            pipeline: PipelineKind::Reprocessing,
            role: DualRole::Single,
            synchronized: false,
        }
    }

    fn includes(&self, chain: Chain) -> bool {
        match (self.pipeline, chain) {
            (PipelineKind::Reprocessing, Chain::Reprocessing) => true,
            (PipelineKind::Reprocessing, _) | (PipelineKind::Preview, Chain::Reprocessing) => false,
            (PipelineKind::Preview, Chain::Primary) => {
                matches!(self.role, DualRole::Single | DualRole::Primary)
            }
            (PipelineKind::Preview, Chain::Secondary) => self.role == DualRole::Secondary,
            (PipelineKind::Preview, Chain::Dual) => self.synchronized && self.role != DualRole::Single,
            (PipelineKind::Preview, Chain::DualPrimary) => {
                self.synchronized && self.role == DualRole::Primary
            }
        }
    }

    fn root(&self) -> StageId {
        match (self.pipeline, self.role) {
            (PipelineKind::Reprocessing, _) => StageId::BayerReprocessing,
            (PipelineKind::Preview, DualRole::Secondary) => StageId::SensorSecondary,
            (PipelineKind::Preview, _) => StageId::Sensor,
        }
    }
}

/// One active stage of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStage {
    pub stage: StageId,
    pub upstream: Option<StageId>,
    /// Mode of the inbound link; `None` for the root.
    pub link: ConnectionMode,
    /// Lane leader this stage runs under.
    pub group: StageId,
    pub optional: bool,
}

/// Statistics about the compiled plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    /// Stages considered for this key
    pub candidate_stages: usize,
    /// Stages in the plan
    pub active_stages: usize,
    /// Number of lanes the plan crosses
    pub lanes: usize,
}

/// Compiled shape of every frame built for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPlan {
    pub key: GraphKey,
    /// Cache generation this plan was compiled under
    pub generation: u64,
    /// Active stages in topological order
    pub stages: Vec<PlanStage>,
    /// Lane leaders in traversal order
    pub lanes: Vec<StageId>,
    /// Last non-optional stage; every frame runs the path that ends here
    pub terminal: StageId,
    pub stats: PlanStats,
}

impl GraphPlan {
    pub fn stage(&self, id: StageId) -> Option<&PlanStage> {
        self.stages.iter().find(|s| s.stage == id)
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.stage(id).is_some()
    }

    pub fn members(&self, leader: StageId) -> impl Iterator<Item = StageId> + '_ {
        self.stages
            .iter()
            .filter(move |s| s.group == leader)
            .map(|s| s.stage)
    }

    /// Stage that produces `stream` for the client: the last active stage
    /// exposing a port for it.
    pub fn producer(&self, stream: StreamKind) -> Option<StageId> {
        self.stages
            .iter()
            .rev()
            .find(|s| descriptor(s.stage).port_for_stream(stream).is_some())
            .map(|s| s.stage)
    }

    /// `id` followed by its upstream chain back to the root.
    pub fn ancestry(&self, id: StageId) -> Vec<StageId> {
        let mut chain = Vec::new();
        let mut cursor = self.stage(id);
        while let Some(stage) = cursor {
            chain.push(stage.stage);
            cursor = stage.upstream.and_then(|up| self.stage(up));
        }
        chain
    }

    /// Last lane whose leader is fed through memory, excluding side branches.
    pub fn error_check_lane(&self) -> Option<StageId> {
        self.stages
            .iter()
            .rev()
            .find(|s| !s.optional && s.link == ConnectionMode::MemoryMediated)
            .map(|s| s.stage)
    }
}

/// Compiles graph plans from the stage table, the connection table and the
/// feature flags.
pub struct GraphCompiler;

impl GraphCompiler {
    /// Compile the plan for `key`.
    ///
    /// A stage is part of the plan when its chain belongs to the key, its
    /// feature is enabled, and it is either the key's root or linked from an
    /// active upstream. A link from an upstream of the key's chains that is
    /// itself inactive makes the table inconsistent for this key.
    pub fn compile(
        table: &ConnectionTable,
        flags: &FeatureFlags,
        key: GraphKey,
        generation: u64,
    ) -> PipelineResult<GraphPlan> {
        table.validate()?;

        let root = key.root();
        let root_desc = descriptor(root);
        if !root_desc.feature.map_or(true, |f| flags.enables(f)) {
            return Err(PipelineError::InconsistentTable {
                stage: root,
                reason: "root stage is disabled by feature flags".into(),
            });
        }

        let mut candidates = 0;
        let mut stages: Vec<PlanStage> = Vec::new();

        for stage in StageId::ALL {
            let desc = descriptor(stage);
            if !key.includes(desc.chain) {
                continue;
            }
            candidates += 1;
            let enabled = desc.feature.map_or(true, |f| flags.enables(f));

            if desc.is_root() {
                if stage == root {
                    stages.push(PlanStage {
                        stage,
                        upstream: None,
                        link: ConnectionMode::None,
                        group: stage,
                        optional: desc.optional,
                    });
                }
                continue;
            }

            // Upstream candidates that belong to this key's chains.
            let linked: Vec<(StageId, ConnectionMode)> = desc
                .upstream
                .iter()
                .copied()
                .filter(|&up| key.includes(descriptor(up).chain))
                .map(|up| (up, table.mode(up, stage)))
                .filter(|(_, mode)| mode.is_present())
                .collect();

            let Some(&(upstream, link)) = linked.first() else {
                continue;
            };
            if !enabled {
                continue;
            }
            if linked.len() > 1 {
                return Err(PipelineError::InconsistentTable {
                    stage,
                    reason: "more than one active upstream".into(),
                });
            }

            let Some(up) = stages.iter().find(|s| s.stage == upstream) else {
                return Err(PipelineError::InconsistentTable {
                    stage,
                    reason: format!("upstream {upstream} is not active"),
                });
            };

            let group = match link {
                ConnectionMode::DirectChain => up.group,
                _ => stage,
            };
            stages.push(PlanStage {
                stage,
                upstream: Some(upstream),
                link,
                group,
                optional: desc.optional,
            });
        }

        if key.synchronized && !stages.iter().any(|s| s.stage == StageId::Sync) {
            return Err(PipelineError::InconsistentTable {
                stage: StageId::Sync,
                reason: "synchronized graph without an active sync stage".into(),
            });
        }

        let terminal = stages
            .iter()
            .rev()
            .find(|s| !s.optional)
            .map(|s| s.stage)
            .unwrap_or(root);

        let mut lanes: Vec<StageId> = Vec::new();
        for s in &stages {
            if !lanes.contains(&s.group) {
                lanes.push(s.group);
            }
        }

        let stats = PlanStats {
            candidate_stages: candidates,
            active_stages: stages.len(),
            lanes: lanes.len(),
        };

        Ok(GraphPlan {
            key,
            generation,
            stages,
            lanes,
            terminal,
            stats,
        })
    }
}

/// Per-key plan cache with a generation counter.
#[derive(Debug)]
pub struct PlanCache {
    table: ConnectionTable,
    flags: FeatureFlags,
    generation: u64,
    plans: HashMap<GraphKey, Arc<GraphPlan>>,
}

impl PlanCache {
    pub fn new(table: ConnectionTable, flags: FeatureFlags) -> Self {
        Self {
            table,
            flags,
            generation: 0,
            plans: HashMap::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    /// Replace the table and flags, invalidating every cached plan.
    pub fn reconfigure(&mut self, table: ConnectionTable, flags: FeatureFlags) {
        self.table = table;
        self.flags = flags;
        self.generation += 1;
        self.plans.clear();
    }

    /// Return the cached plan for `key`, compiling it on first use.
    pub fn plan(&mut self, key: GraphKey) -> PipelineResult<Arc<GraphPlan>> {
        if let Some(plan) = self.plans.get(&key) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(GraphCompiler::compile(
            &self.table,
            &self.flags,
            key,
            self.generation,
        )?);
        tracing::debug!(
            ?key,
            generation = self.generation,
            stages = plan.stats.active_stages,
            lanes = plan.stats.lanes,
            "Compiled graph plan"
        );
        self.plans.insert(key, Arc::clone(&plan));
        Ok(plan)
    }
}

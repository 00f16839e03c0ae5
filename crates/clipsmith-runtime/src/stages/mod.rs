//! Built-in stages, in canonical order.

pub mod bridge;
pub mod completeness;
pub mod hook;
pub mod refine;
pub mod restructure;

use std::sync::Arc;

use clipsmith_consensus::{ConsensusResult, ConsensusTask, Reconciler};
use clipsmith_core::{stages, Error, PipelineConfig, Result, StageId};

use crate::gate::QualityGate;
use crate::stage::{RunContext, Stage};

pub use bridge::BridgeOpenLoops;
pub use completeness::Completeness;
pub use hook::SelectHook;
pub use refine::RefineBoundaries;
pub use restructure::Restructure;

/// The standard stage list, minus stages switched off in `config`.
pub fn standard_stages(config: &PipelineConfig) -> Vec<Arc<dyn Stage>> {
    let all: Vec<Arc<dyn Stage>> = vec![
        Arc::new(RefineBoundaries::new(config)),
        Arc::new(BridgeOpenLoops::new(config)),
        Arc::new(Restructure::new(config)),
        Arc::new(SelectHook::new(config)),
        Arc::new(Completeness::new(config)),
        Arc::new(QualityGate::new(config)),
    ];
    all.into_iter()
        .filter(|s| config.is_stage_enabled(s.id().as_str()))
        .collect()
}

/// Put `task` to the ensemble configured for `stage`.
pub(crate) async fn ensemble(
    ctx: &RunContext,
    stage: &StageId,
    task: &dyn ConsensusTask,
    reconciler: &dyn Reconciler,
) -> Result<ConsensusResult> {
    ctx.engine
        .consensus(ctx.providers_for(stage.as_str()), task, reconciler)
        .await
}

pub(crate) fn unexpected_payload(stage: &StageId, result: &ConsensusResult) -> Error {
    Error::Internal(format!(
        "stage {} got a {} payload",
        stage,
        result.payload.kind()
    ))
}

/// `true` if `name` is one of the built-in stages.
pub fn is_builtin(name: &str) -> bool {
    [
        stages::DISCOVER,
        stages::REFINE_BOUNDARIES,
        stages::BRIDGE_OPEN_LOOPS,
        stages::RESTRUCTURE,
        stages::SELECT_HOOK,
        stages::COMPLETENESS,
        stages::GATE,
    ]
    .contains(&name)
}

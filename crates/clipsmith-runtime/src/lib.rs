//! Clipsmith Runtime: discovery, the ordered stage pipeline, the quality
//! gate, and run reports.

pub mod discovery;
pub mod dry_run;
pub mod gate;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod report;
pub mod stage;
pub mod stages;

pub use discovery::Discovery;
pub use dry_run::dry_run_provider;
pub use gate::{
    analysis, compounded_false_negative_rate, formula_score, simulate_gate_chain, GateSimulation,
    QualityGate, ASSUMED_FALSE_NEGATIVE, GATE_SCORE,
};
pub use orchestrator::{discard_reasons, validate_order, Orchestrator};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use prompts::{read_request, StageTask};
pub use report::{ExportSegment, GateAnalysis, PipelineReport, StageSummary};
pub use stage::{BatchOutcome, FailureScope, RunContext, Stage, StageTraits};
pub use stages::{
    standard_stages, BridgeOpenLoops, Completeness, RefineBoundaries, Restructure, SelectHook,
};

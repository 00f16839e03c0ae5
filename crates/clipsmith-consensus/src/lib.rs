//! Clipsmith Consensus: one logical decision from many concurrent model calls.

pub mod engine;
pub mod reconcile;
pub mod types;

pub use engine::{ConsensusEngine, ConsensusTask, QuorumSettings};
pub use reconcile::{
    mean, std_dev, trimmed_mean, MajorityVote, Reconciled, Reconciler, RobustMean, SegmentMajority,
    SpanUnion,
};
pub use types::{
    BoundaryVote, Confidence, ConsensusResult, EnsembleVote, ItemChoice, ItemKeep, ItemScore,
    ProposedSpan, StagePayload, VoteOutcome,
};

//! Clipsmith Core: data model, error taxonomy, configuration, and the
//! per-run snapshots (principles, resolved models) every stage reads.

pub mod capabilities;
pub mod config;
pub mod error;
pub mod ids;
pub mod item;
pub mod principles;
pub mod transcript;

pub use capabilities::{CapabilityTable, ModelResolver, ResolvedModels};
pub use config::{
    stages, DataPaths, GateMode, PipelineConfig, ProviderKind, ProviderSpec, QuorumPolicy,
};
pub use error::{Error, Result};
pub use ids::{ItemId, StageId};
pub use item::{
    CandidateItem, Change, DiscardReason, ItemStatus, ProvenanceEntry, Score, ScoreMethod,
    SegmentRole, SubSegment, PRIORITY_SCORE,
};
pub use principles::PrinciplesSnapshot;
pub use transcript::{Span, Transcript, TranscriptSegment, TIME_EPSILON};

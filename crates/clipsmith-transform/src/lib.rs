//! Clipsmith Transform: deterministic rule stages with no model calls.

pub mod bridging;
pub mod lexicon;
pub mod restructure;

pub use bridging::{Bridge, BridgeOutcome, BridgeSettings, OpenLoopBridger};
pub use lexicon::{count_fillers, is_answer, is_open_loop};
pub use restructure::{analyze, needs_restructure, RestructureAnalysis, RestructureIssue};

//! Candidate items: the unit of work flowing through the pipeline.
//!
//! All mutation goes through methods that validate the span invariants and
//! append to the provenance log. Provenance is never rewritten.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Error, Result};
use crate::ids::{ItemId, StageId};
use crate::transcript::{Span, TIME_EPSILON};

/// Score name carrying the discovery-time priority.
pub const PRIORITY_SCORE: &str = "potential";

/// Role of a sub-segment in the final cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentRole {
    Hook,
    Content,
    Payoff,
}

/// A piece of the source timeline inside an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubSegment {
    pub span: Span,
    pub text: String,
    pub role: SegmentRole,
    /// Index of the transcript segment this piece was cut from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_index: Option<usize>,
}

/// Lifecycle status. Monotonic except `Discarded`, which is reachable from
/// any non-final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Candidate,
    Refined,
    GatedAccept,
    GatedReject,
    Discarded,
}

impl ItemStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Candidate => 0,
            Self::Refined => 1,
            Self::GatedAccept | Self::GatedReject => 2,
            Self::Discarded => 3,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::GatedAccept | Self::GatedReject | Self::Discarded)
    }

    fn can_become(self, next: ItemStatus) -> bool {
        if self.is_final() {
            return false;
        }
        match next {
            Self::Discarded => true,
            _ => next.rank() >= self.rank(),
        }
    }
}

/// How a score was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    Rule,
    Ensemble,
    Formula,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: f64,
    pub stage: StageId,
    pub method: ScoreMethod,
    /// Spread across ensemble votes, when ensemble-derived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disagreement: Option<f64>,
}

/// Why an item left the pipeline early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum DiscardReason {
    StageTimeout { stage: StageId },
    InvariantViolation { stage: StageId, detail: String },
    StageFailure { stage: StageId, detail: String },
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StageTimeout { stage } => write!(f, "stage-timeout in {}", stage),
            Self::InvariantViolation { stage, detail } => {
                write!(f, "invariant violation in {}: {}", stage, detail)
            }
            Self::StageFailure { stage, detail } => write!(f, "failure in {}: {}", stage, detail),
        }
    }
}

/// What a stage did to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    Created { span: Span },
    SpanChanged { from: Span, to: Span },
    SegmentsChanged { before: usize, after: usize },
    Scored { name: String, value: f64 },
    StatusChanged { from: ItemStatus, to: ItemStatus },
    SpanLocked,
    Skipped { reason: String },
    RolledBack { reason: String },
    Discarded { reason: DiscardReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub stage: StageId,
    #[serde(flatten)]
    pub change: Change,
    pub at: DateTime<Utc>,
}

/// One unit of content under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateItem {
    id: ItemId,
    source_id: String,
    span: Span,
    segments: Vec<SubSegment>,
    #[serde(default)]
    span_locked: bool,
    #[serde(default)]
    scores: BTreeMap<String, Score>,
    status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    discard_reason: Option<DiscardReason>,
    #[serde(default)]
    provenance: Vec<ProvenanceEntry>,
}

impl CandidateItem {
    /// Create a candidate. The id is derived from the source and this
    /// original span and stays fixed for the item's lifetime.
    pub fn new(
        stage: &StageId,
        source_id: impl Into<String>,
        span: Span,
        segments: Vec<SubSegment>,
    ) -> Result<Self> {
        let source_id = source_id.into();
        check_segments(&span, &segments)?;
        let mut item = Self {
            id: ItemId::derive(&source_id, span.start(), span.end()),
            source_id,
            span,
            segments,
            span_locked: false,
            scores: BTreeMap::new(),
            status: ItemStatus::Candidate,
            discard_reason: None,
            provenance: Vec::new(),
        };
        item.record(stage, Change::Created { span });
        Ok(item)
    }

    pub fn id(&self) -> &ItemId {
        &self.id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn segments(&self) -> &[SubSegment] {
        &self.segments
    }

    pub fn provenance(&self) -> &[ProvenanceEntry] {
        &self.provenance
    }

    pub fn scores(&self) -> &BTreeMap<String, Score> {
        &self.scores
    }

    pub fn score(&self, name: &str) -> Option<f64> {
        self.scores.get(name).map(|s| s.value)
    }

    /// Soft ordering key: the discovery `potential` score, 0 when unscored.
    /// Never used to discard.
    pub fn priority(&self) -> f64 {
        self.score(PRIORITY_SCORE).unwrap_or(0.0)
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn discard_reason(&self) -> Option<&DiscardReason> {
        self.discard_reason.as_ref()
    }

    pub fn is_span_locked(&self) -> bool {
        self.span_locked
    }

    /// Still moving through the pipeline (not gated, not discarded).
    pub fn is_active(&self) -> bool {
        !self.status.is_final()
    }

    /// Text of the segment that ends last on the timeline.
    pub fn trailing_text(&self) -> &str {
        self.segments
            .iter()
            .max_by(|a, b| a.span.end().total_cmp(&b.span.end()))
            .map(|s| s.text.as_str())
            .unwrap_or("")
    }

    pub fn full_text(&self) -> String {
        let mut ordered: Vec<&SubSegment> = self.segments.iter().collect();
        ordered.sort_by(|a, b| a.span.start().total_cmp(&b.span.start()));
        ordered
            .iter()
            .map(|s| s.text.trim())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn word_count(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.text.split_whitespace().count())
            .sum()
    }

    /// The fields a stage result depends on: identity, span, and segments.
    /// Scores and provenance are left out so history growth never changes
    /// a fingerprint.
    pub fn canonical_input(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "span": [round_ms(self.span.start()), round_ms(self.span.end())],
            "segments": self.segments.iter().map(|s| json!({
                "start": round_ms(s.span.start()),
                "end": round_ms(s.span.end()),
                "role": s.role,
                "text": s.text,
            })).collect::<Vec<_>>(),
        })
    }

    /// Move the outer span and replace the segments in one step.
    pub fn set_span(
        &mut self,
        stage: &StageId,
        span: Span,
        segments: Vec<SubSegment>,
    ) -> Result<()> {
        if self.span_locked && span != self.span {
            return Err(Error::InvariantViolation(format!(
                "span of {} is locked",
                self.id
            )));
        }
        check_segments(&span, &segments)?;
        let before = self.segments.len();
        let from = self.span;
        self.span = span;
        self.segments = segments;
        if from != span {
            self.record(stage, Change::SpanChanged { from, to: span });
        }
        if before != self.segments.len() {
            self.record(
                stage,
                Change::SegmentsChanged {
                    before,
                    after: self.segments.len(),
                },
            );
        }
        Ok(())
    }

    /// Replace the segments, keeping the outer span.
    pub fn replace_segments(&mut self, stage: &StageId, segments: Vec<SubSegment>) -> Result<()> {
        check_segments(&self.span, &segments)?;
        let before = self.segments.len();
        self.segments = segments;
        self.record(
            stage,
            Change::SegmentsChanged {
                before,
                after: self.segments.len(),
            },
        );
        Ok(())
    }

    pub fn lock_span(&mut self, stage: &StageId) {
        if !self.span_locked {
            self.span_locked = true;
            self.record(stage, Change::SpanLocked);
        }
    }

    pub fn set_score(
        &mut self,
        stage: &StageId,
        name: &str,
        value: f64,
        method: ScoreMethod,
        disagreement: Option<f64>,
    ) {
        self.scores.insert(
            name.to_string(),
            Score {
                value,
                stage: stage.clone(),
                method,
                disagreement,
            },
        );
        self.record(
            stage,
            Change::Scored {
                name: name.to_string(),
                value,
            },
        );
    }

    pub fn advance(&mut self, stage: &StageId, next: ItemStatus) -> Result<()> {
        if next == ItemStatus::Discarded {
            return Err(Error::Internal("use discard() to discard an item".into()));
        }
        if !self.status.can_become(next) {
            return Err(Error::InvariantViolation(format!(
                "status of {} cannot go from {:?} to {:?}",
                self.id, self.status, next
            )));
        }
        if self.status != next {
            let from = self.status;
            self.status = next;
            self.record(stage, Change::StatusChanged { from, to: next });
        }
        Ok(())
    }

    /// Take the item out of the pipeline. No-op on items already final.
    pub fn discard(&mut self, stage: &StageId, reason: DiscardReason) {
        if self.status.is_final() {
            return;
        }
        self.status = ItemStatus::Discarded;
        self.discard_reason = Some(reason.clone());
        self.record(stage, Change::Discarded { reason });
    }

    pub fn note_skip(&mut self, stage: &StageId, reason: impl Into<String>) {
        self.record(
            stage,
            Change::Skipped {
                reason: reason.into(),
            },
        );
    }

    pub fn note_rollback(&mut self, stage: &StageId, reason: impl Into<String>) {
        self.record(
            stage,
            Change::RolledBack {
                reason: reason.into(),
            },
        );
    }

    /// Re-check span invariants on the current state.
    pub fn check_invariants(&self) -> Result<()> {
        Span::new(self.span.start(), self.span.end())?;
        check_segments(&self.span, &self.segments)
    }

    fn record(&mut self, stage: &StageId, change: Change) {
        self.provenance.push(ProvenanceEntry {
            stage: stage.clone(),
            change,
            at: Utc::now(),
        });
    }
}

fn round_ms(t: f64) -> f64 {
    (t * 1000.0).round() / 1000.0
}

/// Segments must be non-empty, pairwise non-overlapping, and inside `span`.
fn check_segments(span: &Span, segments: &[SubSegment]) -> Result<()> {
    if segments.is_empty() {
        return Err(Error::InvariantViolation(format!(
            "item at {} has no segments",
            span
        )));
    }
    let mut ordered: Vec<&Span> = segments.iter().map(|s| &s.span).collect();
    ordered.sort_by(|a, b| a.start().total_cmp(&b.start()));
    for s in &ordered {
        if !span.contains(s) {
            return Err(Error::InvariantViolation(format!(
                "segment {} lies outside item span {}",
                s, span
            )));
        }
    }
    for pair in ordered.windows(2) {
        if pair[1].start() < pair[0].end() - TIME_EPSILON {
            return Err(Error::InvariantViolation(format!(
                "segments {} and {} overlap",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

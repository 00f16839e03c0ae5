//! Discovery: turn a transcript into candidate items.
//!
//! The transcript is cut into windows; each window goes to the ensemble, and
//! the proposed spans are merged by set-union so a candidate found by only
//! one provider is kept.

use std::collections::HashSet;

use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use clipsmith_consensus::{ProposedSpan, SpanUnion, StagePayload};
use clipsmith_core::{
    stages, CandidateItem, PipelineConfig, Result, ScoreMethod, Span, StageId, TranscriptSegment,
    PRIORITY_SCORE,
};

use crate::prompts::StageTask;
use crate::report::StageSummary;
use crate::stage::RunContext;
use crate::stages::{ensemble, unexpected_payload};

pub struct Discovery {
    id: StageId,
    window_secs: f64,
    merge_overlap: f64,
}

struct WindowResult {
    spans: Vec<ProposedSpan>,
    disagreement: f64,
    low_confidence: bool,
    cached: bool,
}

impl Discovery {
    pub const VERSION: u32 = 1;

    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: StageId::new(stages::DISCOVER),
            window_secs: config.discover_window_secs,
            merge_overlap: config.merge_overlap,
        }
    }

    pub fn id(&self) -> &StageId {
        &self.id
    }

    /// Candidates in timeline order, each with its `potential` as priority.
    pub async fn run(&self, ctx: &RunContext) -> (Vec<CandidateItem>, StageSummary) {
        let started = Instant::now();
        let ledger_before = ctx.budget().stage(self.id.as_str());
        let mut summary = StageSummary::new(self.id.as_str());

        let transcript = &ctx.transcript;
        let windows: Vec<Vec<(usize, &TranscriptSegment)>> = {
            let mut offset = 0;
            transcript
                .windows(self.window_secs)
                .into_iter()
                .map(|w| {
                    let indexed = w.iter().enumerate().map(|(i, s)| (offset + i, s)).collect();
                    offset += w.len();
                    indexed
                })
                .collect()
        };
        let deadline = started + ctx.config.stage_timeout();

        let results: Vec<Option<Result<WindowResult>>> = stream::iter(
            windows
                .iter()
                .map(|window| async move {
                    timeout_at(deadline, self.window(window, ctx)).await.ok()
                }),
        )
        .buffered(ctx.config.max_concurrent_batches.max(1))
        .collect()
        .await;

        let mut items = Vec::new();
        let mut seen = HashSet::new();
        for (n, result) in results.into_iter().enumerate() {
            let window = match result {
                Some(Ok(window)) => window,
                Some(Err(e)) => {
                    warn!(stage = %self.id, "Window {} produced no candidates: {}", n, e);
                    summary.discarded += 1;
                    continue;
                }
                None => {
                    warn!(stage = %self.id, "Window {} missed the stage deadline", n);
                    summary.timed_out += 1;
                    continue;
                }
            };
            summary.processed += 1;
            if window.low_confidence {
                summary.low_confidence_batches += 1;
            }
            if window.cached {
                summary.cached_batches += 1;
            }
            for proposed in window.spans {
                match self.to_item(&proposed, window.disagreement, ctx) {
                    Some(item) if seen.insert(item.id().clone()) => items.push(item),
                    Some(_) => {}
                    None => summary.skipped += 1,
                }
            }
        }
        items.sort_by(|a, b| a.span().start().total_cmp(&b.span().start()));

        let ledger = ctx.budget().stage(self.id.as_str());
        summary.calls = ledger.calls.saturating_sub(ledger_before.calls);
        summary.cost_usd = (ledger.cost_usd - ledger_before.cost_usd).max(0.0);
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            stage = %self.id,
            "Discovered {} candidates from {} windows ({} failed, {} late), cost=${:.4}",
            items.len(),
            windows.len(),
            summary.discarded,
            summary.timed_out,
            summary.cost_usd
        );
        (items, summary)
    }

    async fn window(
        &self,
        window: &[(usize, &TranscriptSegment)],
        ctx: &RunContext,
    ) -> Result<WindowResult> {
        let task = StageTask::discovery(self.id.as_str(), Self::VERSION, window, &ctx.principles);
        let reconciler = SpanUnion {
            min_overlap: self.merge_overlap,
        };
        let result = ensemble(ctx, &self.id, &task, &reconciler).await?;
        let StagePayload::Discovery { candidates } = &result.payload else {
            return Err(unexpected_payload(&self.id, &result));
        };
        Ok(WindowResult {
            spans: candidates.clone(),
            disagreement: result.disagreement,
            low_confidence: result.is_low_confidence(),
            cached: result.cached,
        })
    }

    /// Clip a proposed span to the transcript and build the item.
    fn to_item(
        &self,
        proposed: &ProposedSpan,
        disagreement: f64,
        ctx: &RunContext,
    ) -> Option<CandidateItem> {
        let transcript = &ctx.transcript;
        let span = Span::new(proposed.start.max(0.0), proposed.end.min(transcript.duration()))
            .map_err(|e| warn!(stage = %self.id, "Dropping proposed span: {}", e))
            .ok()?;
        let segments = transcript.slice(&span);
        if segments.is_empty() {
            warn!(stage = %self.id, "Dropping proposed span {} with no transcript", span);
            return None;
        }
        let mut item =
            match CandidateItem::new(&self.id, transcript.source_id.clone(), span, segments) {
                Ok(item) => item,
                Err(e) => {
                    warn!(stage = %self.id, "Dropping proposed span {}: {}", span, e);
                    return None;
                }
            };
        item.set_score(
            &self.id,
            PRIORITY_SCORE,
            proposed.potential,
            ScoreMethod::Ensemble,
            Some(disagreement),
        );
        Some(item)
    }
}

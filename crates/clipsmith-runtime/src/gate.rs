//! The quality gate: the pipeline's single accept/reject decision, and the
//! false-negative arithmetic that keeps it single.
//!
//! With a per-gate false-negative rate `p`, `k` independent hard gates lose
//! `1 - (1 - p)^k` of the good items. Anything placed before the gate must
//! therefore only reorder or deprioritize, never reject.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use clipsmith_consensus::{RobustMean, StagePayload};
use clipsmith_core::{
    stages, CandidateItem, GateMode, ItemStatus, PipelineConfig, Result, ScoreMethod, StageId,
    PRIORITY_SCORE,
};

use crate::prompts::StageTask;
use crate::report::GateAnalysis;
use crate::stage::{BatchOutcome, RunContext, Stage, StageTraits};
use crate::stages::completeness::COMPLETENESS_SCORE;
use crate::stages::{ensemble, unexpected_payload};

/// Score name written by the gate.
pub const GATE_SCORE: &str = "gate";

/// Per-gate false-negative rate assumed in run reports.
pub const ASSUMED_FALSE_NEGATIVE: f64 = 0.10;

const INSTRUCTIONS: &str = "For each item, score from 0 to 100 how likely it is to work as \
a published short clip: hook strength, clarity, and payoff.";

/// `1 - (1 - p)^k`: share of good items lost to `k` independent gates.
pub fn compounded_false_negative_rate(p: f64, k: u32) -> f64 {
    let p = p.clamp(0.0, 1.0);
    1.0 - (1.0 - p).powi(k as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateSimulation {
    pub trials: usize,
    pub rejected: usize,
    pub rate: f64,
    /// What the independence model predicts for the same `p` and `k`.
    pub independent_prediction: f64,
}

/// Push `trials` known-good items through `k` gates that each wrongly reject
/// with probability `p`.
///
/// `correlation` in `[0, 1]` is the chance a later gate repeats the first
/// gate's verdict instead of drawing its own; 0 is the independence model,
/// 1 makes the gates one gate.
pub fn simulate_gate_chain(
    p: f64,
    k: u32,
    correlation: f64,
    trials: usize,
    seed: u64,
) -> GateSimulation {
    let p = p.clamp(0.0, 1.0);
    let correlation = correlation.clamp(0.0, 1.0);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rejected = 0;
    for _ in 0..trials {
        let mut first = None;
        let mut lost = false;
        for _ in 0..k {
            let verdict = match first {
                Some(previous) if rng.gen::<f64>() < correlation => previous,
                _ => rng.gen::<f64>() < p,
            };
            first.get_or_insert(verdict);
            lost |= verdict;
        }
        if lost {
            rejected += 1;
        }
    }
    GateSimulation {
        trials,
        rejected,
        rate: if trials == 0 {
            0.0
        } else {
            rejected as f64 / trials as f64
        },
        independent_prediction: compounded_false_negative_rate(p, k),
    }
}

/// Figures for the run report, given how many gates the pipeline has.
pub fn analysis(gates_in_path: usize) -> GateAnalysis {
    GateAnalysis {
        per_gate_false_negative: ASSUMED_FALSE_NEGATIVE,
        gates_in_path,
        compounded_false_negative: compounded_false_negative_rate(
            ASSUMED_FALSE_NEGATIVE,
            gates_in_path as u32,
        ),
        with_extra_gate: compounded_false_negative_rate(
            ASSUMED_FALSE_NEGATIVE,
            gates_in_path as u32 + 1,
        ),
    }
}

/// Deterministic gate score on the 0-100 scale: the mean of discovery
/// potential (scaled from 0-10) and completeness, whichever exist.
pub fn formula_score(item: &CandidateItem) -> f64 {
    let parts: Vec<f64> = [
        item.score(PRIORITY_SCORE).map(|p| p * 10.0),
        item.score(COMPLETENESS_SCORE),
    ]
    .into_iter()
    .flatten()
    .collect();
    if parts.is_empty() {
        0.0
    } else {
        (parts.iter().sum::<f64>() / parts.len() as f64).clamp(0.0, 100.0)
    }
}

pub struct QualityGate {
    id: StageId,
    batch_size: usize,
    mode: GateMode,
    threshold: f64,
    trim: f64,
}

impl QualityGate {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: StageId::new(stages::GATE),
            batch_size: config.batch_size,
            mode: config.gate_mode,
            threshold: config.gate_threshold,
            trim: config.trim_fraction,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn decide(
        &self,
        item: &mut CandidateItem,
        score: f64,
        method: ScoreMethod,
        spread: Option<f64>,
    ) -> Result<()> {
        item.set_score(&self.id, GATE_SCORE, score, method, spread);
        let verdict = if score >= self.threshold {
            ItemStatus::GatedAccept
        } else {
            ItemStatus::GatedReject
        };
        item.advance(&self.id, verdict)
    }
}

#[async_trait]
impl Stage for QualityGate {
    fn id(&self) -> &StageId {
        &self.id
    }

    fn version(&self) -> u32 {
        1
    }

    fn traits(&self) -> StageTraits {
        StageTraits {
            batch_size: self.batch_size,
            is_gate: true,
            ..Default::default()
        }
    }

    async fn apply(&self, batch: &mut [CandidateItem], ctx: &RunContext) -> Result<BatchOutcome> {
        if self.mode == GateMode::Formula {
            let mut outcome = BatchOutcome::default();
            for item in batch.iter_mut() {
                let score = formula_score(item);
                if let Err(e) = self.decide(item, score, ScoreMethod::Formula, None) {
                    outcome.fail(item.id(), e.to_string());
                }
            }
            return Ok(outcome);
        }

        let task = StageTask::scores(
            self.id.as_str(),
            self.version(),
            INSTRUCTIONS,
            batch,
            &ctx.principles,
        );
        let result = ensemble(ctx, &self.id, &task, &RobustMean { trim: self.trim }).await?;
        let StagePayload::Scores { items: scores } = &result.payload else {
            return Err(unexpected_payload(&self.id, &result));
        };

        let mut outcome = BatchOutcome::from_consensus(&result);
        for item in batch.iter_mut() {
            let Some(score) = scores.iter().find(|s| s.item_id == *item.id()) else {
                outcome.fail(item.id(), "no gate score returned");
                continue;
            };
            let spread = result.disagreement_for(item.id());
            if let Err(e) = self.decide(item, score.score, ScoreMethod::Ensemble, spread) {
                outcome.fail(item.id(), e.to_string());
            }
        }
        Ok(outcome)
    }
}

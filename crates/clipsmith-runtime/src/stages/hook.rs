//! Hook selection: categorical vote on the opening segment of each clip.
//!
//! Hooks are matched across the batch (no two items may open with the same
//! line), so a failure anywhere rolls the whole batch back.

use std::collections::HashMap;

use async_trait::async_trait;

use clipsmith_consensus::{MajorityVote, StagePayload};
use clipsmith_core::{
    stages, CandidateItem, ItemId, PipelineConfig, Result, SegmentRole, StageId, SubSegment,
};

use crate::prompts::StageTask;
use crate::stage::{BatchOutcome, FailureScope, RunContext, Stage, StageTraits};
use crate::stages::{ensemble, unexpected_payload};

pub struct SelectHook {
    id: StageId,
    batch_size: usize,
}

impl SelectHook {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: StageId::new(stages::SELECT_HOOK),
            batch_size: config.batch_size,
        }
    }
}

#[async_trait]
impl Stage for SelectHook {
    fn id(&self) -> &StageId {
        &self.id
    }

    fn version(&self) -> u32 {
        1
    }

    fn traits(&self) -> StageTraits {
        StageTraits {
            batch_size: self.batch_size,
            failure_scope: FailureScope::Batch,
            ..Default::default()
        }
    }

    async fn apply(&self, batch: &mut [CandidateItem], ctx: &RunContext) -> Result<BatchOutcome> {
        let task = StageTask::hooks(self.id.as_str(), self.version(), batch, &ctx.principles);
        let result = ensemble(ctx, &self.id, &task, &MajorityVote).await?;
        let StagePayload::Choices { items: choices } = &result.payload else {
            return Err(unexpected_payload(&self.id, &result));
        };

        let mut outcome = BatchOutcome::from_consensus(&result);
        let mut picks: Vec<(usize, usize)> = Vec::with_capacity(batch.len());
        let mut claimed: HashMap<String, ItemId> = HashMap::new();
        for (pos, item) in batch.iter().enumerate() {
            let Some(choice) = choices.iter().find(|c| c.item_id == *item.id()) else {
                outcome.fail(item.id(), "no hook returned");
                continue;
            };
            let index = match choice.choice.parse::<usize>() {
                Ok(i) if i < item.segments().len() => i,
                _ => {
                    outcome.fail(item.id(), format!("invalid hook '{}'", choice.choice));
                    continue;
                }
            };
            let line = item.segments()[index].text.trim().to_lowercase();
            if let Some(other) = claimed.insert(line, item.id().clone()) {
                outcome.fail(item.id(), format!("hook already used by {}", other));
                continue;
            }
            picks.push((pos, index));
        }
        if !outcome.failed.is_empty() {
            return Ok(outcome);
        }

        for (pos, index) in picks {
            let item = &mut batch[pos];
            let segments: Vec<SubSegment> = item
                .segments()
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    let role = match (i == index, s.role) {
                        (true, _) => SegmentRole::Hook,
                        (false, SegmentRole::Hook) => SegmentRole::Content,
                        (false, role) => role,
                    };
                    SubSegment { role, ..s.clone() }
                })
                .collect();
            if let Err(e) = item.replace_segments(&self.id, segments) {
                outcome.fail(item.id(), e.to_string());
            }
        }
        Ok(outcome)
    }
}

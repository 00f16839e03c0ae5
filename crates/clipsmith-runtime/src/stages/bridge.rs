//! Rule stage: extend items that end on an open question to their answer.

use async_trait::async_trait;
use tracing::debug;

use clipsmith_core::{stages, CandidateItem, PipelineConfig, Result, StageId};
use clipsmith_transform::{BridgeOutcome, BridgeSettings, OpenLoopBridger};

use crate::stage::{BatchOutcome, RunContext, Stage, StageTraits};

pub struct BridgeOpenLoops {
    id: StageId,
    batch_size: usize,
    bridger: OpenLoopBridger,
}

impl BridgeOpenLoops {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            id: StageId::new(stages::BRIDGE_OPEN_LOOPS),
            batch_size: config.batch_size,
            bridger: OpenLoopBridger::new(BridgeSettings {
                max_gap: config.bridge_max_gap_secs,
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Stage for BridgeOpenLoops {
    fn id(&self) -> &StageId {
        &self.id
    }

    fn version(&self) -> u32 {
        1
    }

    fn traits(&self) -> StageTraits {
        StageTraits {
            batch_size: self.batch_size,
            extends_span: true,
            ..Default::default()
        }
    }

    async fn apply(&self, batch: &mut [CandidateItem], ctx: &RunContext) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut bridged = 0;
        for item in batch.iter_mut() {
            match self.bridger.apply(&self.id, item, &ctx.transcript) {
                Ok(BridgeOutcome::Bridged { .. }) => bridged += 1,
                Ok(_) => {}
                Err(e) => outcome.fail(item.id(), e.to_string()),
            }
        }
        debug!("Bridged {} of {} items", bridged, batch.len());
        Ok(outcome)
    }
}

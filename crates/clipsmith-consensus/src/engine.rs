//! Ensemble fan-out with quorum, fallback substitution, and result caching.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use clipsmith_cache::{ensemble_model_key, Fingerprint, ResultCache};
use clipsmith_core::{Error, QuorumPolicy, Result};
use clipsmith_gateway::{ModelGateway, ModelProvider, ModelRequest, Payload, ResponseSchema, Usage};

use crate::reconcile::Reconciler;
use crate::types::{Confidence, ConsensusResult, EnsembleVote, StagePayload, VoteOutcome};

/// One logical decision to put to the ensemble.
pub trait ConsensusTask: Send + Sync {
    fn stage(&self) -> &str;

    /// Bump whenever the prompt or parsing changes.
    fn stage_version(&self) -> u32;

    /// The fields the decision depends on, and nothing else.
    fn canonical_input(&self) -> serde_json::Value;

    fn request(&self) -> ModelRequest;

    fn schema(&self) -> ResponseSchema;

    /// Turn a schema-valid reply into this stage's payload.
    fn parse(&self, value: &serde_json::Value) -> std::result::Result<StagePayload, String>;
}

#[derive(Clone)]
pub struct QuorumSettings {
    /// `None` means a majority of the requested providers.
    pub min_quorum: Option<usize>,
    pub policy: QuorumPolicy,
    pub fallback: Option<Arc<dyn ModelProvider>>,
}

impl QuorumSettings {
    pub fn required(&self, requested: usize) -> usize {
        self.min_quorum
            .unwrap_or(requested / 2 + 1)
            .clamp(1, requested.max(1))
    }
}

impl Default for QuorumSettings {
    fn default() -> Self {
        Self {
            min_quorum: None,
            policy: QuorumPolicy::BestEffort,
            fallback: None,
        }
    }
}

pub struct ConsensusEngine {
    gateway: Arc<ModelGateway>,
    cache: Arc<ResultCache>,
    quorum: QuorumSettings,
}

impl ConsensusEngine {
    pub fn new(gateway: Arc<ModelGateway>, cache: Arc<ResultCache>, quorum: QuorumSettings) -> Self {
        Self {
            gateway,
            cache,
            quorum,
        }
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Cache key for `task` put to `providers`.
    pub fn fingerprint(
        &self,
        providers: &[Arc<dyn ModelProvider>],
        task: &dyn ConsensusTask,
    ) -> Fingerprint {
        let model_key = ensemble_model_key(providers.iter().map(|p| (p.id(), p.model())));
        Fingerprint::compute(
            task.stage(),
            task.stage_version(),
            &model_key,
            &task.canonical_input(),
        )
    }

    /// Put `task` to every provider at once and reconcile the answers.
    ///
    /// Failed or timed-out calls are missing votes. Below quorum the result
    /// is low-confidence (after one fallback round when configured); with no
    /// votes at all the call fails with `QuorumNotMet`.
    pub async fn consensus(
        &self,
        providers: &[Arc<dyn ModelProvider>],
        task: &dyn ConsensusTask,
        reconciler: &dyn Reconciler,
    ) -> Result<ConsensusResult> {
        let stage = task.stage().to_string();
        if providers.is_empty() {
            return Err(Error::Config(format!("no providers for stage '{}'", stage)));
        }

        let key = self.fingerprint(providers, task);
        if let Some(mut hit) = self.cache.get::<ConsensusResult>(&stage, &key) {
            hit.cached = true;
            return Ok(hit);
        }

        let request = task.request();
        let schema = task.schema();
        let requested = providers.len();
        let required = self.quorum.required(requested);

        let mut votes = join_all(
            providers
                .iter()
                .map(|p| self.cast_vote(p.as_ref(), task, &request, &schema, false)),
        )
        .await;

        let mut received = count_parsed(&votes);
        if received < required {
            if let (QuorumPolicy::RetryWithFallback, Some(fallback)) =
                (self.quorum.policy, &self.quorum.fallback)
            {
                let missing = requested - received;
                info!(
                    stage = %stage,
                    "Quorum not met ({}/{}), substituting {} votes from {}",
                    received,
                    required,
                    missing,
                    fallback.id()
                );
                let substitutes = join_all(
                    (0..missing)
                        .map(|_| self.cast_vote(fallback.as_ref(), task, &request, &schema, true)),
                )
                .await;
                votes.extend(substitutes);
                received = count_parsed(&votes);
            }
        }

        if received == 0 {
            warn!(stage = %stage, "No provider returned a usable vote");
            return Err(Error::QuorumNotMet { received, required });
        }

        let parsed: Vec<&StagePayload> = votes.iter().filter_map(|v| v.payload()).collect();
        let reconciled = reconciler.reconcile(&parsed)?;
        let confidence = if received >= required {
            Confidence::Full
        } else {
            Confidence::Low
        };
        debug!(
            stage = %stage,
            received,
            required,
            disagreement = reconciled.disagreement,
            reconciler = reconciler.name(),
            "Consensus reached"
        );

        let result = ConsensusResult {
            stage: stage.clone(),
            payload: reconciled.payload,
            disagreement: reconciled.disagreement,
            item_disagreement: reconciled.item_disagreement,
            confidence,
            votes,
            requested,
            received,
            cached: false,
        };
        if confidence == Confidence::Full {
            self.cache.put(&stage, &key, &result);
        } else {
            warn!(
                stage = %stage,
                "Low-confidence consensus ({}/{} votes), not cached",
                received,
                required
            );
        }
        Ok(result)
    }

    async fn cast_vote(
        &self,
        provider: &dyn ModelProvider,
        task: &dyn ConsensusTask,
        request: &ModelRequest,
        schema: &ResponseSchema,
        substitute: bool,
    ) -> EnsembleVote {
        let mut usage = Usage::default();
        let outcome = match self
            .gateway
            .invoke_with_usage(provider, task.stage(), request, Some(schema), &mut usage)
            .await
        {
            Ok(Payload::Structured(value)) => match task.parse(&value) {
                Ok(payload) => VoteOutcome::Parsed { payload },
                Err(e) => VoteOutcome::Failed {
                    error: format!("unparseable reply: {}", e),
                },
            },
            Ok(Payload::Text(_)) => VoteOutcome::Failed {
                error: "expected structured reply".into(),
            },
            Err(e) => {
                warn!(
                    stage = task.stage(),
                    provider = provider.id(),
                    error = %e,
                    "Vote missing"
                );
                VoteOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        EnsembleVote {
            provider: provider.id().to_string(),
            model: provider.model().to_string(),
            outcome,
            cost_usd: usage.cost_usd,
            latency_ms: usage.wall_time.as_millis() as u64,
            substitute,
        }
    }
}

fn count_parsed(votes: &[EnsembleVote]) -> usize {
    votes.iter().filter(|v| v.payload().is_some()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::RobustMean;
    use crate::types::ItemScore;
    use clipsmith_core::ItemId;
    use clipsmith_gateway::{BudgetTracker, CallError, GatewaySettings, ScriptedProvider};
    use serde_json::json;
    use std::time::{Duration, Instant};

    struct ScoreTask;

    impl ConsensusTask for ScoreTask {
        fn stage(&self) -> &str {
            "completeness"
        }
        fn stage_version(&self) -> u32 {
            1
        }
        fn canonical_input(&self) -> serde_json::Value {
            json!({"item": "a"})
        }
        fn request(&self) -> ModelRequest {
            ModelRequest::new("score item a")
        }
        fn schema(&self) -> ResponseSchema {
            ResponseSchema::new(json!({"type": "object", "required": ["score"]}))
        }
        fn parse(&self, value: &serde_json::Value) -> std::result::Result<StagePayload, String> {
            let score = value["score"].as_f64().ok_or("score not a number")?;
            Ok(StagePayload::Scores {
                items: vec![ItemScore {
                    item_id: ItemId::from("a"),
                    score,
                }],
            })
        }
    }

    fn engine(quorum: QuorumSettings) -> ConsensusEngine {
        let gateway = ModelGateway::new(
            Arc::new(BudgetTracker::unlimited()),
            GatewaySettings {
                timeout: Duration::from_millis(300),
                max_retries: 0,
                max_transient_retries: 0,
                backoff_base: Duration::from_millis(1),
            },
        );
        ConsensusEngine::new(
            Arc::new(gateway),
            Arc::new(ResultCache::in_memory(Duration::from_secs(60))),
            quorum,
        )
    }

    fn scoring(id: &str, score: f64) -> Arc<dyn ModelProvider> {
        Arc::new(ScriptedProvider::replying(id, format!(r#"{{"score": {}}}"#, score)))
    }

    fn down(id: &str) -> Arc<dyn ModelProvider> {
        Arc::new(ScriptedProvider::failing(
            id,
            CallError::Rejected {
                provider: id.into(),
                status: Some(401),
                message: "no".into(),
            },
        ))
    }

    fn score_of(result: &ConsensusResult) -> f64 {
        match &result.payload {
            StagePayload::Scores { items } => items[0].score,
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconciles_only_successful_votes() {
        let e = engine(QuorumSettings::default());
        let providers = vec![scoring("a", 70.0), scoring("b", 80.0), down("c")];
        let result = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        assert_eq!(result.confidence, Confidence::Full);
        assert_eq!(result.received, 2);
        assert_eq!(result.votes.len(), 3);
        assert_eq!(score_of(&result), 75.0);
    }

    #[tokio::test]
    async fn test_below_quorum_is_low_confidence_and_not_cached() {
        let e = engine(QuorumSettings::default());
        let providers = vec![scoring("a", 70.0), down("b"), down("c")];
        let result = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        assert!(result.is_low_confidence());
        let again = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        assert!(!again.cached);
    }

    #[tokio::test]
    async fn test_no_votes_is_quorum_error() {
        let e = engine(QuorumSettings::default());
        let providers = vec![down("a"), down("b")];
        let err = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuorumNotMet { received: 0, .. }));
    }

    #[tokio::test]
    async fn test_fallback_fills_missing_votes() {
        let e = engine(QuorumSettings {
            min_quorum: Some(3),
            policy: QuorumPolicy::RetryWithFallback,
            fallback: Some(scoring("backup", 90.0)),
        });
        let providers = vec![scoring("a", 60.0), down("b"), down("c")];
        let result = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        assert_eq!(result.confidence, Confidence::Full);
        assert_eq!(result.received, 3);
        assert_eq!(result.votes.iter().filter(|v| v.substitute).count(), 2);
        assert_eq!(score_of(&result), 80.0);
    }

    #[tokio::test]
    async fn test_second_call_hits_cache() {
        let e = engine(QuorumSettings::default());
        let a = Arc::new(ScriptedProvider::replying("a", r#"{"score": 50}"#));
        let providers: Vec<Arc<dyn ModelProvider>> = vec![a.clone() as Arc<dyn ModelProvider>];
        let first = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        let second = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.payload, first.payload);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_is_concurrent() {
        let e = engine(QuorumSettings::default());
        let slow = |id: &str| -> Arc<dyn ModelProvider> {
            Arc::new(
                ScriptedProvider::replying(id, r#"{"score": 1}"#)
                    .with_delay(Duration::from_millis(100)),
            )
        };
        let providers = vec![slow("a"), slow("b"), slow("c")];
        let started = Instant::now();
        e.consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_timed_out_provider_is_missing_vote() {
        let e = engine(QuorumSettings::default());
        let hung: Arc<dyn ModelProvider> = Arc::new(
            ScriptedProvider::replying("hung", r#"{"score": 1}"#)
                .with_delay(Duration::from_secs(10)),
        );
        let providers = vec![scoring("a", 40.0), scoring("b", 60.0), hung];
        let result = e
            .consensus(&providers, &ScoreTask, &RobustMean { trim: 0.0 })
            .await
            .unwrap();
        assert_eq!(result.received, 2);
        assert_eq!(score_of(&result), 50.0);
    }
}

//! End-to-end runs over in-process providers.
//!
//! Every provider here answers through `dry_run::respond` unless a test
//! overrides a stage, so no network access is needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use clipsmith_core::{
    stages, DiscardReason, PipelineConfig, ProviderKind, ProviderSpec, SegmentRole, Transcript,
    TranscriptSegment, TIME_EPSILON,
};
use clipsmith_gateway::{CallError, ModelProvider, ModelReply, ModelRequest};
use clipsmith_runtime::dry_run::respond;
use clipsmith_runtime::{read_request, Pipeline, PipelineReport};

type Delay = dyn Fn(&str, &Value) -> Duration + Send + Sync;
type Reply = dyn Fn(&str, &str, &ModelRequest) -> Result<String, CallError> + Send + Sync;

/// Provider whose latency and reply depend on the stage and input.
struct TestProvider {
    id: String,
    delay: Box<Delay>,
    reply: Box<Reply>,
}

impl TestProvider {
    fn dry(id: &str) -> Self {
        Self {
            id: id.to_string(),
            delay: Box::new(|_, _| Duration::ZERO),
            reply: Box::new(|provider, _, request| respond(provider, request)),
        }
    }

    fn with_delay(mut self, delay: impl Fn(&str, &Value) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }

    fn with_reply(
        mut self,
        reply: impl Fn(&str, &str, &ModelRequest) -> Result<String, CallError> + Send + Sync + 'static,
    ) -> Self {
        self.reply = Box::new(reply);
        self
    }
}

#[async_trait]
impl ModelProvider for TestProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Scripted
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelReply, CallError> {
        let (stage, input) = read_request(request).unwrap_or_else(|| (String::new(), Value::Null));
        let delay = (self.delay)(&stage, &input);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let text = (self.reply)(&self.id, &stage, request)?;
        Ok(ModelReply {
            tokens_in: (request.prompt.len() / 4) as u64,
            tokens_out: (text.len() / 4) as u64,
            text,
        })
    }
}

fn config(ids: &[&str]) -> PipelineConfig {
    PipelineConfig {
        providers: ids
            .iter()
            .map(|id| ProviderSpec {
                id: id.to_string(),
                kind: ProviderKind::Scripted,
                model: None,
                tier: None,
                stages: Vec::new(),
            })
            .collect(),
        batch_size: 2,
        max_transient_retries: 0,
        backoff_base_ms: 1,
        call_timeout_secs: 5.0,
        stage_timeout_secs: 30.0,
        ..Default::default()
    }
}

fn build(config: PipelineConfig, providers: Vec<TestProvider>) -> Pipeline {
    Pipeline::builder(config)
        .providers(
            providers
                .into_iter()
                .map(|p| Arc::new(p) as Arc<dyn ModelProvider>),
        )
        .build()
        .unwrap()
}

fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
    TranscriptSegment {
        start,
        end,
        text: text.to_string(),
    }
}

/// Four minutes of distinct, plain statements in six-second segments.
fn talk() -> Transcript {
    let segments = (0..40)
        .map(|i| {
            let start = i as f64 * 6.0;
            seg(
                start,
                start + 6.0,
                &format!("Point number {} covers one concrete step of the build.", i),
            )
        })
        .collect();
    Transcript::new("talk", segments)
}

fn all_items(report: &PipelineReport) -> impl Iterator<Item = &clipsmith_core::CandidateItem> {
    report
        .accepted
        .iter()
        .chain(&report.rejected)
        .chain(&report.discarded)
        .chain(&report.ungated)
}

fn stage_summary<'a>(report: &'a PipelineReport, stage: &str) -> &'a clipsmith_runtime::StageSummary {
    report
        .stages
        .iter()
        .find(|s| s.stage == stage)
        .unwrap_or_else(|| panic!("no summary for {}", stage))
}

#[tokio::test]
async fn test_dry_run_accepts_whole_clips() {
    let pipeline = build(
        config(&["a", "b", "c"]),
        vec![TestProvider::dry("a"), TestProvider::dry("b"), TestProvider::dry("c")],
    );
    let report = pipeline.run(talk()).await.unwrap();

    assert_eq!(report.accepted.len(), 4, "{}", report.summary_line());
    assert!(report.discarded.is_empty());
    assert_eq!(report.stages.len(), 7);
    for item in &report.accepted {
        assert!(item.is_span_locked());
        assert_eq!(item.segments()[0].role, SegmentRole::Hook);
        assert_eq!(item.score("completeness"), Some(80.0));
        assert_eq!(item.score("gate"), Some(75.0));
    }
    assert!((report.gate.compounded_false_negative - 0.10).abs() < 1e-12);
    assert!((report.gate.with_extra_gate - 0.19).abs() < 1e-12);
    assert_eq!(report.export().len(), 4);
}

#[tokio::test]
async fn test_every_segment_stays_inside_its_span() {
    let pipeline = build(
        config(&["a", "b"]),
        vec![TestProvider::dry("a"), TestProvider::dry("b")],
    );
    let report = pipeline.run(talk()).await.unwrap();

    for item in all_items(&report) {
        item.check_invariants().unwrap();
        let span = item.span();
        for s in item.segments() {
            assert!(s.span.start() >= span.start() - TIME_EPSILON);
            assert!(s.span.end() <= span.end() + TIME_EPSILON);
        }
    }
}

#[tokio::test]
async fn test_output_order_ignores_completion_order() {
    // Later clips answer first in every stage.
    let late_first = |_: &str, input: &Value| {
        let start = input["items"][0]["start"].as_f64().unwrap_or(0.0);
        Duration::from_millis(60u64.saturating_sub(start as u64 / 4))
    };
    let mut config = config(&["a", "b"]);
    config.batch_size = 1;
    config.max_concurrent_batches = 8;
    let pipeline = build(
        config,
        vec![
            TestProvider::dry("a").with_delay(late_first),
            TestProvider::dry("b").with_delay(late_first),
        ],
    );
    let report = pipeline.run(talk()).await.unwrap();

    let starts: Vec<f64> = report.accepted.iter().map(|i| i.span().start()).collect();
    assert_eq!(starts.len(), 4);
    assert!(starts.windows(2).all(|w| w[0] < w[1]), "{:?}", starts);
}

#[tokio::test]
async fn test_reordered_batch_replies_stay_with_their_items() {
    // Gate replies list the batch backwards, each score derived from the item's own start.
    let reversed_gate = |provider: &str, stage: &str, request: &ModelRequest| {
        if stage != stages::GATE {
            return respond(provider, request);
        }
        let (_, input) = read_request(request).unwrap();
        let mut scores: Vec<Value> = input["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|i| {
                let start = i["start"].as_f64().unwrap();
                json!({"item_id": i["item_id"], "score": 60.0 + start / 10.0})
            })
            .collect();
        scores.reverse();
        Ok(json!({ "items": scores }).to_string())
    };
    let mut config = config(&["a", "b"]);
    config.batch_size = 3;
    let pipeline = build(
        config,
        vec![
            TestProvider::dry("a").with_reply(reversed_gate),
            TestProvider::dry("b").with_reply(reversed_gate),
        ],
    );
    let report = pipeline.run(talk()).await.unwrap();

    assert_eq!(report.accepted.len() + report.rejected.len(), 4);
    for item in report.accepted.iter().chain(&report.rejected) {
        let expected = 60.0 + item.span().start() / 10.0;
        let score = item.score("gate").unwrap();
        assert!((score - expected).abs() < 1e-9, "{} got {}", item.id(), score);
    }
    // 60 and 66 fall below the threshold of 70; 72 and 78 pass.
    assert_eq!(report.accepted.len(), 2);
    assert_eq!(report.rejected.len(), 2);
}

#[tokio::test]
async fn test_overlapping_transcript_segments_still_yield_clips() {
    // Each segment starts a tenth of a second before its predecessor ends.
    let segments = (0..40)
        .map(|i| {
            let start = i as f64 * 6.0;
            seg(
                if i == 0 { 0.0 } else { start - 0.1 },
                start + 6.0,
                &format!("Point number {} covers one concrete step of the build.", i),
            )
        })
        .collect();
    let mut config = config(&["a", "b"]);
    config.batch_size = 3;
    let pipeline = build(
        config,
        vec![TestProvider::dry("a"), TestProvider::dry("b")],
    );
    let report = pipeline.run(Transcript::new("asr", segments)).await.unwrap();

    assert_eq!(report.accepted.len(), 4, "{}", report.summary_line());
    assert!(report.discarded.is_empty());
    assert_eq!(stage_summary(&report, stages::DISCOVER).skipped, 0);
    for item in all_items(&report) {
        item.check_invariants().unwrap();
    }
}

#[tokio::test]
async fn test_open_loop_is_bridged_end_to_end() {
    let transcript = Transcript::new(
        "vortrag",
        vec![
            seg(0.0, 6.0, "Früher hat das allen Spaß gemacht."),
            seg(6.0, 10.32, "Was ist hier passiert?"),
            seg(12.0, 17.5, "Die Freude am Tun ist ersetzt worden."),
            seg(17.5, 22.0, "Und zwar durch Kennzahlen."),
        ],
    );
    let discover_first_half = |provider: &str, stage: &str, request: &ModelRequest| {
        if stage == stages::DISCOVER {
            Ok(json!({"candidates": [{"start": 0.0, "end": 10.32, "potential": 8.0}]}).to_string())
        } else {
            respond(provider, request)
        }
    };
    let pipeline = build(
        config(&["a", "b"]),
        vec![
            TestProvider::dry("a").with_reply(discover_first_half),
            TestProvider::dry("b").with_reply(discover_first_half),
        ],
    );
    let report = pipeline.run(transcript).await.unwrap();

    assert_eq!(report.accepted.len(), 1, "{}", report.summary_line());
    let item = &report.accepted[0];
    assert!((item.span().end() - 17.5).abs() < 1e-9);
    let last = item.segments().last().unwrap();
    assert_eq!(last.role, SegmentRole::Payoff);
    assert_eq!(last.text, "Die Freude am Tun ist ersetzt worden.");
    assert_eq!(stage_summary(&report, stages::BRIDGE_OPEN_LOOPS).processed, 1);
}

#[tokio::test]
async fn test_clashing_hooks_roll_back_the_batch() {
    // Both clips open with the same line, so their hooks cannot both be it.
    let segments = (0..20)
        .map(|i| {
            let start = i as f64 * 6.0;
            let text = if i % 10 == 0 {
                "Okay, listen up.".to_string()
            } else {
                format!("Detail {} of the release process.", i)
            };
            seg(start, start + 6.0, &text)
        })
        .collect();
    let pipeline = build(
        config(&["a", "b"]),
        vec![TestProvider::dry("a"), TestProvider::dry("b")],
    );
    let report = pipeline.run(Transcript::new("release", segments)).await.unwrap();

    assert_eq!(stage_summary(&report, stages::SELECT_HOOK).rolled_back, 2);
    assert_eq!(report.accepted.len(), 2);
    for item in &report.accepted {
        assert!(item.segments().iter().all(|s| s.role != SegmentRole::Hook));
    }
}

#[tokio::test]
async fn test_quorum_shortfall_is_low_confidence_and_never_cached() {
    let broken = || {
        TestProvider::dry("broken").with_reply(|provider, _, _| {
            Err(CallError::Rejected {
                provider: provider.to_string(),
                status: Some(401),
                message: "bad key".into(),
            })
        })
    };
    let pipeline = build(
        config(&["a", "broken"]),
        vec![TestProvider::dry("a"), broken()],
    );

    let first = pipeline.run(talk()).await.unwrap();
    assert_eq!(first.accepted.len(), 4);
    assert!(stage_summary(&first, stages::DISCOVER).low_confidence_batches > 0);
    assert!(stage_summary(&first, stages::GATE).low_confidence_batches > 0);

    let second = pipeline.run(talk()).await.unwrap();
    assert!(second.stages.iter().all(|s| s.cached_batches == 0));
}

#[tokio::test]
async fn test_second_run_is_served_from_cache() {
    let pipeline = build(
        config(&["a", "b"]),
        vec![TestProvider::dry("a"), TestProvider::dry("b")],
    );
    let first = pipeline.run(talk()).await.unwrap();
    let second = pipeline.run(talk()).await.unwrap();

    assert_eq!(
        first.accepted.iter().map(|i| i.id()).collect::<Vec<_>>(),
        second.accepted.iter().map(|i| i.id()).collect::<Vec<_>>()
    );
    assert!(second.budget.by_provider.values().all(|l| l.calls == 0));
    let discover = stage_summary(&second, stages::DISCOVER);
    assert_eq!(discover.cached_batches, discover.processed);
    assert!(second.cache.values().any(|s| s.hits > 0));
}

#[tokio::test]
async fn test_stage_deadline_discards_late_items() {
    let slow_completeness = |stage: &str, _: &Value| {
        if stage == stages::COMPLETENESS {
            Duration::from_secs(2)
        } else {
            Duration::ZERO
        }
    };
    let mut config = config(&["a", "b"]);
    config.stage_timeout_secs = 0.3;
    let pipeline = build(
        config,
        vec![
            TestProvider::dry("a").with_delay(slow_completeness),
            TestProvider::dry("b").with_delay(slow_completeness),
        ],
    );
    let report = pipeline.run(talk()).await.unwrap();

    assert!(report.accepted.is_empty());
    assert_eq!(report.discarded.len(), 4);
    for item in &report.discarded {
        match item.discard_reason() {
            Some(DiscardReason::StageTimeout { stage }) => {
                assert_eq!(stage.as_str(), stages::COMPLETENESS)
            }
            other => panic!("unexpected discard reason {:?}", other),
        }
    }
    assert_eq!(stage_summary(&report, stages::COMPLETENESS).timed_out, 4);
}

#[tokio::test]
async fn test_exhausted_budget_skips_only_optional_stages() {
    let rambling = Transcript::new(
        "rambling",
        (0..8)
            .map(|i| {
                let start = i as f64 * 5.0;
                seg(
                    start,
                    start + 5.0,
                    &format!("Äh also, ähm, Punkt {} ist irgendwie, äh, sozusagen wichtig.", i),
                )
            })
            .collect(),
    );

    let mut capped = config(&["a", "b"]);
    capped.budget_cap_usd = Some(0.0);
    let pipeline = build(capped, vec![TestProvider::dry("a"), TestProvider::dry("b")]);
    let report = pipeline.run(rambling.clone()).await.unwrap();

    let restructure = stage_summary(&report, stages::RESTRUCTURE);
    assert_eq!(restructure.processed, 0);
    assert!(restructure.skipped > 0);
    assert_eq!(restructure.calls, 0);
    assert_eq!(report.accepted.len(), 1);

    let pipeline = build(
        config(&["a", "b"]),
        vec![TestProvider::dry("a"), TestProvider::dry("b")],
    );
    let report = pipeline.run(rambling).await.unwrap();
    assert!(stage_summary(&report, stages::RESTRUCTURE).processed > 0);
}

#[tokio::test]
async fn test_disabled_gate_leaves_items_ungated() {
    let mut config = config(&["a", "b"]);
    config.stage_enabled.insert(stages::GATE.into(), false);
    let pipeline = build(config, vec![TestProvider::dry("a"), TestProvider::dry("b")]);
    let report = pipeline.run(talk()).await.unwrap();

    assert!(report.accepted.is_empty());
    assert_eq!(report.ungated.len(), 4);
    assert_eq!(report.gate.gates_in_path, 0);
    assert!((report.gate.with_extra_gate - 0.10).abs() < 1e-12);
}

#[tokio::test]
async fn test_unmatched_provider_config_is_rejected() {
    let result = Pipeline::builder(config(&["a", "missing"]))
        .provider(Arc::new(TestProvider::dry("a")))
        .build();
    assert!(result.is_err());
}

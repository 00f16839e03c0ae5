//! Offline responder: plausible, deterministic replies for every built-in
//! stage, so a pipeline can run end to end without network access.

use serde_json::{json, Value};

use clipsmith_core::stages;
use clipsmith_gateway::{CallError, ModelRequest, ScriptedProvider};

use crate::prompts::read_request;

/// Longest span proposed per candidate during a dry run.
const DRY_RUN_CLIP_SECS: f64 = 60.0;

pub fn dry_run_provider(id: impl Into<String>) -> ScriptedProvider {
    let id = id.into();
    let provider = id.clone();
    ScriptedProvider::new(id, move |request, _| respond(&provider, request))
}

/// Reply to a request built by [`crate::prompts::StageTask`].
pub fn respond(provider: &str, request: &ModelRequest) -> Result<String, CallError> {
    let Some((stage, input)) = read_request(request) else {
        return Err(CallError::Rejected {
            provider: provider.to_string(),
            status: None,
            message: "dry run cannot read request".into(),
        });
    };
    let items = input["items"].as_array().cloned().unwrap_or_default();
    let reply = match stage.as_str() {
        stages::DISCOVER => discover(&input),
        stages::REFINE_BOUNDARIES => json!({
            "items": items.iter().map(|i| json!({
                "item_id": i["item_id"],
                "start": i["start"],
                "end": i["end"],
            })).collect::<Vec<_>>()
        }),
        stages::RESTRUCTURE => json!({
            "items": items.iter().map(|i| {
                let n = i["segments"].as_array().map(|s| s.len()).unwrap_or(0);
                json!({"item_id": i["item_id"], "keep": (0..n).collect::<Vec<_>>()})
            }).collect::<Vec<_>>()
        }),
        stages::SELECT_HOOK => json!({
            "items": items.iter().map(|i| json!({"item_id": i["item_id"], "hook": 0})).collect::<Vec<_>>()
        }),
        stages::COMPLETENESS => score_all(&items, 80.0),
        _ => score_all(&items, 75.0),
    };
    Ok(reply.to_string())
}

fn score_all(items: &[Value], score: f64) -> Value {
    json!({
        "items": items.iter().map(|i| json!({"item_id": i["item_id"], "score": score})).collect::<Vec<_>>()
    })
}

/// Consecutive segments grouped into clips of at most a minute.
fn discover(input: &Value) -> Value {
    let segments = input["segments"].as_array().cloned().unwrap_or_default();
    let mut candidates = Vec::new();
    let mut current: Option<(f64, f64, usize)> = None;
    for seg in &segments {
        let (Some(start), Some(end)) = (seg["start"].as_f64(), seg["end"].as_f64()) else {
            continue;
        };
        let words = seg["text"]
            .as_str()
            .map(|t| t.split_whitespace().count())
            .unwrap_or(0);
        current = match current {
            Some((s, _, w)) if end - s <= DRY_RUN_CLIP_SECS => Some((s, end, w + words)),
            Some((s, e, w)) => {
                candidates.push(candidate(s, e, w));
                Some((start, end, words))
            }
            None => Some((start, end, words)),
        };
    }
    if let Some((s, e, w)) = current {
        candidates.push(candidate(s, e, w));
    }
    json!({ "candidates": candidates })
}

fn candidate(start: f64, end: f64, words: usize) -> Value {
    json!({
        "start": start,
        "end": end,
        "potential": 5.0 + (words % 5) as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::StageTask;
    use clipsmith_consensus::ConsensusTask;
    use clipsmith_core::{PrinciplesSnapshot, TranscriptSegment};

    #[test]
    fn test_discovery_groups_into_minute_clips() {
        let segments: Vec<TranscriptSegment> = (0..5)
            .map(|i| TranscriptSegment {
                start: i as f64 * 30.0,
                end: (i + 1) as f64 * 30.0,
                text: "one two three".into(),
            })
            .collect();
        let window: Vec<(usize, &TranscriptSegment)> = segments.iter().enumerate().collect();
        let task = StageTask::discovery("discover", 1, &window, &PrinciplesSnapshot::empty());
        let reply: Value = serde_json::from_str(&respond("dry", &task.request()).unwrap()).unwrap();
        let candidates = reply["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0]["start"], 0.0);
        assert_eq!(candidates[0]["end"], 60.0);
        assert_eq!(candidates[2]["end"], 150.0);
        task.schema().validate(&reply).unwrap();
    }

    #[test]
    fn test_unreadable_request_is_rejected() {
        let err = respond("dry", &ModelRequest::new("hello")).unwrap_err();
        assert!(!err.is_transient());
    }
}

//! Request builders and reply parsers for the model-backed stages.
//!
//! Every request carries its stage name on the first line and a single-line
//! JSON input between `INPUT:` and `END INPUT`, so replies can be produced
//! offline by [`crate::dry_run`] and by test providers.

use serde::Deserialize;
use serde_json::{json, Value};

use clipsmith_consensus::{
    BoundaryVote, ConsensusTask, ItemChoice, ItemKeep, ItemScore, ProposedSpan, StagePayload,
};
use clipsmith_core::{CandidateItem, ItemId, PrinciplesSnapshot, Transcript, TranscriptSegment};
use clipsmith_gateway::{ModelRequest, ResponseSchema};

const SYSTEM: &str = "You are an editor cutting short clips from long-form talks. \
Judge only from the transcript you are given.";

const INPUT_START: &str = "INPUT:\n";
const INPUT_END: &str = "\nEND INPUT";

/// Principles entries quoted into a prompt.
const PRINCIPLES_IN_PROMPT: usize = 20;

/// Seconds of surrounding transcript shown when refining boundaries.
const BOUNDARY_CONTEXT_SECS: f64 = 30.0;

type Parser = fn(&Value) -> Result<StagePayload, String>;

/// One model-backed decision, ready for the consensus engine.
pub struct StageTask {
    stage: String,
    version: u32,
    input: Value,
    principles_digest: String,
    prompt: String,
    schema: ResponseSchema,
    parser: Parser,
}

impl StageTask {
    fn build(
        stage: &str,
        version: u32,
        instructions: &str,
        input: Value,
        principles: &PrinciplesSnapshot,
        schema: Value,
        parser: Parser,
    ) -> Self {
        let mut prompt = format!("Task: {}\n{}\n", stage, instructions);
        if !principles.is_empty() {
            prompt.push_str("\nEditing principles learned so far:\n");
            prompt.push_str(&principles.prompt_context(PRINCIPLES_IN_PROMPT));
            prompt.push('\n');
        }
        prompt.push('\n');
        prompt.push_str(INPUT_START);
        prompt.push_str(&input.to_string());
        prompt.push_str(INPUT_END);
        Self {
            stage: stage.to_string(),
            version,
            input,
            principles_digest: principles.digest().to_string(),
            prompt,
            schema: ResponseSchema::new(schema),
            parser,
        }
    }

    /// Propose clip-worthy spans inside one transcript window.
    pub fn discovery(
        stage: &str,
        version: u32,
        window: &[(usize, &TranscriptSegment)],
        principles: &PrinciplesSnapshot,
    ) -> Self {
        let input = json!({
            "segments": window.iter().map(|(index, s)| segment_json(*index, s)).collect::<Vec<_>>(),
        });
        Self::build(
            stage,
            version,
            "Find every passage that would work as a stand-alone short clip. \
             Give start and end in seconds and a potential from 0 to 10.",
            input,
            principles,
            json!({
                "type": "object",
                "required": ["candidates"],
                "properties": {
                    "candidates": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["start", "end"],
                            "properties": {
                                "start": {"type": "number", "minimum": 0},
                                "end": {"type": "number", "minimum": 0},
                                "potential": {"type": "number", "minimum": 0, "maximum": 10},
                                "title": {"type": "string"}
                            }
                        }
                    }
                }
            }),
            parse_discovery,
        )
    }

    /// Propose exact start/end times per item.
    pub fn boundaries(
        stage: &str,
        version: u32,
        items: &[CandidateItem],
        transcript: &Transcript,
        principles: &PrinciplesSnapshot,
    ) -> Self {
        let items_json: Vec<Value> = items
            .iter()
            .map(|item| {
                let span = item.span();
                let context: Vec<Value> = transcript
                    .segments
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| {
                        s.end >= span.start() - BOUNDARY_CONTEXT_SECS
                            && s.start <= span.end() + BOUNDARY_CONTEXT_SECS
                    })
                    .map(|(index, s)| segment_json(index, s))
                    .collect();
                json!({
                    "item_id": item.id(),
                    "start": span.start(),
                    "end": span.end(),
                    "context": context,
                })
            })
            .collect();
        Self::build(
            stage,
            version,
            "For each item, choose start and end times so the clip begins and ends \
             on sentence boundaries. You may move either edge into the context.",
            json!({ "items": items_json }),
            principles,
            json!({
                "type": "object",
                "required": ["items"],
                "properties": {
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["item_id", "start", "end"],
                            "properties": {
                                "item_id": {"type": "string"},
                                "start": {"type": "number", "minimum": 0},
                                "end": {"type": "number", "minimum": 0}
                            }
                        }
                    }
                }
            }),
            parse_boundaries,
        )
    }

    /// Pick which sub-segments to keep.
    pub fn restructure(
        stage: &str,
        version: u32,
        items: &[CandidateItem],
        principles: &PrinciplesSnapshot,
    ) -> Self {
        Self::build(
            stage,
            version,
            "For each item, list the indices of the segments to keep so the clip \
             stays coherent without filler or repetition.",
            json!({ "items": items.iter().map(item_json).collect::<Vec<_>>() }),
            principles,
            json!({
                "type": "object",
                "required": ["items"],
                "properties": {
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["item_id", "keep"],
                            "properties": {
                                "item_id": {"type": "string"},
                                "keep": {"type": "array", "items": {"type": "integer", "minimum": 0}}
                            }
                        }
                    }
                }
            }),
            parse_keep,
        )
    }

    /// Pick the segment that opens each clip.
    pub fn hooks(
        stage: &str,
        version: u32,
        items: &[CandidateItem],
        principles: &PrinciplesSnapshot,
    ) -> Self {
        Self::build(
            stage,
            version,
            "For each item, give the index of the segment that makes the strongest \
             opening line. Different items must not share a hook.",
            json!({ "items": items.iter().map(item_json).collect::<Vec<_>>() }),
            principles,
            json!({
                "type": "object",
                "required": ["items"],
                "properties": {
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["item_id", "hook"],
                            "properties": {
                                "item_id": {"type": "string"},
                                "hook": {"type": "integer", "minimum": 0}
                            }
                        }
                    }
                }
            }),
            parse_hooks,
        )
    }

    /// Score each item from 0 to 100 against `instructions`.
    pub fn scores(
        stage: &str,
        version: u32,
        instructions: &str,
        items: &[CandidateItem],
        principles: &PrinciplesSnapshot,
    ) -> Self {
        Self::build(
            stage,
            version,
            instructions,
            json!({ "items": items.iter().map(item_json).collect::<Vec<_>>() }),
            principles,
            json!({
                "type": "object",
                "required": ["items"],
                "properties": {
                    "items": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["item_id", "score"],
                            "properties": {
                                "item_id": {"type": "string"},
                                "score": {"type": "number", "minimum": 0, "maximum": 100}
                            }
                        }
                    }
                }
            }),
            parse_scores,
        )
    }
}

impl ConsensusTask for StageTask {
    fn stage(&self) -> &str {
        &self.stage
    }

    fn stage_version(&self) -> u32 {
        self.version
    }

    fn canonical_input(&self) -> Value {
        json!({
            "input": self.input,
            "principles": self.principles_digest,
        })
    }

    fn request(&self) -> ModelRequest {
        ModelRequest::new(self.prompt.clone()).with_system(SYSTEM)
    }

    fn schema(&self) -> ResponseSchema {
        self.schema.clone()
    }

    fn parse(&self, value: &Value) -> Result<StagePayload, String> {
        (self.parser)(value)
    }
}

/// Stage name and input JSON of a request built here.
pub fn read_request(request: &ModelRequest) -> Option<(String, Value)> {
    let prompt = &request.prompt;
    let stage = prompt.lines().next()?.strip_prefix("Task: ")?.trim().to_string();
    let start = prompt.find(INPUT_START)? + INPUT_START.len();
    let end = start + prompt[start..].find(INPUT_END)?;
    let input = serde_json::from_str(&prompt[start..end]).ok()?;
    Some((stage, input))
}

fn segment_json(index: usize, segment: &TranscriptSegment) -> Value {
    json!({
        "index": index,
        "start": segment.start,
        "end": segment.end,
        "text": segment.text,
    })
}

fn item_json(item: &CandidateItem) -> Value {
    json!({
        "item_id": item.id(),
        "start": item.span().start(),
        "end": item.span().end(),
        "segments": item.segments().iter().enumerate().map(|(i, s)| json!({
            "index": i,
            "start": s.span.start(),
            "end": s.span.end(),
            "role": s.role,
            "text": s.text,
        })).collect::<Vec<_>>(),
    })
}

fn field<T: serde::de::DeserializeOwned>(value: &Value, name: &str) -> Result<T, String> {
    let raw = value
        .get(name)
        .cloned()
        .ok_or_else(|| format!("missing '{}'", name))?;
    serde_json::from_value(raw).map_err(|e| format!("bad '{}': {}", name, e))
}

fn parse_discovery(value: &Value) -> Result<StagePayload, String> {
    let mut candidates: Vec<ProposedSpan> = field(value, "candidates")?;
    for c in &mut candidates {
        c.support = 1;
    }
    Ok(StagePayload::Discovery { candidates })
}

fn parse_boundaries(value: &Value) -> Result<StagePayload, String> {
    let items: Vec<BoundaryVote> = field(value, "items")?;
    Ok(StagePayload::Boundaries { items })
}

fn parse_keep(value: &Value) -> Result<StagePayload, String> {
    let items: Vec<ItemKeep> = field(value, "items")?;
    Ok(StagePayload::Restructure { items })
}

fn parse_hooks(value: &Value) -> Result<StagePayload, String> {
    #[derive(Deserialize)]
    struct Row {
        item_id: ItemId,
        hook: usize,
    }
    let rows: Vec<Row> = field(value, "items")?;
    Ok(StagePayload::Choices {
        items: rows
            .into_iter()
            .map(|r| ItemChoice {
                item_id: r.item_id,
                choice: r.hook.to_string(),
            })
            .collect(),
    })
}

fn parse_scores(value: &Value) -> Result<StagePayload, String> {
    let items: Vec<ItemScore> = field(value, "items")?;
    Ok(StagePayload::Scores { items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipsmith_core::{Span, StageId};

    fn item() -> CandidateItem {
        let t = Transcript::new(
            "talk",
            vec![TranscriptSegment {
                start: 0.0,
                end: 5.0,
                text: "Hello there.".into(),
            }],
        );
        let span = Span::new(0.0, 5.0).unwrap();
        CandidateItem::new(&StageId::new("discover"), "talk", span, t.slice(&span)).unwrap()
    }

    #[test]
    fn test_request_round_trips_stage_and_input() {
        let items = vec![item()];
        let task = StageTask::scores("gate", 1, "Score it.", &items, &PrinciplesSnapshot::empty());
        let (stage, input) = read_request(&task.request()).unwrap();
        assert_eq!(stage, "gate");
        assert_eq!(input["items"][0]["item_id"], json!(items[0].id()));
        assert_eq!(input["items"][0]["segments"][0]["text"], "Hello there.");
    }

    #[test]
    fn test_read_request_survives_schema_suffix() {
        let items = vec![item()];
        let task = StageTask::hooks("select_hook", 1, &items, &PrinciplesSnapshot::empty());
        let mut request = task.request();
        request.prompt = format!("{}\n\n{}", request.prompt, task.schema().instruction());
        assert_eq!(read_request(&request).unwrap().0, "select_hook");
    }

    #[test]
    fn test_principles_change_canonical_input() {
        let items = vec![item()];
        let plain = StageTask::scores("gate", 1, "Score it.", &items, &PrinciplesSnapshot::empty());
        let mut entries = std::collections::BTreeMap::new();
        entries.insert("pacing".to_string(), json!("cut long pauses"));
        let learned = PrinciplesSnapshot::from_entries(entries);
        let informed = StageTask::scores("gate", 1, "Score it.", &items, &learned);
        assert_ne!(plain.canonical_input(), informed.canonical_input());
        assert!(informed.request().prompt.contains("cut long pauses"));
    }

    #[test]
    fn test_hook_replies_become_choices() {
        let payload = parse_hooks(&json!({"items": [{"item_id": "a", "hook": 2}]})).unwrap();
        assert_eq!(
            payload,
            StagePayload::Choices {
                items: vec![ItemChoice {
                    item_id: ItemId::from("a"),
                    choice: "2".into()
                }]
            }
        );
    }

    #[test]
    fn test_discovery_ignores_claimed_support() {
        let payload = parse_discovery(&json!({
            "candidates": [{"start": 1.0, "end": 9.0, "potential": 7, "support": 5}]
        }))
        .unwrap();
        match payload {
            StagePayload::Discovery { candidates } => assert_eq!(candidates[0].support, 1),
            other => panic!("unexpected {:?}", other),
        }
    }
}

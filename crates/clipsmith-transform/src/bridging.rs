//! Open-loop bridging.
//!
//! An item whose trailing segment poses a question is extended to include
//! the nearby segment that answers it, when that answer starts within
//! `max_gap` seconds of the item's end.

use serde::{Deserialize, Serialize};
use tracing::debug;

use clipsmith_core::{
    CandidateItem, Result, SegmentRole, Span, StageId, SubSegment, Transcript, TIME_EPSILON,
};

use crate::lexicon::{is_answer, is_open_loop};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Largest silence between the item end and a payoff segment start.
    pub max_gap: f64,
    /// Segments examined after the item end.
    pub max_segments: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            max_gap: 5.0,
            max_segments: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BridgeOutcome {
    NoOpenLoop,
    SpanLocked,
    NoPayoff,
    /// The payoff would itself end on an open loop.
    PayoffStillOpen,
    Bridged { gap: f64, added: usize, new_end: f64 },
}

/// Proposed extension: new outer span and the full segment list.
#[derive(Debug, Clone, PartialEq)]
pub struct Bridge {
    pub span: Span,
    pub segments: Vec<SubSegment>,
    pub gap: f64,
    pub added: usize,
}

pub struct OpenLoopBridger {
    settings: BridgeSettings,
}

impl OpenLoopBridger {
    pub fn new(settings: BridgeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Pure check: what bridging would do to `item`, without touching it.
    pub fn plan(
        &self,
        item: &CandidateItem,
        transcript: &Transcript,
    ) -> std::result::Result<Bridge, BridgeOutcome> {
        if !is_open_loop(item.trailing_text()) {
            return Err(BridgeOutcome::NoOpenLoop);
        }
        if item.is_span_locked() {
            return Err(BridgeOutcome::SpanLocked);
        }

        let end = item.span().end();
        let mut payoff = Vec::new();
        let mut first_gap = None;
        let mut found = false;
        for (index, seg) in transcript.segments_from(end).take(self.settings.max_segments) {
            let gap = seg.start - end;
            if gap > self.settings.max_gap + TIME_EPSILON {
                break;
            }
            first_gap.get_or_insert(gap.max(0.0));
            payoff.push((index, seg));
            if is_answer(&seg.text) {
                found = true;
                break;
            }
        }
        if !found {
            return Err(BridgeOutcome::NoPayoff);
        }
        let Some(&(_, last)) = payoff.last() else {
            return Err(BridgeOutcome::NoPayoff);
        };
        if is_open_loop(&last.text) {
            return Err(BridgeOutcome::PayoffStillOpen);
        }

        let mut segments = item.segments().to_vec();
        for (index, seg) in &payoff {
            let span = Span::new(seg.start, seg.end).map_err(|_| BridgeOutcome::NoPayoff)?;
            segments.push(SubSegment {
                span,
                text: seg.text.clone(),
                role: SegmentRole::Payoff,
                source_index: Some(*index),
            });
        }
        let span = Span::new(item.span().start(), last.end.max(end))
            .map_err(|_| BridgeOutcome::NoPayoff)?;
        Ok(Bridge {
            span,
            segments,
            gap: first_gap.unwrap_or(0.0),
            added: payoff.len(),
        })
    }

    /// Apply bridging to `item`. Running it again on the result is a no-op.
    pub fn apply(
        &self,
        stage: &StageId,
        item: &mut CandidateItem,
        transcript: &Transcript,
    ) -> Result<BridgeOutcome> {
        match self.plan(item, transcript) {
            Ok(bridge) => {
                item.set_span(stage, bridge.span, bridge.segments)?;
                debug!(
                    item_id = %item.id(),
                    "Bridged open loop across {:.2}s gap ({} segments)",
                    bridge.gap,
                    bridge.added
                );
                Ok(BridgeOutcome::Bridged {
                    gap: bridge.gap,
                    added: bridge.added,
                    new_end: bridge.span.end(),
                })
            }
            Err(outcome) => Ok(outcome),
        }
    }
}

impl Default for OpenLoopBridger {
    fn default() -> Self {
        Self::new(BridgeSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipsmith_core::TranscriptSegment;

    fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end,
            text: text.into(),
        }
    }

    fn stage() -> StageId {
        StageId::new("bridge_open_loops")
    }

    fn transcript() -> Transcript {
        Transcript::new(
            "talk",
            vec![
                seg(0.0, 6.0, "Früher hat das allen Spaß gemacht."),
                seg(6.0, 10.32, "Was ist hier passiert?"),
                seg(12.0, 17.5, "Die Freude am Tun ist ersetzt worden."),
                seg(17.5, 22.0, "Und zwar durch Kennzahlen."),
            ],
        )
    }

    fn item_over(t: &Transcript, start: f64, end: f64) -> CandidateItem {
        let span = Span::new(start, end).unwrap();
        CandidateItem::new(&StageId::new("discover"), "talk", span, t.slice(&span)).unwrap()
    }

    #[test]
    fn test_bridges_answer_after_short_gap() {
        let t = transcript();
        let mut item = item_over(&t, 0.0, 10.32);
        let outcome = OpenLoopBridger::default()
            .apply(&stage(), &mut item, &t)
            .unwrap();
        match outcome {
            BridgeOutcome::Bridged { gap, added, new_end } => {
                assert!((gap - 1.68).abs() < 1e-9);
                assert_eq!(added, 1);
                assert_eq!(new_end, 17.5);
            }
            other => panic!("expected bridge, got {:?}", other),
        }
        assert_eq!(item.span().end(), 17.5);
        assert!(!is_open_loop(item.trailing_text()));
        assert_eq!(item.segments().last().unwrap().role, SegmentRole::Payoff);
        item.check_invariants().unwrap();
    }

    #[test]
    fn test_bridging_twice_is_a_no_op() {
        let t = transcript();
        let bridger = OpenLoopBridger::default();
        let mut item = item_over(&t, 0.0, 10.32);
        bridger.apply(&stage(), &mut item, &t).unwrap();
        let once = item.span();
        let segments = item.segments().len();
        let outcome = bridger.apply(&stage(), &mut item, &t).unwrap();
        assert_eq!(outcome, BridgeOutcome::NoOpenLoop);
        assert_eq!(item.span(), once);
        assert_eq!(item.segments().len(), segments);
    }

    #[test]
    fn test_gap_ceiling() {
        let t = transcript();
        let bridger = OpenLoopBridger::new(BridgeSettings {
            max_gap: 1.0,
            max_segments: 3,
        });
        let mut item = item_over(&t, 0.0, 10.32);
        let outcome = bridger.apply(&stage(), &mut item, &t).unwrap();
        assert_eq!(outcome, BridgeOutcome::NoPayoff);
        assert_eq!(item.span().end(), 10.32);
    }

    #[test]
    fn test_no_open_loop_leaves_item_alone() {
        let t = transcript();
        let mut item = item_over(&t, 0.0, 6.0);
        let before = item.provenance().len();
        let outcome = OpenLoopBridger::default()
            .apply(&stage(), &mut item, &t)
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::NoOpenLoop);
        assert_eq!(item.provenance().len(), before);
    }

    #[test]
    fn test_locked_span_is_not_extended() {
        let t = transcript();
        let mut item = item_over(&t, 0.0, 10.32);
        item.lock_span(&StageId::new("completeness"));
        let outcome = OpenLoopBridger::default()
            .apply(&stage(), &mut item, &t)
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::SpanLocked);
    }

    #[test]
    fn test_payoff_that_asks_again_is_refused() {
        let t = Transcript::new(
            "talk",
            vec![
                seg(0.0, 5.0, "Warum?"),
                seg(6.0, 9.0, "Das ist doch die Frage, oder?"),
            ],
        );
        let mut item = item_over(&t, 0.0, 5.0);
        let outcome = OpenLoopBridger::default()
            .apply(&stage(), &mut item, &t)
            .unwrap();
        assert_eq!(outcome, BridgeOutcome::PayoffStillOpen);
        assert_eq!(item.span().end(), 5.0);
    }

    #[test]
    fn test_walks_up_to_max_segments_for_answer() {
        let t = Transcript::new(
            "talk",
            vec![
                seg(0.0, 4.0, "Why did the build fail?"),
                seg(4.5, 6.0, "Let me show you."),
                seg(6.0, 9.0, "It turns out the cache was stale."),
            ],
        );
        let mut item = item_over(&t, 0.0, 4.0);
        let outcome = OpenLoopBridger::default()
            .apply(&stage(), &mut item, &t)
            .unwrap();
        assert!(matches!(outcome, BridgeOutcome::Bridged { added: 2, .. }));
        assert_eq!(item.span().end(), 9.0);
    }
}

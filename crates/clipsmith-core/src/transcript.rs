//! Source timeline: spans and time-stamped transcript segments.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::item::{SegmentRole, SubSegment};

/// Tolerance for floating-point boundary comparisons (seconds).
pub const TIME_EPSILON: f64 = 1e-6;

/// A half-open time range `[start, end)` on the source timeline, in seconds.
///
/// Always satisfies `end > start`; construction fails otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSpan")]
pub struct Span {
    start: f64,
    end: f64,
}

#[derive(Deserialize)]
struct RawSpan {
    start: f64,
    end: f64,
}

impl TryFrom<RawSpan> for Span {
    type Error = Error;

    fn try_from(raw: RawSpan) -> Result<Self> {
        Span::new(raw.start, raw.end)
    }
}

impl Span {
    pub fn new(start: f64, end: f64) -> Result<Self> {
        if !start.is_finite() || !end.is_finite() {
            return Err(Error::InvariantViolation(format!(
                "non-finite span {}..{}",
                start, end
            )));
        }
        if end - start <= TIME_EPSILON {
            return Err(Error::InvariantViolation(format!(
                "empty span {:.3}..{:.3}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Length of the shared part of two spans (0 when disjoint).
    pub fn intersection(&self, other: &Span) -> f64 {
        (self.end.min(other.end) - self.start.max(other.start)).max(0.0)
    }

    /// Intersection relative to the shorter of the two spans, in `[0, 1]`.
    pub fn overlap_fraction(&self, other: &Span) -> f64 {
        let shorter = self.duration().min(other.duration());
        if shorter <= 0.0 {
            return 0.0;
        }
        (self.intersection(other) / shorter).clamp(0.0, 1.0)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.intersection(other) > TIME_EPSILON
    }

    pub fn contains(&self, other: &Span) -> bool {
        other.start >= self.start - TIME_EPSILON && other.end <= self.end + TIME_EPSILON
    }

    /// Smallest span covering both.
    pub fn cover(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}s-{:.2}s", self.start, self.end)
    }
}

/// One time-stamped text segment as produced by the upstream transcriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Ordered transcript of one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub source_id: String,
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Build a transcript: sort by start, then make the timeline
    /// non-overlapping by clamping each segment's start to the previous
    /// segment's end. Segments left empty (zero-length, or nested inside
    /// their predecessor) are dropped.
    pub fn new(source_id: impl Into<String>, mut segments: Vec<TranscriptSegment>) -> Self {
        segments.retain(|s| s.start.is_finite() && s.end.is_finite());
        segments.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut timeline: Vec<TranscriptSegment> = Vec::with_capacity(segments.len());
        for mut seg in segments {
            if let Some(prev) = timeline.last() {
                seg.start = seg.start.max(prev.end);
            }
            if seg.end - seg.start > TIME_EPSILON {
                timeline.push(seg);
            }
        }
        Self {
            source_id: source_id.into(),
            segments: timeline,
        }
    }

    /// Load a transcript JSON file (`{"source_id": .., "segments": [..]}`).
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let raw: Transcript = serde_json::from_str(&data)?;
        Ok(Self::new(raw.source_id, raw.segments))
    }

    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.end).fold(0.0, f64::max)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Transcript segments overlapping `span`, clipped to it, as content sub-segments.
    pub fn slice(&self, span: &Span) -> Vec<SubSegment> {
        self.segments
            .iter()
            .enumerate()
            .filter_map(|(index, seg)| {
                let start = seg.start.max(span.start());
                let end = seg.end.min(span.end());
                let clipped = Span::new(start, end).ok()?;
                Some(SubSegment {
                    span: clipped,
                    text: seg.text.clone(),
                    role: SegmentRole::Content,
                    source_index: Some(index),
                })
            })
            .collect()
    }

    /// Segments starting at or after `t`, in timeline order, with their indices.
    pub fn segments_from(&self, t: f64) -> impl Iterator<Item = (usize, &TranscriptSegment)> {
        self.segments
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.start >= t - TIME_EPSILON)
    }

    /// Split the timeline into consecutive windows of roughly `window_secs`,
    /// never cutting through a segment.
    pub fn windows(&self, window_secs: f64) -> Vec<&[TranscriptSegment]> {
        let mut windows = Vec::new();
        let mut begin = 0;
        while begin < self.segments.len() {
            let window_start = self.segments[begin].start;
            let mut end = begin + 1;
            while end < self.segments.len() && self.segments[end].end - window_start <= window_secs
            {
                end += 1;
            }
            windows.push(&self.segments[begin..end]);
            begin = end;
        }
        windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end,
            text: text.into(),
        }
    }

    #[test]
    fn test_span_rejects_empty_and_reversed() {
        assert!(Span::new(5.0, 5.0).is_err());
        assert!(Span::new(6.0, 5.0).is_err());
        assert!(Span::new(f64::NAN, 5.0).is_err());
        assert!(Span::new(0.0, 0.5).is_ok());
    }

    #[test]
    fn test_span_deserialize_validates() {
        let ok: std::result::Result<Span, _> = serde_json::from_str(r#"{"start":1.0,"end":2.0}"#);
        assert!(ok.is_ok());
        let bad: std::result::Result<Span, _> = serde_json::from_str(r#"{"start":3.0,"end":2.0}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_overlap_fraction_uses_shorter_span() {
        let a = Span::new(0.0, 10.0).unwrap();
        let b = Span::new(8.0, 12.0).unwrap();
        assert!((a.overlap_fraction(&b) - 0.5).abs() < 1e-9);
        let c = Span::new(20.0, 30.0).unwrap();
        assert_eq!(a.overlap_fraction(&c), 0.0);
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_slice_clips_to_span() {
        let t = Transcript::new(
            "src",
            vec![seg(0.0, 4.0, "one"), seg(4.0, 8.0, "two"), seg(8.0, 12.0, "three")],
        );
        let parts = t.slice(&Span::new(2.0, 9.0).unwrap());
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].span.start(), 2.0);
        assert_eq!(parts[2].span.end(), 9.0);
        assert_eq!(parts[1].source_index, Some(1));
    }

    #[test]
    fn test_windows_cover_all_segments() {
        let segments: Vec<_> = (0..10)
            .map(|i| seg(i as f64 * 10.0, i as f64 * 10.0 + 10.0, "x"))
            .collect();
        let t = Transcript::new("src", segments);
        let windows = t.windows(30.0);
        assert_eq!(windows.iter().map(|w| w.len()).sum::<usize>(), 10);
        assert_eq!(windows[0].len(), 3);
    }

    #[test]
    fn test_new_sorts_and_drops_empty() {
        let t = Transcript::new("src", vec![seg(5.0, 6.0, "b"), seg(1.0, 1.0, ""), seg(0.0, 1.0, "a")]);
        assert_eq!(t.segments.len(), 2);
        assert_eq!(t.segments[0].text, "a");
    }

    #[test]
    fn test_new_removes_overlap_between_neighbours() {
        let t = Transcript::new(
            "asr",
            vec![
                seg(0.0, 4.1, "one"),
                seg(4.0, 8.1, "two"),
                seg(8.0, 12.0, "three"),
                seg(9.0, 11.0, "nested"),
            ],
        );
        assert_eq!(t.segments.len(), 3);
        assert_eq!(t.segments[1].start, 4.1);
        assert_eq!(t.segments[2].start, 8.1);
        assert_eq!(t.duration(), 12.0);

        let parts = t.slice(&Span::new(1.0, 11.0).unwrap());
        assert_eq!(parts.len(), 3);
        for pair in parts.windows(2) {
            assert!(pair[0].span.end() <= pair[1].span.start() + TIME_EPSILON);
        }
    }

    #[test]
    fn test_duration_is_latest_end() {
        let t = Transcript {
            source_id: "raw".into(),
            segments: vec![seg(0.0, 20.0, "long"), seg(5.0, 6.0, "inner")],
        };
        assert_eq!(t.duration(), 20.0);
    }
}

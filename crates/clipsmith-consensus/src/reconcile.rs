//! Reconciliation strategies.
//!
//! Votes arrive in provider priority order. Each strategy reconciles per
//! item id and only over the votes that mention that item.

use std::collections::BTreeMap;

use clipsmith_core::{Error, ItemId, Result, Span};

use crate::types::{
    BoundaryVote, ItemChoice, ItemKeep, ItemScore, ProposedSpan, StagePayload,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub payload: StagePayload,
    pub disagreement: f64,
    pub item_disagreement: BTreeMap<ItemId, f64>,
}

impl Reconciled {
    fn from_items(payload: StagePayload, item_disagreement: BTreeMap<ItemId, f64>) -> Self {
        let disagreement = if item_disagreement.is_empty() {
            0.0
        } else {
            item_disagreement.values().sum::<f64>() / item_disagreement.len() as f64
        };
        Self {
            payload,
            disagreement,
            item_disagreement,
        }
    }
}

/// Turns successful votes (in priority order) into one payload.
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    fn reconcile(&self, votes: &[&StagePayload]) -> Result<Reconciled>;
}

fn mismatch(expected: &str, got: &StagePayload) -> Error {
    Error::Internal(format!(
        "reconciler expected {} payloads, got {}",
        expected,
        got.kind()
    ))
}

/// Group per-item entries across votes, keeping first-seen item order.
fn group_by_item<'a, T>(
    per_vote: impl Iterator<Item = &'a [T]>,
    id: impl Fn(&T) -> &ItemId,
) -> Vec<(ItemId, Vec<&'a T>)>
where
    T: 'a,
{
    let mut order: Vec<ItemId> = Vec::new();
    let mut groups: BTreeMap<ItemId, Vec<&'a T>> = BTreeMap::new();
    for entries in per_vote {
        // One entry per item per vote; later duplicates from the same vote are ignored.
        let mut seen: Vec<&ItemId> = Vec::new();
        for entry in entries {
            let key = id(entry);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key.clone());
                    Vec::new()
                })
                .push(entry);
        }
    }
    order
        .into_iter()
        .filter_map(|k| groups.remove(&k).map(|g| (k, g)))
        .collect()
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Mean after dropping `k` values from each end, where `k = floor(n * trim)`,
/// raised to 1 when `trim > 0` and there are at least 3 values.
pub fn trimmed_mean(values: &[f64], trim: f64) -> f64 {
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut k = (n as f64 * trim).floor() as usize;
    if trim > 0.0 && n >= 3 {
        k = k.max(1);
    }
    while k > 0 && 2 * k >= n {
        k -= 1;
    }
    mean(&sorted[k..n - k])
}

/// Categorical decisions: most votes wins, ties go to the label of the
/// highest-priority provider among the tied labels.
pub struct MajorityVote;

impl Reconciler for MajorityVote {
    fn name(&self) -> &'static str {
        "majority"
    }

    fn reconcile(&self, votes: &[&StagePayload]) -> Result<Reconciled> {
        let mut per_vote: Vec<&[ItemChoice]> = Vec::with_capacity(votes.len());
        for vote in votes {
            match vote {
                StagePayload::Choices { items } => per_vote.push(items),
                other => return Err(mismatch("choices", other)),
            }
        }

        let mut items = Vec::new();
        let mut disagreement = BTreeMap::new();
        for (item_id, choices) in group_by_item(per_vote.into_iter(), |c| &c.item_id) {
            let mut counts: Vec<(&str, usize)> = Vec::new();
            for c in &choices {
                match counts.iter_mut().find(|(label, _)| *label == c.choice) {
                    Some((_, n)) => *n += 1,
                    None => counts.push((c.choice.as_str(), 1)),
                }
            }
            let best = counts.iter().map(|(_, n)| *n).max().unwrap_or(0);
            // `counts` is in first-vote order, i.e. provider priority order.
            let Some((winner, _)) = counts.iter().find(|(_, n)| *n == best) else {
                continue;
            };
            disagreement.insert(
                item_id.clone(),
                1.0 - best as f64 / choices.len() as f64,
            );
            items.push(ItemChoice {
                item_id,
                choice: winner.to_string(),
            });
        }
        Ok(Reconciled::from_items(
            StagePayload::Choices { items },
            disagreement,
        ))
    }
}

/// Numeric decisions: trimmed mean, standard deviation as disagreement.
/// Handles per-item scores and per-item boundary pairs.
pub struct RobustMean {
    pub trim: f64,
}

impl Reconciler for RobustMean {
    fn name(&self) -> &'static str {
        "robust_mean"
    }

    fn reconcile(&self, votes: &[&StagePayload]) -> Result<Reconciled> {
        match votes.first() {
            Some(StagePayload::Scores { .. }) => self.scores(votes),
            Some(StagePayload::Boundaries { .. }) => self.boundaries(votes),
            Some(other) => Err(mismatch("scores or boundaries", other)),
            None => Err(Error::Internal("no votes to reconcile".into())),
        }
    }
}

impl RobustMean {
    fn scores(&self, votes: &[&StagePayload]) -> Result<Reconciled> {
        let mut per_vote: Vec<&[ItemScore]> = Vec::with_capacity(votes.len());
        for vote in votes {
            match vote {
                StagePayload::Scores { items } => per_vote.push(items),
                other => return Err(mismatch("scores", other)),
            }
        }
        let mut items = Vec::new();
        let mut disagreement = BTreeMap::new();
        for (item_id, entries) in group_by_item(per_vote.into_iter(), |s| &s.item_id) {
            let values: Vec<f64> = entries
                .iter()
                .map(|s| s.score)
                .filter(|v| v.is_finite())
                .collect();
            if values.is_empty() {
                continue;
            }
            disagreement.insert(item_id.clone(), std_dev(&values));
            items.push(ItemScore {
                item_id,
                score: trimmed_mean(&values, self.trim),
            });
        }
        Ok(Reconciled::from_items(StagePayload::Scores { items }, disagreement))
    }

    fn boundaries(&self, votes: &[&StagePayload]) -> Result<Reconciled> {
        let mut per_vote: Vec<&[BoundaryVote]> = Vec::with_capacity(votes.len());
        for vote in votes {
            match vote {
                StagePayload::Boundaries { items } => per_vote.push(items),
                other => return Err(mismatch("boundaries", other)),
            }
        }
        let mut items = Vec::new();
        let mut disagreement = BTreeMap::new();
        for (item_id, entries) in group_by_item(per_vote.into_iter(), |b| &b.item_id) {
            let valid: Vec<&&BoundaryVote> = entries
                .iter()
                .filter(|b| b.start.is_finite() && b.end.is_finite() && b.end > b.start)
                .collect();
            if valid.is_empty() {
                continue;
            }
            let starts: Vec<f64> = valid.iter().map(|b| b.start).collect();
            let ends: Vec<f64> = valid.iter().map(|b| b.end).collect();
            let start = trimmed_mean(&starts, self.trim);
            let end = trimmed_mean(&ends, self.trim);
            if end <= start {
                continue;
            }
            disagreement.insert(
                item_id.clone(),
                (std_dev(&starts) + std_dev(&ends)) / 2.0,
            );
            items.push(BoundaryVote {
                item_id,
                start,
                end,
            });
        }
        Ok(Reconciled::from_items(
            StagePayload::Boundaries { items },
            disagreement,
        ))
    }
}

/// Discovery: union of every vote's spans, with near-duplicates merged.
///
/// Two spans are the same candidate when their intersection covers at least
/// `min_overlap` of the shorter one. Merged bounds are the cluster mean.
pub struct SpanUnion {
    pub min_overlap: f64,
}

struct Cluster {
    members: Vec<ProposedSpan>,
    start: f64,
    end: f64,
}

impl Cluster {
    fn new(span: ProposedSpan) -> Self {
        let (start, end) = (span.start, span.end);
        Self {
            members: vec![span],
            start,
            end,
        }
    }

    fn add(&mut self, span: ProposedSpan) {
        self.members.push(span);
        let n = self.members.len() as f64;
        self.start = self.members.iter().map(|m| m.start).sum::<f64>() / n;
        self.end = self.members.iter().map(|m| m.end).sum::<f64>() / n;
    }

    fn overlap(&self, span: &ProposedSpan, min_overlap: f64) -> Option<f64> {
        let a = Span::new(self.start, self.end).ok()?;
        let b = Span::new(span.start, span.end).ok()?;
        let f = a.overlap_fraction(&b);
        (f >= min_overlap && f > 0.0).then_some(f)
    }
}

impl Reconciler for SpanUnion {
    fn name(&self) -> &'static str {
        "span_union"
    }

    fn reconcile(&self, votes: &[&StagePayload]) -> Result<Reconciled> {
        let mut proposals: Vec<ProposedSpan> = Vec::new();
        for vote in votes {
            match vote {
                StagePayload::Discovery { candidates } => proposals.extend(
                    candidates
                        .iter()
                        .filter(|c| c.start.is_finite() && c.end.is_finite() && c.end > c.start)
                        .cloned(),
                ),
                other => return Err(mismatch("discovery", other)),
            }
        }
        proposals.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));

        let mut clusters: Vec<Cluster> = Vec::new();
        for span in proposals {
            let best = clusters
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.overlap(&span, self.min_overlap).map(|f| (i, f)))
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(i, _)| i);
            match best {
                Some(i) => clusters[i].add(span),
                None => clusters.push(Cluster::new(span)),
            }
        }

        let voters = votes.len().max(1) as f64;
        let candidates: Vec<ProposedSpan> = clusters
            .into_iter()
            .map(|c| {
                let n = c.members.len();
                ProposedSpan {
                    start: c.start,
                    end: c.end,
                    potential: c.members.iter().map(|m| m.potential).sum::<f64>() / n as f64,
                    title: c.members.iter().find_map(|m| m.title.clone()),
                    support: n,
                }
            })
            .collect();
        let disagreement = if candidates.is_empty() {
            0.0
        } else {
            let mean_support =
                candidates.iter().map(|c| c.support as f64).sum::<f64>() / candidates.len() as f64;
            (1.0 - mean_support / voters).max(0.0)
        };
        Ok(Reconciled {
            payload: StagePayload::Discovery { candidates },
            disagreement,
            item_disagreement: BTreeMap::new(),
        })
    }
}

/// Restructure: keep a sub-segment when at least half the votes keep it.
pub struct SegmentMajority;

impl Reconciler for SegmentMajority {
    fn name(&self) -> &'static str {
        "segment_majority"
    }

    fn reconcile(&self, votes: &[&StagePayload]) -> Result<Reconciled> {
        let mut per_vote: Vec<&[ItemKeep]> = Vec::with_capacity(votes.len());
        for vote in votes {
            match vote {
                StagePayload::Restructure { items } => per_vote.push(items),
                other => return Err(mismatch("restructure", other)),
            }
        }
        let mut items = Vec::new();
        let mut disagreement = BTreeMap::new();
        for (item_id, entries) in group_by_item(per_vote.into_iter(), |k| &k.item_id) {
            let n = entries.len();
            let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
            for entry in &entries {
                let mut seen = entry.keep.clone();
                seen.sort_unstable();
                seen.dedup();
                for index in seen {
                    *counts.entry(index).or_insert(0) += 1;
                }
            }
            let keep: Vec<usize> = counts
                .iter()
                .filter(|(_, c)| **c * 2 >= n)
                .map(|(i, _)| *i)
                .collect();
            let contested = counts.values().filter(|c| **c != n).count();
            let spread = if counts.is_empty() {
                0.0
            } else {
                contested as f64 / counts.len() as f64
            };
            disagreement.insert(item_id.clone(), spread);
            items.push(ItemKeep { item_id, keep });
        }
        Ok(Reconciled::from_items(
            StagePayload::Restructure { items },
            disagreement,
        ))
    }
}

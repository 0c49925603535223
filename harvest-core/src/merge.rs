//! Recombines the results of the sub-jobs of one trigger iteration.
//!
//! Every sub-result names a logical slot and the strategy used to fold it
//! into that slot. Two results that disagree on the strategy for a slot are
//! a hard error; nothing is merged for that iteration.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HarvestError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Lists concatenated in sub-job sequence order.
    ConcatLists,
    /// The result with the highest sequence replaces the others.
    LastWriteWins,
    /// Objects keyed by `key`; later sequences override earlier ones. Ties
    /// on sequence keep the item with the greater canonical JSON.
    UnionByKey { key: String },
    /// Deduplicated set of values.
    SetUnion,
}

impl MergeStrategy {
    /// Whether merging gives the same result regardless of input order.
    pub fn is_order_independent(&self) -> bool {
        matches!(self, MergeStrategy::UnionByKey { .. } | MergeStrategy::SetUnion)
    }

    fn describe(&self) -> String {
        match self {
            MergeStrategy::ConcatLists => "concat_lists".to_string(),
            MergeStrategy::LastWriteWins => "last_write_wins".to_string(),
            MergeStrategy::UnionByKey { key } => format!("union_by_key({key})"),
            MergeStrategy::SetUnion => "set_union".to_string(),
        }
    }
}

/// Output of one sub-job that declares how it combines with its siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeableIngestionResult {
    pub slot: String,
    pub strategy: MergeStrategy,
    /// Position of the sub-job within the iteration (page number, window
    /// index). Orders concatenation and breaks last-write ties.
    pub sequence: u64,
    #[serde(default)]
    pub partial: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedResult {
    pub slot: String,
    pub strategy: MergeStrategy,
    /// True when any contributing sub-result was partial.
    pub partial: bool,
    /// Number of sub-results folded in.
    pub sources: usize,
    pub items: Vec<Value>,
}

/// Stateless merger; see the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultMerger;

impl ResultMerger {
    pub fn new() -> Self {
        Self
    }

    /// Merges all results, grouped by slot.
    pub fn merge(
        &self,
        results: Vec<MergeableIngestionResult>,
    ) -> Result<BTreeMap<String, MergedResult>> {
        let mut slots: BTreeMap<String, Vec<MergeableIngestionResult>> = BTreeMap::new();
        for result in results {
            slots.entry(result.slot.clone()).or_default().push(result);
        }

        let mut merged = BTreeMap::new();
        for (slot, group) in slots {
            let mut iter = group.into_iter();
            let Some(first) = iter.next() else {
                continue;
            };
            let mut acc = MergedResult {
                slot: slot.clone(),
                strategy: first.strategy.clone(),
                partial: first.partial,
                sources: 1,
                items: Vec::new(),
            };
            let mut parts = vec![first];
            for next in iter {
                ensure_compatible(&slot, &acc.strategy, &next.strategy)?;
                acc.partial |= next.partial;
                acc.sources += 1;
                parts.push(next);
            }
            acc.items = fold(&slot, &acc.strategy, parts)?;
            merged.insert(slot, acc);
        }
        Ok(merged)
    }

    /// Merges two results for the same slot into one.
    pub fn merge_pair(
        &self,
        left: MergeableIngestionResult,
        right: MergeableIngestionResult,
    ) -> Result<MergeableIngestionResult> {
        if left.slot != right.slot {
            return Err(HarvestError::InvalidState(format!(
                "cannot merge slot {} into slot {}",
                right.slot, left.slot
            )));
        }
        ensure_compatible(&left.slot, &left.strategy, &right.strategy)?;

        let slot = left.slot.clone();
        let strategy = left.strategy.clone();
        let partial = left.partial || right.partial;
        let sequence = left.sequence.max(right.sequence);
        let items = fold(&slot, &strategy, vec![left, right])?;
        Ok(MergeableIngestionResult {
            slot,
            strategy,
            sequence,
            partial,
            items,
        })
    }
}

fn ensure_compatible(slot: &str, left: &MergeStrategy, right: &MergeStrategy) -> Result<()> {
    if left == right {
        Ok(())
    } else {
        Err(HarvestError::MergeConflict {
            slot: slot.to_string(),
            left: left.describe(),
            right: right.describe(),
        })
    }
}

fn fold(
    slot: &str,
    strategy: &MergeStrategy,
    mut parts: Vec<MergeableIngestionResult>,
) -> Result<Vec<Value>> {
    parts.sort_by_key(|part| part.sequence);
    match strategy {
        MergeStrategy::ConcatLists => Ok(parts.into_iter().flat_map(|part| part.items).collect()),
        MergeStrategy::LastWriteWins => {
            Ok(parts.pop().map(|part| part.items).unwrap_or_default())
        }
        MergeStrategy::UnionByKey { key } => {
            // Highest sequence wins; equal sequences fall back to the larger
            // canonical JSON so arrival order never decides.
            let mut by_key: BTreeMap<String, (u64, String, Value)> = BTreeMap::new();
            for part in parts {
                for item in part.items {
                    let id = item_key(slot, key, &item)?;
                    let canonical = serde_json::to_string(&item)?;
                    let replace = by_key.get(&id).is_none_or(|(sequence, current, _)| {
                        (part.sequence, &canonical) > (*sequence, current)
                    });
                    if replace {
                        by_key.insert(id, (part.sequence, canonical, item));
                    }
                }
            }
            Ok(by_key.into_values().map(|(_, _, item)| item).collect())
        }
        MergeStrategy::SetUnion => {
            let mut seen = BTreeSet::new();
            let mut items = Vec::new();
            for item in parts.into_iter().flat_map(|part| part.items) {
                let canonical = serde_json::to_string(&item)?;
                if seen.insert(canonical.clone()) {
                    items.push((canonical, item));
                }
            }
            items.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(items.into_iter().map(|(_, item)| item).collect())
        }
    }
}

/// Key of an item under `union_by_key`. Items without the key cannot be
/// placed and fail the merge instead of being dropped.
fn item_key(slot: &str, key: &str, item: &Value) -> Result<String> {
    match item.get(key) {
        Some(Value::String(raw)) => Ok(raw.clone()),
        Some(Value::Null) | None => Err(HarvestError::InvalidState(format!(
            "item in slot {slot} has no '{key}' field"
        ))),
        Some(other) => Ok(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn result(
        slot: &str,
        strategy: MergeStrategy,
        sequence: u64,
        items: Vec<Value>,
    ) -> MergeableIngestionResult {
        MergeableIngestionResult {
            slot: slot.into(),
            strategy,
            sequence,
            partial: false,
            items,
        }
    }

    #[test]
    fn concat_follows_sequence_not_arrival() {
        let merger = ResultMerger::new();
        let merged = merger
            .merge(vec![
                result("issues", MergeStrategy::ConcatLists, 2, vec![json!(3)]),
                result("issues", MergeStrategy::ConcatLists, 1, vec![json!(1), json!(2)]),
            ])
            .unwrap();
        assert_eq!(merged["issues"].items, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(merged["issues"].sources, 2);
    }

    #[test]
    fn last_write_wins_keeps_highest_sequence() {
        let merged = ResultMerger::new()
            .merge(vec![
                result("profile", MergeStrategy::LastWriteWins, 7, vec![json!({"v": 7})]),
                result("profile", MergeStrategy::LastWriteWins, 3, vec![json!({"v": 3})]),
            ])
            .unwrap();
        assert_eq!(merged["profile"].items, vec![json!({"v": 7})]);
    }

    #[test]
    fn union_by_key_prefers_later_sequence() {
        let by_id = MergeStrategy::UnionByKey { key: "id".into() };
        let merged = ResultMerger::new()
            .merge(vec![
                result("users", by_id.clone(), 2, vec![json!({"id": "a", "name": "new"})]),
                result(
                    "users",
                    by_id,
                    1,
                    vec![json!({"id": "a", "name": "old"}), json!({"id": "b"})],
                ),
            ])
            .unwrap();
        assert_eq!(
            merged["users"].items,
            vec![json!({"id": "a", "name": "new"}), json!({"id": "b"})]
        );
    }

    #[test]
    fn union_by_key_breaks_sequence_ties_by_content() {
        let by_id = MergeStrategy::UnionByKey { key: "id".into() };
        let a = result("users", by_id.clone(), 0, vec![json!({"id": "x", "v": 1})]);
        let b = result("users", by_id, 0, vec![json!({"id": "x", "v": 2})]);
        assert!(a.strategy.is_order_independent());

        let merger = ResultMerger::new();
        let forward = merger.merge(vec![a.clone(), b.clone()]).unwrap();
        let reversed = merger.merge(vec![b.clone(), a.clone()]).unwrap();
        assert_eq!(forward["users"].items, reversed["users"].items);
        assert_eq!(forward["users"].items, vec![json!({"id": "x", "v": 2})]);

        let paired = merger.merge_pair(b, a).unwrap();
        assert_eq!(paired.items, forward["users"].items);
    }

    #[test]
    fn set_union_is_order_independent_and_associative() {
        let merger = ResultMerger::new();
        let a = result("labels", MergeStrategy::SetUnion, 1, vec![json!("bug"), json!("p1")]);
        let b = result("labels", MergeStrategy::SetUnion, 2, vec![json!("p1"), json!("ui")]);
        let c = result("labels", MergeStrategy::SetUnion, 3, vec![json!("bug"), json!("db")]);

        let left = merger
            .merge_pair(merger.merge_pair(a.clone(), b.clone()).unwrap(), c.clone())
            .unwrap();
        let right = merger
            .merge_pair(a.clone(), merger.merge_pair(b.clone(), c.clone()).unwrap())
            .unwrap();
        assert_eq!(left.items, right.items);

        let forward = merger.merge(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        let reversed = merger.merge(vec![c, b, a]).unwrap();
        assert_eq!(forward["labels"].items, reversed["labels"].items);
        assert_eq!(forward["labels"].items.len(), 4);
    }

    #[test]
    fn conflicting_strategies_fail_the_merge() {
        let err = ResultMerger::new()
            .merge(vec![
                result("issues", MergeStrategy::ConcatLists, 1, vec![json!(1)]),
                result("issues", MergeStrategy::SetUnion, 2, vec![json!(2)]),
            ])
            .unwrap_err();
        assert!(matches!(err, HarvestError::MergeConflict { ref slot, .. } if slot == "issues"));
    }

    #[test]
    fn partial_inputs_mark_the_slot_partial() {
        let mut page = result("issues", MergeStrategy::ConcatLists, 1, vec![json!(1)]);
        page.partial = true;
        let merged = ResultMerger::new()
            .merge(vec![
                page,
                result("issues", MergeStrategy::ConcatLists, 2, vec![json!(2)]),
                result("comments", MergeStrategy::ConcatLists, 1, vec![]),
            ])
            .unwrap();
        assert!(merged["issues"].partial);
        assert!(!merged["comments"].partial);
    }

    #[test]
    fn union_by_key_rejects_items_without_key() {
        let by_id = MergeStrategy::UnionByKey { key: "id".into() };
        let err = ResultMerger::new()
            .merge(vec![result("users", by_id, 1, vec![json!({"name": "x"})])])
            .unwrap_err();
        assert!(matches!(err, HarvestError::InvalidState(_)));
    }
}

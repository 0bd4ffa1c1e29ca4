//! Candidate selection for a mixing round.
//!
//! Selection is a pure function over a pool snapshot. Candidates are taken
//! oldest first; a candidate is skipped when it belongs to a mix already in
//! the set or was deposited within `min_deposit_separation` of a selected
//! entry, so no two members of an anonymity set can be linked by owner or by
//! arrival time.

use crate::config::SelectionConfig;
use crate::model::{Amount, EntryId, PoolEntry};
use crate::util::time::duration_ms;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Entry ids forming one anonymity set, oldest first
    Ready(Vec<EntryId>),
    /// Too few compatible candidates; `candidates` passed the amount filter
    Insufficient { candidates: usize },
}

/// Amount window a candidate must fall in, relative to the mix target.
pub fn amount_bounds(mix_target: Amount, config: &SelectionConfig) -> (Amount, Amount) {
    let target = mix_target as f64;
    (
        (target * config.min_amount_ratio).ceil() as Amount,
        (target * config.max_amount_ratio).floor() as Amount,
    )
}

pub fn select_participants(
    entries: &[PoolEntry],
    mix_target: Amount,
    config: &SelectionConfig,
    exclude: &HashSet<EntryId>,
) -> Selection {
    let (low, high) = amount_bounds(mix_target, config);
    let separation = duration_ms(config.min_deposit_separation);
    let fill = (mix_target as f64 * config.target_fill_ratio).ceil() as Amount;

    let mut candidates: Vec<&PoolEntry> = entries
        .iter()
        .filter(|e| e.is_selectable() && !exclude.contains(&e.id))
        .filter(|e| e.amount >= low && e.amount <= high)
        .collect();
    candidates.sort_by_key(|e| (e.deposited_at, e.id));

    let mut selected: Vec<&PoolEntry> = Vec::new();
    let mut accumulated: Amount = 0;
    for candidate in &candidates {
        let conflicts = selected.iter().any(|s| {
            s.mix_id == candidate.mix_id
                || s.deposited_at.abs_diff(candidate.deposited_at) < separation
        });
        if conflicts {
            continue;
        }
        selected.push(candidate);
        accumulated = accumulated.saturating_add(candidate.amount);

        let enough = selected.len() >= config.min_mix_participants && accumulated >= fill;
        if enough || selected.len() >= config.max_mix_participants {
            break;
        }
    }

    if selected.len() < config.min_mix_participants {
        return Selection::Insufficient {
            candidates: candidates.len(),
        };
    }
    Selection::Ready(selected.into_iter().map(|e| e.id).collect())
}

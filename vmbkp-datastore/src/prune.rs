use std::collections::{BTreeSet, HashMap};

use crate::chain::GenerationId;

enum PruneMark {
    Keep,
    Remove,
}

/// Chain entry as seen by the retention logic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GenerationInfo {
    pub id: GenerationId,
    pub timestamp_ms: i64,
    pub succeeded: bool,
}

impl GenerationInfo {
    /// Sort newest first.
    pub fn sort_list(list: &mut [GenerationInfo]) {
        list.sort_unstable_by(|a, b| {
            b.timestamp_ms
                .cmp(&a.timestamp_ms)
                .then_with(|| b.id.cmp(&a.id))
        });
    }
}

fn mark_selections(
    mark: &mut HashMap<GenerationId, PruneMark>,
    list: &[GenerationInfo],
    keep: usize,
) {
    let mut succeeded_seen = 0;

    for info in list {
        if succeeded_seen >= keep {
            mark.insert(info.id, PruneMark::Remove);
        } else {
            mark.insert(info.id, PruneMark::Keep);
        }
        if info.succeeded {
            succeeded_seen += 1;
        }
    }
}

/// Walk from newest to oldest, only succeeded generations count towards
/// `keep`. Everything after the `keep`-th succeeded generation is removed,
/// failed or not.
pub fn compute_prune_info(
    mut list: Vec<GenerationInfo>,
    keep: usize,
) -> Vec<(GenerationInfo, bool)> {
    let mut mark = HashMap::new();

    GenerationInfo::sort_list(&mut list);

    mark_selections(&mut mark, &list, keep);

    list.into_iter()
        .map(|info| {
            let keep = matches!(mark.get(&info.id), Some(PruneMark::Keep));
            (info, keep)
        })
        .collect()
}

/// Ids of generations which are no longer needed.
pub fn old_generations(list: Vec<GenerationInfo>, keep: usize) -> BTreeSet<GenerationId> {
    compute_prune_info(list, keep)
        .into_iter()
        .filter(|(_, keep)| !keep)
        .map(|(info, _)| info.id)
        .collect()
}

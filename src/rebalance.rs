// src/rebalance.rs

//! Block-count balancing across active sources.
//!
//! With `T` sources and `R` writable blocks every source gets a quota of
//! `ceil(R / T)`. Sources over quota give blocks back (HTTP its highest, peers
//! their lowest), then the unassigned blocks go to the least loaded sources
//! first (HTTP from the low end, peers from the high end).

use crate::source::{ComponentId, SourceKind};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct SourceLoad {
    pub id: ComponentId,
    pub kind: SourceKind,
    pub assigned: BTreeSet<usize>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Plan {
    pub unassign: BTreeMap<ComponentId, BTreeSet<usize>>,
    pub assign: BTreeMap<ComponentId, BTreeSet<usize>>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.unassign.is_empty() && self.assign.is_empty()
    }
}

pub fn plan(writable: &BTreeSet<usize>, sources: &[SourceLoad]) -> Plan {
    let mut plan = Plan::default();
    if sources.is_empty() {
        return plan;
    }
    let quota = writable.len().div_ceil(sources.len());

    let mut claimed = BTreeSet::new();
    let mut kept: Vec<BTreeSet<usize>> = Vec::with_capacity(sources.len());
    for source in sources {
        let mut keep: BTreeSet<usize> = source
            .assigned
            .iter()
            .copied()
            .filter(|i| writable.contains(i) && !claimed.contains(i))
            .collect();
        while keep.len() > quota {
            let dropped = match source.kind {
                SourceKind::Http => keep.pop_last(),
                SourceKind::Peer => keep.pop_first(),
            };
            if dropped.is_none() {
                break;
            }
        }
        let released: BTreeSet<usize> = source.assigned.difference(&keep).copied().collect();
        if !released.is_empty() {
            plan.unassign.insert(source.id, released);
        }
        claimed.extend(keep.iter().copied());
        kept.push(keep);
    }

    let mut free: BTreeSet<usize> = writable.difference(&claimed).copied().collect();
    let mut order: Vec<usize> = (0..sources.len()).collect();
    order.sort_by_key(|&n| kept[n].len());

    for &n in &order {
        if free.is_empty() {
            break;
        }
        let need = quota.saturating_sub(kept[n].len());
        let mut granted = BTreeSet::new();
        for _ in 0..need {
            let next = match sources[n].kind {
                SourceKind::Http => free.pop_first(),
                SourceKind::Peer => free.pop_last(),
            };
            match next {
                Some(index) => {
                    granted.insert(index);
                }
                None => break,
            }
        }
        if !granted.is_empty() {
            plan.assign.entry(sources[n].id).or_default().extend(granted);
        }
    }

    if let Some(&last) = order.last() {
        if !free.is_empty() {
            tracing::warn!(source = sources[last].id, blocks = free.len(), "assigning leftover blocks to one source");
            plan.assign.entry(sources[last].id).or_default().extend(free);
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn load(id: ComponentId, kind: SourceKind, assigned: &[usize]) -> SourceLoad {
        SourceLoad {
            id,
            kind,
            assigned: assigned.iter().copied().collect(),
        }
    }

    fn apply(sources: &[SourceLoad], plan: &Plan) -> BTreeMap<ComponentId, BTreeSet<usize>> {
        sources
            .iter()
            .map(|s| {
                let mut set = s.assigned.clone();
                if let Some(out) = plan.unassign.get(&s.id) {
                    set.retain(|i| !out.contains(i));
                }
                if let Some(add) = plan.assign.get(&s.id) {
                    set.extend(add.iter().copied());
                }
                (s.id, set)
            })
            .collect()
    }

    #[test]
    fn http_and_peer_split_ten_blocks_from_opposite_ends() {
        let writable: BTreeSet<usize> = (0..10).collect();
        let sources = [
            load(1, SourceKind::Http, &(0..10).collect::<Vec<_>>()),
            load(2, SourceKind::Peer, &[]),
        ];
        let after = apply(&sources, &plan(&writable, &sources));
        assert_eq!(after[&1], (0..5).collect());
        assert_eq!(after[&2], (5..10).collect());
    }

    #[test]
    fn fresh_sources_split_the_same_way() {
        let writable: BTreeSet<usize> = (0..10).collect();
        let sources = [load(1, SourceKind::Http, &[]), load(2, SourceKind::Peer, &[])];
        let after = apply(&sources, &plan(&writable, &sources));
        assert_eq!(after[&1], (0..5).collect());
        assert_eq!(after[&2], (5..10).collect());
    }

    #[test]
    fn lost_peer_blocks_return_to_http() {
        let writable: BTreeSet<usize> = [0, 1, 2, 6, 7].into_iter().collect();
        let sources = [load(1, SourceKind::Http, &[0, 1, 2])];
        let after = apply(&sources, &plan(&writable, &sources));
        assert_eq!(after[&1], writable);
    }

    #[test]
    fn completed_blocks_are_released() {
        let writable: BTreeSet<usize> = [1, 2].into_iter().collect();
        let sources = [load(1, SourceKind::Http, &[0, 1, 2])];
        let p = plan(&writable, &sources);
        assert_eq!(p.unassign[&1], BTreeSet::from([0]));
        assert!(p.assign.is_empty());
    }

    #[test]
    fn balanced_assignment_is_left_alone() {
        let writable: BTreeSet<usize> = (0..4).collect();
        let sources = [
            load(1, SourceKind::Http, &[0, 1]),
            load(2, SourceKind::Peer, &[2, 3]),
        ];
        assert!(plan(&writable, &sources).is_empty());
    }

    fn arb_case() -> impl Strategy<Value = (BTreeSet<usize>, Vec<SourceLoad>)> {
        (
            proptest::collection::btree_set(0usize..64, 0..64),
            proptest::collection::vec(
                (any::<bool>(), proptest::collection::btree_set(0usize..64, 0..16)),
                1..6,
            ),
        )
            .prop_map(|(writable, raw)| {
                let mut taken = BTreeSet::new();
                let sources = raw
                    .into_iter()
                    .enumerate()
                    .map(|(n, (http, set))| {
                        // Disjoint going in, like the engine's registry.
                        let own: BTreeSet<usize> = set.difference(&taken).copied().collect();
                        taken.extend(own.iter().copied());
                        SourceLoad {
                            id: n as ComponentId,
                            kind: if http { SourceKind::Http } else { SourceKind::Peer },
                            assigned: own,
                        }
                    })
                    .collect();
                (writable, sources)
            })
    }

    proptest! {
        #[test]
        fn rebalance_conserves_writable_blocks((writable, sources) in arb_case()) {
            let after = apply(&sources, &plan(&writable, &sources));
            let quota = writable.len().div_ceil(sources.len());
            let mut seen = BTreeSet::new();
            for set in after.values() {
                prop_assert!(set.len() <= quota);
                for i in set {
                    prop_assert!(writable.contains(i));
                    prop_assert!(seen.insert(*i), "block {} assigned twice", i);
                }
            }
            prop_assert_eq!(seen, writable);
        }
    }
}

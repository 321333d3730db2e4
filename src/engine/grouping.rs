use hashbrown::HashMap;

use crate::{batch::BatchRecord, types::BatchId};

/// Bucketing key derived per lineage root; first matching rule wins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupKey {
    /// Explicit operator override from the notes tag.
    Override(String),
    /// Same genetic identity created in the same minute.
    Genetic {
        /// Genetic reference or display-name fallback.
        genetic: String,
        /// Creation time truncated to the minute.
        minute: u64,
    },
    /// No merging; the root stands alone.
    Unique(BatchId),
}

/// Display-time aggregation of one or more batches.
///
/// Groups are recomputed from scratch on every call and carry no identity
/// across recomputations; their order is purely a function of the primary
/// batch's creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    /// Key the members share.
    pub key: GroupKey,
    /// Name forced by an override tag; `None` leaves derivation to the
    /// caller, from the primary record's genetics/name/code.
    pub display_name: Option<String>,
    /// Deterministically chosen representative batch.
    pub primary: BatchId,
    /// All member batches, primary first.
    pub members: Vec<BatchId>,
    /// Sum of member quantities.
    pub total_quantity: u64,
}

struct Candidate<'a> {
    root: &'a BatchRecord,
    kids: Vec<BatchId>,
}

/// Derives ordered display groups from a flat batch list.
///
/// `by_genetic` turns on the automatic genetic-plus-minute merge wanted in
/// drying-style rooms, where same-genetic batches harvested together
/// should read as one card. Spatial rooms leave it off: merging genuinely
/// distinct sowings by accident is worse than under-grouping, so the
/// default is one group per root.
///
/// Roots are batches with no parent, or whose parent is absent from the
/// input; an absent parent never drops the child. Each root carries only
/// its direct children already in scope; deeper descendants are not
/// expanded. Zero-quantity batches are excluded entirely.
pub fn group_batches(batches: &[BatchRecord], by_genetic: bool) -> Vec<Group> {
    let live: Vec<&BatchRecord> = batches.iter().filter(|b| b.quantity > 0).collect();
    let present: HashMap<BatchId, &BatchRecord> = live.iter().map(|b| (b.id, *b)).collect();

    let mut children: HashMap<BatchId, Vec<BatchId>> = HashMap::new();
    let mut roots: Vec<&BatchRecord> = Vec::new();
    for &b in &live {
        match b.parent_id {
            Some(parent) if present.contains_key(&parent) => {
                children.entry(parent).or_default().push(b.id);
            }
            _ => roots.push(b),
        }
    }

    let mut buckets: HashMap<GroupKey, Vec<Candidate<'_>>> = HashMap::new();
    for root in roots {
        let key = if let Some(tag) = &root.group_override {
            GroupKey::Override(tag.clone())
        } else if by_genetic {
            GroupKey::Genetic {
                genetic: root.genetic_key(),
                minute: root.created_ms / 60_000,
            }
        } else {
            GroupKey::Unique(root.id)
        };
        let kids = children.get(&root.id).cloned().unwrap_or_default();
        buckets.entry(key).or_default().push(Candidate { root, kids });
    }

    let mut keyed: Vec<(u64, BatchId, Group)> = Vec::with_capacity(buckets.len());
    for (key, mut cands) in buckets {
        cands.sort_by(|a, b| {
            a.root
                .name
                .cmp(&b.root.name)
                .then_with(|| a.root.tracking_code.cmp(&b.root.tracking_code))
                .then_with(|| a.root.id.cmp(&b.root.id))
        });
        let Some((primary, rest)) = cands.split_first() else {
            continue;
        };

        let mut members = Vec::with_capacity(cands.len());
        members.push(primary.root.id);
        members.extend(primary.kids.iter().copied());
        for other in rest {
            members.push(other.root.id);
            members.extend(other.kids.iter().copied());
        }

        let total_quantity = members
            .iter()
            .filter_map(|id| present.get(id))
            .map(|b| u64::from(b.quantity))
            .sum();

        let display_name = match &key {
            GroupKey::Override(name) => Some(name.clone()),
            _ => None,
        };

        keyed.push((
            primary.root.created_ms,
            primary.root.id,
            Group {
                display_name,
                primary: primary.root.id,
                members,
                total_quantity,
                key,
            },
        ));
    }

    // newest first; ids break creation-time ties deterministically
    keyed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    keyed.into_iter().map(|(_, _, g)| g).collect()
}

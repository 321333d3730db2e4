use crate::{batch::BatchRecord, types::BatchId};

use super::error::EngineError;

/// How one unit-placement is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitSource {
    /// Split a quantity-1 child off the batch; the child takes the cell.
    Split {
        /// Source batch to split from.
        source: BatchId,
    },
    /// The batch itself takes the cell with its last remaining unit.
    Whole {
        /// Batch to move.
        batch: BatchId,
    },
}

/// Units drawn from one candidate batch during bulk consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Draw {
    /// Candidate the units come from.
    pub batch: BatchId,
    /// Units drawn, at most the candidate quantity.
    pub units: u32,
}

/// Outcome of a discard request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardPlan {
    /// Decrement the quantity and append an audit note.
    Decrement {
        /// Units removed.
        units: u32,
    },
    /// The full quantity goes; the record is handed to deletion rather
    /// than decremented to zero in place.
    Remove,
}

/// Consolidation of several units back into one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// Batch that survives and absorbs every quantity.
    pub target: BatchId,
    /// Batches deleted after their quantity moves to the target.
    pub absorbed: Vec<BatchId>,
    /// Units moving into the target.
    pub units_moved: u64,
}

/// Plans how `units` placements of `batch` are materialized.
///
/// Each unit splits off a quantity-1 child with a fresh lineage leaf,
/// except that consuming the batch's full quantity moves the original
/// record into the last cell instead of leaving an empty husk behind.
pub fn plan_units(batch: &BatchRecord, units: u32) -> Result<Vec<UnitSource>, EngineError> {
    if units > batch.quantity {
        return Err(EngineError::InsufficientStock {
            requested: units,
            available: batch.quantity,
        });
    }

    let mut plan = Vec::with_capacity(units as usize);
    for i in 0..units {
        if i + 1 == units && units == batch.quantity {
            plan.push(UnitSource::Whole { batch: batch.id });
        } else {
            plan.push(UnitSource::Split { source: batch.id });
        }
    }
    Ok(plan)
}

/// Greedily draws `needed` units across `candidates`.
///
/// Candidates are ordered by tracking code then id before drawing; the
/// order is deterministic but carries no business meaning. Zero-quantity
/// candidates never contribute. Exhausting the candidates with units
/// still needed is [`EngineError::InsufficientStock`], distinct from the
/// grid running out of cells.
pub fn consume_candidates(
    candidates: &[&BatchRecord],
    needed: u32,
) -> Result<Vec<Draw>, EngineError> {
    let mut ordered: Vec<&BatchRecord> = candidates
        .iter()
        .copied()
        .filter(|b| b.quantity > 0)
        .collect();
    ordered.sort_by(|a, b| {
        a.tracking_code
            .cmp(&b.tracking_code)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut draws = Vec::new();
    let mut remaining = needed;
    for b in ordered {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(b.quantity);
        draws.push(Draw {
            batch: b.id,
            units: take,
        });
        remaining -= take;
    }

    if remaining > 0 {
        return Err(EngineError::InsufficientStock {
            requested: needed,
            available: needed - remaining,
        });
    }
    Ok(draws)
}

/// Plans a discard of `units` from `batch`.
///
/// A partial discard decrements in place; discarding the full quantity
/// routes to deletion.
pub fn plan_discard(batch: &BatchRecord, units: u32) -> Result<DiscardPlan, EngineError> {
    if units == 0 {
        return Err(EngineError::InvariantViolation(format!(
            "discard of zero units from batch {}",
            batch.id
        )));
    }
    if units > batch.quantity {
        return Err(EngineError::InsufficientStock {
            requested: units,
            available: batch.quantity,
        });
    }
    if units == batch.quantity {
        Ok(DiscardPlan::Remove)
    } else {
        Ok(DiscardPlan::Decrement { units })
    }
}

/// Plans recombining `units` (typically harvested cells) into a single
/// batch.
///
/// The survivor is picked by tracking code then id. Every member must be
/// live, and all members must share one genetic identity; recombining
/// distinct genetics is refused.
pub fn plan_merge(units: &[&BatchRecord]) -> Result<MergePlan, EngineError> {
    let mut ordered: Vec<&BatchRecord> = units.to_vec();
    if ordered.is_empty() {
        return Err(EngineError::InvariantViolation(
            "merge of an empty selection".to_string(),
        ));
    }
    for b in &ordered {
        if b.quantity == 0 {
            return Err(EngineError::InvariantViolation(format!(
                "merge includes discarded batch {}",
                b.id
            )));
        }
    }
    let genetic = ordered[0].genetic_key();
    if ordered.iter().any(|b| b.genetic_key() != genetic) {
        return Err(EngineError::InvariantViolation(
            "merge spans distinct genetic identities".to_string(),
        ));
    }

    ordered.sort_by(|a, b| {
        a.tracking_code
            .cmp(&b.tracking_code)
            .then_with(|| a.id.cmp(&b.id))
    });
    let target = ordered[0].id;
    let absorbed: Vec<BatchId> = ordered[1..].iter().map(|b| b.id).collect();
    let units_moved = ordered[1..].iter().map(|b| u64::from(b.quantity)).sum();

    Ok(MergePlan {
        target,
        absorbed,
        units_moved,
    })
}

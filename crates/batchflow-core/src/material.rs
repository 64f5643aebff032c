//! Material, lots, eligibility and inventory.
//!
//! A [`Lot`] is a traceable quantity of one material from one source. Its
//! available quantity at a tick is what its [`TransferPolicy`] has released
//! by then, minus what placements have drawn from it. A lot that has been
//! fully drawn, or that has expired, is never eligible again.
//!
//! Whether a lot may satisfy a particular demand is answered by a
//! [`Usability`] policy through three capability queries. The wear-based
//! variant has no notion of an explicit eligible-lot set, and asking it
//! whether a code is in that set is a contract violation reported as
//! [`EligibilityError::Unsupported`].

use crate::fixed::{Quantity, Ticks, prorate};
use crate::id::{ActivityId, ConnectorId, LotCode, LotId, MaterialId, StorageAreaId};
use crate::time::Window;
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A capability query was invoked on a policy variant that does not
/// support it. Always a programming error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EligibilityError {
    #[error("{query} is not supported by the {variant} usability policy")]
    Unsupported {
        variant: &'static str,
        query: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MaterialError {
    #[error("lot {lot} has {available} available, {requested} requested")]
    InsufficientQuantity {
        lot: LotCode,
        available: Quantity,
        requested: Quantity,
    },
    #[error("lot {0} is fully consumed")]
    LotConsumed(LotCode),
    #[error("lot {0} has expired")]
    LotExpired(LotCode),
    #[error("cannot restore {restored} to lot {lot}: only {consumed} was drawn")]
    OverRestore {
        lot: LotCode,
        consumed: Quantity,
        restored: Quantity,
    },
    #[error("unknown lot")]
    UnknownLot,
    #[error("unknown material {0:?}")]
    UnknownMaterial(MaterialId),
}

// ---------------------------------------------------------------------------
// Material definitions
// ---------------------------------------------------------------------------

/// How a producing activity releases its output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPolicy {
    /// The whole quantity becomes available at processing-end.
    #[default]
    AtCompletion,
    /// Quantity accrues linearly over the run phase, released every `step`
    /// ticks.
    Incremental { step: Ticks },
}

impl TransferPolicy {
    /// Quantity released by tick `t` for a ramp over `flow`.
    pub fn released(&self, total: Quantity, flow: Window, t: Ticks) -> Quantity {
        if t >= flow.end {
            return total;
        }
        match self {
            TransferPolicy::AtCompletion => Quantity::ZERO,
            TransferPolicy::Incremental { step } => {
                let step = (*step).max(1);
                let elapsed = t.saturating_sub(flow.start);
                let whole_steps = (elapsed / step) * step;
                prorate(total, whole_steps, flow.len())
            }
        }
    }

    /// Every tick at which the released quantity grows, ending with
    /// `flow.end`.
    pub fn release_ticks(&self, flow: Window) -> Vec<Ticks> {
        match self {
            TransferPolicy::AtCompletion => vec![flow.end],
            TransferPolicy::Incremental { step } => {
                let step = (*step).max(1);
                let mut ticks: Vec<Ticks> = (1..)
                    .map(|i| flow.start.saturating_add(step.saturating_mul(i)))
                    .take_while(|t| *t < flow.end)
                    .collect();
                ticks.push(flow.end);
                ticks
            }
        }
    }
}

/// A material definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialDef {
    pub name: String,
    /// Ticks after production at which a lot expires.
    pub shelf_life: Option<Ticks>,
    pub transfer: TransferPolicy,
}

impl MaterialDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shelf_life: None,
            transfer: TransferPolicy::AtCompletion,
        }
    }

    pub fn with_shelf_life(mut self, ticks: Ticks) -> Self {
        self.shelf_life = Some(ticks);
        self
    }

    pub fn with_transfer(mut self, transfer: TransferPolicy) -> Self {
        self.transfer = transfer;
        self
    }
}

// ---------------------------------------------------------------------------
// Lot
// ---------------------------------------------------------------------------

/// A traceable quantity of material from one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub code: LotCode,
    pub material: MaterialId,
    pub total: Quantity,
    pub(crate) consumed: Quantity,
    /// Number of placements that drew from this lot (wear).
    pub(crate) uses: u32,
    pub produced_at: Ticks,
    /// Ramp over which the quantity is released.
    pub flow: Window,
    pub transfer: TransferPolicy,
    pub expires_at: Option<Ticks>,
    pub location: Option<StorageAreaId>,
    pub tags: BTreeSet<String>,
    /// The activity whose placement created this lot. `None` for lots
    /// supplied with the scenario.
    pub producer: Option<ActivityId>,
    pub(crate) expired: bool,
}

impl Lot {
    /// A lot that is fully available from `produced_at`.
    pub fn on_hand(code: impl Into<String>, material: MaterialId, total: Quantity, produced_at: Ticks) -> Self {
        Self {
            code: LotCode::new(code),
            material,
            total,
            consumed: Quantity::ZERO,
            uses: 0,
            produced_at,
            flow: Window::new(produced_at, produced_at),
            transfer: TransferPolicy::AtCompletion,
            expires_at: None,
            location: None,
            tags: BTreeSet::new(),
            producer: None,
            expired: false,
        }
    }

    pub fn with_expiry(mut self, expires_at: Ticks) -> Self {
        self.expires_at = Some(expires_at.max(self.produced_at));
        self
    }

    pub fn at(mut self, area: StorageAreaId) -> Self {
        self.location = Some(area);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn consumed(&self) -> Quantity {
        self.consumed
    }

    pub fn uses(&self) -> u32 {
        self.uses
    }

    /// Whether every unit has been drawn.
    pub fn is_consumed(&self) -> bool {
        self.consumed >= self.total
    }

    /// Whether the lot was purged by shelf-life expiry.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// Quantity released by tick `t`.
    pub fn released_at(&self, t: Ticks) -> Quantity {
        self.transfer.released(self.total, self.flow, t)
    }

    /// Quantity that can still be drawn at tick `t`.
    pub fn available_at(&self, t: Ticks) -> Quantity {
        if self.expired || self.expires_at.is_some_and(|e| t >= e) {
            return Quantity::ZERO;
        }
        (self.released_at(t) - self.consumed).max(Quantity::ZERO)
    }

    /// Quantity not yet drawn, regardless of release progress.
    pub fn remaining(&self) -> Quantity {
        (self.total - self.consumed).max(Quantity::ZERO)
    }

    /// Draw `quantity` at tick `t`.
    pub(crate) fn consume(&mut self, quantity: Quantity, t: Ticks) -> Result<(), MaterialError> {
        if self.expired {
            return Err(MaterialError::LotExpired(self.code.clone()));
        }
        if self.is_consumed() {
            return Err(MaterialError::LotConsumed(self.code.clone()));
        }
        let available = self.available_at(t);
        if quantity > available {
            return Err(MaterialError::InsufficientQuantity {
                lot: self.code.clone(),
                available,
                requested: quantity,
            });
        }
        self.consumed += quantity;
        self.uses += 1;
        Ok(())
    }

    /// Undo a draw of `quantity`.
    pub(crate) fn restore(&mut self, quantity: Quantity) -> Result<(), MaterialError> {
        if quantity > self.consumed {
            return Err(MaterialError::OverRestore {
                lot: self.code.clone(),
                consumed: self.consumed,
                restored: quantity,
            });
        }
        self.consumed -= quantity;
        self.uses = self.uses.saturating_sub(1);
        Ok(())
    }

    /// Reset run-scoped accounting.
    pub(crate) fn reset(&mut self) {
        self.consumed = Quantity::ZERO;
        self.uses = 0;
        self.expired = false;
    }
}

// ---------------------------------------------------------------------------
// Usability / eligibility
// ---------------------------------------------------------------------------

/// Auxiliary context for an eligibility query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityContext {
    /// Tick at which the draw is planned.
    pub tick: Ticks,
    /// Tick until which the drawn material must stay good.
    pub needed_until: Ticks,
}

/// Lot usability policy attached to a material demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Usability {
    /// Lots wear out after `max_uses` draws.
    Wear { max_uses: u32 },
    /// Lots must have at least `min_remaining` ticks of shelf life left and
    /// must not expire before the material is needed. With `eligible` set,
    /// only the listed lots may be drawn.
    ShelfLife {
        min_remaining: Ticks,
        eligible: Option<BTreeSet<LotCode>>,
    },
}

impl Default for Usability {
    fn default() -> Self {
        Usability::ShelfLife {
            min_remaining: 0,
            eligible: None,
        }
    }
}

impl Usability {
    pub fn variant_name(&self) -> &'static str {
        match self {
            Usability::Wear { .. } => "wear",
            Usability::ShelfLife { .. } => "shelf-life",
        }
    }

    /// Is `lot` eligible for this demand in `ctx`?
    pub fn is_eligible(&self, lot: &Lot, ctx: &EligibilityContext) -> bool {
        if lot.expired || lot.is_consumed() {
            return false;
        }
        match self {
            Usability::Wear { max_uses } => lot.uses < *max_uses,
            Usability::ShelfLife { min_remaining, .. } => match lot.expires_at {
                None => true,
                Some(expires) => {
                    expires > ctx.tick
                        && expires - ctx.tick >= *min_remaining
                        && expires >= ctx.needed_until
                }
            },
        }
    }

    /// Must eligible lots come only from an explicit eligible-lot set?
    pub fn must_use_eligible_set(&self) -> bool {
        match self {
            Usability::Wear { .. } => false,
            Usability::ShelfLife { eligible, .. } => eligible.is_some(),
        }
    }

    /// Is `code` in the explicit eligible-lot set?
    ///
    /// The wear variant has no such set and fails. A shelf-life policy
    /// without a set contains no codes.
    pub fn contains_eligible_lot(&self, code: &LotCode) -> Result<bool, EligibilityError> {
        match self {
            Usability::Wear { .. } => Err(EligibilityError::Unsupported {
                variant: self.variant_name(),
                query: "contains_eligible_lot",
            }),
            Usability::ShelfLife { eligible, .. } => {
                Ok(eligible.as_ref().is_some_and(|set| set.contains(code)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Demand & lot selection
// ---------------------------------------------------------------------------

/// An activity's demand on a material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRequirement {
    pub material: MaterialId,
    pub quantity: Quantity,
    pub usability: Usability,
    /// Lots must carry every one of these tags.
    pub required_tags: BTreeSet<String>,
    /// Draw only from lots resident in this area.
    pub source: Option<StorageAreaId>,
    /// Connector the drawn material moves through.
    pub connector: Option<ConnectorId>,
}

impl MaterialRequirement {
    pub fn new(material: MaterialId, quantity: Quantity) -> Self {
        Self {
            material,
            quantity,
            usability: Usability::default(),
            required_tags: BTreeSet::new(),
            source: None,
            connector: None,
        }
    }

    pub fn with_usability(mut self, usability: Usability) -> Self {
        self.usability = usability;
        self
    }

    pub fn from_area(mut self, area: StorageAreaId) -> Self {
        self.source = Some(area);
        self
    }

    pub fn through(mut self, connector: ConnectorId) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.required_tags.insert(tag.into());
        self
    }

    /// Material, tag and location match, before usability is considered.
    pub fn matches(&self, lot: &Lot) -> bool {
        lot.material == self.material
            && self.required_tags.is_subset(&lot.tags)
            && self.source.is_none_or(|area| lot.location == Some(area))
    }

    /// Full eligibility of `lot` for this demand.
    pub fn accepts(&self, lot: &Lot, ctx: &EligibilityContext) -> Result<bool, EligibilityError> {
        if !self.matches(lot) || !self.usability.is_eligible(lot, ctx) {
            return Ok(false);
        }
        if self.usability.must_use_eligible_set() {
            return self.usability.contains_eligible_lot(&lot.code);
        }
        Ok(true)
    }
}

/// A planned draw from one lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draw {
    pub lot: LotId,
    pub quantity: Quantity,
}

/// Plan draws for `req` across `order` (FIFO candidate order) without
/// touching any lot. `planned` holds draws already planned by earlier
/// demands of the same placement and is updated with the new draws.
///
/// Returns `Ok(None)` when the eligible lots cannot cover the demand.
pub fn plan_draws(
    lots: &SlotMap<LotId, Lot>,
    order: &[LotId],
    req: &MaterialRequirement,
    ctx: &EligibilityContext,
    planned: &mut BTreeMap<LotId, Quantity>,
) -> Result<Option<Vec<Draw>>, EligibilityError> {
    let mut outstanding = req.quantity;
    let mut draws = Vec::new();
    if outstanding <= Quantity::ZERO {
        return Ok(Some(draws));
    }

    for &lot_id in order {
        let Some(lot) = lots.get(lot_id) else { continue };
        if !req.accepts(lot, ctx)? {
            continue;
        }
        let already = planned.get(&lot_id).copied().unwrap_or(Quantity::ZERO);
        let free = lot.available_at(ctx.tick) - already;
        if free <= Quantity::ZERO {
            continue;
        }
        let take = free.min(outstanding);
        draws.push(Draw {
            lot: lot_id,
            quantity: take,
        });
        outstanding -= take;
        if outstanding <= Quantity::ZERO {
            break;
        }
    }

    if outstanding > Quantity::ZERO {
        return Ok(None);
    }
    for draw in &draws {
        *planned.entry(draw.lot).or_insert(Quantity::ZERO) += draw.quantity;
    }
    Ok(Some(draws))
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Material held in a storage area. Its quantity is the quantity of its lot
/// that has not been drawn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub storage: StorageAreaId,
    pub lot: LotId,
    pub material: MaterialId,
    pub produced_at: Ticks,
    pub expires_at: Option<Ticks>,
}

impl Inventory {
    pub fn for_lot(lot_id: LotId, lot: &Lot, storage: StorageAreaId) -> Self {
        Self {
            storage,
            lot: lot_id,
            material: lot.material,
            produced_at: lot.produced_at,
            expires_at: lot.expires_at,
        }
    }

    pub fn quantity(&self, lots: &SlotMap<LotId, Lot>) -> Quantity {
        lots.get(self.lot).map_or(Quantity::ZERO, Lot::remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::units;

    fn flour() -> MaterialId {
        MaterialId(0)
    }

    fn ctx(tick: Ticks) -> EligibilityContext {
        EligibilityContext {
            tick,
            needed_until: tick,
        }
    }

    #[test]
    fn at_completion_releases_everything_at_end() {
        let p = TransferPolicy::AtCompletion;
        let flow = Window::new(10, 50);
        assert_eq!(p.released(units(100), flow, 49), units(0));
        assert_eq!(p.released(units(100), flow, 50), units(100));
        assert_eq!(p.release_ticks(flow), vec![50]);
    }

    #[test]
    fn incremental_releases_in_steps() {
        let p = TransferPolicy::Incremental { step: 10 };
        let flow = Window::new(0, 40);
        assert_eq!(p.released(units(100), flow, 0), units(0));
        assert_eq!(p.released(units(100), flow, 9), units(0));
        assert_eq!(p.released(units(100), flow, 10), units(25));
        assert_eq!(p.released(units(100), flow, 35), units(75));
        assert_eq!(p.released(units(100), flow, 40), units(100));
        assert_eq!(p.release_ticks(flow), vec![10, 20, 30, 40]);
    }

    #[test]
    fn incremental_step_not_dividing_run() {
        let p = TransferPolicy::Incremental { step: 15 };
        assert_eq!(p.release_ticks(Window::new(0, 40)), vec![15, 30, 40]);
    }

    #[test]
    fn available_is_bounded_by_total() {
        let mut lot = Lot::on_hand("L1", flour(), units(100), 0);
        assert_eq!(lot.available_at(0), units(100));
        lot.consume(units(40), 999).unwrap();
        assert_eq!(lot.available_at(999), units(60));
        assert!(lot.available_at(999) <= lot.total);
        assert!(!lot.is_consumed());
    }

    #[test]
    fn consume_more_than_available_fails_without_change() {
        let mut lot = Lot::on_hand("L1", flour(), units(10), 0);
        let err = lot.consume(units(11), 0).unwrap_err();
        assert!(matches!(err, MaterialError::InsufficientQuantity { .. }));
        assert_eq!(lot.consumed(), units(0));
        assert_eq!(lot.uses(), 0);
    }

    #[test]
    fn fully_consumed_lot_rejects_draws_and_eligibility() {
        let mut lot = Lot::on_hand("L1", flour(), units(10), 0);
        lot.consume(units(10), 0).unwrap();
        assert!(lot.is_consumed());
        assert!(matches!(
            lot.consume(units(1), 0),
            Err(MaterialError::LotConsumed(_))
        ));
        assert!(!Usability::default().is_eligible(&lot, &ctx(0)));
    }

    #[test]
    fn restore_undoes_a_draw() {
        let mut lot = Lot::on_hand("L1", flour(), units(10), 0);
        let before = lot.clone();
        lot.consume(units(4), 0).unwrap();
        lot.restore(units(4)).unwrap();
        assert_eq!(lot, before);
        assert!(lot.restore(units(1)).is_err());
    }

    #[test]
    fn expired_lot_has_nothing_available() {
        let lot = Lot::on_hand("L1", flour(), units(10), 0).with_expiry(100);
        assert_eq!(lot.available_at(99), units(10));
        assert_eq!(lot.available_at(100), units(0));
    }

    #[test]
    fn wear_policy_counts_uses() {
        let policy = Usability::Wear { max_uses: 2 };
        let mut lot = Lot::on_hand("T1", flour(), units(10), 0);
        assert!(policy.is_eligible(&lot, &ctx(0)));
        lot.consume(units(1), 0).unwrap();
        lot.consume(units(1), 0).unwrap();
        assert!(!policy.is_eligible(&lot, &ctx(0)));
        assert!(!policy.must_use_eligible_set());
    }

    #[test]
    fn wear_policy_rejects_set_membership_query() {
        let policy = Usability::Wear { max_uses: 3 };
        assert_eq!(
            policy.contains_eligible_lot(&LotCode::new("T1")),
            Err(EligibilityError::Unsupported {
                variant: "wear",
                query: "contains_eligible_lot",
            })
        );
    }

    #[test]
    fn wear_demand_is_decided_without_the_set_query() {
        let req = MaterialRequirement::new(flour(), units(1)).with_usability(Usability::Wear { max_uses: 1 });
        let mut lot = Lot::on_hand("T1", flour(), units(10), 0);
        assert_eq!(req.accepts(&lot, &ctx(0)), Ok(true));
        lot.consume(units(1), 0).unwrap();
        assert_eq!(req.accepts(&lot, &ctx(0)), Ok(false));
    }

    #[test]
    fn shelf_life_policy_checks_remaining_life() {
        let policy = Usability::ShelfLife {
            min_remaining: 50,
            eligible: None,
        };
        let lot = Lot::on_hand("L1", flour(), units(10), 0).with_expiry(100);
        assert!(policy.is_eligible(&lot, &ctx(50)));
        assert!(!policy.is_eligible(&lot, &ctx(51)));

        let needed_late = EligibilityContext {
            tick: 0,
            needed_until: 150,
        };
        assert!(!policy.is_eligible(&lot, &needed_late));
    }

    #[test]
    fn shelf_life_explicit_set() {
        let set: BTreeSet<LotCode> = [LotCode::new("A")].into_iter().collect();
        let policy = Usability::ShelfLife {
            min_remaining: 0,
            eligible: Some(set),
        };
        assert!(policy.must_use_eligible_set());
        assert_eq!(policy.contains_eligible_lot(&LotCode::new("A")), Ok(true));
        assert_eq!(policy.contains_eligible_lot(&LotCode::new("B")), Ok(false));

        let open = Usability::default();
        assert!(!open.must_use_eligible_set());
        assert_eq!(open.contains_eligible_lot(&LotCode::new("A")), Ok(false));
    }

    #[test]
    fn requirement_matches_tags_and_location() {
        let mut areas = SlotMap::<StorageAreaId, ()>::with_key();
        let tank = areas.insert(());
        let other = areas.insert(());

        let req = MaterialRequirement::new(flour(), units(1))
            .with_tag("organic")
            .from_area(tank);
        let good = Lot::on_hand("L1", flour(), units(5), 0)
            .with_tag("organic")
            .at(tank);
        let untagged = Lot::on_hand("L2", flour(), units(5), 0).at(tank);
        let elsewhere = Lot::on_hand("L3", flour(), units(5), 0)
            .with_tag("organic")
            .at(other);
        assert!(req.matches(&good));
        assert!(!req.matches(&untagged));
        assert!(!req.matches(&elsewhere));
    }

    #[test]
    fn plan_draws_fifo_across_lots() {
        let mut lots = SlotMap::<LotId, Lot>::with_key();
        let a = lots.insert(Lot::on_hand("A", flour(), units(30), 0));
        let b = lots.insert(Lot::on_hand("B", flour(), units(30), 5));
        let req = MaterialRequirement::new(flour(), units(45));
        let mut planned = BTreeMap::new();

        let draws = plan_draws(&lots, &[a, b], &req, &ctx(10), &mut planned)
            .unwrap()
            .unwrap();
        assert_eq!(
            draws,
            vec![
                Draw { lot: a, quantity: units(30) },
                Draw { lot: b, quantity: units(15) },
            ]
        );
        assert_eq!(planned[&b], units(15));

        // A second demand in the same placement sees the planned draws.
        let req2 = MaterialRequirement::new(flour(), units(20));
        assert_eq!(
            plan_draws(&lots, &[a, b], &req2, &ctx(10), &mut planned).unwrap(),
            None
        );
        // Nothing was touched.
        assert_eq!(lots[a].consumed(), units(0));
    }

    #[test]
    fn plan_draws_respects_explicit_set() {
        let mut lots = SlotMap::<LotId, Lot>::with_key();
        let a = lots.insert(Lot::on_hand("A", flour(), units(30), 0));
        let b = lots.insert(Lot::on_hand("B", flour(), units(30), 0));
        let set: BTreeSet<LotCode> = [LotCode::new("B")].into_iter().collect();
        let req = MaterialRequirement::new(flour(), units(10)).with_usability(Usability::ShelfLife {
            min_remaining: 0,
            eligible: Some(set),
        });
        let draws = plan_draws(&lots, &[a, b], &req, &ctx(0), &mut BTreeMap::new())
            .unwrap()
            .unwrap();
        assert_eq!(draws, vec![Draw { lot: b, quantity: units(10) }]);
    }

    #[test]
    fn inventory_quantity_tracks_lot() {
        let mut areas = SlotMap::<StorageAreaId, ()>::with_key();
        let tank = areas.insert(());
        let mut lots = SlotMap::<LotId, Lot>::with_key();
        let id = lots.insert(Lot::on_hand("A", flour(), units(100), 0).with_expiry(1000));
        let inv = Inventory::for_lot(id, &lots[id], tank);
        assert_eq!(inv.expires_at, Some(1000));
        assert!(inv.expires_at.unwrap() >= inv.produced_at);
        lots[id].consume(units(40), 999).unwrap();
        assert_eq!(inv.quantity(&lots), units(60));
    }
}

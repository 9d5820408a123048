//! End-to-end behaviour of the cycle core over a memory store

use bidloop_bridge::DryRunGateway;
use bidloop_core::prelude::*;
use bidloop_cycle::{CoreSettings, CycleServices, CycleSettings};
use bidloop_economics::{LedgerHold, RankTable, RankTier, ReferralCommissionEngine, ReferralRates, TeamRewardEngine};
use bidloop_storage::{
    AccountRepository, CycleRepository, EarningRepository, MemoryStore, NetworkRepository,
    PurchaseRepository,
};
use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal_macros::dec;
use std::sync::{Arc, Barrier};
use std::thread;

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    services: CycleServices,
}

fn harness() -> Harness {
    harness_with(CoreSettings::default())
}

fn harness_with(mut settings: CoreSettings) -> Harness {
    settings.cycle = CycleSettings {
        utc_offset_minutes: 0,
        open_time: "08:00:00".into(),
        ..settings.cycle
    };
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap(),
    ));
    let services = CycleServices::build(
        store.clone(),
        clock.clone(),
        Arc::new(DryRunGateway),
        settings,
    )
    .unwrap();
    Harness {
        store,
        clock,
        services,
    }
}

impl Harness {
    fn user(&self, name: &str, referrer: Option<&UserId>, balance: Decimal) -> UserId {
        let user = UserId::new(name);
        self.services
            .network
            .register_user(&user, referrer, None)
            .unwrap();
        if balance > Decimal::ZERO {
            self.services
                .deposits
                .record_deposit(&user, balance, &format!("dep-{name}"))
                .unwrap();
        }
        user
    }

    /// Current open cycle with `filled` preset
    fn open_cycle_filled(&self, filled: u32) -> Cycle {
        let mut cycle = self.services.manager.tick().unwrap();
        assert!(cycle.is_open());
        cycle.filled = filled;
        self.store.insert_cycle(cycle).unwrap()
    }

    fn assert_invariants(&self) {
        let cycles = self.store.cycles();
        assert!(cycles.iter().all(|c| c.filled <= c.capacity));
        assert!(cycles.iter().filter(|c| c.is_open()).count() <= 1);
    }
}

#[test]
fn scenario_a_purchase_fills_in_order() {
    let h = harness();
    let cycle = h.open_cycle_filled(0);
    assert_eq!(cycle.capacity, 5);
    let alice = h.user("alice", None, dec!(100));

    let outcome = h.services.purchases.purchase(&alice, &cycle.id, 3, Some(dec!(60))).unwrap();

    assert_eq!(outcome.receipt.cycle.filled, 3);
    let orders: Vec<u32> = outcome.receipt.purchases.iter().map(|p| p.order).collect();
    assert_eq!(orders, vec![1, 2, 3]);
    assert_eq!(outcome.total_cost, dec!(60));
    assert_eq!(h.store.balance(&alice).unwrap(), dec!(40));
    assert!(outcome.rollover.is_none());
    h.assert_invariants();
}

#[test]
fn scenario_b_over_capacity_rejected_without_effects() {
    let h = harness();
    let cycle = h.open_cycle_filled(3);
    let bob = h.user("bob", None, dec!(100));

    let err = h.services.purchases.purchase(&bob, &cycle.id, 3, None).unwrap_err();
    assert_eq!(err, BidError::CapacityExceeded { available: 2 });
    assert!(err.to_string().contains("Only 2 units available"));

    assert_eq!(h.store.cycle(&cycle.id).unwrap().filled, 3);
    assert_eq!(h.store.balance(&bob).unwrap(), dec!(100));
    assert!(h.store.purchases_for_user(&bob).is_empty());
}

#[test]
fn scenario_c_fill_closes_and_rolls_over() {
    let h = harness();
    let cycle = h.open_cycle_filled(2);
    let carol = h.user("carol", None, dec!(100));

    let outcome = h.services.purchases.purchase(&carol, &cycle.id, 3, None).unwrap();

    let rollover = outcome.rollover.expect("fill triggers rollover");
    assert_eq!(rollover.closed.id, cycle.id);
    assert_eq!(rollover.closed.status, CycleStatus::Closed);
    assert!(rollover.closed.close_time.is_some());

    let next = rollover.next.expect("next cycle opened");
    assert!(next.is_open());
    assert_eq!(next.capacity, 6);
    assert_eq!(h.store.open_cycle().unwrap().id, next.id);
    h.assert_invariants();
}

#[test]
fn scenario_d_referral_credit_and_hold() {
    let h = harness();
    let sponsor = h.user("sponsor", None, dec!(0));
    let buyer = h.user("buyer", Some(&sponsor), dec!(0));
    let store: Arc<dyn bidloop_storage::Store> = h.store.clone();
    let clock: Arc<dyn Clock> = h.clock.clone();
    let hold = Arc::new(LedgerHold::new(store.clone(), clock.clone()));
    let engine = ReferralCommissionEngine::new(store, hold, clock, ReferralRates(vec![dec!(5)]));

    let outcome = engine.distribute(&buyer, dec!(100), "inv-1").unwrap();
    assert_eq!(outcome.credited[0].amount, dec!(5.00));
    assert_eq!(outcome.credited[0].status, EarningStatus::Processed);
    assert_eq!(h.store.balance(&sponsor).unwrap(), dec!(5.00));

    h.store
        .modify_income_hold(&sponsor, &mut |hold| hold.referral_on_hold = true);
    let outcome = engine.distribute(&buyer, dec!(100), "inv-2").unwrap();
    assert_eq!(outcome.held[0].amount, dec!(5.00));
    assert_eq!(outcome.held[0].status, EarningStatus::Pending);
    assert_eq!(h.store.balance(&sponsor).unwrap(), dec!(5.00));
}

#[test]
fn scenario_e_rank_advance() {
    let h = harness();
    let leader = h.user("leader", None, dec!(0));
    let store: Arc<dyn bidloop_storage::Store> = h.store.clone();
    let clock: Arc<dyn Clock> = h.clock.clone();
    let hold = Arc::new(LedgerHold::new(store.clone(), clock.clone()));
    let engine = TeamRewardEngine::new(
        store,
        hold,
        clock,
        RankTable(vec![RankTier::new(1, dec!(2000), dec!(16.00))]),
        0,
    );

    engine.evaluate(&leader, dec!(1900)).unwrap();
    let evaluation = engine.evaluate(&leader, dec!(200)).unwrap();

    assert_eq!(evaluation.previous_rank, 0);
    assert_eq!(evaluation.business.rank_level, 1);
    assert_eq!(evaluation.business.volume, dec!(2100));
    let reward = evaluation.reward.unwrap();
    assert_eq!(reward.amount, dec!(16.00));
    assert_eq!(reward.kind, EarningKind::TeamReward);
    assert_eq!(h.store.balance(&leader).unwrap(), dec!(16.00));
}

#[test]
fn open_and_close_are_idempotent() {
    let h = harness();
    h.clock.set(Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).unwrap());
    let pending = h.services.manager.get_or_create_current_cycle().unwrap();
    assert_eq!(pending.status, CycleStatus::Pending);

    h.clock.advance(Duration::hours(3));
    let opened = h.services.manager.open_if_due(&pending.id).unwrap();
    assert!(opened.is_some());
    let before = h.store.cycles();
    assert!(h.services.manager.open_if_due(&pending.id).unwrap().is_none());
    assert_eq!(h.store.cycles(), before);

    let mut full = h.store.cycle(&pending.id).unwrap();
    full.filled = full.capacity;
    h.store.insert_cycle(full).unwrap();
    assert!(h.services.manager.close_if_filled(&pending.id).unwrap().is_some());
    let after_close = h.store.cycles();
    assert!(h.services.manager.close_if_filled(&pending.id).unwrap().is_none());
    assert_eq!(h.store.cycles(), after_close);
    h.assert_invariants();
}

#[test]
fn last_unit_race_has_exactly_one_winner() {
    let h = harness();
    let cycle = h.open_cycle_filled(4);
    let racers: Vec<UserId> = (0..8)
        .map(|i| h.user(&format!("racer{i}"), None, dec!(20)))
        .collect();

    let barrier = Arc::new(Barrier::new(racers.len()));
    let handles: Vec<_> = racers
        .into_iter()
        .map(|user| {
            let purchases = h.services.purchases.clone();
            let barrier = barrier.clone();
            let cycle_id = cycle.id;
            thread::spawn(move || {
                barrier.wait();
                purchases.purchase(&user, &cycle_id, 1, None)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(matches!(
            err,
            BidError::CapacityExceeded { available: 0 } | BidError::CycleNotOpen { .. }
        ));
    }
    assert_eq!(h.store.cycle(&cycle.id).unwrap().filled, 5);
    h.assert_invariants();
}

#[test]
fn purchase_conserves_balance_exactly() {
    let h = harness();
    let cycle = h.open_cycle_filled(0);
    let user = h.user("dana", None, dec!(100.10));
    let before = h.store.balance(&user).unwrap();

    let outcome = h.services.purchases.purchase(&user, &cycle.id, 2, None).unwrap();
    assert_eq!(outcome.receipt.balance_before, before);
    assert_eq!(before - outcome.total_cost, outcome.receipt.balance_after);
    assert_eq!(h.store.balance(&user).unwrap(), dec!(60.10));
}

#[test]
fn insufficient_balance_reports_amounts() {
    let h = harness();
    let cycle = h.open_cycle_filled(0);
    let user = h.user("erin", None, dec!(30));
    let err = h.services.purchases.purchase(&user, &cycle.id, 2, None).unwrap_err();
    assert_eq!(
        err,
        BidError::InsufficientBalance {
            required: dec!(40),
            available: dec!(30)
        }
    );
    assert_eq!(h.store.cycle(&cycle.id).unwrap().filled, 0);
}

#[test]
fn fill_runs_pipeline_once_per_unit() {
    let mut settings = CoreSettings::default();
    settings.distribution.referral_rates = ReferralRates(vec![dec!(5)]);
    let h = harness_with(settings);
    let cycle = h.open_cycle_filled(0);
    let sponsor = h.user("sponsor", None, dec!(0));
    let buyer = h.user("buyer", Some(&sponsor), dec!(200));

    h.services.purchases.purchase(&buyer, &cycle.id, 5, None).unwrap();
    // five units of 20 at 5% through the fill-triggered run
    assert_eq!(h.store.balance(&sponsor).unwrap(), dec!(5.00));

    let report = h.services.pipeline.run_catch_up();
    assert_eq!(report.referrals.processed, 0);
    assert_eq!(h.store.balance(&sponsor).unwrap(), dec!(5.00));
    assert_eq!(h.store.earnings_for(&sponsor).len(), 5);
}

#[test]
fn matured_units_pay_returns_and_may_apply_hold() {
    let h = harness();
    let cycle = h.open_cycle_filled(0);
    let user = h.user("frank", None, dec!(40));
    h.services.purchases.purchase(&user, &cycle.id, 2, None).unwrap();
    assert_eq!(h.store.income_hold(&user).baseline_unit_count, 2);

    h.clock.advance(Duration::days(5));
    let report = h.services.pipeline.run_catch_up();
    assert_eq!(report.returns.processed, 2);
    assert_eq!(h.store.balance(&user).unwrap(), dec!(46.00));
    assert_eq!(h.store.active_units(&user), 0);
    // fewer active units than before puts referral income on hold
    assert!(h.store.income_hold(&user).referral_on_hold);
    assert_eq!(
        h.store.user_cycles(&user)[0].status,
        UserCycleStatus::Completed
    );
}

#[test]
fn reopen_recovers_improper_close() {
    let h = harness();
    let cycle = h.open_cycle_filled(2);
    let mut broken = h.store.cycle(&cycle.id).unwrap();
    broken.status = CycleStatus::Closed;
    broken.close_time = Some(h.clock.now());
    h.store.insert_cycle(broken).unwrap();
    assert!(!h.services.diagnose().is_healthy());

    let reopened = h.services.manager.recover_improperly_closed_cycles().unwrap();
    assert_eq!(reopened.id, cycle.id);
    assert!(reopened.is_open());
    assert!(h.services.diagnose().is_healthy());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn capacity_invariant_holds(quantities in proptest::collection::vec(-1i64..8, 1..30)) {
        let h = harness();
        h.open_cycle_filled(0);
        let user = h.user("prop", None, dec!(100000));

        for q in quantities {
            let Some(open) = h.store.open_cycle() else { break };
            let before = h.store.balance(&user).unwrap();
            match h.services.purchases.purchase(&user, &open.id, q, None) {
                Ok(outcome) => {
                    prop_assert_eq!(before - outcome.total_cost, outcome.receipt.balance_after);
                }
                Err(_) => {
                    prop_assert_eq!(h.store.balance(&user).unwrap(), before);
                }
            }
            let cycles = h.store.cycles();
            prop_assert!(cycles.iter().all(|c| c.filled <= c.capacity));
            prop_assert!(cycles.iter().filter(|c| c.is_open()).count() <= 1);
        }
    }
}

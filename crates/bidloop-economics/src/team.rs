//! Team business volume and rank rewards
//!
//! Each qualifying user accumulates the volume invested beneath them. Crossing
//! a rank threshold pays that rank's reward once; ranks never go backwards and
//! several ranks can be skipped in one step (only the highest is paid).
//!
//! ## Default ranks
//!
//! | Rank | Volume | Reward |
//! |------|--------|--------|
//! | 1 | 2,000 | 16 |
//! | 2 | 10,000 | 35 |
//! | 3 | 25,000 | 60 |
//! | 4 | 75,000 | 100 |
//! | 5 | 300,000 | 300 |
//! | 6 | 1,000,000 | 1,000 |
//! | 7 | 4,000,000 | 4,000 |
//! | 8 | 15,000,000 | 15,000 |
//! | 9 | 75,000,000 | 75,000 |
//! | 10 | 250,000,000 | 250,000 |
//! | 11 | 1,000,000,000 | 1,000,000 |
//! | 12 | 2,147,483,647 | 1,500,000 |

use crate::constants::MAX_UPLINE_LEVELS;
use crate::hold::LedgerHold;
use crate::upline::walk_upline;
use bidloop_core::prelude::*;
use bidloop_storage::Store;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankTier {
    pub level: u8,
    /// Business volume needed to reach this rank
    pub volume_required: Decimal,
    /// One-off reward paid on reaching it
    pub reward: Decimal,
}

impl RankTier {
    pub fn new(level: u8, volume_required: Decimal, reward: Decimal) -> Self {
        Self {
            level,
            volume_required,
            reward,
        }
    }
}

/// Rank thresholds, ascending
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankTable(pub Vec<RankTier>);

impl RankTable {
    /// Highest rank above `current` whose requirement `volume` meets
    pub fn highest_attainable(&self, current: u8, volume: Decimal) -> Option<&RankTier> {
        self.0
            .iter()
            .filter(|tier| tier.level > current && tier.volume_required <= volume)
            .last()
    }

    pub fn tier(&self, level: u8) -> Option<&RankTier> {
        self.0.iter().find(|t| t.level == level)
    }

    /// Levels, requirements and rewards must all strictly increase
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(BidError::Config("rank table is empty".into()));
        }
        for pair in self.0.windows(2) {
            let (lo, hi) = (&pair[0], &pair[1]);
            if hi.level <= lo.level
                || hi.volume_required <= lo.volume_required
                || hi.reward <= lo.reward
            {
                return Err(BidError::Config(format!(
                    "rank {} must exceed rank {} in level, volume and reward",
                    hi.level, lo.level
                )));
            }
        }
        Ok(())
    }
}

impl Default for RankTable {
    fn default() -> Self {
        Self(vec![
            RankTier::new(1, dec!(2000), dec!(16)),
            RankTier::new(2, dec!(10000), dec!(35)),
            RankTier::new(3, dec!(25000), dec!(60)),
            RankTier::new(4, dec!(75000), dec!(100)),
            RankTier::new(5, dec!(300000), dec!(300)),
            RankTier::new(6, dec!(1000000), dec!(1000)),
            RankTier::new(7, dec!(4000000), dec!(4000)),
            RankTier::new(8, dec!(15000000), dec!(15000)),
            RankTier::new(9, dec!(75000000), dec!(75000)),
            RankTier::new(10, dec!(250000000), dec!(250000)),
            RankTier::new(11, dec!(1000000000), dec!(1000000)),
            RankTier::new(12, dec!(2147483647), dec!(1500000)),
        ])
    }
}

/// Result of one `evaluate` call
#[derive(Clone, Debug, PartialEq)]
pub struct TeamEvaluation {
    pub business: TeamBusiness,
    pub previous_rank: u8,
    /// Reward earning when the rank advanced
    pub reward: Option<Earning>,
}

impl TeamEvaluation {
    pub fn rank_changed(&self) -> bool {
        self.business.rank_level > self.previous_rank
    }
}

pub struct TeamRewardEngine {
    store: Arc<dyn Store>,
    hold: Arc<LedgerHold>,
    clock: Arc<dyn Clock>,
    ranks: RankTable,
    min_active_legs: u32,
}

impl TeamRewardEngine {
    pub fn new(
        store: Arc<dyn Store>,
        hold: Arc<LedgerHold>,
        clock: Arc<dyn Clock>,
        ranks: RankTable,
        min_active_legs: u32,
    ) -> Self {
        Self {
            store,
            hold,
            clock,
            ranks,
            min_active_legs,
        }
    }

    pub fn ranks(&self) -> &RankTable {
        &self.ranks
    }

    /// Add volume to `user` and pay a rank reward if a new rank is reached
    pub fn evaluate(&self, user: &UserId, additional_volume: Decimal) -> Result<TeamEvaluation> {
        let now = self.clock.now();
        let mut previous_rank = 0;
        let mut advanced: Option<RankTier> = None;

        let business = self.store.modify_team_business(user, &mut |business| {
            previous_rank = business.rank_level;
            business.volume += additional_volume.max(Decimal::ZERO);
            if let Some(tier) = self
                .ranks
                .highest_attainable(business.rank_level, business.volume)
            {
                business.rank_level = tier.level;
                advanced = Some(tier.clone());
            }
            business.last_calculated_at = Some(now);
        });

        let Some(tier) = advanced else {
            return Ok(TeamEvaluation {
                business,
                previous_rank,
                reward: None,
            });
        };

        let status = if self.hold.is_team_eligible(user) {
            EarningStatus::Processed
        } else {
            EarningStatus::Pending
        };
        let earning = self.store.record_earning(Earning::new(
            user.clone(),
            format!("rank-{}", tier.level),
            tier.reward,
            EarningKind::TeamReward,
            Some(tier.level),
            status,
            now,
        ))?;

        info!(
            user_id = %user,
            from = previous_rank,
            to = tier.level,
            reward = %tier.reward,
            held = status == EarningStatus::Pending,
            "Team rank advanced"
        );
        self.store.append_event(SystemEvent::info(
            now,
            EventKind::RankAdvanced,
            user,
            format!(
                "rank {previous_rank} -> {} at volume {}",
                tier.level, business.volume
            ),
        ));

        Ok(TeamEvaluation {
            business,
            previous_rank,
            reward: Some(earning),
        })
    }

    /// Credit `amount` of volume to every qualifying ancestor of `user`
    ///
    /// Ancestors qualify with at least `min_active_legs` active direct legs.
    /// One failing ancestor does not stop the others.
    pub fn credit_upline_volume(&self, user: &UserId, amount: Decimal) -> Vec<TeamEvaluation> {
        let upline = walk_upline(self.store.as_ref(), user, MAX_UPLINE_LEVELS);
        let mut evaluations = Vec::new();
        for (_, ancestor) in upline.ancestors {
            if self.store.legs(&ancestor).active_legs < self.min_active_legs {
                continue;
            }
            match self.evaluate(&ancestor, amount) {
                Ok(evaluation) => evaluations.push(evaluation),
                Err(e) => warn!(user_id = %ancestor, error = %e, "Team volume evaluation failed"),
            }
        }
        evaluations
    }
}

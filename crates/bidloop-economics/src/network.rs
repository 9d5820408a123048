//! Referral network registration and leg bookkeeping

use bidloop_core::prelude::*;
use bidloop_storage::Store;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ReferralNetwork {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ReferralNetwork {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create an account, optionally under `referrer`
    pub fn register_user(
        &self,
        user: &UserId,
        referrer: Option<&UserId>,
        payout_address: Option<String>,
    ) -> Result<Account> {
        if !user.is_valid() {
            return Err(BidError::UserNotFound(user.clone()));
        }
        if let Some(referrer) = referrer {
            if referrer == user {
                return Err(BidError::ReferralLoop {
                    user: user.clone(),
                    referrer: referrer.clone(),
                });
            }
            // referrer must exist before anyone can join under them
            self.store.account(referrer)?;
        }

        let account = Account {
            user_id: user.clone(),
            balance: Decimal::ZERO,
            payout_address,
            created_at: self.clock.now(),
        };
        self.store.create_account(account.clone())?;

        if let Some(referrer) = referrer {
            let depth = self
                .store
                .upline_link(referrer)
                .map(|l| l.depth + 1)
                .unwrap_or(1);
            self.store.insert_link(UplineLink {
                user_id: user.clone(),
                referrer_id: referrer.clone(),
                depth,
            })?;
            let legs = self.store.adjust_legs(referrer, 1, 0);
            debug!(referrer = %referrer, total_legs = legs.total_legs, "Leg added");
        }

        info!(user_id = %user, referrer = ?referrer.map(UserId::as_str), "User registered");
        Ok(account)
    }

    /// Keep the direct referrer's active leg count in step with `user`'s units
    pub fn on_active_units_changed(&self, user: &UserId, before: u32, after: u32) -> Option<LegsCounter> {
        let delta = match (before, after) {
            (0, a) if a > 0 => 1,
            (b, 0) if b > 0 => -1,
            _ => return None,
        };
        let link = self.store.upline_link(user)?;
        let legs = self.store.adjust_legs(&link.referrer_id, 0, delta);
        debug!(
            referrer = %link.referrer_id,
            active_legs = legs.active_legs,
            "Active legs updated"
        );
        Some(legs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidloop_storage::{MemoryStore, NetworkRepository};

    fn network() -> (Arc<MemoryStore>, ReferralNetwork) {
        let store = Arc::new(MemoryStore::new());
        let net = ReferralNetwork::new(store.clone(), Arc::new(SystemClock));
        (store, net)
    }

    #[test]
    fn test_register_builds_depth_and_legs() {
        let (store, net) = network();
        let root = UserId::new("root");
        let mid = UserId::new("mid");
        let leaf = UserId::new("leaf");
        net.register_user(&root, None, None).unwrap();
        net.register_user(&mid, Some(&root), None).unwrap();
        net.register_user(&leaf, Some(&mid), Some("0xleaf".into())).unwrap();

        assert_eq!(store.upline_link(&mid).unwrap().depth, 1);
        assert_eq!(store.upline_link(&leaf).unwrap().depth, 2);
        assert_eq!(store.legs(&root).total_legs, 1);
        assert_eq!(store.direct_referrals(&mid), vec![leaf]);
    }

    #[test]
    fn test_unknown_referrer_rejected() {
        let (_, net) = network();
        let err = net
            .register_user(&UserId::new("a"), Some(&UserId::new("nobody")), None)
            .unwrap_err();
        assert!(matches!(err, BidError::UserNotFound(_)));
    }

    #[test]
    fn test_active_legs_follow_units() {
        let (store, net) = network();
        let root = UserId::new("root");
        let child = UserId::new("child");
        net.register_user(&root, None, None).unwrap();
        net.register_user(&child, Some(&root), None).unwrap();

        assert!(net.on_active_units_changed(&child, 0, 3).is_some());
        assert_eq!(store.legs(&root).active_legs, 1);
        assert!(net.on_active_units_changed(&child, 3, 5).is_none());
        net.on_active_units_changed(&child, 5, 0);
        assert_eq!(store.legs(&root).active_legs, 0);
    }
}

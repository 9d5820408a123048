//! Bounded upline walk

use bidloop_core::prelude::*;
use bidloop_storage::Store;
use std::collections::HashSet;

/// Ancestors of a user, nearest first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Upline {
    /// `(level, ancestor)` with level 1 being the direct referrer
    pub ancestors: Vec<(u8, UserId)>,
    /// A link pointed back into the chain already walked
    pub loop_detected: bool,
}

/// Walk referrer links upward from `user`, at most `max_levels` deep
pub fn walk_upline(store: &dyn Store, user: &UserId, max_levels: u8) -> Upline {
    let mut upline = Upline::default();
    let mut seen: HashSet<UserId> = HashSet::new();
    seen.insert(user.clone());

    let mut current = user.clone();
    for level in 1..=max_levels {
        let Some(link) = store.upline_link(&current) else {
            break;
        };
        if !seen.insert(link.referrer_id.clone()) {
            upline.loop_detected = true;
            break;
        }
        upline.ancestors.push((level, link.referrer_id.clone()));
        current = link.referrer_id;
    }
    upline
}

//! Subscription matching
//!
//! The one predicate shared by live broadcast and history replay.

use crate::types::{Share, Subscription};

/// Whether `share` belongs to `subscription`
pub fn share_matches(share: &Share, subscription: &Subscription) -> bool {
    let Some(address) = share.address.as_deref() else {
        return false;
    };
    if address != subscription.address {
        return false;
    }

    match subscription.worker.as_deref() {
        Some(wanted) => share.worker.as_deref() == Some(wanted),
        None => true,
    }
}

//! Deciding whether a changed filter set must be resent to a relay.
//!
//! Clients advance `since` continuously as they catch up. Resending on every
//! advance would storm relays with REQs that ask for nothing new, so a
//! forward-moving `since` is not a change. Anything else is.

use crate::filter::Filter;

/// Returns true if a relay currently serving `old` must be sent `new`.
///
/// Rules, applied position by position:
/// 1. Different lengths always resend.
/// 2. Any field other than `since` differing resends.
/// 3. `since` appearing where there was none resends (the relay would keep
///    replaying history the client no longer wants).
/// 4. `since` moving backward resends (a forward-only cursor cannot express
///    "also replay earlier data").
/// 5. `since` moving forward, staying put, or being dropped does not resend.
pub fn needs_resend(old: &[Filter], new: &[Filter]) -> bool {
    if old.len() != new.len() {
        return true;
    }

    old.iter().zip(new).any(|(o, n)| filter_changed(o, n))
}

fn filter_changed(old: &Filter, new: &Filter) -> bool {
    if !old.eq_ignoring_since(new) {
        return true;
    }

    match (old.since, new.since) {
        (None, Some(_)) => true,
        (Some(old_since), Some(new_since)) => old_since > new_since,
        _ => false,
    }
}

//! Publisher-confirm tracking
//!
//! The ledger maps outstanding delivery tags to the messages they carry.
//! A confirmation with the cumulative flag resolves every outstanding tag up
//! to and including the given one; otherwise only the exact tag. Every
//! published message is in exactly one of {unconfirmed, confirmed-and-
//! discarded, nacked}.

use std::collections::BTreeMap;

use crate::message::OutboundMessage;

// ----------------------------------------------------------------------------
// Confirm Ledger
// ----------------------------------------------------------------------------

/// Tracks unconfirmed messages by delivery tag
#[derive(Debug, Default)]
pub struct ConfirmLedger {
    /// Outstanding tags in ascending order
    pending: BTreeMap<u64, OutboundMessage>,
    /// Nacked messages kept for diagnostics and leftovers
    nacked: Vec<OutboundMessage>,
    confirmed: u64,
}

impl ConfirmLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly published message under its delivery tag
    pub fn register(&mut self, tag: u64, message: OutboundMessage) {
        self.pending.insert(tag, message);
    }

    /// Apply an ack or nack from the broker.
    ///
    /// With `multiple` set, resolves every outstanding tag ≤ `tag`;
    /// otherwise only the exact tag. Acked messages are discarded, nacked
    /// ones move to the diagnostic nacked list. Returns how many tags were
    /// resolved; an unknown single tag resolves nothing and is tolerated.
    pub fn apply(&mut self, tag: u64, multiple: bool, ack: bool) -> usize {
        let resolved: Vec<OutboundMessage> = if multiple {
            let keep = self.pending.split_off(&(tag + 1));
            let taken = std::mem::replace(&mut self.pending, keep);
            taken.into_values().collect()
        } else {
            self.pending.remove(&tag).into_iter().collect()
        };

        let count = resolved.len();
        if ack {
            self.confirmed += count as u64;
        } else {
            self.nacked.extend(resolved);
        }
        count
    }

    /// Remove a registration without counting it confirmed or nacked.
    ///
    /// Used when the publish call itself failed after the tag was assigned:
    /// the message goes back onto the outbound queue instead.
    pub fn remove(&mut self, tag: u64) -> Option<OutboundMessage> {
        self.pending.remove(&tag)
    }

    /// Number of outstanding (unconfirmed) messages
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Point-in-time copy of the outstanding tags and messages
    pub fn snapshot(&self) -> Vec<(u64, OutboundMessage)> {
        self.pending
            .iter()
            .map(|(tag, msg)| (*tag, msg.clone()))
            .collect()
    }

    /// Drain every outstanding message, in tag order, for republication
    /// after a reconnect. The caller resets its delivery-tag counter.
    pub fn drain_pending(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.pending).into_values().collect()
    }

    /// Messages nacked so far, for diagnostics
    pub fn nacked(&self) -> &[OutboundMessage] {
        &self.nacked
    }

    /// Take ownership of the nacked list, e.g. when assembling leftovers
    pub fn take_nacked(&mut self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.nacked)
    }

    /// Messages confirmed and discarded so far
    pub fn confirmed_count(&self) -> u64 {
        self.confirmed
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RoutingKey;
    use serde_json::json;

    fn msg(n: u64) -> OutboundMessage {
        OutboundMessage::new(json!({ "n": n }), RoutingKey::new("test", "msg", "certified"))
    }

    fn ledger_with(tags: &[u64]) -> ConfirmLedger {
        let mut ledger = ConfirmLedger::new();
        for &tag in tags {
            ledger.register(tag, msg(tag));
        }
        ledger
    }

    #[test]
    fn test_single_ack_resolves_exact_tag() {
        let mut ledger = ledger_with(&[1, 2, 3]);
        assert_eq!(ledger.apply(2, false, true), 1);
        assert_eq!(ledger.pending_count(), 2);
        let tags: Vec<u64> = ledger.snapshot().into_iter().map(|(t, _)| t).collect();
        assert_eq!(tags, vec![1, 3]);
        assert_eq!(ledger.confirmed_count(), 1);
    }

    #[test]
    fn test_cumulative_ack_resolves_up_to_tag() {
        let mut ledger = ledger_with(&[1, 2, 3, 4, 5]);
        assert_eq!(ledger.apply(3, true, true), 3);
        let tags: Vec<u64> = ledger.snapshot().into_iter().map(|(t, _)| t).collect();
        assert_eq!(tags, vec![4, 5]);
        assert_eq!(ledger.confirmed_count(), 3);
        assert!(ledger.nacked().is_empty());
    }

    #[test]
    fn test_nack_moves_to_diagnostic_list() {
        let mut ledger = ledger_with(&[1, 2, 3]);
        assert_eq!(ledger.apply(2, true, false), 2);
        assert_eq!(ledger.pending_count(), 1);
        assert_eq!(ledger.nacked().len(), 2);
        assert_eq!(ledger.confirmed_count(), 0);
    }

    #[test]
    fn test_unknown_single_tag_is_tolerated() {
        let mut ledger = ledger_with(&[1, 2]);
        assert_eq!(ledger.apply(7, false, true), 0);
        assert_eq!(ledger.pending_count(), 2);
    }

    #[test]
    fn test_drain_pending_preserves_tag_order() {
        let mut ledger = ledger_with(&[3, 1, 2]);
        let drained = ledger.drain_pending();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].payload, json!({ "n": 1 }));
        assert_eq!(drained[2].payload, json!({ "n": 3 }));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let mut ledger = ledger_with(&[1, 2]);
        let snapshot = ledger.snapshot();
        ledger.apply(2, true, true);
        assert_eq!(snapshot.len(), 2);
        assert_eq!(ledger.pending_count(), 0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Cumulative resolution removes exactly the outstanding tags
            /// ≤ the confirmed tag, and every message ends up in exactly
            /// one of {pending, confirmed, nacked}.
            #[test]
            fn cumulative_partition(
                tags in proptest::collection::btree_set(1u64..200, 1..40),
                confirm_tag in 1u64..200,
                ack in any::<bool>(),
            ) {
                let tags: Vec<u64> = tags.into_iter().collect();
                let mut ledger = ledger_with(&tags);
                let total = tags.len();

                let resolved = ledger.apply(confirm_tag, true, ack);
                let expected = tags.iter().filter(|&&t| t <= confirm_tag).count();
                prop_assert_eq!(resolved, expected);

                let accounted = ledger.pending_count()
                    + ledger.confirmed_count() as usize
                    + ledger.nacked().len();
                prop_assert_eq!(accounted, total);
                for (tag, _) in ledger.snapshot() {
                    prop_assert!(tag > confirm_tag);
                }
            }
        }
    }
}

//! Pending-message ledger for rtwire.
//!
//! Tracks outbound messages that were handed to a transport and still wait
//! for the server to acknowledge them. Entries are ordered by serial and are
//! always contiguous, so every resolution removes a prefix:
//!
//! 1. the caller reads [`PendingLedger::next_serial`], stamps the message and
//!    hands it to the transport
//! 2. `push()` records it under that serial
//! 3. `ack()` / `nack()` / `reset()` remove a prefix and hand the entries back
//!
//! Because resolved entries leave the ledger before they are returned, a
//! duplicate server report finds nothing to resolve.

use std::collections::VecDeque;

use thiserror::Error;

/// Error type for ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The pushed serial is not the next one.
    #[error("out of order push: expected serial {expected}, got {got}")]
    OutOfOrder {
        /// Serial the ledger expected.
        expected: u64,
        /// Serial that was pushed.
        got: u64,
    },
}

/// A message awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage<T> {
    /// Serial the message was sent with.
    pub serial: u64,
    /// Whatever the caller needs to complete the message.
    pub item: T,
}

/// Entries removed by an ack.
#[derive(Debug)]
pub struct Resolution<T> {
    /// Entries the server acknowledged.
    pub acked: Vec<T>,
    /// Entries older than the acked serial, treated as lost.
    pub nacked: Vec<T>,
}

impl<T> Resolution<T> {
    /// Whether nothing was resolved.
    pub fn is_empty(&self) -> bool {
        self.acked.is_empty() && self.nacked.is_empty()
    }
}

/// Ordered record of sent-but-unacknowledged messages.
#[derive(Debug)]
pub struct PendingLedger<T> {
    entries: VecDeque<PendingMessage<T>>,
    next_serial: u64,
    base_serial: u64,
}

impl<T> PendingLedger<T> {
    /// Create an empty ledger starting at serial zero.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_serial: 0,
            base_serial: 0,
        }
    }

    /// Serial to assign to the next message.
    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    /// Serial of the oldest unresolved entry, or `next_serial` when empty.
    pub fn base_serial(&self) -> u64 {
        self.base_serial
    }

    /// Record a message sent with `serial`.
    ///
    /// `serial` must equal [`next_serial`](Self::next_serial).
    pub fn push(&mut self, serial: u64, item: T) -> Result<(), LedgerError> {
        if serial != self.next_serial {
            return Err(LedgerError::OutOfOrder {
                expected: self.next_serial,
                got: serial,
            });
        }
        if self.entries.is_empty() {
            self.base_serial = serial;
        }
        self.entries.push_back(PendingMessage { serial, item });
        self.next_serial += 1;
        Ok(())
    }

    /// Resolve `count` entries starting at `serial` as acknowledged.
    ///
    /// Entries older than `serial` are implicitly nacked: the server's serial
    /// is authoritative.
    pub fn ack(&mut self, serial: u64, count: u32) -> Resolution<T> {
        let (nacked, acked) = self.resolve(serial, count);
        Resolution { acked, nacked }
    }

    /// Resolve `count` entries starting at `serial`, and everything older, as
    /// failed.
    pub fn nack(&mut self, serial: u64, count: u32) -> Vec<T> {
        let (mut nacked, rest) = self.resolve(serial, count);
        nacked.extend(rest);
        nacked
    }

    /// Fail every entry below `up_to` and restart the serial space at zero.
    ///
    /// Used when a resume lands on a different connection. Entries at or
    /// beyond `up_to` keep their order and are renumbered from zero.
    pub fn reset(&mut self, up_to: u64) -> Vec<T> {
        let below = up_to
            .saturating_sub(self.base_serial)
            .min(self.entries.len() as u64) as usize;
        let failed = self.entries.drain(..below).map(|e| e.item).collect();

        for (serial, entry) in self.entries.iter_mut().enumerate() {
            entry.serial = serial as u64;
        }
        self.base_serial = 0;
        self.next_serial = self.entries.len() as u64;
        failed
    }

    /// Remove every entry, keeping the serial counter.
    pub fn drain(&mut self) -> Vec<T> {
        self.base_serial = self.next_serial;
        self.entries.drain(..).map(|e| e.item).collect()
    }

    /// Continue a recovered connection's serial space at `serial`.
    ///
    /// Any leftover entries are removed and returned.
    pub fn continue_from(&mut self, serial: u64) -> Vec<T> {
        let leftovers = self.entries.drain(..).map(|e| e.item).collect();
        self.next_serial = serial;
        self.base_serial = serial;
        leftovers
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serials currently pending, oldest first.
    pub fn serials(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.serial).collect()
    }

    /// Split off the prefix before `serial` and the `count` entries from it.
    fn resolve(&mut self, serial: u64, count: u32) -> (Vec<T>, Vec<T>) {
        let mut serial = serial;
        let mut count = u64::from(count);

        // Overlap with already-resolved serials is dropped.
        if serial < self.base_serial {
            count = count.saturating_sub(self.base_serial - serial);
            serial = self.base_serial;
        }

        let len = self.entries.len() as u64;
        let skipped = (serial - self.base_serial).min(len) as usize;
        let before: Vec<T> = self.entries.drain(..skipped).map(|e| e.item).collect();

        let taken = count.min(self.entries.len() as u64) as usize;
        let resolved: Vec<T> = self.entries.drain(..taken).map(|e| e.item).collect();

        self.base_serial = self
            .entries
            .front()
            .map_or(self.next_serial, |e| e.serial);
        (before, resolved)
    }
}

impl<T> Default for PendingLedger<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A ledger holding serials `0..n`, each item being its own serial.
    fn ledger_with(n: u64) -> PendingLedger<u64> {
        let mut ledger = PendingLedger::new();
        for serial in 0..n {
            ledger.push(serial, serial).unwrap();
        }
        ledger
    }

    #[test]
    fn push_requires_next_serial() {
        let mut ledger = PendingLedger::new();
        ledger.push(0, "a").unwrap();

        let err = ledger.push(5, "b").unwrap_err();
        assert_eq!(err, LedgerError::OutOfOrder { expected: 1, got: 5 });
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.next_serial(), 1);
    }

    #[test]
    fn ack_resolves_prefix() {
        let mut ledger = ledger_with(3);

        let resolution = ledger.ack(0, 2);

        assert_eq!(resolution.acked, vec![0, 1]);
        assert!(resolution.nacked.is_empty());
        assert_eq!(ledger.serials(), vec![2]);
        assert_eq!(ledger.base_serial(), 2);
    }

    #[test]
    fn ack_past_base_nacks_older_entries() {
        let mut ledger = ledger_with(8);
        ledger.ack(0, 5);
        assert_eq!(ledger.serials(), vec![5, 6, 7]);

        let resolution = ledger.ack(6, 1);

        assert_eq!(resolution.nacked, vec![5]);
        assert_eq!(resolution.acked, vec![6]);
        assert_eq!(ledger.serials(), vec![7]);
    }

    #[test]
    fn duplicate_ack_is_a_no_op() {
        let mut ledger = ledger_with(3);

        let first = ledger.ack(0, 2);
        let second = ledger.ack(0, 2);

        assert_eq!(first.acked, vec![0, 1]);
        assert!(second.is_empty());
        assert_eq!(ledger.serials(), vec![2]);
    }

    #[test]
    fn ack_overlapping_resolved_serials_only_takes_new_ones() {
        let mut ledger = ledger_with(4);
        ledger.ack(0, 2);

        let resolution = ledger.ack(0, 3);

        assert_eq!(resolution.acked, vec![2]);
        assert!(resolution.nacked.is_empty());
        assert_eq!(ledger.serials(), vec![3]);
    }

    #[test]
    fn ack_count_beyond_ledger_is_clamped() {
        let mut ledger = ledger_with(2);

        let resolution = ledger.ack(1, 10);

        assert_eq!(resolution.nacked, vec![0]);
        assert_eq!(resolution.acked, vec![1]);
        assert!(ledger.is_empty());
        assert_eq!(ledger.base_serial(), 2);
    }

    #[test]
    fn ack_beyond_next_serial_nacks_everything() {
        let mut ledger = ledger_with(2);

        let resolution = ledger.ack(9, 1);

        assert_eq!(resolution.nacked, vec![0, 1]);
        assert!(resolution.acked.is_empty());
        assert!(ledger.is_empty());
    }

    #[test]
    fn nack_fails_prefix_and_range() {
        let mut ledger = ledger_with(4);

        let failed = ledger.nack(1, 2);

        assert_eq!(failed, vec![0, 1, 2]);
        assert_eq!(ledger.serials(), vec![3]);
    }

    #[test]
    fn duplicate_nack_is_a_no_op() {
        let mut ledger = ledger_with(2);

        assert_eq!(ledger.nack(0, 2), vec![0, 1]);
        assert!(ledger.nack(0, 2).is_empty());
    }

    #[test]
    fn ack_on_empty_ledger_is_a_no_op() {
        let mut ledger: PendingLedger<u64> = PendingLedger::new();
        assert!(ledger.ack(0, 1).is_empty());
        assert_eq!(ledger.next_serial(), 0);
    }

    #[test]
    fn reset_fails_everything_below_and_restarts_at_zero() {
        let mut ledger = ledger_with(3);
        ledger.ack(0, 1);

        let failed = ledger.reset(3);

        assert_eq!(failed, vec![1, 2]);
        assert!(ledger.is_empty());
        assert_eq!(ledger.next_serial(), 0);
        assert_eq!(ledger.base_serial(), 0);

        ledger.push(0, 100).unwrap();
        assert_eq!(ledger.ack(0, 1).acked, vec![100]);
    }

    #[test]
    fn reset_renumbers_entries_at_or_beyond_the_limit() {
        let mut ledger = ledger_with(4);

        let failed = ledger.reset(2);

        assert_eq!(failed, vec![0, 1]);
        assert_eq!(ledger.serials(), vec![0, 1]);
        assert_eq!(ledger.next_serial(), 2);
    }

    #[test]
    fn drain_keeps_serial_counter() {
        let mut ledger = ledger_with(3);

        assert_eq!(ledger.drain(), vec![0, 1, 2]);
        assert_eq!(ledger.next_serial(), 3);
        assert_eq!(ledger.base_serial(), 3);
        ledger.push(3, 3).unwrap();
    }

    #[test]
    fn continue_from_moves_serial_space() {
        let mut ledger: PendingLedger<u64> = PendingLedger::new();

        assert!(ledger.continue_from(42).is_empty());
        assert_eq!(ledger.next_serial(), 42);
        ledger.push(42, 7).unwrap();
        assert_eq!(ledger.ack(42, 1).acked, vec![7]);
    }
}

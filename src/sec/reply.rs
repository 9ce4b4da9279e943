//! Outstanding method-call tracking.
//!
//! A fixed-size slot table: each outgoing method call that expects a
//! reply reserves a slot holding its serial, message id, deadline, and
//! the unique name the reply must come from. Slots are uniquely keyed
//! by serial; a serial is reusable only after its slot is cleared.

use crate::error::{BusError, Result};
use crate::types::{Timer, NUM_REPLY_CONTEXTS};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReplyContext {
    pub serial: u32,
    pub message_id: u32,
    pub timeout: Duration,
    pub call_time: Timer,
    /// Unique name of the peer the call went to; replies to encrypted
    /// calls must come from exactly this sender.
    pub unique_name: String,
}

#[derive(Debug, Default)]
pub struct ReplyContextTable {
    slots: Vec<Option<ReplyContext>>,
}

impl ReplyContextTable {
    pub fn new() -> ReplyContextTable {
        ReplyContextTable { slots: vec![None; NUM_REPLY_CONTEXTS] }
    }

    /// Reserve a slot for an outgoing call.
    pub fn alloc(
        &mut self,
        serial: u32,
        message_id: u32,
        timeout: Duration,
        unique_name: &str,
    ) -> Result<()> {
        debug_assert!(serial != 0);
        let free = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(BusError::Resources)?;
        *free = Some(ReplyContext {
            serial,
            message_id,
            timeout,
            call_time: Timer::start(),
            unique_name: unique_name.to_string(),
        });
        Ok(())
    }

    /// Claim the context matching a reply serial, clearing the slot.
    pub fn take(&mut self, reply_serial: u32) -> Option<ReplyContext> {
        for slot in &mut self.slots {
            if slot.as_ref().map(|c| c.serial) == Some(reply_serial) {
                return slot.take();
            }
        }
        None
    }

    /// Release the slot for a call that will never get a reply.
    pub fn release(&mut self, serial: u32) {
        self.take(serial);
    }

    /// One expired call per invocation: returns its serial and message
    /// id so the caller can synthesize a timeout reply.
    pub fn timed_out(&mut self) -> Option<(u32, u32)> {
        for slot in &mut self.slots {
            let expired = match slot {
                Some(ctx) => ctx.call_time.expired(ctx.timeout),
                None => false,
            };
            if expired {
                let ctx = slot.take().expect("checked above");
                return Some((ctx.serial, ctx.message_id));
            }
        }
        None
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_take_cycle() {
        let mut table = ReplyContextTable::new();
        table.alloc(7, 0x0100_0001, Duration::from_secs(5), ":1.9").unwrap();
        let ctx = table.take(7).unwrap();
        assert_eq!(ctx.message_id, 0x0100_0001);
        assert_eq!(ctx.unique_name, ":1.9");
        assert!(table.take(7).is_none());
    }

    #[test]
    fn table_is_bounded() {
        let mut table = ReplyContextTable::new();
        for serial in 1..=NUM_REPLY_CONTEXTS as u32 {
            table.alloc(serial, 0, Duration::from_secs(5), "").unwrap();
        }
        assert_eq!(
            table.alloc(99, 0, Duration::from_secs(5), "").unwrap_err(),
            BusError::Resources
        );
        // Releasing a slot makes room again
        table.release(1);
        table.alloc(99, 0, Duration::from_secs(5), "").unwrap();
    }

    #[test]
    fn timeout_sweep_returns_one_at_a_time() {
        let mut table = ReplyContextTable::new();
        table.alloc(1, 10, Duration::from_millis(0), "").unwrap();
        table.alloc(2, 20, Duration::from_millis(0), "").unwrap();
        table.alloc(3, 30, Duration::from_secs(600), "").unwrap();

        let first = table.timed_out().unwrap();
        let second = table.timed_out().unwrap();
        assert_ne!(first.0, second.0);
        assert!(table.timed_out().is_none());
        // The long-deadline call is still tracked
        assert!(table.take(3).is_some());
    }
}

//! Confirmation bytes: written by a generated routine for each item it
//! contains, read back on a later cycle to learn which writes really happened.

use crate::asm::{Emitter, FLAG_M, FLAG_X, Width};

/// Opcode stamped over the first byte of a routine once it has run.
pub const EXECUTED_MARKER: u8 = 0x60;

/// Where item `index` of a routine reports its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmSlot {
    pub index: u32,
    pub address: u32,
}

impl ConfirmSlot {
    /// Confirmation bytes sit right after the two-byte `BRA` that skips them.
    pub fn new(routine_base: u32, index: u32) -> Self {
        Self {
            index,
            address: routine_base + 2 + index,
        }
    }

    /// Stores `value` into the slot. Word-mode code drops to 8-bit for the store.
    pub fn store(&self, a: &mut Emitter, width: Width, value: u8) {
        if width == Width::Word {
            a.sep(FLAG_M | FLAG_X);
        }
        a.lda_imm8(value);
        a.sta_long(self.address);
        if width == Width::Word {
            a.rep(FLAG_M | FLAG_X);
        }
    }

    /// Emits the tail shared by every guarded item:
    /// `confirm=1; BRA next; fail: confirm=0; next:`.
    pub fn guarded_tail(&self, a: &mut Emitter, width: Width, fail: &str, next: &str) {
        a.comment(format!("write confirmation for #{}:", self.index));
        self.store(a, width, 0x01);
        a.bra(next);

        a.label(fail);
        a.comment(format!("write failure for #{}:", self.index));
        self.store(a, width, 0x00);

        a.label(next);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The guarded write ran.
    Executed,
    /// The guard failed or the item never reported.
    Skipped,
}

/// The items of the routine most recently handed to the device, in index order.
#[derive(Debug, Clone)]
pub struct ConfirmationTracker<T> {
    base: u32,
    pending: Vec<T>,
}

impl<T> Default for ConfirmationTracker<T> {
    fn default() -> Self {
        Self {
            base: 0,
            pending: Vec::new(),
        }
    }
}

impl<T> ConfirmationTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a routine at `base` whose item `i` is `items[i]`.
    pub fn submit(&mut self, base: u32, items: Vec<T>) {
        self.base = base;
        self.pending = items;
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Bus address and size of the read that covers the executed marker and
    /// every confirmation byte.
    pub fn check_read(&self) -> (u32, usize) {
        (self.base, 2 + self.pending.len())
    }

    /// Matches a completed check read against the pending items.
    ///
    /// Returns `None` and keeps everything pending while the routine has not
    /// run yet.
    pub fn reconcile(&mut self, bytes: &[u8]) -> Option<Vec<(T, Outcome)>> {
        if bytes.first() != Some(&EXECUTED_MARKER) {
            return None;
        }
        let outcomes = std::mem::take(&mut self.pending)
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                let outcome = match bytes.get(2 + i) {
                    Some(1) => Outcome::Executed,
                    _ => Outcome::Skipped,
                };
                (item, outcome)
            })
            .collect();
        Some(outcomes)
    }

    /// Gives up on a routine that will never be checked, returning its items.
    pub fn abandon(&mut self) -> Vec<T> {
        std::mem::take(&mut self.pending)
    }
}

//! Per-dungeon small key counters, merged by most recent change.
//!
//! Counters live in WRAM, which cannot be written from outside, so changes
//! are sampled locally and stamped with the time they were first seen. The
//! newest stamp across all players wins; a tie keeps the local value.

use std::collections::BTreeMap;

use crate::alttp::DUNGEON_NAMES;
use crate::asm::{Emitter, Width};
use crate::confirm::{ConfirmSlot, Outcome};
use crate::player::{Player, Stamped};
use crate::sync::Generated;

pub const SMALL_KEY_FIRST: u16 = 0xF37C;
pub const SMALL_KEY_LAST: u16 = 0xF38B;
/// Key counter for whichever dungeon the player is in.
pub const CURRENT_KEYS: u16 = 0xF36F;
/// Current dungeon number, doubled; `$FF` outside dungeons.
pub const CURRENT_DUNGEON: u16 = 0x040C;

pub fn key_name(offset: u16) -> String {
    let i = usize::from(offset.wrapping_sub(SMALL_KEY_FIRST));
    match DUNGEON_NAMES.get(i) {
        Some(d) => format!("{d} small keys"),
        None => format!("${offset:04x} small keys"),
    }
}

/// A remote counter newer than ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyUpdate {
    pub offset: u16,
    pub value: u8,
    pub timestamp: u32,
    pub from: String,
}

impl KeyUpdate {
    pub fn notification(&self) -> String {
        format!(
            "update {} to {} from {}",
            key_name(self.offset),
            self.value,
            self.from
        )
    }

    /// Writes the counter, routing it to `$7EF36F` when the player is
    /// currently inside that dungeon. Sewers and Hyrule Castle share keys.
    pub fn generate(&self, parent: &Emitter, slot: ConfirmSlot) -> Generated {
        let mut a = parent.fork();
        let offs = self.offset;
        let dungeon = offs - SMALL_KEY_FIRST;
        let notification = self.notification();
        let cmp = format!("cmp{offs:04x}");
        let end = format!("end{offs:04x}");

        a.comment(format!("{notification}:"));
        a.lda_imm8(self.value);
        a.comment(format!(
            "check if current dungeon is {:02x} {}",
            dungeon << 1,
            DUNGEON_NAMES.get(usize::from(dungeon)).copied().unwrap_or("")
        ));
        a.ldy_abs(CURRENT_DUNGEON);
        if offs < SMALL_KEY_FIRST + 2 {
            a.cpy_imm8(0x04);
            a.bcs(&cmp);
        } else {
            a.cpy_imm8((dungeon << 1) as u8);
            a.bne(&cmp);
        }
        a.sta_long(0x7E_0000 + u32::from(CURRENT_KEYS));
        a.bra(&end);

        a.label(&cmp);
        a.sta_long(0x7E_0000 + u32::from(offs));
        if offs == SMALL_KEY_FIRST {
            a.comment("sync sewer keys with HC keys:");
            a.sta_long(0x7E_0000 + u32::from(SMALL_KEY_FIRST + 1));
        } else if offs == SMALL_KEY_FIRST + 1 {
            a.comment("sync HC keys with sewer keys:");
            a.sta_long(0x7E_0000 + u32::from(SMALL_KEY_FIRST));
        }
        a.label(&end);

        a.comment(format!("write confirmation for #{}:", slot.index));
        slot.store(&mut a, Width::Byte, 0x01);

        Generated {
            code: a,
            notification: Some(notification),
        }
    }
}

/// Outcome of comparing local counters against teammates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyScan {
    pub updates: Vec<KeyUpdate>,
    pub adopted: Vec<(u16, Stamped)>,
}

#[derive(Debug, Clone, Default)]
pub struct SmallKeySync {
    /// Values sent to the console and awaiting confirmation.
    writing: BTreeMap<u16, Stamped>,
    sampled: bool,
}

impl SmallKeySync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_writing(&self, offset: u16) -> bool {
        self.writing.contains_key(&offset)
    }

    /// Samples the local counters after a WRAM refresh. Changed values are
    /// stamped with `now_ms`, except on the first sample after a reset.
    pub fn sample(&mut self, local: &mut Player, now_ms: u32) {
        let dungeon = local.wram.read_u8(u32::from(CURRENT_DUNGEON));
        if local.state.is_in_dungeon() && dungeon != 0xFF && dungeon < 0x20 {
            let count = local.wram.read_u8(u32::from(CURRENT_KEYS));
            let slot = SMALL_KEY_FIRST + u16::from(dungeon >> 1);
            local.wram.write_u8(usize::from(slot), count);
            if slot == SMALL_KEY_FIRST {
                local.wram.write_u8(usize::from(SMALL_KEY_FIRST + 1), count);
            } else if slot == SMALL_KEY_FIRST + 1 {
                local.wram.write_u8(usize::from(SMALL_KEY_FIRST), count);
            }
        }

        for offs in SMALL_KEY_FIRST..=SMALL_KEY_LAST {
            if self.writing.contains_key(&offs) {
                continue;
            }
            let v = u16::from(local.wram.read_u8(u32::from(offs)));
            let entry = local.stamped.entry(offs).or_default();
            if v != entry.value {
                if self.sampled {
                    entry.timestamp = now_ms;
                }
                entry.value = v;
                log::debug!(
                    "keys: wram[${offs:04x}] -> {v:02x} @ {:08x} ; {}",
                    entry.timestamp,
                    key_name(offs)
                );
            }
        }
        self.sampled = true;
    }

    /// Counters where some remote holds a strictly newer stamp than ours.
    /// A newer stamp carrying the value we already hold is not an update; it
    /// is returned in [`KeyScan::adopted`] for the caller to record locally.
    pub fn candidates(&self, local: &Player, remotes: &[&Player]) -> KeyScan {
        let mut scan = KeyScan::default();
        for offs in SMALL_KEY_FIRST..=SMALL_KEY_LAST {
            if self.writing.contains_key(&offs) {
                continue;
            }
            let ours = local.stamped.get(&offs).copied().unwrap_or_default();
            let mut best = ours;
            let mut winner = None;
            for p in remotes {
                if let Some(rw) = p.stamped.get(&offs)
                    && rw.timestamp > best.timestamp
                {
                    best = *rw;
                    winner = Some(p.display_name());
                }
            }
            let Some(from) = winner else {
                continue;
            };
            if best.value == ours.value {
                scan.adopted.push((offs, best));
                continue;
            }
            scan.updates.push(KeyUpdate {
                offset: offs,
                value: best.value as u8,
                timestamp: best.timestamp,
                from,
            });
        }
        scan
    }

    /// Takes on newer stamps for counters whose value already matches.
    pub fn adopt(&self, local: &mut Player, adopted: &[(u16, Stamped)]) {
        for &(offs, stamp) in adopted {
            if self.writing.contains_key(&offs) {
                continue;
            }
            log::debug!(
                "keys: [${offs:04x}] stamp -> {:08x}, value {:02x} unchanged",
                stamp.timestamp,
                stamp.value
            );
            local.stamped.insert(offs, stamp);
        }
    }

    /// Records that `update` is part of a submitted routine.
    pub fn begin_write(&mut self, update: &KeyUpdate) {
        log::info!(
            "keys: [${:04x}] <- {:08x}, {:02x} <- player '{}'",
            update.offset,
            update.timestamp,
            update.value,
            update.from
        );
        self.writing.insert(
            update.offset,
            Stamped {
                value: u16::from(update.value),
                timestamp: update.timestamp,
            },
        );
    }

    /// Settles a pending write. On success the local stamp adopts the
    /// winner's so the value does not bounce back.
    pub fn confirm(&mut self, local: &mut Player, offset: u16, outcome: Outcome) {
        let Some(pending) = self.writing.remove(&offset) else {
            return;
        };
        match outcome {
            Outcome::Executed => {
                local.stamped.insert(offset, pending);
                local.wram.write_u8(usize::from(offset), pending.value as u8);
            }
            Outcome::Skipped => {
                log::warn!("keys: write of {} was not applied", key_name(offset));
            }
        }
    }

    /// Drops pending writes and forgets local stamps.
    pub fn reset(&mut self, local: &mut Player) {
        self.writing.clear();
        self.sampled = false;
        for offs in SMALL_KEY_FIRST..=SMALL_KEY_LAST {
            local.stamped.remove(&offs);
        }
    }
}

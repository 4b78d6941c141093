//! Builds the per-cycle update routine from everything that needs writing.
//!
//! Layout at the slot base:
//!
//! ```text
//!     bra   +K              ; skip the confirmation bytes
//!     db    0, 0, ...       ; one per item
//!     lda   $02e4           ; bail while the player is frozen
//!     beq   +1
//!     rts
//!     ...                   ; 8-bit items, small keys
//!     rep   #$30            ; 16-bit items
//!     ...
//!     sep   #$30
//!     lda.b #$60            ; overwrite our own first byte with rts
//!     sta.l base
//!     sep   #$30
//!     rts
//! ```

use crate::alttp::{self, UPDATE_CAPACITY, wram};
use crate::asm::{AsmError, Assembled, Emitter, FLAG_M, FLAG_X, Width};
use crate::confirm::{ConfirmSlot, EXECUTED_MARKER};
use crate::keys::KeyUpdate;
use crate::sync::{Generated, MergeContext, SyncFlags, SyncTable};

/// `bra` plus the guard and the epilogue.
const FIXED_OVERHEAD: usize = 2 + 6 + 9;
/// `rep` and `sep` around the 16-bit section.
const WIDE_OVERHEAD: usize = 4;

/// One write a routine attempts, in confirmation-byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Sram {
        offset: u16,
        notification: Option<String>,
    },
    SmallKey(KeyUpdate),
    TunicColor(u16),
}

/// Everything the generator may draw from this cycle.
#[derive(Debug, Clone, Copy)]
pub struct UpdateRequest<'a> {
    pub table: &'a SyncTable,
    pub flags: &'a SyncFlags,
    pub ctx: MergeContext<'a>,
    pub keys: &'a [KeyUpdate],
    pub tunic_color: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routine {
    pub assembled: Assembled,
    pub pending: Vec<PendingWrite>,
}

struct Budget {
    base: u32,
    used: usize,
    pending: Vec<PendingWrite>,
}

impl Budget {
    fn slot(&self) -> ConfirmSlot {
        ConfirmSlot::new(self.base, self.pending.len() as u32)
    }

    /// Commits `generated` into `into` if it fits alongside `reserve` more bytes.
    fn admit(
        &mut self,
        into: &mut Emitter,
        generated: Generated,
        write: PendingWrite,
        reserve: usize,
    ) -> bool {
        let cost = generated.code.len() + 1;
        if self.used + cost + reserve > UPDATE_CAPACITY {
            log::debug!("update: skipping {write:?}; {cost} bytes would not fit");
            return false;
        }
        self.used += cost;
        into.append(generated.code);
        self.pending.push(write);
        true
    }
}

/// Generates the routine for slot `base`, or `None` when nothing differs.
pub fn generate(base: u32, req: UpdateRequest<'_>) -> Result<Option<Routine>, AsmError> {
    let mut budget = Budget {
        base,
        used: FIXED_OVERHEAD,
        pending: Vec::new(),
    };

    let mut body = Emitter::new(base);
    body.assume_sep(FLAG_M | FLAG_X);

    for item in req.table.enabled(req.flags) {
        if item.width != Width::Byte {
            continue;
        }
        if let Some(generated) = item.generate(&req.ctx, &body, budget.slot()) {
            let write = PendingWrite::Sram {
                offset: item.offset,
                notification: generated.notification.clone(),
            };
            budget.admit(&mut body, generated, write, 0);
        }
    }

    if req.flags.small_keys {
        for update in req.keys {
            let generated = update.generate(&body, budget.slot());
            budget.admit(
                &mut body,
                generated,
                PendingWrite::SmallKey(update.clone()),
                0,
            );
        }
    }

    let mut wide = body.fork();
    wide.comment("switch to 16-bit mode:");
    wide.rep(FLAG_M | FLAG_X);
    let mut wide_used = false;
    for item in req.table.enabled(req.flags) {
        if item.width != Width::Word {
            continue;
        }
        if let Some(generated) = item.generate(&req.ctx, &wide, budget.slot()) {
            let write = PendingWrite::Sram {
                offset: item.offset,
                notification: generated.notification.clone(),
            };
            let reserve = if wide_used { 0 } else { WIDE_OVERHEAD };
            if budget.admit(&mut wide, generated, write, reserve) && !wide_used {
                budget.used += WIDE_OVERHEAD;
                wide_used = true;
            }
        }
    }
    if let Some(color) = req.tunic_color {
        let slot = budget.slot();
        let mut a = wide.fork();
        alttp::emit_tunic_color(&mut a, color);
        a.comment(format!("write confirmation for #{}:", slot.index));
        slot.store(&mut a, Width::Word, 0x01);
        let generated = Generated {
            code: a,
            notification: None,
        };
        let reserve = if wide_used { 0 } else { WIDE_OVERHEAD };
        if budget.admit(&mut wide, generated, PendingWrite::TunicColor(color), reserve)
            && !wide_used
        {
            budget.used += WIDE_OVERHEAD;
            wide_used = true;
        }
    }
    if wide_used {
        wide.sep(FLAG_M | FLAG_X);
        body.append(wide);
    }

    if budget.pending.is_empty() {
        return Ok(None);
    }

    body.comment("disable update routine with RTS instruction:");
    body.lda_imm8(EXECUTED_MARKER);
    body.sta_long(base);
    body.sep(FLAG_M | FLAG_X);
    body.rts();

    let count = budget.pending.len();
    let mut routine = Emitter::new(base);
    routine.assume_sep(FLAG_M | FLAG_X);
    routine.bra_rel(count as i8);
    routine.emit_bytes(&vec![0; count]);
    routine.comment("don't update while the player cannot move:");
    routine.lda_abs(wram::LINK_FROZEN);
    routine.beq_rel(1);
    routine.rts();
    routine.append(body);

    debug_assert_eq!(routine.len(), budget.used);
    let assembled = routine.assemble()?;
    log::debug!("update: {count} writes, {} bytes\n{}", assembled.code.len(), assembled.text);
    Ok(Some(Routine {
        assembled,
        pending: budget.pending,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alttp::{RomFunctions, RomRegion, UPDATE_SLOT_A, sync_table};
    use crate::keys::SMALL_KEY_FIRST;
    use crate::player::Player;

    fn player(index: usize, name: &str) -> Player {
        let mut p = Player::new(Some(index));
        p.name = name.to_string();
        p.sram.write(0, &[0; 0x500]);
        p
    }

    fn table() -> SyncTable {
        sync_table(&RomFunctions::for_region(RomRegion::NorthAmerica)).unwrap()
    }

    fn request<'a>(
        table: &'a SyncTable,
        flags: &'a SyncFlags,
        local: &'a Player,
        remotes: &'a [&'a Player],
        keys: &'a [KeyUpdate],
    ) -> UpdateRequest<'a> {
        UpdateRequest {
            table,
            flags,
            ctx: MergeContext {
                local,
                remotes,
                notify_unnamed: false,
            },
            keys,
            tunic_color: None,
        }
    }

    #[test]
    fn nothing_to_write_yields_no_routine() {
        let (t, flags) = (table(), SyncFlags::default());
        let local = player(0, "me");
        let remote = player(1, "r");
        let remotes = [&remote];
        let out = generate(UPDATE_SLOT_A, request(&t, &flags, &local, &remotes, &[])).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn single_item_layout() {
        let (t, flags) = (table(), SyncFlags::default());
        let local = player(0, "me");
        let mut remote = player(1, "r");
        remote.sram.write_u8(0x342, 1);
        let remotes = [&remote];
        let routine = generate(UPDATE_SLOT_A, request(&t, &flags, &local, &remotes, &[]))
            .unwrap()
            .unwrap();

        assert_eq!(
            routine.pending,
            vec![PendingWrite::Sram {
                offset: 0x342,
                notification: Some("got Hookshot from r".into()),
            }]
        );
        let code = &routine.assembled.code;
        assert_eq!(&code[..3], &[0x80, 0x01, 0x00]);
        assert_eq!(&code[3..9], &[0xAD, 0xE4, 0x02, 0xF0, 0x01, 0x60]);
        assert_eq!(
            &code[code.len() - 9..],
            &[0xA9, 0x60, 0x8F, 0x00, 0x7D, 0x70, 0xE2, 0x30, 0x60]
        );
        assert!(code.len() <= UPDATE_CAPACITY);
    }

    #[test]
    fn word_items_run_in_sixteen_bit_mode_after_keys() {
        let (t, flags) = (table(), SyncFlags::default());
        let local = player(0, "me");
        let mut remote = player(1, "r");
        remote.sram.write_u8(0x355, 1);
        remote.sram.write(0x0C8 << 1, &[0x00, 0x08]);
        let remotes = [&remote];
        let keys = [KeyUpdate {
            offset: SMALL_KEY_FIRST + 2,
            value: 1,
            timestamp: 10,
            from: "r".into(),
        }];
        let routine = generate(UPDATE_SLOT_A, request(&t, &flags, &local, &remotes, &keys))
            .unwrap()
            .unwrap();

        assert!(matches!(routine.pending[0], PendingWrite::Sram { offset: 0x355, .. }));
        assert!(matches!(routine.pending[1], PendingWrite::SmallKey(_)));
        assert!(matches!(routine.pending[2], PendingWrite::Sram { offset: 0x190, .. }));
        let text = &routine.assembled.text;
        let rep = text.find("rep   #$30").unwrap();
        assert!(text.find("Eastern Palace small keys").unwrap() < rep);
        assert!(text.find("Armos Knights").unwrap() > rep);
    }

    #[test]
    fn disabled_groups_are_left_alone() {
        let t = table();
        let flags = SyncFlags {
            items: false,
            ..SyncFlags::default()
        };
        let local = player(0, "me");
        let mut remote = player(1, "r");
        remote.sram.write_u8(0x342, 1);
        let remotes = [&remote];
        let out = generate(UPDATE_SLOT_A, request(&t, &flags, &local, &remotes, &[])).unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn oversized_change_sets_are_cut_to_capacity() {
        let (t, flags) = (table(), SyncFlags::default());
        let local = player(0, "me");
        let mut remote = player(1, "r");
        for offs in 0x280..0x340 {
            remote.sram.write_u8(offs, 0x02);
        }
        let remotes = [&remote];
        let routine = generate(UPDATE_SLOT_A, request(&t, &flags, &local, &remotes, &[]))
            .unwrap()
            .unwrap();
        assert!(routine.assembled.code.len() <= UPDATE_CAPACITY);
        assert!(routine.pending.len() < 0xC0);
        assert_eq!(routine.assembled.code[1] as usize, routine.pending.len());
    }

    #[test]
    fn tunic_color_is_confirmed_like_any_write() {
        let (t, flags) = (table(), SyncFlags::default());
        let local = player(0, "me");
        let remotes: [&Player; 0] = [];
        let mut req = request(&t, &flags, &local, &remotes, &[]);
        req.tunic_color = Some(0x1234);
        let routine = generate(UPDATE_SLOT_A, req).unwrap().unwrap();
        assert_eq!(routine.pending, vec![PendingWrite::TunicColor(0x1234)]);
        assert!(routine.assembled.text.contains("inc   $15"));
    }
}

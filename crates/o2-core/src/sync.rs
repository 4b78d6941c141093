//! Convergence rules for save-data fields and the guarded code each one emits.
//!
//! A [`SyncItem`] binds one [`Policy`] to one offset of the save data. Items
//! live in a [`SyncTable`], which refuses overlapping registrations and yields
//! items in ascending offset order so routine generation is deterministic.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::asm::{Emitter, Width};
use crate::confirm::ConfirmSlot;
use crate::mirror::MemoryMirror;
use crate::notify::Statement;
use crate::player::Player;

/// Configuration switch an item answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncGroup {
    Items,
    SmallKeys,
    Underworld,
    Overworld,
    Progress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFlags {
    pub items: bool,
    pub small_keys: bool,
    pub underworld: bool,
    pub overworld: bool,
    pub progress: bool,
}

impl Default for SyncFlags {
    fn default() -> Self {
        Self {
            items: true,
            small_keys: true,
            underworld: true,
            overworld: true,
            progress: true,
        }
    }
}

impl SyncFlags {
    pub fn is_enabled(&self, group: SyncGroup) -> bool {
        match group {
            SyncGroup::Items => self.items,
            SyncGroup::SmallKeys => self.small_keys,
            SyncGroup::Underworld => self.underworld,
            SyncGroup::Overworld => self.overworld,
            SyncGroup::Progress => self.progress,
        }
    }
}

/// What a strategy sees while generating: the local player and the remotes
/// whose data may be merged in.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub local: &'a Player,
    pub remotes: &'a [&'a Player],
    /// Produce generic notification text for items without names.
    pub notify_unnamed: bool,
}

impl<'a> MergeContext<'a> {
    /// Remotes that have actually sent the `len` bytes at `offset`.
    pub fn sources(&self, offset: u16, len: usize) -> impl Iterator<Item = &'a Player> + 'a {
        self.remotes
            .iter()
            .copied()
            .filter(move |p| p.sram.is_fresh(u32::from(offset), len))
    }
}

/// Code emitted for one item plus the text to publish once it is confirmed.
#[derive(Debug)]
pub struct Generated {
    pub code: Emitter,
    pub notification: Option<String>,
}

/// A strategy that owns its code generation entirely.
pub trait CustomPolicy: fmt::Debug + Send + Sync {
    /// Emits into `a` (a fork of the routine body) and returns it, or `None`
    /// when there is nothing to write.
    fn generate(
        &self,
        item: &SyncItem,
        ctx: &MergeContext<'_>,
        a: Emitter,
        slot: ConfirmSlot,
    ) -> Option<Generated>;

    fn local_check(&self, item: &SyncItem, previous: u16, current: u16) -> Vec<Statement> {
        item.value_statements(previous, current)
    }
}

#[derive(Debug)]
pub enum Policy {
    /// Union of every remote value (after `mask`) with the local value.
    BitOr { mask: u16 },
    /// Largest value wins. Remote values above `cap` are ignored.
    MaxWins { cap: u16 },
    Custom(Box<dyn CustomPolicy>),
}

#[derive(Debug)]
pub struct SyncItem {
    /// Offset into the save data (`$7EF000`).
    pub offset: u16,
    pub width: Width,
    pub group: SyncGroup,
    pub policy: Policy,
    /// Per-bit names for [`Policy::BitOr`], per-value names (`value - 1`) otherwise.
    pub names: Vec<String>,
    pub verbs: Vec<String>,
    pub location: Option<String>,
    /// Long subroutines called after a successful write.
    pub on_updated: Vec<u32>,
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn bin8(v: u16) -> String {
    format!("0b{:04b}_{:04b}", (v >> 4) & 0xF, v & 0xF)
}

fn bin16(v: u16) -> String {
    format!(
        "0b{:04b}_{:04b}_{:04b}_{:04b}",
        (v >> 12) & 0xF,
        (v >> 8) & 0xF,
        (v >> 4) & 0xF,
        v & 0xF
    )
}

impl SyncItem {
    fn new(offset: u16, width: Width, group: SyncGroup, policy: Policy, names: &[&str]) -> Self {
        Self {
            offset,
            width,
            group,
            policy,
            names: owned(names),
            verbs: Vec::new(),
            location: None,
            on_updated: Vec::new(),
        }
    }

    pub fn bit_or_u8(offset: u16, group: SyncGroup, names: &[&str]) -> Self {
        Self::new(offset, Width::Byte, group, Policy::BitOr { mask: 0xFF }, names)
    }

    pub fn bit_or_u16(offset: u16, group: SyncGroup, names: &[&str]) -> Self {
        Self::new(offset, Width::Word, group, Policy::BitOr { mask: 0xFFFF }, names)
    }

    pub fn max_u8(offset: u16, group: SyncGroup, names: &[&str]) -> Self {
        Self::new(offset, Width::Byte, group, Policy::MaxWins { cap: 0xFF }, names)
    }

    pub fn max_u16(offset: u16, group: SyncGroup, names: &[&str]) -> Self {
        Self::new(offset, Width::Word, group, Policy::MaxWins { cap: 0xFFFF }, names)
    }

    pub fn custom_u8(
        offset: u16,
        group: SyncGroup,
        names: &[&str],
        policy: impl CustomPolicy + 'static,
    ) -> Self {
        Self::new(offset, Width::Byte, group, Policy::Custom(Box::new(policy)), names)
    }

    /// Sets the bit mask of a `BitOr` or the cap of a `MaxWins`.
    pub fn limited_to(mut self, limit: u16) -> Self {
        match &mut self.policy {
            Policy::BitOr { mask } => *mask = limit,
            Policy::MaxWins { cap } => *cap = limit,
            Policy::Custom(_) => {}
        }
        self
    }

    pub fn with_verbs(mut self, verbs: &[&str]) -> Self {
        self.verbs = owned(verbs);
        self
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn then_call(mut self, routine: u32) -> Self {
        self.on_updated.push(routine);
        self
    }

    pub fn len(&self) -> usize {
        self.width.bytes()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Bus address of this item in the local player's save data.
    pub fn bus_address(&self, local: &Player) -> u32 {
        local.sram.bus_address(u32::from(self.offset))
    }

    pub fn read(&self, mirror: &MemoryMirror) -> u16 {
        match self.width {
            Width::Byte => u16::from(mirror.read_u8(u32::from(self.offset))),
            Width::Word => mirror.read_u16(u32::from(self.offset)),
        }
    }

    fn bit_count(&self) -> usize {
        self.width.bytes() * 8
    }

    fn name(&self, i: usize) -> Option<&str> {
        self.names.get(i).map(String::as_str).filter(|s| !s.is_empty())
    }

    fn verb(&self, i: usize) -> Option<&str> {
        self.verbs.get(i).map(String::as_str).filter(|s| !s.is_empty())
    }

    fn labels(&self, local: &Player) -> (String, String) {
        let addr = self.bus_address(local);
        (format!("fail{addr:06x}"), format!("next{addr:06x}"))
    }

    /// Emits a verify-then-write for this item into a fork of `parent`.
    ///
    /// Returns `None` when the merged value equals the local value.
    pub fn generate(
        &self,
        ctx: &MergeContext<'_>,
        parent: &Emitter,
        slot: ConfirmSlot,
    ) -> Option<Generated> {
        let a = parent.fork();
        match &self.policy {
            Policy::BitOr { mask } => self.generate_bit_or(*mask, ctx, a, slot),
            Policy::MaxWins { cap } => self.generate_max(*cap, ctx, a, slot),
            Policy::Custom(custom) => custom.generate(self, ctx, a, slot),
        }
    }

    fn generate_bit_or(
        &self,
        mask: u16,
        ctx: &MergeContext<'_>,
        mut a: Emitter,
        slot: ConfirmSlot,
    ) -> Option<Generated> {
        let initial = self.read(&ctx.local.sram);
        let mut updated = initial;
        let mut received_from: Vec<Option<String>> = vec![None; self.bit_count()];
        let mut first_source = None;

        for p in ctx.sources(self.offset, self.len()) {
            let v = self.read(&p.sram) & mask;
            let new_bits = v & !updated;
            if new_bits != 0 {
                let name = p.display_name();
                for (i, from) in received_from.iter_mut().enumerate() {
                    if new_bits & (1 << i) != 0 {
                        *from = Some(name.clone());
                    }
                }
                first_source.get_or_insert(name);
            }
            updated |= v;
        }

        if updated == initial {
            return None;
        }

        let addr = self.bus_address(ctx.local);
        let new_bits = updated & !initial;

        let received: Vec<String> = (0..self.bit_count())
            .filter(|&i| new_bits & (1 << i) != 0)
            .filter_map(|i| {
                let name = self.name(i)?;
                let from = received_from[i].as_deref().unwrap_or("?");
                Some(match (&self.location, self.verb(i)) {
                    (Some(_), Some(verb)) => format!("{name} {verb} from {from}"),
                    _ => format!("{name} from {from}"),
                })
            })
            .collect();
        let notification = if !received.is_empty() {
            Some(format!("got {}", received.join(", ")))
        } else if ctx.notify_unnamed {
            first_source.map(|from| format!("got ${addr:06x} |= ${new_bits:x} from {from}"))
        } else {
            None
        };
        if let Some(text) = &notification {
            a.comment(format!("{text}:"));
        }

        let (fail, next) = self.labels(ctx.local);
        match self.width {
            Width::Byte => {
                a.comment(format!(
                    "u8 [${addr:06x}] = {} | {}",
                    bin8(initial),
                    bin8(new_bits)
                ));
                a.lda_long(addr);
                a.cmp_imm8(initial as u8);
                a.bne(&fail);
                a.ora_imm8(new_bits as u8);
            }
            Width::Word => {
                a.comment(format!(
                    "u16[${addr:06x}] = {} | {}",
                    bin16(initial),
                    bin16(new_bits)
                ));
                a.lda_long(addr);
                a.cmp_imm16(initial);
                a.bne(&fail);
                a.ora_imm16(new_bits);
            }
        }
        a.sta_long(addr);
        for &routine in &self.on_updated {
            a.jsl(routine);
        }
        slot.guarded_tail(&mut a, self.width, &fail, &next);

        Some(Generated {
            code: a,
            notification,
        })
    }

    fn generate_max(
        &self,
        cap: u16,
        ctx: &MergeContext<'_>,
        mut a: Emitter,
        slot: ConfirmSlot,
    ) -> Option<Generated> {
        let initial = self.read(&ctx.local.sram);
        let mut max = initial;
        let mut winner = None;
        for p in ctx.sources(self.offset, self.len()) {
            let v = self.read(&p.sram);
            if v > cap {
                continue;
            }
            if v > max {
                max = v;
                winner = Some(p);
            }
        }

        let winner = winner?;
        let from = winner.display_name();
        let addr = self.bus_address(ctx.local);

        let notification = match self.name(usize::from(max).wrapping_sub(1)) {
            Some(name) => Some(format!("got {name} from {from}")),
            None if ctx.notify_unnamed => Some(format!("got ${addr:06x} = ${max:x} from {from}")),
            None => None,
        };
        if let Some(text) = &notification {
            a.comment(format!("{text}:"));
        }

        let (fail, next) = self.labels(ctx.local);
        match self.width {
            Width::Byte => {
                a.comment(format!("u8[${addr:06x}]: ${initial:02x} -> ${max:02x}"));
                a.lda_long(addr);
                a.cmp_imm8(initial as u8);
                a.bne(&fail);
                a.lda_imm8(max as u8);
            }
            Width::Word => {
                a.comment(format!("u16[${addr:06x}]: ${initial:04x} -> ${max:04x}"));
                a.lda_long(addr);
                a.cmp_imm16(initial);
                a.bne(&fail);
                a.lda_imm16(max);
            }
        }
        a.sta_long(addr);
        for &routine in &self.on_updated {
            a.jsl(routine);
        }
        slot.guarded_tail(&mut a, self.width, &fail, &next);

        Some(Generated {
            code: a,
            notification,
        })
    }

    /// Compares two snapshots of the local save data and describes what the
    /// local player just picked up.
    pub fn local_check(&self, previous: &MemoryMirror, current: &MemoryMirror) -> Vec<Statement> {
        let prev = self.read(previous);
        let curr = self.read(current);
        if prev == curr {
            return Vec::new();
        }
        log::debug!(
            "sync: local: [${:06x}]: ${prev:04x} -> ${curr:04x}",
            current.bus_address(u32::from(self.offset))
        );
        match &self.policy {
            Policy::BitOr { .. } => self.bit_statements(prev, curr),
            Policy::MaxWins { .. } => self.value_statements(prev, curr),
            Policy::Custom(custom) => custom.local_check(self, prev, curr),
        }
    }

    fn default_verb(&self) -> &str {
        if self.location.is_some() {
            "enabled"
        } else {
            "picked up"
        }
    }

    fn bit_statements(&self, prev: u16, curr: u16) -> Vec<Statement> {
        (0..self.bit_count())
            .filter(|&i| prev & (1 << i) == 0 && curr & (1 << i) != 0)
            .filter_map(|i| {
                let name = self.name(i)?;
                let verb = self.verb(i).unwrap_or(self.default_verb());
                let mut s = Statement::new(verb, name);
                s.location = self.location.clone();
                Some(s)
            })
            .collect()
    }

    /// Statement for a newly reached named value; used by value-like policies.
    pub fn value_statements(&self, _prev: u16, curr: u16) -> Vec<Statement> {
        let i = usize::from(curr).wrapping_sub(1);
        match self.name(i) {
            Some(name) => {
                let verb = self.verb(i).unwrap_or(self.default_verb());
                vec![Statement::new(verb, name)]
            }
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncTableError {
    #[error("sync item at ${offset:03x} overlaps the item registered at ${existing:03x}")]
    Overlap { offset: u16, existing: u16 },
}

/// Offset-indexed set of items; at most one item covers any byte.
#[derive(Debug, Default)]
pub struct SyncTable {
    items: BTreeMap<u16, SyncItem>,
}

impl SyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: SyncItem) -> Result<(), SyncTableError> {
        let start = u32::from(item.offset);
        let end = start + item.len() as u32;

        if let Some((&existing, prev)) = self.items.range(..=item.offset).next_back()
            && u32::from(existing) + prev.len() as u32 > start
        {
            return Err(SyncTableError::Overlap {
                offset: item.offset,
                existing,
            });
        }
        if let Some((&existing, _)) = self.items.range(item.offset..).next()
            && u32::from(existing) < end
        {
            return Err(SyncTableError::Overlap {
                offset: item.offset,
                existing,
            });
        }

        self.items.insert(item.offset, item);
        Ok(())
    }

    pub fn get(&self, offset: u16) -> Option<&SyncItem> {
        self.items.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncItem> {
        self.items.values()
    }

    pub fn enabled<'a>(&'a self, flags: &'a SyncFlags) -> impl Iterator<Item = &'a SyncItem> {
        self.items
            .values()
            .filter(move |item| flags.is_enabled(item.group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{FLAG_M, FLAG_X};

    fn player(index: usize, name: &str) -> Player {
        let mut p = Player::new(Some(index));
        p.name = name.to_string();
        p
    }

    fn byte_body() -> Emitter {
        let mut a = Emitter::new(0x707D00);
        a.assume_sep(FLAG_M | FLAG_X);
        a
    }

    fn generate(item: &SyncItem, local: &Player, remotes: &[&Player]) -> Option<Generated> {
        let ctx = MergeContext {
            local,
            remotes,
            notify_unnamed: false,
        };
        item.generate(&ctx, &byte_body(), ConfirmSlot::new(0x707D00, 0))
    }

    #[test]
    fn bit_or_names_new_bit_and_its_source() {
        let item = SyncItem::bit_or_u8(
            0x3C6,
            SyncGroup::Progress,
            &["", "", "", "", "", "Uncle's gear", "", ""],
        );
        let local = player(0, "me");
        let mut remote = player(1, "zelda");
        remote.sram.write_u8(0x3C6, 0x20);

        let out = generate(&item, &local, &[&remote]).unwrap();
        assert_eq!(out.notification.as_deref(), Some("got Uncle's gear from zelda"));

        let code = out.code.assemble().unwrap().code;
        // lda.l $7ef3c6 ; cmp.b #$00 ; bne fail ; ora.b #$20 ; sta.l $7ef3c6
        assert_eq!(
            &code[..15],
            &[0xAF, 0xC6, 0xF3, 0x7E, 0xC9, 0x00, 0xD0, 0x0E, 0x09, 0x20, 0x8F, 0xC6, 0xF3, 0x7E, 0xA9]
        );
    }

    #[test]
    fn bit_or_attributes_each_bit_to_the_first_holder() {
        let item = SyncItem::bit_or_u8(0x374, SyncGroup::Items, &["Red", "Blue", "Green"]);
        let local = player(0, "me");
        let mut a = player(1, "a");
        a.sram.write_u8(0x374, 0b001);
        let mut b = player(2, "b");
        b.sram.write_u8(0x374, 0b011);

        let out = generate(&item, &local, &[&a, &b]).unwrap();
        assert_eq!(
            out.notification.as_deref(),
            Some("got Red from a, Blue from b")
        );
    }

    #[test]
    fn bit_or_respects_mask() {
        let item = SyncItem::bit_or_u8(0x3C6, SyncGroup::Progress, &[]).limited_to(0x0F);
        let local = player(0, "me");
        let mut remote = player(1, "r");
        remote.sram.write_u8(0x3C6, 0xF0);
        assert!(generate(&item, &local, &[&remote]).is_none());
    }

    #[test]
    fn max_wins_with_local_maximum_generates_nothing() {
        let item = SyncItem::max_u8(0x35A, SyncGroup::Items, &["Blue Shield", "Red Shield"]);
        let mut local = player(0, "me");
        local.sram.write_u8(0x35A, 0x03);
        let mut a = player(1, "a");
        a.sram.write_u8(0x35A, 0x01);
        let mut b = player(2, "b");
        b.sram.write_u8(0x35A, 0x02);
        assert!(generate(&item, &local, &[&a, &b]).is_none());
    }

    #[test]
    fn max_wins_ignores_values_over_the_cap() {
        let item = SyncItem::max_u8(0x37B, SyncGroup::Items, &["1/2 Magic", "1/4 Magic"]).limited_to(2);
        let local = player(0, "me");
        let mut a = player(1, "a");
        a.sram.write_u8(0x37B, 0x07);
        let mut b = player(2, "b");
        b.sram.write_u8(0x37B, 0x01);

        let out = generate(&item, &local, &[&a, &b]).unwrap();
        assert_eq!(out.notification.as_deref(), Some("got 1/2 Magic from b"));
        let text = out.code.assemble().unwrap().text;
        assert!(text.contains("u8[$7ef37b]: $00 -> $01"));
    }

    #[test]
    fn unnamed_items_are_silent_unless_asked() {
        let item = SyncItem::max_u8(0x370, SyncGroup::Items, &[]);
        let local = player(0, "me");
        let mut remote = player(1, "r");
        remote.sram.write_u8(0x370, 5);

        let silent = generate(&item, &local, &[&remote]).unwrap();
        assert_eq!(silent.notification, None);

        let ctx = MergeContext {
            local: &local,
            remotes: &[&remote],
            notify_unnamed: true,
        };
        let loud = item
            .generate(&ctx, &byte_body(), ConfirmSlot::new(0x707D00, 0))
            .unwrap();
        assert_eq!(loud.notification.as_deref(), Some("got $7ef370 = $5 from r"));
    }

    #[test]
    fn stale_remote_bytes_are_not_sources() {
        let item = SyncItem::max_u8(0x342, SyncGroup::Items, &["Hookshot"]);
        let local = player(0, "me");
        let remote = player(1, "r");
        assert!(generate(&item, &local, &[&remote]).is_none());
    }

    #[test]
    fn word_items_wrap_confirmation_in_byte_mode() {
        let item = SyncItem::bit_or_u16(0x190, SyncGroup::Underworld, &[]);
        let local = player(0, "me");
        let mut remote = player(1, "r");
        remote.sram.write(0x190, &[0x00, 0x08]);

        let mut body = Emitter::new(0x707D00);
        body.assume_rep(FLAG_M | FLAG_X);
        let ctx = MergeContext {
            local: &local,
            remotes: &[&remote],
            notify_unnamed: false,
        };
        let out = item
            .generate(&ctx, &body, ConfirmSlot::new(0x707D00, 3))
            .unwrap();
        let text = out.code.assemble().unwrap().text;
        assert!(text.contains("ora.w #$0800"));
        assert!(text.contains("write confirmation for #3:"));
        assert!(text.contains("sep   #$30"));
    }

    #[test]
    fn local_check_reports_named_pickups() {
        let item = SyncItem::bit_or_u8(0x280, SyncGroup::Overworld, &["", "bomb wall"])
            .with_verbs(&["", "opened"])
            .at("Kakariko Village");
        let prev = MemoryMirror::new(crate::mirror::Region::Sram);
        let mut curr = prev.clone();
        curr.write_u8(0x280, 0x02);
        let got: Vec<String> = item
            .local_check(&prev, &curr)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(got, vec!["opened bomb wall at Kakariko Village"]);

        let sword = SyncItem::max_u8(0x359, SyncGroup::Items, &["Fighter Sword", "Master Sword"]);
        curr.write_u8(0x359, 2);
        assert_eq!(
            sword.local_check(&prev, &curr)[0].to_string(),
            "picked up Master Sword"
        );
    }

    #[test]
    fn table_rejects_overlaps() {
        let mut t = SyncTable::new();
        t.insert(SyncItem::bit_or_u16(0x100, SyncGroup::Underworld, &[]))
            .unwrap();
        assert_eq!(
            t.insert(SyncItem::max_u8(0x101, SyncGroup::Items, &[])),
            Err(SyncTableError::Overlap {
                offset: 0x101,
                existing: 0x100
            })
        );
        assert_eq!(
            t.insert(SyncItem::bit_or_u16(0x0FF, SyncGroup::Underworld, &[])),
            Err(SyncTableError::Overlap {
                offset: 0x0FF,
                existing: 0x100
            })
        );
        t.insert(SyncItem::max_u8(0x102, SyncGroup::Items, &[])).unwrap();
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn enabled_filters_by_group() {
        let mut t = SyncTable::new();
        t.insert(SyncItem::max_u8(0x340, SyncGroup::Items, &[])).unwrap();
        t.insert(SyncItem::bit_or_u8(0x280, SyncGroup::Overworld, &[]))
            .unwrap();
        let flags = SyncFlags {
            overworld: false,
            ..SyncFlags::default()
        };
        let offsets: Vec<u16> = t.enabled(&flags).map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0x340]);
    }
}

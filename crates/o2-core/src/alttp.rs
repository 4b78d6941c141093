//! A Link to the Past: memory layout, item names and the fields kept in sync.

use crate::asm::{Emitter, Width};
use crate::confirm::ConfirmSlot;
use crate::player::{Module, PlayerState};
use crate::sync::{
    CustomPolicy, Generated, MergeContext, SyncGroup, SyncItem, SyncTable, SyncTableError,
};

/// Scratch slots the update routine alternates between.
pub const UPDATE_SLOT_A: u32 = 0x70_7D00;
pub const UPDATE_SLOT_B: u32 = 0x70_7E00;
/// Capacity of one scratch slot.
pub const UPDATE_CAPACITY: usize = 255;
/// `JSR` patched into the main loop; its high address byte picks the slot.
pub const PRE_MAIN: u32 = 0x70_8000 - 0x1E;
pub const TRAMPOLINE: u32 = PRE_MAIN + 2;

/// WRAM ranges refreshed every cycle, as `(bus address, length)`.
pub const MAIN_READS: [(u32, usize); 8] = [
    (0x7E_0010, 0xF0),
    (0x7E_0100, 0x36),
    (0x7E_0400, 0x20),
    (0x7E_F000, 0x100),
    (0x7E_F100, 0x100),
    (0x7E_F200, 0x100),
    (0x7E_F300, 0x100),
    (0x7E_F400, 0x100),
];

/// WRAM offsets of the values the run loop samples.
pub mod wram {
    pub const MODULE: u32 = 0x10;
    pub const SUB_MODULE: u32 = 0x11;
    pub const SUB_SUB_MODULE: u32 = 0xB0;
    pub const FRAME: u32 = 0x1A;
    pub const IN_DUNGEON: u32 = 0x1B;
    pub const Y: u32 = 0x20;
    pub const X: u32 = 0x22;
    pub const OVERWORLD_AREA: u32 = 0x8A;
    pub const DUNGEON_ROOM: u32 = 0xA0;
    pub const SCROLL_X: u32 = 0xE2;
    pub const SCROLL_Y: u32 = 0xE8;
    pub const SCROLL_X_ADJUST: u32 = 0x11A;
    pub const SCROLL_Y_ADJUST: u32 = 0x11C;
    pub const DUNGEON: u32 = 0x040C;
    /// Non-zero while the player entity may move.
    pub const LINK_FROZEN: u16 = 0x02E4;
    /// Start of the game's copy of the save data.
    pub const SRAM_SHADOW: usize = 0xF000;
    /// Copy of the player sprite palette.
    pub const LINK_PALETTE: u32 = 0x7E_C6E0;
    /// Non-zero requests a palette upload on the next frame.
    pub const PALETTE_DIRTY: u8 = 0x15;
}

pub const DUNGEON_NAMES: [&str; 16] = [
    "Sewers",
    "Hyrule Castle",
    "Eastern Palace",
    "Desert Palace",
    "Agahnim's Tower",
    "Swamp Palace",
    "Palace of Darkness",
    "Misery Mire",
    "Skull Woods",
    "Ice Palace",
    "Tower of Hera",
    "Thieves' Town",
    "Turtle Rock",
    "Ganon's Tower",
    "Unused 0E",
    "Unused 0F",
];

/// `(room, boss, dungeon)` for the rooms where a boss can be defeated.
pub const BOSS_ROOMS: [(u16, &str, &str); 12] = [
    (0x0C8, "Armos Knights", "Eastern Palace"),
    (0x033, "Lanmolas", "Desert Palace"),
    (0x007, "Moldorm", "Tower of Hera"),
    (0x020, "Agahnim", "Agahnim's Tower"),
    (0x05A, "Helmasaur King", "Palace of Darkness"),
    (0x006, "Arrghus", "Swamp Palace"),
    (0x029, "Mothula", "Skull Woods"),
    (0x0AC, "Blind", "Thieves' Town"),
    (0x0DE, "Kholdstare", "Ice Palace"),
    (0x090, "Vitreous", "Misery Mire"),
    (0x0A4, "Trinexx", "Turtle Rock"),
    (0x00D, "Agahnim 2", "Ganon's Tower"),
];

pub const UNDERWORLD_ROOMS: u16 = 0x128;
pub const OVERWORLD_AREAS: u16 = 0xC0;

const OVERWORLD_NAMES: [(u16, &str); 11] = [
    (0x00, "Lost Woods"),
    (0x18, "Kakariko Village"),
    (0x1B, "Hyrule Castle"),
    (0x1E, "Eastern Palace"),
    (0x2C, "Link's House"),
    (0x30, "Desert of Mystery"),
    (0x35, "Lake Hylia"),
    (0x40, "Skull Woods"),
    (0x58, "Village of Outcasts"),
    (0x5B, "Pyramid of Power"),
    (0x70, "Misery Mire"),
];

pub fn overworld_name(area: u16) -> String {
    OVERWORLD_NAMES
        .iter()
        .find(|(a, _)| *a == area)
        .map(|(_, n)| n.to_string())
        .unwrap_or_else(|| format!("area ${area:02x}"))
}

const BOTTLE_NAMES: [&str; 8] = [
    "",
    "Empty Bottle",
    "Red Potion",
    "Green Potion",
    "Blue Potion",
    "Fairy",
    "Bee",
    "Good Bee",
];

const BOW_NAMES: [&str; 4] = ["Bow", "Bow", "Silver Bow", "Silver Bow"];

const PENDANT_NAMES: [&str; 3] = ["Red Pendant", "Blue Pendant", "Green Pendant"];

const CRYSTAL_NAMES: [&str; 7] = [
    "Crystal 6", "Crystal 1", "Crystal 5", "Crystal 7", "Crystal 2", "Crystal 4", "Crystal 3",
];

const RANDOMIZER_BITS_38C: [&str; 8] = [
    "Flute (active)",
    "Flute (inactive)",
    "Shovel",
    "",
    "Magic Powder",
    "Mushroom",
    "Red Boomerang",
    "Blue Boomerang",
];

const RANDOMIZER_BITS_38E: [&str; 8] = ["", "", "", "", "", "", "Silver Bow", "Bow"];

/// In-game iff the module is one where the player is live on a map.
/// The menu module defers to the module it was opened from.
pub fn is_in_game(state: &PlayerState) -> bool {
    fn allowed(m: Module) -> bool {
        (0x07..=0x1A).contains(&m.0) && m.0 != 0x14 && m.0 != 0x17
    }
    if state.module.0 == 0x0E {
        return state.prior_module.0 == 0x0E || allowed(state.prior_module);
    }
    allowed(state.module)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RomRegion {
    #[default]
    NorthAmerica,
    Japan,
}

/// Addresses of game routines the generated code calls after certain writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RomFunctions {
    pub update_palette_armor_gloves: u32,
    pub update_palette_sword: u32,
    pub update_palette_shield: u32,
    pub decomp_gfx_sword: u32,
    pub decomp_gfx_shield: u32,
}

impl RomFunctions {
    pub fn for_region(region: RomRegion) -> Self {
        match region {
            RomRegion::NorthAmerica => Self {
                update_palette_armor_gloves: 0x1B_EDF9,
                update_palette_sword: 0x1B_ED03,
                update_palette_shield: 0x1B_ED29,
                decomp_gfx_sword: 0x00_D2C8,
                decomp_gfx_shield: 0x00_D308,
            },
            RomRegion::Japan => Self {
                update_palette_armor_gloves: 0x1B_EDF9,
                update_palette_sword: 0x1B_ED03,
                update_palette_shield: 0x1B_ED29,
                decomp_gfx_sword: 0x00_D308,
                decomp_gfx_shield: 0x00_D348,
            },
        }
    }
}

fn item(offset: u16, names: &[&str]) -> SyncItem {
    SyncItem::max_u8(offset, SyncGroup::Items, names)
}

/// Every synced field of the save data.
pub fn sync_table(rom: &RomFunctions) -> Result<SyncTable, SyncTableError> {
    let mut t = SyncTable::new();

    t.insert(SyncItem::custom_u8(0x340, SyncGroup::Items, &BOW_NAMES, Bow))?;
    t.insert(item(0x341, &["Blue Boomerang", "Red Boomerang"]))?;
    t.insert(item(0x342, &["Hookshot"]))?;
    // $343 is the bomb count
    t.insert(item(0x344, &["Mushroom", "Magic Powder"]))?;
    t.insert(item(0x345, &["Fire Rod"]))?;
    t.insert(item(0x346, &["Ice Rod"]))?;
    t.insert(item(0x347, &["Bombos Medallion"]))?;
    t.insert(item(0x348, &["Ether Medallion"]))?;
    t.insert(item(0x349, &["Quake Medallion"]))?;
    t.insert(item(0x34A, &["Lamp"]))?;
    t.insert(item(0x34B, &["Hammer"]))?;
    t.insert(item(0x34C, &["Shovel", "Flute", "Flute (activated)"]))?;
    t.insert(item(0x34D, &["Bug Catching Net"]))?;
    t.insert(item(0x34E, &["Book of Mudora"]))?;
    // $34F is the selected bottle
    t.insert(item(0x350, &["Cane of Somaria"]))?;
    t.insert(item(0x351, &["Cane of Byrna"]))?;
    t.insert(item(0x352, &["Magic Cape"]))?;
    t.insert(item(0x353, &["Magic Scroll", "Magic Mirror"]))?;
    t.insert(
        item(0x354, &["Power Gloves", "Titan's Mitts"]).then_call(rom.update_palette_armor_gloves),
    )?;
    t.insert(item(0x355, &["Pegasus Boots"]))?;
    t.insert(item(0x356, &["Flippers"]))?;
    t.insert(item(0x357, &["Moon Pearl"]))?;
    t.insert(
        item(
            0x359,
            &["Fighter Sword", "Master Sword", "Tempered Sword", "Golden Sword"],
        )
        .then_call(rom.decomp_gfx_sword)
        .then_call(rom.update_palette_sword),
    )?;
    t.insert(
        item(0x35A, &["Blue Shield", "Red Shield", "Mirror Shield"])
            .then_call(rom.decomp_gfx_shield)
            .then_call(rom.update_palette_shield),
    )?;
    t.insert(item(0x35B, &["Blue Mail", "Red Mail"]).then_call(rom.update_palette_armor_gloves))?;
    for offset in 0x35C..=0x35F {
        t.insert(SyncItem::custom_u8(
            offset,
            SyncGroup::Items,
            &BOTTLE_NAMES[1..],
            Bottle,
        ))?;
    }

    // bomb and arrow capacity upgrades
    t.insert(item(0x370, &[]))?;
    t.insert(item(0x371, &[]))?;
    t.insert(SyncItem::bit_or_u8(0x374, SyncGroup::Items, &PENDANT_NAMES))?;
    t.insert(SyncItem::bit_or_u8(0x37A, SyncGroup::Items, &CRYSTAL_NAMES))?;
    t.insert(item(0x37B, &["1/2 Magic", "1/4 Magic"]).limited_to(2))?;
    t.insert(SyncItem::bit_or_u8(0x38C, SyncGroup::Items, &RANDOMIZER_BITS_38C))?;
    t.insert(SyncItem::bit_or_u8(0x38E, SyncGroup::Items, &RANDOMIZER_BITS_38E))?;

    t.insert(SyncItem::max_u8(0x3C5, SyncGroup::Progress, &[]))?;
    t.insert(SyncItem::bit_or_u8(0x3C6, SyncGroup::Progress, &[]))?;
    t.insert(SyncItem::max_u8(0x3C7, SyncGroup::Progress, &[]))?;

    for room in 0..UNDERWORLD_ROOMS {
        let mut names = [""; 16];
        let mut verbs = [""; 16];
        let mut location = format!("room ${room:03x}");
        if let Some((_, boss, dungeon)) = BOSS_ROOMS.iter().find(|(r, _, _)| *r == room) {
            names[0xB] = boss;
            verbs[0xB] = "defeated";
            location = dungeon.to_string();
        }
        t.insert(
            SyncItem::bit_or_u16(room << 1, SyncGroup::Underworld, &names)
                .with_verbs(&verbs)
                .at(location),
        )?;
    }

    for area in 0..OVERWORLD_AREAS {
        t.insert(
            SyncItem::bit_or_u8(
                0x280 + area,
                SyncGroup::Overworld,
                &["", "bomb wall", "", "", "", "overlay", "item", ""],
            )
            .with_verbs(&["", "opened", "", "", "", "activated", "collected", ""])
            .at(overworld_name(area)),
        )?;
    }

    Ok(t)
}

fn normalize_bow(v: u16) -> u16 {
    match v {
        2 => 1,
        v if v >= 4 => 3,
        v => v,
    }
}

/// Bow level merged independently of whether arrows are present; the
/// arrows-present bit is recomputed on the console.
#[derive(Debug, Clone, Copy)]
pub struct Bow;

impl CustomPolicy for Bow {
    fn generate(
        &self,
        item: &SyncItem,
        ctx: &MergeContext<'_>,
        mut a: Emitter,
        slot: ConfirmSlot,
    ) -> Option<Generated> {
        let initial = normalize_bow(item.read(&ctx.local.sram));
        let mut max = initial;
        let mut winner = None;
        for p in ctx.sources(item.offset, 1) {
            let v = normalize_bow(item.read(&p.sram));
            if v > max {
                max = v;
                winner = Some(p);
            }
        }
        let from = winner?.display_name();

        let name = BOW_NAMES
            .get(usize::from(max) - 1)
            .copied()
            .unwrap_or("Bow");
        let notification = format!("got {name} from {from}");
        a.comment(format!("{notification}:"));

        a.lda_long(0x7E_F377); // arrows
        a.cmp_imm8(0x01);
        a.lda_imm8(max as u8);
        a.adc_imm8(0x00);
        a.sta_long(item.bus_address(ctx.local));

        a.comment(format!("write confirmation for #{}:", slot.index));
        slot.store(&mut a, Width::Byte, 0x01);

        Some(Generated {
            code: a,
            notification: Some(notification),
        })
    }
}

/// Existing bottle contents are kept; an empty slot takes the best remote
/// contents. A remote mushroom (`1`) does not count.
#[derive(Debug, Clone, Copy)]
pub struct Bottle;

impl CustomPolicy for Bottle {
    fn generate(
        &self,
        item: &SyncItem,
        ctx: &MergeContext<'_>,
        mut a: Emitter,
        slot: ConfirmSlot,
    ) -> Option<Generated> {
        let initial = item.read(&ctx.local.sram);
        if initial >= 2 {
            return None;
        }

        let mut max = initial;
        let mut winner = None;
        for p in ctx.sources(item.offset, 1) {
            let v = match item.read(&p.sram) {
                1 => 0,
                v => v,
            };
            if v > max {
                max = v;
                winner = Some(p);
            }
        }
        let from = winner?.display_name();
        let addr = item.bus_address(ctx.local);

        let notification = item
            .names
            .get(usize::from(max) - 1)
            .filter(|n| !n.is_empty())
            .map(|n| format!("got {n} from {from}"));
        match &notification {
            Some(text) => a.comment(format!("{text}:")),
            None => a.comment(format!("got bottle value ${max:02x} from {from}:")),
        }
        a.comment(format!("u8 [${addr:06x}]: ${initial:02x} -> ${max:02x}"));

        let fail = format!("fail{addr:06x}");
        let next = format!("next{addr:06x}");
        a.lda_long(addr);
        a.cmp_imm8(initial as u8);
        a.bne(&fail);
        a.lda_imm8(max as u8);
        a.sta_long(addr);
        slot.guarded_tail(&mut a, Width::Byte, &fail, &next);

        Some(Generated {
            code: a,
            notification,
        })
    }
}

/// 75% brightness of a BGR555 color, for the tunic's shaded pixels.
pub fn shade(color: u16) -> u16 {
    let c = |shift: u16| (((color >> shift) & 31) * 3 / 4) << shift;
    c(0) | c(5) | c(10)
}

/// Emits a tunic palette change in 16-bit mode.
pub fn emit_tunic_color(a: &mut Emitter, color: u16) {
    a.comment(format!("tunic color ${color:04x}:"));
    a.lda_imm16(color);
    a.sta_long(wram::LINK_PALETTE + (0x0C << 1));
    a.sta_long(wram::LINK_PALETTE + (0x0A << 1));
    a.lda_imm16(shade(color));
    a.sta_long(wram::LINK_PALETTE + (0x0B << 1));
    a.sta_long(wram::LINK_PALETTE + (0x09 << 1));
    a.inc_dp(wram::PALETTE_DIRTY);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{FLAG_M, FLAG_X};
    use crate::player::Player;

    fn named(index: usize, name: &str) -> Player {
        let mut p = Player::new(Some(index));
        p.name = name.to_string();
        p
    }

    fn run(item: &SyncItem, local: &Player, remotes: &[&Player]) -> Option<Generated> {
        let mut body = Emitter::new(UPDATE_SLOT_A);
        body.assume_sep(FLAG_M | FLAG_X);
        let ctx = MergeContext {
            local,
            remotes,
            notify_unnamed: false,
        };
        item.generate(&ctx, &body, ConfirmSlot::new(UPDATE_SLOT_A, 0))
    }

    fn table() -> SyncTable {
        sync_table(&RomFunctions::for_region(RomRegion::NorthAmerica)).unwrap()
    }

    #[test]
    fn table_builds_without_overlaps() {
        let t = table();
        assert!(t.get(0x340).is_some());
        assert!(t.get(0x343).is_none());
        assert_eq!(t.get(0x190).map(|i| i.width), Some(Width::Word));
        assert_eq!(
            t.iter().filter(|i| i.group == SyncGroup::Overworld).count(),
            usize::from(OVERWORLD_AREAS)
        );
    }

    #[test]
    fn module_allow_list() {
        let st = |m, prior| PlayerState {
            module: Module(m),
            prior_module: Module(prior),
            ..PlayerState::default()
        };
        assert!(is_in_game(&st(0x07, 0)));
        assert!(is_in_game(&st(0x09, 0)));
        assert!(!is_in_game(&st(0x05, 0)));
        assert!(!is_in_game(&st(0x14, 0)));
        assert!(!is_in_game(&st(0x17, 0)));
        assert!(!is_in_game(&st(0x1B, 0)));
        assert!(is_in_game(&st(0x0E, 0x09)));
        assert!(!is_in_game(&st(0x0E, 0x01)));
    }

    #[test]
    fn bottle_keeps_existing_contents() {
        let t = table();
        let bottle = t.get(0x35C).unwrap();
        let mut local = named(0, "me");
        local.sram.write_u8(0x35C, 3);
        let mut remote = named(1, "r");
        remote.sram.write_u8(0x35C, 6);
        assert!(run(bottle, &local, &[&remote]).is_none());
    }

    #[test]
    fn bottle_ignores_remote_mushroom() {
        let t = table();
        let bottle = t.get(0x35D).unwrap();
        let local = named(0, "me");
        let mut a = named(1, "a");
        a.sram.write_u8(0x35D, 1);
        assert!(run(bottle, &local, &[&a]).is_none());

        let mut b = named(2, "b");
        b.sram.write_u8(0x35D, 5);
        let out = run(bottle, &local, &[&a, &b]).unwrap();
        assert_eq!(out.notification.as_deref(), Some("got Fairy from b"));
    }

    #[test]
    fn bow_treats_arrows_as_the_same_level() {
        let t = table();
        let bow = t.get(0x340).unwrap();
        let mut local = named(0, "me");
        local.sram.write_u8(0x340, 2);
        let mut remote = named(1, "r");
        remote.sram.write_u8(0x340, 1);
        assert!(run(bow, &local, &[&remote]).is_none());

        remote.sram.write_u8(0x340, 4);
        let out = run(bow, &local, &[&remote]).unwrap();
        assert_eq!(out.notification.as_deref(), Some("got Silver Bow from r"));
        let code = out.code.assemble().unwrap().code;
        assert_eq!(
            &code[..14],
            &[0xAF, 0x77, 0xF3, 0x7E, 0xC9, 0x01, 0xA9, 0x03, 0x69, 0x00, 0x8F, 0x40, 0xF3, 0x7E]
        );
    }

    #[test]
    fn sword_upgrade_refreshes_graphics() {
        let t = table();
        let sword = t.get(0x359).unwrap();
        let local = named(0, "me");
        let mut remote = named(1, "r");
        remote.sram.write_u8(0x359, 2);
        let out = run(sword, &local, &[&remote]).unwrap();
        assert_eq!(out.notification.as_deref(), Some("got Master Sword from r"));
        let text = out.code.assemble().unwrap().text;
        assert!(text.contains("jsl   $00d2c8"));
        assert!(text.contains("jsl   $1bed03"));
    }

    #[test]
    fn boss_defeat_names_the_boss() {
        let t = table();
        let room = t.get(0x0C8 << 1).unwrap();
        let mut body = Emitter::new(UPDATE_SLOT_A);
        body.assume_rep(FLAG_M | FLAG_X);
        let local = named(0, "me");
        let mut remote = named(1, "r");
        remote.sram.write(0x0C8 << 1, &[0x00, 0x08]);
        let ctx = MergeContext {
            local: &local,
            remotes: &[&remote],
            notify_unnamed: false,
        };
        let out = room
            .generate(&ctx, &body, ConfirmSlot::new(UPDATE_SLOT_A, 0))
            .unwrap();
        assert_eq!(
            out.notification.as_deref(),
            Some("got Armos Knights defeated from r")
        );
    }

    #[test]
    fn shade_darkens_each_channel() {
        assert_eq!(shade(0x7FFF), (23 << 10) | (23 << 5) | 23);
        assert_eq!(shade(0), 0);
    }
}

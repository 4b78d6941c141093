//! The per-session reconciliation state machine.
//!
//! [`Game`] owns every piece of mutable sync state and never touches I/O. The
//! session feeds it read completions, relay payloads and timer ticks, and
//! carries out the writes and broadcasts it hands back.

use std::sync::Arc;

use crate::alttp::{
    self, MAIN_READS, RomFunctions, RomRegion, TRAMPOLINE, UPDATE_SLOT_A, UPDATE_SLOT_B, wram,
};
use crate::confirm::{ConfirmationTracker, Outcome};
use crate::keys::{KeyScan, SMALL_KEY_FIRST, SMALL_KEY_LAST, SmallKeySync};
use crate::mirror::{MemoryMirror, Region};
use crate::notify::NotificationBus;
use crate::payload::{self, PayloadWriter};
use crate::player::{MESSAGE_TTL, Module, PlayerRegistry, PlayerState, Stamped};
use crate::sync::{MergeContext, SyncFlags, SyncTable, SyncTableError};
use crate::update::{self, PendingWrite, UpdateRequest};

/// Frames to wait after a routine ran before generating the next one.
const UPDATE_COOLDOWN: u8 = 2;
/// Location is resent at least this often even when unchanged.
const LOCATION_RESEND_FRAMES: u8 = 60;

const SRAM_SHADOW_LEN: usize = 0x500;

/// A console read, by bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadRequest {
    pub address: u32,
    pub size: usize,
}

/// A console write, by bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Where the current update routine is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Nothing outstanding; a routine may be generated on the next frame.
    Idle,
    /// Writes handed to the device, completion not yet reported.
    Writing,
    /// Written and redirected to; waiting for the console to run it.
    Checking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameOptions {
    pub sync: SyncFlags,
    pub notify_unnamed: bool,
    pub region: RomRegion,
    /// Tunic color to apply to the local player, BGR555.
    pub tunic_color: Option<u16>,
}

impl Default for GameOptions {
    fn default() -> Self {
        Self {
            sync: SyncFlags::default(),
            notify_unnamed: false,
            region: RomRegion::NorthAmerica,
            tunic_color: None,
        }
    }
}

/// What the session must do after a read cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameOutput {
    /// Routine writes, in order; the trampoline byte is always last.
    pub writes: Vec<WriteRequest>,
    /// Game payload to broadcast to the group.
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug)]
pub struct Game {
    options: GameOptions,
    table: SyncTable,
    players: PlayerRegistry,
    keys: SmallKeySync,
    confirmations: ConfirmationTracker<PendingWrite>,
    bus: Arc<NotificationBus>,
    stage: Stage,
    slot: u32,
    cooldown: u8,
    last_frame: Option<u8>,
    previous_sram: Option<MemoryMirror>,
    last_location: Option<PlayerState>,
    location_age: u8,
    applied_color: Option<u16>,
}

impl Game {
    pub fn new(
        name: &str,
        team: u8,
        options: GameOptions,
        bus: Arc<NotificationBus>,
    ) -> Result<Self, SyncTableError> {
        let table = alttp::sync_table(&RomFunctions::for_region(options.region))?;
        log::info!("alttp: {} sync items registered", table.len());
        Ok(Self {
            options,
            table,
            players: PlayerRegistry::new(name, team),
            keys: SmallKeySync::new(),
            confirmations: ConfirmationTracker::new(),
            bus,
            stage: Stage::Idle,
            slot: UPDATE_SLOT_A,
            cooldown: 0,
            last_frame: None,
            previous_sram: None,
            last_location: None,
            location_age: 0,
            applied_color: None,
        })
    }

    pub fn players(&self) -> &PlayerRegistry {
        &self.players
    }

    pub fn table(&self) -> &SyncTable {
        &self.table
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Base of the slot the next routine will be written to.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn is_in_game(&self) -> bool {
        alttp::is_in_game(&self.players.local().state)
    }

    /// Reads to issue this cycle: the fixed WRAM ranges, plus the
    /// confirmation check while a routine is outstanding.
    pub fn main_reads(&self) -> Vec<ReadRequest> {
        let mut reads: Vec<ReadRequest> = MAIN_READS
            .iter()
            .map(|&(address, size)| ReadRequest { address, size })
            .collect();
        if self.stage == Stage::Checking {
            let (address, size) = self.confirmations.check_read();
            reads.push(ReadRequest { address, size });
        }
        reads
    }

    /// Takes in one completed batch of [`Game::main_reads`].
    pub fn complete_reads(&mut self, reads: &[(ReadRequest, Vec<u8>)], now_ms: u32) -> FrameOutput {
        let check_address = (self.stage == Stage::Checking).then(|| self.confirmations.check_read().0);
        let mut check = None;
        {
            let local = self.players.local_mut();
            for (req, data) in reads {
                if Some(req.address) == check_address {
                    check = Some(data.as_slice());
                    continue;
                }
                match req.address.checked_sub(Region::Wram.bus_base()) {
                    Some(offset) if (offset as usize) < Region::Wram.size() => {
                        local.wram.write(offset as usize, data)
                    }
                    _ => log::warn!("alttp: ignoring read at ${:06x}", req.address),
                }
            }
            let shadow = local
                .wram
                .bytes(wram::SRAM_SHADOW..wram::SRAM_SHADOW + SRAM_SHADOW_LEN)
                .to_vec();
            local.sram.write(0, &shadow);
        }

        if let Some(bytes) = check {
            self.reconcile(bytes);
        }
        self.refresh_local_state();

        let frame = self.players.local().wram.read_u8(wram::FRAME);
        if self.last_frame == Some(frame) {
            return FrameOutput::default();
        }
        self.last_frame = Some(frame);
        self.advance_frame(frame, now_ms)
    }

    fn refresh_local_state(&mut self) {
        let local = self.players.local_mut();
        let w = &local.wram;
        let module = Module(w.read_u8(wram::MODULE));
        let in_dungeon = w.read_u8(wram::IN_DUNGEON) & 1 != 0;
        let area = w.read_u16(wram::OVERWORLD_AREA);
        let room = w.read_u16(wram::DUNGEON_ROOM);
        let x = w.read_u16(wram::X);
        let y = w.read_u16(wram::Y);

        let mut location = u32::from(if in_dungeon { room } else { area });
        if in_dungeon {
            location |= 1 << 16;
        }
        if area & 0x40 != 0 {
            location |= 1 << 17;
        }

        let prev = &local.state;
        let mut state = PlayerState {
            module,
            prior_module: if module != prev.module {
                prev.module
            } else {
                prev.prior_module
            },
            sub_module: w.read_u8(wram::SUB_MODULE),
            sub_sub_module: w.read_u8(wram::SUB_SUB_MODULE),
            location,
            x,
            y,
            dungeon: w.read_u16(wram::DUNGEON),
            dungeon_entrance: w.read_u16(0x010E),
            last_overworld_x: prev.last_overworld_x,
            last_overworld_y: prev.last_overworld_y,
            x_offs: w.read_u16(wram::SCROLL_X).wrapping_sub(w.read_u16(wram::SCROLL_X_ADJUST)) as i16,
            y_offs: w.read_u16(wram::SCROLL_Y).wrapping_sub(w.read_u16(wram::SCROLL_Y_ADJUST)) as i16,
            color: self.options.tunic_color.unwrap_or(0),
        };
        if module.is_overworld() {
            state.last_overworld_x = x;
            state.last_overworld_y = y;
        }
        local.state = state;
    }

    fn advance_frame(&mut self, frame: u8, now_ms: u32) -> FrameOutput {
        for event in self.players.tick() {
            self.bus.publish(&event.to_string());
        }

        self.report_local_pickups();
        if self.is_in_game() {
            self.keys.sample(self.players.local_mut(), now_ms);
        }

        let payload = Some(self.frame_payload(frame));

        let writes = if self.cooldown > 0 {
            self.cooldown -= 1;
            Vec::new()
        } else {
            self.generate_update()
        };

        FrameOutput { writes, payload }
    }

    fn report_local_pickups(&mut self) {
        let current = &self.players.local().sram;
        if let Some(previous) = &self.previous_sram {
            for item in self.table.enabled(&self.options.sync) {
                for statement in item.local_check(previous, current) {
                    self.bus.publish(&statement.to_string());
                }
            }
        }
        self.previous_sram = Some(current.clone());
    }

    fn frame_payload(&mut self, frame: u8) -> Vec<u8> {
        let local = self.players.local();
        let mut w = PayloadWriter::new(local.team, frame);

        self.location_age = self.location_age.saturating_add(1);
        if self.last_location.as_ref() != Some(&local.state)
            || self.location_age >= LOCATION_RESEND_FRAMES
        {
            w.location(&local.state);
            self.last_location = Some(local.state.clone());
            self.location_age = 0;
        }

        let keys: Vec<Stamped> = (SMALL_KEY_FIRST..=SMALL_KEY_LAST)
            .map(|offs| local.stamped.get(&offs).copied().unwrap_or_default())
            .collect();
        w.wram(SMALL_KEY_FIRST, &keys);

        let sram = &local.sram;
        if frame & 15 == 0 {
            w.sram(0x340, sram.bytes(0x340..0x390));
            w.sram(0x3C5, sram.bytes(0x3C5..0x3CA));
        }
        if self.options.sync.underworld && frame & 31 == 0 {
            w.sram(0x000, sram.bytes(0x000..0x250));
        }
        if self.options.sync.overworld && frame & 31 == 16 {
            w.sram(0x280, sram.bytes(0x280..0x340));
        }
        w.finish()
    }

    fn generate_update(&mut self) -> Vec<WriteRequest> {
        if self.stage != Stage::Idle || !self.is_in_game() {
            return Vec::new();
        }

        let local = self.players.local();
        let remotes = self.players.teammates();
        let scan = if self.options.sync.small_keys {
            self.keys.candidates(local, &remotes)
        } else {
            KeyScan::default()
        };
        let tunic_color = self
            .options
            .tunic_color
            .filter(|&c| self.applied_color != Some(c));
        let req = UpdateRequest {
            table: &self.table,
            flags: &self.options.sync,
            ctx: MergeContext {
                local,
                remotes: &remotes,
                notify_unnamed: self.options.notify_unnamed,
            },
            keys: &scan.updates,
            tunic_color,
        };

        let routine = update::generate(self.slot, req);
        self.keys.adopt(self.players.local_mut(), &scan.adopted);
        let routine = match routine {
            Ok(Some(routine)) => routine,
            Ok(None) => return Vec::new(),
            Err(e) => {
                log::error!("alttp: update routine failed to assemble: {e}");
                return Vec::new();
            }
        };

        for write in &routine.pending {
            if let PendingWrite::SmallKey(k) = write {
                self.keys.begin_write(k);
            }
        }
        self.confirmations.submit(self.slot, routine.pending);
        self.stage = Stage::Writing;

        vec![
            WriteRequest {
                address: self.slot,
                data: routine.assembled.code,
            },
            WriteRequest {
                address: TRAMPOLINE,
                data: vec![(self.slot >> 8) as u8],
            },
        ]
    }

    /// Reports the device's answer to the writes from the last [`FrameOutput`].
    pub fn routine_written(&mut self, ok: bool) {
        if self.stage != Stage::Writing {
            return;
        }
        if ok {
            self.stage = Stage::Checking;
            return;
        }
        log::warn!("alttp: update routine write failed");
        self.abandon_routine();
    }

    fn abandon_routine(&mut self) {
        for write in self.confirmations.abandon() {
            if let PendingWrite::SmallKey(k) = write {
                self.keys
                    .confirm(self.players.local_mut(), k.offset, Outcome::Skipped);
            }
        }
        if self.stage != Stage::Idle {
            self.flip_slot();
        }
        self.stage = Stage::Idle;
    }

    fn flip_slot(&mut self) {
        self.slot = if self.slot == UPDATE_SLOT_A {
            UPDATE_SLOT_B
        } else {
            UPDATE_SLOT_A
        };
    }

    fn reconcile(&mut self, bytes: &[u8]) {
        let Some(outcomes) = self.confirmations.reconcile(bytes) else {
            return;
        };
        for (write, outcome) in outcomes {
            match write {
                PendingWrite::Sram {
                    offset,
                    notification,
                } => {
                    if outcome != Outcome::Executed {
                        log::debug!("alttp: write to ${offset:03x} skipped by console");
                        continue;
                    }
                    if let Some(text) = notification {
                        self.bus.publish(&text);
                    }
                    // the write is not a local pickup
                    if let (Some(prev), Some(item)) =
                        (self.previous_sram.as_mut(), self.table.get(offset))
                    {
                        let start = usize::from(offset);
                        let sram = &self.players.local().sram;
                        prev.write(start, sram.bytes(start..start + item.len()));
                    }
                }
                PendingWrite::SmallKey(k) => {
                    self.keys.confirm(self.players.local_mut(), k.offset, outcome);
                    if outcome == Outcome::Executed {
                        self.bus.publish(&k.notification());
                    }
                }
                PendingWrite::TunicColor(color) => {
                    if outcome == Outcome::Executed {
                        self.applied_color = Some(color);
                    }
                }
            }
        }
        self.flip_slot();
        self.cooldown = UPDATE_COOLDOWN;
        self.stage = Stage::Idle;
    }

    /// Takes in a game payload relayed from player `index`.
    pub fn handle_payload(&mut self, index: usize, data: &[u8]) {
        if self.players.local_index() == Some(index) {
            return;
        }
        let payload = match payload::decode(data) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("alttp: dropping payload from player {index:02x}: {e}");
                return;
            }
        };
        let Some(player) = self.players.remote_entry(index) else {
            return;
        };
        if !payload::apply(player, &payload) {
            return;
        }
        self.players.set_ttl(index, MESSAGE_TTL);
        if let Some(event) = self.players.announce(index) {
            self.bus.publish(&event.to_string());
        }
    }

    /// Adopts the index the relay assigned to us.
    pub fn assign_local_index(&mut self, index: usize) {
        if self.players.assign_local_index(index) {
            log::info!("alttp: local player index {index:02x}");
        }
    }

    pub fn has_local_index(&self) -> bool {
        self.players.local_index().is_some()
    }

    /// Payload carrying only the player name, for the slow heartbeat.
    pub fn name_payload(&self) -> Vec<u8> {
        let local = self.players.local();
        let mut w = PayloadWriter::new(local.team, self.last_frame.unwrap_or(0));
        w.player_name(&local.name);
        w.finish()
    }

    /// Forgets remotes and anything in flight, keeping local memory.
    pub fn reset(&mut self) {
        log::info!("alttp: reset");
        self.abandon_routine();
        self.keys.reset(self.players.local_mut());
        self.players.reset();
        self.cooldown = 0;
        self.last_location = None;
        self.applied_color = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game() -> Game {
        Game::new("me", 0, GameOptions::default(), Arc::new(NotificationBus::new())).unwrap()
    }

    #[test]
    fn main_reads_add_the_check_only_while_checking() {
        let g = game();
        assert_eq!(g.main_reads().len(), MAIN_READS.len());
    }

    #[test]
    fn echoes_of_our_own_payloads_are_ignored() {
        let mut g = game();
        g.assign_local_index(4);
        let mut w = PayloadWriter::new(0, 1);
        w.sram(0x340, &[1]);
        g.handle_payload(4, &w.finish());
        assert_eq!(g.players().active_remotes().count(), 0);
    }

    #[test]
    fn joining_player_is_announced_once() {
        let bus = Arc::new(NotificationBus::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |s| sink.lock().unwrap().push(s.to_string()));
        let mut g = Game::new("me", 0, GameOptions::default(), bus).unwrap();

        let mut w = PayloadWriter::new(0, 1);
        w.player_name("zelda");
        let data = w.finish();
        g.handle_payload(2, &data);
        g.handle_payload(2, &data);
        assert_eq!(*seen.lock().unwrap(), vec!["zelda joined".to_string()]);
    }

    #[test]
    fn failed_write_frees_the_slot() {
        let mut g = game();
        g.stage = Stage::Writing;
        g.routine_written(false);
        assert_eq!(g.stage(), Stage::Idle);
        assert_eq!(g.slot(), UPDATE_SLOT_B);
    }
}

use std::collections::BTreeMap;
use std::fmt;

use crate::mirror::{MemoryMirror, Region};

pub const MAX_PLAYERS: usize = 256;
/// TTL given to a player each time one of its messages arrives.
pub const MESSAGE_TTL: u8 = 255;

/// The game's main execution module (`$7E0010`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Module(pub u8);

impl Module {
    pub fn is_overworld(self) -> bool {
        self.0 == 0x09 || self.0 == 0x0B
    }

    pub fn is_dungeon(self) -> bool {
        self.0 == 0x07
    }
}

/// Where a player is and what the game is doing, as carried by location messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerState {
    pub module: Module,
    pub prior_module: Module,
    pub sub_module: u8,
    pub sub_sub_module: u8,
    /// Bit 16 set means `location & 0xFFFF` is a dungeon room, else an overworld area.
    pub location: u32,
    pub x: u16,
    pub y: u16,
    pub dungeon: u16,
    pub dungeon_entrance: u16,
    pub last_overworld_x: u16,
    pub last_overworld_y: u16,
    pub x_offs: i16,
    pub y_offs: i16,
    pub color: u16,
}

impl PlayerState {
    pub fn is_in_dungeon(&self) -> bool {
        self.module.is_dungeon() || self.location & (1 << 16) != 0
    }

    pub fn dungeon_room(&self) -> Option<u16> {
        (self.location & (1 << 16) != 0).then_some((self.location & 0xFFFF) as u16)
    }
}

/// A value with the time (in milliseconds) it last changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stamped {
    pub value: u16,
    pub timestamp: u32,
}

#[derive(Debug, Clone)]
pub struct Player {
    pub index: Option<usize>,
    pub name: String,
    pub team: u8,
    pub ttl: u8,
    /// Last accepted payload frame counter.
    pub frame: u8,
    pub state: PlayerState,
    pub sram: MemoryMirror,
    pub wram: MemoryMirror,
    /// Time-ordered fields keyed by WRAM offset.
    pub stamped: BTreeMap<u16, Stamped>,
    announce_join: bool,
}

impl Player {
    pub fn new(index: Option<usize>) -> Self {
        Self {
            index,
            name: String::new(),
            team: 0,
            ttl: 0,
            frame: 0,
            state: PlayerState::default(),
            sram: MemoryMirror::new(Region::Sram),
            wram: MemoryMirror::new(Region::Wram),
            stamped: BTreeMap::new(),
            announce_join: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ttl > 0
    }

    pub fn mirror(&self, region: Region) -> &MemoryMirror {
        match region {
            Region::Wram => &self.wram,
            Region::Sram => &self.sram,
        }
    }

    /// Name for notifications; falls back to the slot number before a name arrives.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            match self.index {
                Some(i) => format!("player {i:02x}"),
                None => "local player".to_string(),
            }
        } else {
            self.name.clone()
        }
    }

    /// Marks the player as joined when its name changes, so the next
    /// [`PlayerRegistry::announce`] reports it.
    pub fn set_name(&mut self, name: String) {
        if self.name != name {
            self.name = name;
            self.announce_join = true;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Joined(String),
    Left(String),
}

impl fmt::Display for PlayerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerEvent::Joined(name) => write!(f, "{name} joined"),
            PlayerEvent::Left(name) => write!(f, "{name} left"),
        }
    }
}

/// Fixed-capacity table of the local player and every remote the relay has mentioned.
#[derive(Debug, Clone)]
pub struct PlayerRegistry {
    local: Player,
    remotes: Vec<Option<Player>>,
}

impl PlayerRegistry {
    pub fn new(name: &str, team: u8) -> Self {
        let mut local = Player::new(None);
        local.name = name.to_string();
        local.team = team;
        Self {
            local,
            remotes: vec![None; MAX_PLAYERS],
        }
    }

    pub fn local(&self) -> &Player {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut Player {
        &mut self.local
    }

    pub fn local_index(&self) -> Option<usize> {
        self.local.index
    }

    /// Moves the local player to the slot the relay assigned. Any remote that
    /// occupied that slot is dropped.
    pub fn assign_local_index(&mut self, index: usize) -> bool {
        if index >= MAX_PLAYERS || self.local.index == Some(index) {
            return false;
        }
        self.remotes[index] = None;
        self.local.index = Some(index);
        true
    }

    /// The remote in `index`, created on first use. `None` for the local slot
    /// and out-of-range indices.
    pub fn remote_entry(&mut self, index: usize) -> Option<&mut Player> {
        if index >= MAX_PLAYERS || self.local.index == Some(index) {
            return None;
        }
        Some(self.remotes[index].get_or_insert_with(|| Player::new(Some(index))))
    }

    pub fn remote(&self, index: usize) -> Option<&Player> {
        self.remotes.get(index)?.as_ref()
    }

    /// Refreshes a remote's liveness. A player coming back from zero will be
    /// announced again once it has a name.
    pub fn set_ttl(&mut self, index: usize, ttl: u8) {
        if let Some(p) = self.remote_entry(index) {
            if p.ttl == 0 && ttl > 0 {
                p.announce_join = true;
            }
            p.ttl = ttl;
        }
    }

    /// Returns the join event for `index` once, after the player has a name.
    pub fn announce(&mut self, index: usize) -> Option<PlayerEvent> {
        let p = self.remotes.get_mut(index)?.as_mut()?;
        if p.announce_join && p.ttl > 0 && !p.name.is_empty() {
            p.announce_join = false;
            return Some(PlayerEvent::Joined(p.name.clone()));
        }
        None
    }

    /// Ages every active remote by one frame.
    pub fn tick(&mut self) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        for p in self.remotes.iter_mut().flatten() {
            if p.ttl == 0 {
                continue;
            }
            p.ttl -= 1;
            if p.ttl == 0 {
                p.announce_join = false;
                events.push(PlayerEvent::Left(p.display_name()));
            }
        }
        events
    }

    pub fn active_remotes(&self) -> impl Iterator<Item = &Player> {
        self.remotes.iter().flatten().filter(|p| p.is_active())
    }

    /// Active remotes on the local player's team; the merge sources.
    pub fn teammates(&self) -> Vec<&Player> {
        let team = self.local.team;
        self.active_remotes().filter(|p| p.team == team).collect()
    }

    /// Forgets every remote and the local slot assignment.
    pub fn reset(&mut self) {
        for slot in &mut self.remotes {
            *slot = None;
        }
        self.local.index = None;
        self.local.stamped.values_mut().for_each(|s| s.timestamp = 0);
    }
}

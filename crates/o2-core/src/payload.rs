//! The per-game payload carried inside relay broadcasts.
//!
//! Layout: serialization version, team, frame counter, then a run of
//! `(message type, body)` records until the end of the buffer.

use thiserror::Error;

use crate::player::{Module, Player, PlayerState, Stamped};

pub const SERIALIZATION_VERSION: u8 = 0x13;
pub const PLAYER_NAME_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload truncated")]
    Truncated,

    #[error("serialization version {0:#04x} does not match {expected:#04x}", expected = SERIALIZATION_VERSION)]
    VersionMismatch(u8),

    #[error("unknown message type {0:#04x}")]
    UnknownMessage(u8),

    #[error("message type {0:?} has no known length")]
    Unparseable(MessageType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Location = 1,
    Sfx = 2,
    Sprites1 = 3,
    Sprites2 = 4,
    Wram = 5,
    Sram = 6,
    Tilemaps = 7,
    Objects = 8,
    Ancillae = 9,
    Torches = 10,
    PvP = 11,
    PlayerName = 12,
}

impl TryFrom<u8> for MessageType {
    type Error = PayloadError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => MessageType::Location,
            2 => MessageType::Sfx,
            3 => MessageType::Sprites1,
            4 => MessageType::Sprites2,
            5 => MessageType::Wram,
            6 => MessageType::Sram,
            7 => MessageType::Tilemaps,
            8 => MessageType::Objects,
            9 => MessageType::Ancillae,
            10 => MessageType::Torches,
            11 => MessageType::PvP,
            12 => MessageType::PlayerName,
            other => return Err(PayloadError::UnknownMessage(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Location(PlayerState),
    Wram { start: u16, entries: Vec<Stamped> },
    Sram { start: u16, data: Vec<u8> },
    PlayerName(String),
    /// Decoded for its length only.
    Skipped(MessageType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub team: u8,
    pub frame: u8,
    pub messages: Vec<Message>,
    /// Why parsing stopped before the end of the buffer, if it did.
    pub error: Option<PayloadError>,
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PayloadError> {
        if self.buf.len() < n {
            return Err(PayloadError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, PayloadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PayloadError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, PayloadError> {
        Ok(self.u16()? as i16)
    }

    fn u24(&mut self) -> Result<u32, PayloadError> {
        let b = self.take(3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn u32(&mut self) -> Result<u32, PayloadError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Decodes a payload. A version mismatch or a truncated header rejects the
/// whole payload; a bad record only ends parsing, keeping what came before.
pub fn decode(buf: &[u8]) -> Result<Payload, PayloadError> {
    let mut r = Reader { buf };
    let version = r.u8()?;
    if version != SERIALIZATION_VERSION {
        return Err(PayloadError::VersionMismatch(version));
    }
    let team = r.u8()?;
    let frame = r.u8()?;

    let mut messages = Vec::new();
    let mut error = None;
    while !r.is_empty() {
        match decode_message(&mut r) {
            Ok(m) => messages.push(m),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }

    Ok(Payload {
        team,
        frame,
        messages,
        error,
    })
}

fn decode_message(r: &mut Reader<'_>) -> Result<Message, PayloadError> {
    let kind = MessageType::try_from(r.u8()?)?;
    match kind {
        MessageType::Location => {
            let state = PlayerState {
                module: Module(r.u8()?),
                prior_module: Module::default(),
                sub_module: r.u8()?,
                sub_sub_module: r.u8()?,
                location: r.u24()?,
                x: r.u16()?,
                y: r.u16()?,
                dungeon: r.u16()?,
                dungeon_entrance: r.u16()?,
                last_overworld_x: r.u16()?,
                last_overworld_y: r.u16()?,
                x_offs: r.i16()?,
                y_offs: r.i16()?,
                color: r.u16()?,
            };
            let _in_sm = r.u8()?;
            Ok(Message::Location(state))
        }
        MessageType::Sfx => {
            r.take(2)?;
            Ok(Message::Skipped(kind))
        }
        MessageType::Sprites1 => {
            skip_sprites(r)?;
            Ok(Message::Skipped(kind))
        }
        MessageType::Sprites2 => {
            r.take(1)?;
            skip_sprites(r)?;
            Ok(Message::Skipped(kind))
        }
        MessageType::Wram => {
            let count = r.u8()?;
            let start = r.u16()?;
            let mut entries = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                let timestamp = r.u32()?;
                let value = r.u16()?;
                entries.push(Stamped { value, timestamp });
            }
            Ok(Message::Wram { start, entries })
        }
        MessageType::Sram => {
            let _start_is_zero = r.u8()?;
            let _in_sm = r.u8()?;
            let start = r.u16()?;
            let count = r.u16()?;
            let data = r.take(usize::from(count))?.to_vec();
            Ok(Message::Sram { start, data })
        }
        MessageType::Tilemaps => {
            let _timestamp = r.u32()?;
            let _location = r.u24()?;
            let _start = r.u8()?;
            let len = r.u8()?;
            for _ in 0..len {
                let offs = r.u16()?;
                let count = r.u8()?;
                if offs & 0x8000 != 0 {
                    r.take(3)?;
                } else {
                    r.take(usize::from(count) * 3)?;
                }
            }
            Ok(Message::Skipped(kind))
        }
        MessageType::Ancillae => {
            let count = r.u8()?;
            for _ in 0..count {
                let index = r.u8()? & 0x7F;
                r.take(if index < 5 { 0x20 } else { 0x16 })?;
            }
            Ok(Message::Skipped(kind))
        }
        MessageType::Torches => {
            let count = r.u8()?;
            r.take(usize::from(count) * 2)?;
            Ok(Message::Skipped(kind))
        }
        MessageType::Objects | MessageType::PvP => Err(PayloadError::Unparseable(kind)),
        MessageType::PlayerName => {
            let raw = r.take(PLAYER_NAME_LEN)?;
            let name = String::from_utf8_lossy(raw)
                .trim_matches(|c: char| matches!(c, ' ' | '\t' | '\n' | '\r' | '\0'))
                .to_string();
            Ok(Message::PlayerName(name))
        }
    }
}

fn skip_sprites(r: &mut Reader<'_>) -> Result<(), PayloadError> {
    let len = r.u8()?;
    for _ in 0..len {
        let spr = r.take(6)?;
        if spr[0] & 0x80 != 0 {
            r.take(32)?;
            if (spr[5] >> 1) & 1 != 0 {
                r.take(96)?;
            }
        }
        if spr[5] & 0x80 != 0 {
            r.take(32)?;
        }
    }
    Ok(())
}

/// Whether frame `next` is older than the last accepted `last`, allowing for wrap-around.
pub fn is_stale(last: u8, next: u8) -> bool {
    let next = i32::from(next);
    let mut last = i32::from(last);
    if last - next >= 128 {
        last -= 256;
    }
    next < last
}

/// Applies a decoded payload to the player that sent it. Returns `false` when
/// the payload was stale and ignored.
pub fn apply(player: &mut Player, payload: &Payload) -> bool {
    if is_stale(player.frame, payload.frame) {
        log::debug!(
            "payload: discard stale frame data ({} < {})",
            payload.frame,
            player.frame
        );
        return false;
    }
    player.frame = payload.frame;
    player.team = payload.team;

    for m in &payload.messages {
        match m {
            Message::Location(state) => {
                let prior = player.state.module;
                player.state = state.clone();
                player.state.prior_module = prior;
            }
            Message::Wram { start, entries } => {
                for (i, e) in entries.iter().enumerate() {
                    player.stamped.insert(start.wrapping_add(i as u16), *e);
                }
            }
            Message::Sram { start, data } => player.sram.write(usize::from(*start), data),
            Message::PlayerName(name) => player.set_name(name.clone()),
            Message::Skipped(_) => {}
        }
    }
    if let Some(e) = &payload.error {
        log::debug!("payload: parsing stopped early: {e}");
    }
    true
}

/// Builds an outgoing payload.
#[derive(Debug, Clone)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new(team: u8, frame: u8) -> Self {
        Self {
            buf: vec![SERIALIZATION_VERSION, team, frame],
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.len() <= 3
    }

    pub fn location(&mut self, s: &PlayerState) -> &mut Self {
        let b = &mut self.buf;
        b.push(MessageType::Location as u8);
        b.push(s.module.0);
        b.push(s.sub_module);
        b.push(s.sub_sub_module);
        b.extend_from_slice(&s.location.to_le_bytes()[..3]);
        for v in [
            s.x,
            s.y,
            s.dungeon,
            s.dungeon_entrance,
            s.last_overworld_x,
            s.last_overworld_y,
            s.x_offs as u16,
            s.y_offs as u16,
            s.color,
        ] {
            b.extend_from_slice(&v.to_le_bytes());
        }
        b.push(0);
        self
    }

    pub fn wram(&mut self, start: u16, entries: &[Stamped]) -> &mut Self {
        let count = entries.len().min(usize::from(u8::MAX));
        self.buf.push(MessageType::Wram as u8);
        self.buf.push(count as u8);
        self.buf.extend_from_slice(&start.to_le_bytes());
        for e in &entries[..count] {
            self.buf.extend_from_slice(&e.timestamp.to_le_bytes());
            self.buf.extend_from_slice(&e.value.to_le_bytes());
        }
        self
    }

    pub fn sram(&mut self, start: u16, data: &[u8]) -> &mut Self {
        let count = data.len().min(usize::from(u16::MAX));
        self.buf.push(MessageType::Sram as u8);
        self.buf.push(u8::from(start == 0));
        self.buf.push(0);
        self.buf.extend_from_slice(&start.to_le_bytes());
        self.buf.extend_from_slice(&(count as u16).to_le_bytes());
        self.buf.extend_from_slice(&data[..count]);
        self
    }

    pub fn player_name(&mut self, name: &str) -> &mut Self {
        let mut field = [b' '; PLAYER_NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(PLAYER_NAME_LEN);
        field[..n].copy_from_slice(&bytes[..n]);
        self.buf.push(MessageType::PlayerName as u8);
        self.buf.extend_from_slice(&field);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_mismatch_rejects_everything() {
        let mut w = PayloadWriter::new(0, 1);
        w.player_name("zelda");
        let mut buf = w.finish();
        buf[0] = 0x12;
        assert_eq!(decode(&buf), Err(PayloadError::VersionMismatch(0x12)));
    }

    #[test]
    fn unknown_type_stops_parsing_but_keeps_earlier_messages() {
        let mut w = PayloadWriter::new(2, 9);
        w.player_name("link");
        let mut buf = w.finish();
        buf.extend_from_slice(&[0x7F, 0x06, 0, 0]);

        let p = decode(&buf).unwrap();
        assert_eq!(p.team, 2);
        assert_eq!(p.frame, 9);
        assert_eq!(p.messages, vec![Message::PlayerName("link".into())]);
        assert_eq!(p.error, Some(PayloadError::UnknownMessage(0x7F)));
    }

    #[test]
    fn objects_message_ends_parsing() {
        let buf = [SERIALIZATION_VERSION, 0, 0, MessageType::Objects as u8, 1, 2, 3];
        let p = decode(&buf).unwrap();
        assert!(p.messages.is_empty());
        assert_eq!(p.error, Some(PayloadError::Unparseable(MessageType::Objects)));
    }

    #[test]
    fn skipped_messages_consume_their_bodies() {
        let mut buf = vec![SERIALIZATION_VERSION, 0, 0];
        buf.extend_from_slice(&[MessageType::Sfx as u8, 0xAA, 0xBB]);
        buf.extend_from_slice(&[MessageType::Torches as u8, 2, 1, 1, 2, 2]);
        // one sprite with a palette but no graphics
        buf.extend_from_slice(&[MessageType::Sprites1 as u8, 1, 0, 0, 0, 0, 0, 0x80]);
        buf.extend_from_slice(&[0; 32]);
        buf.extend_from_slice(&[MessageType::Ancillae as u8, 1, 0x85]);
        buf.extend_from_slice(&[0; 0x16]);
        let mut tail = PayloadWriter::new(0, 0);
        tail.sram(0x340, &[1]);
        buf.extend_from_slice(&tail.finish()[3..]);

        let p = decode(&buf).unwrap();
        assert_eq!(p.error, None);
        assert_eq!(p.messages.len(), 5);
        assert_eq!(
            p.messages[4],
            Message::Sram {
                start: 0x340,
                data: vec![1]
            }
        );
    }

    #[test]
    fn truncated_record_is_reported() {
        let mut w = PayloadWriter::new(0, 0);
        w.sram(0x340, &[1, 2, 3]);
        let buf = w.finish();
        let p = decode(&buf[..buf.len() - 1]).unwrap();
        assert!(p.messages.is_empty());
        assert_eq!(p.error, Some(PayloadError::Truncated));
    }

    #[test]
    fn location_survives_the_wire() {
        let state = PlayerState {
            module: Module(0x07),
            sub_module: 1,
            location: 0x1_0012,
            x: 0x1234,
            y: 0x0456,
            x_offs: -3,
            color: 0x7FFF,
            ..PlayerState::default()
        };
        let mut w = PayloadWriter::new(0, 0);
        w.location(&state);
        let p = decode(&w.finish()).unwrap();
        assert_eq!(p.messages, vec![Message::Location(state)]);
    }

    #[test]
    fn stale_frames_account_for_wrap_around() {
        assert!(is_stale(10, 9));
        assert!(!is_stale(10, 10));
        assert!(!is_stale(10, 11));
        assert!(!is_stale(250, 3));
        assert!(is_stale(200, 100));
    }

    #[test]
    fn apply_updates_the_sender() {
        let mut w = PayloadWriter::new(1, 5);
        w.sram(0x340, &[2, 1])
            .wram(0xF37C, &[Stamped { value: 3, timestamp: 77 }])
            .player_name("zelda");
        let payload = decode(&w.finish()).unwrap();

        let mut p = Player::new(Some(4));
        assert!(apply(&mut p, &payload));
        assert_eq!(p.team, 1);
        assert_eq!(p.name, "zelda");
        assert_eq!(p.sram.read_u8(0x341), 1);
        assert!(p.sram.is_fresh(0x340, 2));
        assert_eq!(p.stamped[&0xF37C], Stamped { value: 3, timestamp: 77 });

        let mut old = PayloadWriter::new(1, 4);
        old.sram(0x340, &[9]);
        assert!(!apply(&mut p, &decode(&old.finish()).unwrap()));
        assert_eq!(p.sram.read_u8(0x340), 2);
    }
}

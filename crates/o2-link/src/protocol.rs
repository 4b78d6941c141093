//! Relay wire format.
//!
//! Every frame starts with a little-endian magic and a protocol id:
//!
//! ```text
//! u16 magic (25887) | u8 protocol | body...
//! ```
//!
//! Protocol 01 is a legacy name handshake, 02 a fixed 20-byte group header and
//! 03 a tagged union whose header carries player and server clocks.

use crate::error::ProtocolError;

pub const MAGIC: u16 = 25887;
pub const DEFAULT_PORT: u16 = 4590;
pub const GROUP_LEN: usize = 20;
/// Client type announced in protocol 01 handshakes.
pub const CLIENT_TYPE_ALTTP: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    V02,
    #[default]
    V03,
}

impl ProtocolVersion {
    pub fn id(self) -> u8 {
        match self {
            ProtocolVersion::V02 => 0x02,
            ProtocolVersion::V03 => 0x03,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0x02 => Some(ProtocolVersion::V02),
            0x03 => Some(ProtocolVersion::V03),
            _ => None,
        }
    }
}

/// Protocol 02 message kinds. Server responses set bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    RequestIndex = 0x00,
    Broadcast = 0x01,
    BroadcastToSector = 0x02,
}

impl TryFrom<u8> for Kind {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b & 0x7F {
            0x00 => Ok(Kind::RequestIndex),
            0x01 => Ok(Kind::Broadcast),
            0x02 => Ok(Kind::BroadcastToSector),
            _ => Err(ProtocolError::BadKind(b)),
        }
    }
}

/// Protocol 03 body variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBody {
    JoinGroup,
    BroadcastAll(Vec<u8>),
    BroadcastSector { sector: u64, data: Vec<u8> },
    Echo(Vec<u8>),
}

impl GroupBody {
    fn tag(&self) -> u8 {
        match self {
            GroupBody::JoinGroup => 1,
            GroupBody::BroadcastAll(_) => 2,
            GroupBody::BroadcastSector { .. } => 3,
            GroupBody::Echo(_) => 4,
        }
    }
}

/// A protocol 03 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub group: String,
    pub player_time_ns: i64,
    pub server_time_ns: i64,
    pub player_index: u32,
    pub player_sector: u64,
    pub body: GroupBody,
}

/// What an inbound frame means to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The relay answered a join with our player index.
    IndexAssigned(usize),
    /// A game payload relayed from player `index`.
    Payload { index: usize, data: Vec<u8> },
    /// Our echo came back.
    Echo { server_time_ns: i64 },
    /// Legacy handshake; carries no game data.
    Hello {
        group: String,
        name: String,
        client_type: u8,
    },
}

struct Reader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated(self.what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn tiny_string(&mut self) -> Result<String, ProtocolError> {
        let n = usize::from(self.u8()?);
        Ok(String::from_utf8_lossy(self.take(n)?).into_owned())
    }

    fn rest(self) -> &'a [u8] {
        self.buf
    }
}

fn envelope(protocol: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.push(protocol);
    buf
}

/// Splits a frame into its protocol id and body.
pub fn split_envelope(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    let mut r = Reader::new(frame, "envelope");
    let magic = r.u16()?;
    if magic != MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let protocol = r.u8()?;
    Ok((protocol, r.rest()))
}

/// Group name as sent in protocol 02: truncated or space-padded to 20 bytes.
pub fn padded_group(group: &str) -> [u8; GROUP_LEN] {
    let mut out = [b' '; GROUP_LEN];
    let bytes = group.as_bytes();
    let n = bytes.len().min(GROUP_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

pub fn encode_hello(group: &str, name: &str, client_type: u8) -> Vec<u8> {
    let mut buf = envelope(0x01);
    for s in [group, name] {
        let bytes = &s.as_bytes()[..s.len().min(255)];
        buf.push(bytes.len() as u8);
        buf.extend_from_slice(bytes);
    }
    buf.push(client_type);
    buf
}

pub fn encode_p02(group: &str, kind: Kind, index: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = envelope(0x02);
    buf.extend_from_slice(&padded_group(group));
    buf.push(kind as u8);
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_p03(msg: &GroupMessage) -> Vec<u8> {
    let mut buf = envelope(0x03);
    let group = &msg.group.as_bytes()[..msg.group.len().min(255)];
    buf.push(group.len() as u8);
    buf.extend_from_slice(group);
    buf.extend_from_slice(&msg.player_time_ns.to_le_bytes());
    buf.extend_from_slice(&msg.server_time_ns.to_le_bytes());
    buf.extend_from_slice(&msg.player_index.to_le_bytes());
    buf.extend_from_slice(&msg.player_sector.to_le_bytes());
    buf.push(msg.body.tag());
    let data = match &msg.body {
        GroupBody::JoinGroup => None,
        GroupBody::BroadcastAll(data) | GroupBody::Echo(data) => Some(data),
        GroupBody::BroadcastSector { sector, data } => {
            buf.extend_from_slice(&sector.to_le_bytes());
            Some(data)
        }
    };
    if let Some(data) = data {
        let n = data.len().min(usize::from(u16::MAX));
        buf.extend_from_slice(&(n as u16).to_le_bytes());
        buf.extend_from_slice(&data[..n]);
    }
    buf
}

pub fn decode_p03(body: &[u8]) -> Result<GroupMessage, ProtocolError> {
    let mut r = Reader::new(body, "protocol 03 body");
    let group = r.tiny_string()?;
    let player_time_ns = r.i64()?;
    let server_time_ns = r.i64()?;
    let player_index = r.u32()?;
    let player_sector = r.u64()?;
    let tag = r.u8()?;
    let data = |r: &mut Reader<'_>| -> Result<Vec<u8>, ProtocolError> {
        let n = usize::from(r.u16()?);
        Ok(r.take(n)?.to_vec())
    };
    let body = match tag {
        1 => GroupBody::JoinGroup,
        2 => GroupBody::BroadcastAll(data(&mut r)?),
        3 => {
            let sector = r.u64()?;
            GroupBody::BroadcastSector {
                sector,
                data: data(&mut r)?,
            }
        }
        4 => GroupBody::Echo(data(&mut r)?),
        t => return Err(ProtocolError::BadKind(t)),
    };
    Ok(GroupMessage {
        group,
        player_time_ns,
        server_time_ns,
        player_index,
        player_sector,
        body,
    })
}

/// Decodes any inbound frame into what it means for the session.
pub fn decode(frame: &[u8]) -> Result<Inbound, ProtocolError> {
    let (protocol, body) = split_envelope(frame)?;
    match protocol {
        0x01 => {
            let mut r = Reader::new(body, "protocol 01 header");
            let group = r.tiny_string()?;
            let name = r.tiny_string()?;
            let client_type = r.u8()?;
            Ok(Inbound::Hello {
                group,
                name,
                client_type,
            })
        }
        0x02 => {
            let mut r = Reader::new(body, "protocol 02 header");
            r.take(GROUP_LEN)?;
            let kind = r.u8()?;
            let index = usize::from(r.u16()?);
            match Kind::try_from(kind)? {
                Kind::RequestIndex => Ok(Inbound::IndexAssigned(index)),
                Kind::Broadcast | Kind::BroadcastToSector => Ok(Inbound::Payload {
                    index,
                    data: r.rest().to_vec(),
                }),
            }
        }
        0x03 => {
            let msg = decode_p03(body)?;
            let index = msg.player_index as usize;
            Ok(match msg.body {
                GroupBody::JoinGroup => Inbound::IndexAssigned(index),
                GroupBody::BroadcastAll(data) | GroupBody::BroadcastSector { data, .. } => {
                    Inbound::Payload { index, data }
                }
                GroupBody::Echo(_) => Inbound::Echo {
                    server_time_ns: msg.server_time_ns,
                },
            })
        }
        p => Err(ProtocolError::UnknownProtocol(p)),
    }
}

/// Builds outbound frames for one group in one protocol version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCodec {
    pub version: ProtocolVersion,
    pub group: String,
}

impl RelayCodec {
    pub fn new(version: ProtocolVersion, group: impl Into<String>) -> Self {
        Self {
            version,
            group: group.into(),
        }
    }

    fn p03(&self, index: Option<usize>, sector: u64, now_ns: i64, body: GroupBody) -> Vec<u8> {
        encode_p03(&GroupMessage {
            group: self.group.clone(),
            player_time_ns: now_ns,
            server_time_ns: 0,
            player_index: index.map_or(u32::MAX, |i| i as u32),
            player_sector: sector,
            body,
        })
    }

    /// Asks the relay for a player index.
    pub fn join(&self, index: Option<usize>, sector: u64, now_ns: i64) -> Vec<u8> {
        match self.version {
            ProtocolVersion::V02 => encode_p02(
                &self.group,
                Kind::RequestIndex,
                index.map_or(u16::MAX, |i| i as u16),
                &[],
            ),
            ProtocolVersion::V03 => self.p03(index, sector, now_ns, GroupBody::JoinGroup),
        }
    }

    pub fn broadcast(&self, index: Option<usize>, sector: u64, now_ns: i64, payload: &[u8]) -> Vec<u8> {
        match self.version {
            ProtocolVersion::V02 => encode_p02(
                &self.group,
                Kind::Broadcast,
                index.map_or(u16::MAX, |i| i as u16),
                payload,
            ),
            ProtocolVersion::V03 => self.p03(
                index,
                sector,
                now_ns,
                GroupBody::BroadcastAll(payload.to_vec()),
            ),
        }
    }

    /// Round-trip probe; protocol 02 has no echo and yields `None`.
    pub fn echo(&self, index: Option<usize>, now_ns: i64) -> Option<Vec<u8>> {
        match self.version {
            ProtocolVersion::V02 => None,
            ProtocolVersion::V03 => Some(self.p03(index, 0, now_ns, GroupBody::Echo(Vec::new()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_rejects_bad_magic() {
        assert_eq!(
            split_envelope(&[0x00, 0x00, 0x03]),
            Err(ProtocolError::BadMagic(0))
        );
        assert_eq!(
            split_envelope(&[0x1F]),
            Err(ProtocolError::Truncated("envelope"))
        );
    }

    #[test]
    fn p02_join_pads_group_and_marks_kind() {
        let frame = RelayCodec::new(ProtocolVersion::V02, "lttp").join(None, 0, 0);
        assert_eq!(&frame[..3], &[0x1F, 0x65, 0x02]);
        assert_eq!(&frame[3..23], b"lttp                ");
        assert_eq!(&frame[23..], &[0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn p02_responses_set_the_high_bit() {
        let mut frame = encode_p02("lttp", Kind::RequestIndex, 7, &[]);
        frame[23] |= 0x80;
        assert_eq!(decode(&frame), Ok(Inbound::IndexAssigned(7)));

        let mut frame = encode_p02("lttp", Kind::Broadcast, 3, &[0x13, 0, 1]);
        frame[23] |= 0x80;
        assert_eq!(
            decode(&frame),
            Ok(Inbound::Payload {
                index: 3,
                data: vec![0x13, 0, 1],
            })
        );

        let mut bad = encode_p02("lttp", Kind::Broadcast, 3, &[]);
        bad[23] = 0x85;
        assert_eq!(decode(&bad), Err(ProtocolError::BadKind(0x85)));
    }

    #[test]
    fn p03_sector_broadcast_is_a_payload() {
        let frame = encode_p03(&GroupMessage {
            group: "lttp".into(),
            player_time_ns: 1,
            server_time_ns: 2,
            player_index: 9,
            player_sector: 0x1_0012,
            body: GroupBody::BroadcastSector {
                sector: 0x1_0012,
                data: vec![1, 2, 3],
            },
        });
        assert_eq!(
            decode(&frame),
            Ok(Inbound::Payload {
                index: 9,
                data: vec![1, 2, 3],
            })
        );
    }

    #[test]
    fn p03_truncated_data_is_rejected() {
        let mut frame = RelayCodec::new(ProtocolVersion::V03, "g").broadcast(Some(1), 0, 0, &[1, 2, 3]);
        frame.pop();
        assert!(matches!(decode(&frame), Err(ProtocolError::Truncated(_))));
    }

    #[test]
    fn legacy_hello_is_understood() {
        let frame = encode_hello("lttp", "link", CLIENT_TYPE_ALTTP);
        assert_eq!(
            decode(&frame),
            Ok(Inbound::Hello {
                group: "lttp".into(),
                name: "link".into(),
                client_type: 1,
            })
        );
    }

    #[test]
    fn unknown_protocol_is_an_error() {
        assert_eq!(
            decode(&[0x1F, 0x65, 0x09]),
            Err(ProtocolError::UnknownProtocol(9))
        );
    }
}

use std::net::UdpSocket;
use std::time::Duration;

use crossbeam_channel as cb;
use o2_link::protocol::{self, GroupBody, GroupMessage, Inbound, ProtocolVersion};
use o2_link::{RelayClient, RelayEvent, RelaySettings};

const WAIT: Duration = Duration::from_secs(2);

fn start(version: ProtocolVersion) -> (UdpSocket, RelayClient, cb::Receiver<RelayEvent>) {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server.set_read_timeout(Some(WAIT)).unwrap();
    let settings = RelaySettings {
        host: "127.0.0.1".into(),
        port: server.local_addr().unwrap().port(),
        group: "lttp".into(),
        version,
    };
    let (tx, rx) = cb::unbounded();
    let client = RelayClient::connect(&settings, move |ev| {
        let _ = tx.send(ev);
    })
    .unwrap();
    (server, client, rx)
}

fn next_message(rx: &cb::Receiver<RelayEvent>) -> Inbound {
    loop {
        match rx.recv_timeout(WAIT).unwrap() {
            RelayEvent::Message(msg) => return msg,
            RelayEvent::Connected { .. } => continue,
            RelayEvent::Closed(reason) => panic!("relay closed: {reason}"),
        }
    }
}

#[test]
fn join_is_answered_with_an_index() {
    let (server, mut client, rx) = start(ProtocolVersion::V03);
    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        RelayEvent::Connected { .. }
    ));

    assert!(client.join(None, 0));
    let mut buf = [0u8; 1500];
    let (n, from) = server.recv_from(&mut buf).unwrap();
    let (id, body) = protocol::split_envelope(&buf[..n]).unwrap();
    assert_eq!(id, 0x03);
    let mut msg = protocol::decode_p03(body).unwrap();
    assert_eq!(msg.body, GroupBody::JoinGroup);
    assert_eq!(msg.group, "lttp");
    assert_eq!(msg.player_index, u32::MAX);

    msg.player_index = 5;
    msg.server_time_ns = 42;
    server.send_to(&protocol::encode_p03(&msg), from).unwrap();
    assert_eq!(next_message(&rx), Inbound::IndexAssigned(5));

    client.disconnect();
    assert!(!client.is_closed());
}

#[test]
fn garbage_frames_do_not_close_the_connection() {
    let (server, mut client, rx) = start(ProtocolVersion::V03);
    assert!(client.broadcast(Some(2), 0, &[0x13, 0x00, 0x01]));
    let mut buf = [0u8; 1500];
    let (_, from) = server.recv_from(&mut buf).unwrap();

    server.send_to(&[0xDE, 0xAD, 0x03], from).unwrap();
    let relayed = GroupMessage {
        group: "lttp".into(),
        player_time_ns: 0,
        server_time_ns: 0,
        player_index: 7,
        player_sector: 0,
        body: GroupBody::BroadcastAll(vec![0x13, 0x00, 0x02]),
    };
    server
        .send_to(&protocol::encode_p03(&relayed), from)
        .unwrap();

    assert_eq!(
        next_message(&rx),
        Inbound::Payload {
            index: 7,
            data: vec![0x13, 0x00, 0x02],
        }
    );
    assert!(!client.is_closed());
    client.disconnect();
}

#[test]
fn protocol_02_has_no_echo() {
    let (_server, mut client, _rx) = start(ProtocolVersion::V02);
    assert!(!client.echo(None));
    assert!(client.join(None, 0));
    client.disconnect();
}

// Integration smoke test for the relay server.
//
// Starts a relay on localhost and connects plain TCP nodes that speak the
// protocol crate's framing directly: login, roster delivery, presence
// forwarding, data routing, rejected logins, and disconnects.

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use global_connection_protocol::framing;
use global_connection_protocol::{
    NodeMessage, PROTOCOL_VERSION, PlayerId, PlayerInfo, RelayMessage, ServerId, ServerInfo,
    read_frame, send_message,
};
use global_connection_relay::{RelayConfig, start_relay};

struct MockNode {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl MockNode {
    fn send(&mut self, msg: &NodeMessage) {
        send_message(&mut self.writer, msg).unwrap();
    }

    fn recv(&mut self) -> RelayMessage {
        let bytes = read_frame(&mut self.reader).unwrap();
        framing::decode(&bytes).unwrap()
    }

    /// Drain all currently buffered messages using a short read timeout.
    fn drain(&mut self) -> Vec<RelayMessage> {
        let stream = self.reader.get_ref();
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .ok();
        let mut messages = Vec::new();
        while let Ok(bytes) = read_frame(&mut self.reader) {
            match framing::decode(&bytes) {
                Ok(msg) => messages.push(msg),
                Err(_) => break,
            }
        }
        self.reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_secs(5)))
            .ok();
        messages
    }
}

/// Open a connection and send Hello. Returns the node and the relay's first
/// reply.
fn hello(addr: SocketAddr, account: &str, password: &str) -> (MockNode, RelayMessage) {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let reader = BufReader::new(stream.try_clone().unwrap());
    let writer = BufWriter::new(stream);
    let mut node = MockNode { reader, writer };
    node.send(&NodeMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
        account: account.into(),
        password: password.into(),
    });
    let reply = node.recv();
    (node, reply)
}

/// Log in and return the node with the roster it was welcomed with.
fn login(addr: SocketAddr, account: &str) -> (MockNode, Vec<ServerInfo>) {
    match hello(addr, account, "") {
        (node, RelayMessage::Welcome { server, servers }) => {
            assert_eq!(server, ServerId::new(account));
            (node, servers)
        }
        (_, other) => panic!("expected Welcome, got {other:?}"),
    }
}

fn open_relay() -> global_connection_relay::RelayHandle {
    start_relay(RelayConfig {
        port: 0,
        accounts: BTreeMap::new(),
    })
    .unwrap()
}

fn steve() -> PlayerInfo {
    PlayerInfo {
        id: PlayerId::from_u128(0x5713_0E00),
        name: "Steve".into(),
        joined_at: 1_700_000_000_000,
    }
}

#[test]
fn presence_and_data_lifecycle() {
    let relay = open_relay();
    let addr = relay.addr();

    // 1. First node sees an empty cluster.
    let (mut lobby, servers) = login(addr, "lobby");
    assert!(servers.is_empty());

    // 2. It reports a player before anyone else is connected.
    lobby.send(&NodeMessage::PlayerOnline { player: steve() });

    // 3. A second node joins. Lobby is told; survival gets lobby's roster,
    //    including the player it already hosts.
    std::thread::sleep(Duration::from_millis(100));
    let (mut survival, servers) = login(addr, "survival");
    assert_eq!(
        servers,
        vec![ServerInfo {
            id: ServerId::new("lobby"),
            players: vec![steve()],
        }]
    );
    assert_eq!(
        lobby.recv(),
        RelayMessage::ServerConnected {
            server: ServerId::new("survival"),
        }
    );

    // 4. Presence is forwarded to the other node only.
    survival.send(&NodeMessage::PlayerOnline {
        player: PlayerInfo {
            id: PlayerId::from_u128(2),
            name: "Alex".into(),
            joined_at: 5,
        },
    });
    match lobby.recv() {
        RelayMessage::PlayerOnline { server, player } => {
            assert_eq!(server, ServerId::new("survival"));
            assert_eq!(player.name, "Alex");
        }
        other => panic!("expected PlayerOnline, got {other:?}"),
    }

    // 5. Broadcast data reaches lobby, stamped with its source.
    survival.send(&NodeMessage::Data {
        channel: "Chat.global".into(),
        target_player: None,
        target_server: None,
        payload: vec![1, 2, 3],
    });
    assert_eq!(
        lobby.recv(),
        RelayMessage::Data {
            source: ServerId::new("survival"),
            channel: "Chat.global".into(),
            target_player: None,
            payload: vec![1, 2, 3],
        }
    );

    // 6. Data addressed to a player goes to the node hosting them.
    lobby.send(&NodeMessage::Data {
        channel: "Chat.whisper".into(),
        target_player: Some(PlayerId::from_u128(2)),
        target_server: None,
        payload: vec![9],
    });
    match survival.recv() {
        RelayMessage::Data {
            source,
            target_player,
            ..
        } => {
            assert_eq!(source, ServerId::new("lobby"));
            assert_eq!(target_player, Some(PlayerId::from_u128(2)));
        }
        other => panic!("expected Data, got {other:?}"),
    }

    // 7. Goodbye removes the node; the other side is told.
    lobby.send(&NodeMessage::Goodbye);
    let messages = survival.drain();
    assert!(
        messages.contains(&RelayMessage::ServerDisconnected {
            server: ServerId::new("lobby"),
        }),
        "expected ServerDisconnected for lobby, got {messages:?}"
    );

    relay.stop();
}

#[test]
fn rejected_wrong_password() {
    let relay = start_relay(RelayConfig {
        port: 0,
        accounts: BTreeMap::from([("lobby".to_string(), "secret".to_string())]),
    })
    .unwrap();

    let (_node, reply) = hello(relay.addr(), "lobby", "wrong");
    assert_eq!(
        reply,
        RelayMessage::Rejected {
            reason: "incorrect password".into(),
        }
    );

    let (_node, reply) = hello(relay.addr(), "lobby", "secret");
    assert!(matches!(reply, RelayMessage::Welcome { .. }));

    relay.stop();
}

#[test]
fn disconnect_node_closes_its_stream() {
    let relay = open_relay();
    let (mut lobby, _) = login(relay.addr(), "lobby");
    let (mut survival, _) = login(relay.addr(), "survival");
    let _ = lobby.recv();

    relay.disconnect_node(&ServerId::new("survival"));

    // The kicked node sees EOF.
    assert!(read_frame(&mut survival.reader).is_err());
    let messages = lobby.drain();
    assert!(
        messages.contains(&RelayMessage::ServerDisconnected {
            server: ServerId::new("survival"),
        }),
        "expected ServerDisconnected, got {messages:?}"
    );

    // The account can log in again.
    let (_survival, servers) = login(relay.addr(), "survival");
    assert_eq!(servers.len(), 1);

    relay.stop();
}

#[test]
fn stop_closes_every_node() {
    let relay = open_relay();
    let (mut lobby, _) = login(relay.addr(), "lobby");
    relay.stop();
    assert!(read_frame(&mut lobby.reader).is_err());
}

//! Integration tests for the relay over real WebSocket connections
//!
//! Each test starts its own server on an ephemeral port and drives it with
//! tokio-tungstenite clients.

use assert_approx_eq::assert_approx_eq;
use futures_util::{SinkExt, StreamExt};
use server::network::{Server, ServerSettings, INDEX_BANNER};
use shared::{ClientMessage, PlayerMove, PlayerRecord, ServerMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Helper: start a server on a random port and return its address
async fn start_test_server(settings: ServerSettings) -> SocketAddr {
    let server = Server::bind("127.0.0.1:0", settings)
        .await
        .expect("Failed to bind test server");
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = assert_ok!(connect_async(format!("ws://{}", addr)).await);
    client
}

/// Receives the next server message, skipping control frames
async fn recv(client: &mut Client) -> ServerMessage {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("Timed out waiting for message")
            .expect("Connection closed")
            .expect("Read error");

        if let Message::Text(text) = frame {
            return ServerMessage::parse(&text).expect("Undecodable server message");
        }
    }
}

/// Asserts nothing arrives within a short window
async fn assert_silent(client: &mut Client) {
    loop {
        match timeout(Duration::from_millis(200), client.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => panic!("Unexpected message: {}", text),
            Ok(Some(Ok(_))) => continue,
            Ok(other) => panic!("Connection ended: {:?}", other),
        }
    }
}

async fn send(client: &mut Client, message: &ClientMessage) {
    let text = assert_ok!(message.to_text());
    assert_ok!(client.send(Message::Text(text)).await);
}

/// Receives the next text frame without decoding it
async fn recv_raw(client: &mut Client) -> serde_json::Value {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("Timed out waiting for message")
            .expect("Connection closed")
            .expect("Read error");

        if let Message::Text(text) = frame {
            return assert_ok!(serde_json::from_str(&text));
        }
    }
}

/// Connects a client and returns it with its assigned id
async fn join(addr: SocketAddr) -> (Client, String) {
    let mut client = connect(addr).await;
    match recv(&mut client).await {
        ServerMessage::Connected { message, player_id } => {
            assert_eq!(message, shared::CONNECTED_MESSAGE);
            (client, player_id)
        }
        other => panic!("Expected connected, got {:?}", other),
    }
}

/// PRESENCE TESTS
mod presence_tests {
    use super::*;

    /// Walks through join, move, leave and roster as two clients
    #[tokio::test]
    async fn two_client_scenario() {
        let addr = start_test_server(ServerSettings::default()).await;

        let (mut a, a_id) = join(addr).await;
        let (mut b, b_id) = join(addr).await;
        assert_ne!(a_id, b_id);

        assert_eq!(
            recv(&mut a).await,
            ServerMessage::PlayerJoined {
                player_id: b_id.clone()
            }
        );

        send(
            &mut b,
            &ClientMessage::PlayerMove(PlayerMove::new(b_id.as_str(), 5, 10)),
        )
        .await;
        let echo = ServerMessage::PlayerMove(PlayerMove::new(b_id.as_str(), 5, 10));
        assert_eq!(recv(&mut a).await, echo);
        assert_eq!(recv(&mut b).await, echo);

        a.close(None).await.unwrap();
        assert_eq!(
            recv(&mut b).await,
            ServerMessage::PlayerLeft {
                player_id: a_id.clone()
            }
        );

        send(&mut b, &ClientMessage::GetPlayers).await;
        assert_eq!(
            recv(&mut b).await,
            ServerMessage::PlayersList {
                players: vec![PlayerRecord {
                    id: b_id,
                    x: Some(5.into()),
                    y: Some(10.into()),
                }]
            }
        );
    }

    /// A new client does not receive its own join notice
    #[tokio::test]
    async fn join_notice_excludes_self() {
        let addr = start_test_server(ServerSettings::default()).await;

        let (mut a, a_id) = join(addr).await;
        assert_silent(&mut a).await;

        send(&mut a, &ClientMessage::GetPlayers).await;
        match recv(&mut a).await {
            ServerMessage::PlayersList { players } => {
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].id, a_id);
                assert!(players[0].x.is_none());
            }
            other => panic!("Expected players_list, got {:?}", other),
        }
    }

    /// Dropping the socket without a close frame still counts as leaving
    #[tokio::test]
    async fn abrupt_disconnect_is_announced() {
        let addr = start_test_server(ServerSettings::default()).await;

        let (mut a, _) = join(addr).await;
        let (b, b_id) = join(addr).await;
        assert!(matches!(
            recv(&mut a).await,
            ServerMessage::PlayerJoined { .. }
        ));

        drop(b);
        assert_eq!(
            recv(&mut a).await,
            ServerMessage::PlayerLeft { player_id: b_id }
        );
    }

    /// A silent client is dropped after the idle timeout
    #[tokio::test]
    async fn idle_client_is_dropped() {
        let settings = ServerSettings {
            idle_timeout: Duration::from_millis(300),
            ..ServerSettings::default()
        };
        let addr = start_test_server(settings).await;

        let (mut watcher, _) = join(addr).await;

        // This client stops reading after the handshake, so it never answers pings
        let (idle, idle_id) = join(addr).await;
        assert!(matches!(
            recv(&mut watcher).await,
            ServerMessage::PlayerJoined { .. }
        ));

        // The watcher keeps answering pings through recv, so only the idle
        // client goes away
        assert_eq!(
            recv(&mut watcher).await,
            ServerMessage::PlayerLeft { player_id: idle_id }
        );
        drop(idle);
    }
}

/// POSITION TESTS
mod position_tests {
    use super::*;

    /// Float coordinates reach every client as floats
    #[tokio::test]
    async fn float_move_is_echoed_to_everyone() {
        let addr = start_test_server(ServerSettings::default()).await;
        let (mut a, a_id) = join(addr).await;
        let (mut b, _) = join(addr).await;
        recv(&mut a).await;

        let frame = serde_json::json!({
            "event": "player_move",
            "data": {"playerId": &a_id, "x": 1.25, "y": -3.5}
        });
        assert_ok!(a.send(Message::Text(frame.to_string())).await);

        for client in [&mut a, &mut b] {
            let frame = recv_raw(client).await;
            assert_eq!(frame["event"], "player_move");
            assert_eq!(frame["data"]["playerId"], a_id.as_str());
            assert_approx_eq!(frame["data"]["x"].as_f64().unwrap(), 1.25);
            assert_approx_eq!(frame["data"]["y"].as_f64().unwrap(), -3.5);
        }
    }

    /// Integers too large for u64 keep every digit on the way through
    #[tokio::test]
    async fn oversized_integer_move_is_echoed_verbatim() {
        let addr = start_test_server(ServerSettings::default()).await;
        let (mut a, a_id) = join(addr).await;

        let frame = format!(
            r#"{{"event":"player_move","data":{{"playerId":"{}","x":18446744073709551616,"y":-1}}}}"#,
            a_id
        );
        assert_ok!(a.send(Message::Text(frame.clone())).await);

        let echoed = timeout(RECV_TIMEOUT, a.next())
            .await
            .expect("Timed out waiting for message")
            .expect("Connection closed")
            .expect("Read error");
        assert_eq!(echoed, Message::Text(frame));
    }
}

/// HTTP TESTS
mod http_tests {
    use super::*;

    /// A plain GET on the WebSocket port answers with the banner
    #[tokio::test]
    async fn plain_get_returns_banner() {
        let addr = start_test_server(ServerSettings::default()).await;

        let mut stream = assert_ok!(TcpStream::connect(addr).await);
        assert_ok!(
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
        );

        let mut response = String::new();
        assert_ok!(
            timeout(RECV_TIMEOUT, stream.read_to_string(&mut response))
                .await
                .expect("Timed out waiting for response")
        );

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with(INDEX_BANNER));
        assert_eq!(INDEX_BANNER, "Position relay server is running!");
    }

    /// Serving the banner does not register anyone or disturb live clients
    #[tokio::test]
    async fn banner_request_leaves_clients_alone() {
        let addr = start_test_server(ServerSettings::default()).await;
        let (mut a, a_id) = join(addr).await;

        let mut stream = assert_ok!(TcpStream::connect(addr).await);
        assert_ok!(stream.write_all(b"GET /health HTTP/1.1\r\n\r\n").await);
        let mut response = Vec::new();
        assert_ok!(stream.read_to_end(&mut response).await);
        assert!(!response.is_empty());

        assert_silent(&mut a).await;
        send(&mut a, &ClientMessage::GetPlayers).await;
        match recv(&mut a).await {
            ServerMessage::PlayersList { players } => {
                assert_eq!(players.len(), 1);
                assert_eq!(players[0].id, a_id);
            }
            other => panic!("Expected players_list, got {:?}", other),
        }
    }
}

/// ERROR HANDLING TESTS
mod error_tests {
    use super::*;

    #[tokio::test]
    async fn incomplete_move_is_rejected_without_broadcast() {
        let addr = start_test_server(ServerSettings::default()).await;
        let (mut a, _) = join(addr).await;
        let (mut b, _) = join(addr).await;
        recv(&mut a).await;

        b.send(Message::Text(
            r#"{"event":"player_move","data":{"playerId":"b","x":1}}"#.to_string(),
        ))
        .await
        .unwrap();

        assert_eq!(
            recv(&mut b).await,
            ServerMessage::error("Invalid player_move data. Required: playerId, x, y")
        );
        assert_silent(&mut a).await;
        assert_silent(&mut b).await;
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_get_one_error_each() {
        let addr = start_test_server(ServerSettings::default()).await;
        let (mut a, _) = join(addr).await;

        a.send(Message::Text("hello".to_string())).await.unwrap();
        match recv(&mut a).await {
            ServerMessage::Error { message } => assert!(message.starts_with("Malformed message:")),
            other => panic!("Expected error, got {:?}", other),
        }

        a.send(Message::Text(r#"{"event":"chat","data":{}}"#.to_string()))
            .await
            .unwrap();
        assert_eq!(recv(&mut a).await, ServerMessage::error("Unknown event: chat"));

        // Binary frames are ignored and the connection stays usable
        a.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        send(&mut a, &ClientMessage::GetPlayers).await;
        assert!(matches!(
            recv(&mut a).await,
            ServerMessage::PlayersList { .. }
        ));
    }
}

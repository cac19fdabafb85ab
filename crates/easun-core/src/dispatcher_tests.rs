use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::client::InverterClient;
use crate::connection::{connect_back_request, Session, SessionState};
use crate::dispatcher::{Command, TextualClient, POLL_SEQUENCE};
use crate::error::ClientError;
use crate::test_support::{canned_replies, loopback_config, spawn_textual_device};

fn loopback(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

#[test]
fn transaction_ids_wrap_without_repeating() {
    let mut session = Session::new();
    let ids: HashSet<u16> = (0..65_536).map(|_| session.next_transaction_id()).collect();

    assert_eq!(ids.len(), 65_536);
    assert_eq!(session.next_transaction_id(), 0);
}

#[test]
fn connect_back_request_format() {
    let request = connect_back_request(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 502));
    assert_eq!(request, "set>server=192.168.1.10:502;");
}

#[tokio::test]
async fn session_transitions_and_rejects_extra_connections() {
    // Arrange
    let mut session = Session::new();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.transport().is_err());

    // Act: listen
    let bound = session.listen(loopback(0)).await.expect("listen");
    assert_eq!(session.state(), SessionState::Negotiating);

    // Act: device connects back
    let _device = TcpStream::connect(bound).await.expect("device connects");
    session.accept(Duration::from_secs(1)).await.expect("accept");
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.transport().is_ok());

    // Assert: a second inbound connection is closed straight away
    let mut intruder = TcpStream::connect(bound).await.expect("tcp handshake");
    let mut buf = [0_u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(1), intruder.read(&mut buf))
        .await
        .expect("intruder closed promptly");
    assert!(matches!(read, Ok(0) | Err(_)));

    // Act: close
    session.close().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.transport().is_err());
}

#[tokio::test]
async fn accept_without_listen_fails() {
    let mut session = Session::new();
    let result = session.accept(Duration::from_millis(10)).await;
    assert!(matches!(result, Err(ClientError::Connection(_))));
}

#[tokio::test]
async fn device_that_never_connects_back_is_a_connection_failure() {
    let mut session = Session::new();
    session.listen(loopback(0)).await.expect("listen");

    let result = session.accept(Duration::from_millis(20)).await;

    assert!(matches!(result, Err(ClientError::Connection(_))));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn poll_issues_every_command_in_order_then_closes() {
    // Arrange
    let (port, device) = spawn_textual_device(canned_replies(), 1).await;
    let mut config = loopback_config("EASUN_SMW_8K");
    config.discovery_port = port;
    let mut client = TextualClient::new(&config);

    // Act
    let parts = client.fetch().await.expect("fetch");

    // Assert
    let snapshot = parts.into_snapshot("EASUN_SMW_8K", Utc::now()).expect("complete");
    assert_eq!(snapshot.battery.power, 534);
    assert_eq!(snapshot.system.mode_name, "Line Mode");
    assert_eq!(snapshot.system.warnings, Some(vec!["No warnings".to_string()]));
    assert_eq!(client.session_state().await, SessionState::Disconnected);

    let transcript = device.await.expect("device");
    let expected: Vec<(u16, String)> = POLL_SEQUENCE
        .iter()
        .enumerate()
        .map(|(idx, command)| (idx as u16, command.as_str().to_string()))
        .collect();
    assert_eq!(transcript, expected);
}

#[tokio::test]
async fn each_poll_negotiates_a_fresh_session() {
    let (port, device) = spawn_textual_device(canned_replies(), 2).await;
    let mut config = loopback_config("EASUN_SMW_11K");
    config.discovery_port = port;
    let mut client = TextualClient::new(&config);

    client.fetch().await.expect("first poll");
    client.fetch().await.expect("second poll");

    let transcript = device.await.expect("device");
    let ids: Vec<u16> = transcript.iter().map(|(tid, _)| *tid).collect();
    assert_eq!(ids, (0..10).collect::<Vec<u16>>());
}

#[tokio::test]
async fn single_send_reuses_the_negotiated_session() {
    let (port, device) = spawn_textual_device(canned_replies(), 1).await;
    let mut config = loopback_config("EASUN_SMW_8K");
    config.discovery_port = port;
    let mut client = TextualClient::new(&config);

    let mode = client.send(Command::Mode).await.expect("mode");
    let live = client.send(Command::LiveMetrics).await.expect("live");
    assert_eq!(client.session_state().await, SessionState::Connected);
    client.close().await;

    assert_eq!(mode, "(L");
    assert!(live.starts_with("(230.0"));
    assert_eq!(device.await.expect("device").len(), 2);
}

#[tokio::test]
async fn truncated_reply_is_a_protocol_error() {
    // Arrange: a device that announces 40 bytes and sends 5
    let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let port = udp.local_addr().expect("addr").port();
    let device = tokio::spawn(async move {
        let mut buf = [0_u8; 128];
        let (len, _) = udp.recv_from(&mut buf).await.expect("request");
        let text = String::from_utf8_lossy(&buf[..len]).to_string();
        let server = text
            .trim_start_matches("set>server=")
            .trim_end_matches(';')
            .to_string();
        let mut stream = TcpStream::connect(server).await.expect("connect back");
        // QPIRI: 8-byte header, 5 command bytes, checksum, terminator
        let mut request = [0_u8; 16];
        stream.read_exact(&mut request).await.expect("request");
        stream
            .write_all(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x28, 0xFF, 0x04, b'(', b'L', b' '])
            .await
            .expect("partial reply");
    });

    let mut config = loopback_config("EASUN_SMW_8K");
    config.discovery_port = port;
    let mut client = TextualClient::new(&config);

    // Act
    let result = client.fetch().await;

    // Assert
    assert!(matches!(result, Err(ClientError::Protocol(_))), "{result:?}");
    assert_eq!(client.session_state().await, SessionState::Disconnected);
    device.await.expect("device");
}

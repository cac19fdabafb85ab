use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::codec::{checksum, escape_byte, framed, FrameTransport};
use crate::config::ClientConfig;

pub const LIVE_METRICS_REPLY: &str = "(230.0 50.0 230.0 50.0 3000 2800 60 360.0 52.4 10.2 85 35 12.3 180.0 52.30 00000 00010110 00 00 2000 010)";
pub const SECONDARY_PV_REPLY: &str = "(05.1 210.5 01073)";
pub const MODE_REPLY: &str = "(L";
pub const RATING_REPLY: &str = "(230.0 34.7 230.0 50.0 34.7 8000 8000 48.0 46.0 42.0 56.4 54.0 2 30 120 0 2 3 9 01 0 00 54.0 0 1 480 120)";

/// A 36-position warning bit string with the given indices set.
pub fn warnings_reply(set: &[usize]) -> String {
    let bits: String = (0..36)
        .map(|idx| if set.contains(&idx) { '1' } else { '0' })
        .collect();
    format!("({bits}")
}

pub fn canned_replies() -> HashMap<String, String> {
    HashMap::from([
        ("QPIGS".to_string(), LIVE_METRICS_REPLY.to_string()),
        ("QPIGS2".to_string(), SECONDARY_PV_REPLY.to_string()),
        ("QMOD".to_string(), MODE_REPLY.to_string()),
        ("QPIRI".to_string(), RATING_REPLY.to_string()),
        ("QPIWS".to_string(), warnings_reply(&[])),
    ])
}

pub fn loopback_config(model: &str) -> ClientConfig {
    ClientConfig {
        inverter: Ipv4Addr::LOCALHOST,
        local: Ipv4Addr::LOCALHOST,
        model: model.to_string(),
        server_port: 0,
        command_spacing: Duration::from_millis(5),
        reply_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    }
}

pub fn reply_frame(transaction_id: u16, reply: &str) -> Vec<u8> {
    let [hi, lo] = checksum(reply.as_bytes()).to_be_bytes();
    let mut body = vec![0xFF, 0x04];
    body.extend_from_slice(reply.as_bytes());
    body.extend_from_slice(&[escape_byte(hi), escape_byte(lo), 0x0D]);

    let mut frame = Vec::new();
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0x0001_u16.to_be_bytes());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

async fn read_request(transport: &mut FrameTransport) -> Option<(u16, Bytes)> {
    match transport.next().await? {
        Ok(frame) => Some((frame.header.transaction_id, frame.body)),
        Err(_) => None,
    }
}

pub type Transcript = Vec<(u16, String)>;

/// Simulates a textual-protocol inverter: waits for the connect-back
/// request on UDP, dials the advertised listener and answers each command
/// from `replies`, for `sessions` consecutive sessions.
pub async fn spawn_textual_device(
    replies: HashMap<String, String>,
    sessions: usize,
) -> (u16, JoinHandle<Transcript>) {
    let udp = UdpSocket::bind("127.0.0.1:0").await.expect("bind device udp");
    let port = udp.local_addr().expect("udp addr").port();

    let handle = tokio::spawn(async move {
        let mut transcript = Vec::new();
        for _ in 0..sessions {
            let mut buf = [0_u8; 128];
            let (len, _) = udp.recv_from(&mut buf).await.expect("connect-back request");
            let request = String::from_utf8_lossy(&buf[..len]).to_string();
            let server = request
                .strip_prefix("set>server=")
                .and_then(|rest| rest.strip_suffix(';'))
                .expect("well-formed connect-back request");
            let server: SocketAddr = server.parse().expect("advertised address");

            let stream = TcpStream::connect(server).await.expect("connect back");
            let mut transport = framed(stream);
            while let Some((tid, body)) = read_request(&mut transport).await {
                assert_eq!(&body[..2], &[0xFF, 0x04]);
                let command = String::from_utf8_lossy(&body[2..body.len() - 3]).to_string();
                let [hi, lo] = checksum(command.as_bytes()).to_be_bytes();
                assert_eq!(
                    &body[body.len() - 3..],
                    &[escape_byte(hi), escape_byte(lo), 0x0D],
                    "checksum trailer of {command}"
                );

                transcript.push((tid, command.clone()));
                let reply = replies.get(&command).cloned().unwrap_or_else(|| "(NAK".to_string());
                transport
                    .get_mut()
                    .write_all(&reply_frame(tid, &reply))
                    .await
                    .expect("reply");
            }
        }
        transcript
    });

    (port, handle)
}

/// Simulates a register-protocol inverter serving `registers` (missing
/// addresses read as zero).
pub async fn spawn_register_device(registers: BTreeMap<u16, u16>) -> (u16, JoinHandle<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind device tcp");
    let port = listener.local_addr().expect("tcp addr").port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("client connects");
        let mut transport = framed(stream);
        let mut served = 0;
        while let Some((tid, body)) = read_request(&mut transport).await {
            let unit = body[0];
            let address = u16::from_be_bytes([body[2], body[3]]);
            let count = u16::from_be_bytes([body[4], body[5]]);

            let mut reply_body = vec![unit, 0x03, (count * 2) as u8];
            for offset in 0..count {
                let word = registers.get(&(address + offset)).copied().unwrap_or(0);
                reply_body.extend_from_slice(&word.to_be_bytes());
            }

            let mut frame = Vec::new();
            frame.extend_from_slice(&tid.to_be_bytes());
            frame.extend_from_slice(&0_u16.to_be_bytes());
            frame.extend_from_slice(&(reply_body.len() as u16).to_be_bytes());
            frame.extend_from_slice(&reply_body);
            transport.get_mut().write_all(&frame).await.expect("reply");
            served += 1;
        }
        served
    });

    (port, handle)
}

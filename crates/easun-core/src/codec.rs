use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use crc16::{State, XMODEM};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::error::{ClientError, Result};

pub const PREFIX_LEN: usize = 6;
pub const MAX_FRAME_LEN: usize = 1024;

pub const TEXTUAL_PROTOCOL_ID: u16 = 0x0001;
pub const TEXTUAL_UNIT_ID: u8 = 0xFF;
pub const TEXTUAL_FUNCTION_CODE: u8 = 0x04;
const TERMINATOR: u8 = 0x0D;

pub const REGISTER_PROTOCOL_ID: u16 = 0x0000;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

pub fn checksum(data: &[u8]) -> u16 {
    State::<XMODEM>::calculate(data)
}

/// Bumps bytes the device's line receiver treats as control characters.
pub fn escape_byte(byte: u8) -> u8 {
    match byte {
        0x0A | 0x0D | 0x28 => byte.wrapping_add(1),
        other => other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: usize,
}

pub fn build_textual_frame(command: &str, transaction_id: u16) -> Vec<u8> {
    let [hi, lo] = checksum(command.as_bytes()).to_be_bytes();

    let mut payload = Vec::with_capacity(command.len() + 3);
    payload.extend_from_slice(command.as_bytes());
    payload.push(escape_byte(hi));
    payload.push(escape_byte(lo));
    payload.push(TERMINATOR);

    let length = (payload.len() + 2) as u16;
    let mut frame = Vec::with_capacity(PREFIX_LEN + 2 + payload.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&TEXTUAL_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(TEXTUAL_UNIT_ID);
    frame.push(TEXTUAL_FUNCTION_CODE);
    frame.extend_from_slice(&payload);
    frame
}

pub fn parse_frame_header(prefix: &[u8; PREFIX_LEN]) -> Result<FrameHeader> {
    let length = u16::from_be_bytes([prefix[4], prefix[5]]) as usize;
    if length == 0 || length > MAX_FRAME_LEN {
        return Err(ClientError::protocol(format!(
            "malformed header length {length}"
        )));
    }

    Ok(FrameHeader {
        transaction_id: u16::from_be_bytes([prefix[0], prefix[1]]),
        protocol_id: u16::from_be_bytes([prefix[2], prefix[3]]),
        length,
    })
}

/// Body ends with two CRC bytes and a carriage return; anything ahead of the
/// first `(` is buffering noise.
pub fn decode_textual_reply(body: &[u8]) -> Result<String> {
    if body.len() < 3 {
        return Err(ClientError::protocol(format!(
            "reply body of {} bytes has no room for checksum and terminator",
            body.len()
        )));
    }

    let text: String = body[..body.len() - 3]
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| b as char)
        .collect();

    let text = match text.find('(') {
        Some(idx) => &text[idx..],
        None => text.as_str(),
    };
    Ok(text.trim().to_string())
}

pub fn build_read_request(transaction_id: u16, unit_id: u8, address: u16, count: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(PREFIX_LEN + 6);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&REGISTER_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&6_u16.to_be_bytes());
    frame.push(unit_id);
    frame.push(READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&address.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    frame
}

pub fn parse_read_response(
    header: &FrameHeader,
    body: &[u8],
    expected_transaction: u16,
    unit_id: u8,
    count: u16,
) -> Result<Vec<u16>> {
    if header.transaction_id != expected_transaction {
        return Err(ClientError::protocol(format!(
            "transaction id mismatch: sent {expected_transaction:#06x}, got {:#06x}",
            header.transaction_id
        )));
    }
    if header.protocol_id != REGISTER_PROTOCOL_ID {
        return Err(ClientError::protocol(format!(
            "unexpected protocol id {:#06x}",
            header.protocol_id
        )));
    }
    if body.len() < 3 {
        return Err(ClientError::protocol("register reply too short"));
    }
    if body[0] != unit_id {
        return Err(ClientError::protocol(format!(
            "unit id mismatch: sent {unit_id}, got {}",
            body[0]
        )));
    }

    let function = body[1];
    if function == READ_HOLDING_REGISTERS | 0x80 {
        return Err(ClientError::protocol(format!(
            "device returned exception code {:#04x}",
            body[2]
        )));
    }
    if function != READ_HOLDING_REGISTERS {
        return Err(ClientError::protocol(format!(
            "unexpected function code {function:#04x}"
        )));
    }

    let byte_count = body[2] as usize;
    let expected = count as usize * 2;
    if byte_count != expected || body.len() != 3 + expected {
        return Err(ClientError::protocol(format!(
            "expected {expected} data bytes, header says {byte_count}, frame carries {}",
            body.len().saturating_sub(3)
        )));
    }

    Ok(body[3..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Textual {
        command: &'static str,
        transaction_id: u16,
    },
    ReadRegisters {
        transaction_id: u16,
        unit_id: u8,
        address: u16,
        count: u16,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

pub type FrameTransport = Framed<TcpStream, FrameCodec>;

pub fn framed(stream: TcpStream) -> FrameTransport {
    Framed::new(stream, FrameCodec)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = [0_u8; PREFIX_LEN];
        prefix.copy_from_slice(&src[..PREFIX_LEN]);
        let header = parse_frame_header(&prefix)?;

        let total = PREFIX_LEN + header.length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(PREFIX_LEN);
        let body = src.split_to(header.length).freeze();
        Ok(Some(Frame { header, body }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ClientError::protocol(format!(
                "short read: peer closed with {} bytes of an incomplete frame",
                src.len()
            ))),
        }
    }
}

impl Encoder<Request> for FrameCodec {
    type Error = ClientError;

    fn encode(&mut self, request: Request, dst: &mut BytesMut) -> Result<()> {
        let frame = match request {
            Request::Textual {
                command,
                transaction_id,
            } => build_textual_frame(command, transaction_id),
            Request::ReadRegisters {
                transaction_id,
                unit_id,
                address,
                count,
            } => build_read_request(transaction_id, unit_id, address, count),
        };
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

pub async fn round_trip(
    transport: &mut FrameTransport,
    request: Request,
    reply_timeout: Duration,
) -> Result<Frame> {
    transport.send(request).await?;
    match timeout(reply_timeout, transport.next()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => Err(ClientError::protocol("peer closed the connection before replying")),
        Err(_) => Err(ClientError::Timeout(reply_timeout)),
    }
}

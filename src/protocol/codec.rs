//! Protocol codec
//!
//! Framing plus encoding and decoding of requests and responses.
//!
//! ## Wire Format
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Len (4)  │   Payload                   │
//! └──────────┴─────────────────────────────┘
//! ```

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};

use crate::error::{KvError, Result};
use super::{Command, Request, Response};

/// Header size: 4 bytes length
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Framing
// =============================================================================

fn frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE as usize {
        return Err(KvError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.to_vec())
}

/// Split one frame off the front of `bytes`, returning its payload
fn unframe(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < HEADER_SIZE {
        return Err(KvError::Protocol(format!(
            "Incomplete header: expected {} bytes, got {}",
            HEADER_SIZE,
            bytes.len()
        )));
    }
    let payload_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(KvError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }
    let total_len = HEADER_SIZE + payload_len as usize;
    if bytes.len() < total_len {
        return Err(KvError::Protocol(format!(
            "Incomplete payload: expected {} bytes, got {}",
            total_len,
            bytes.len()
        )));
    }
    Ok(&bytes[HEADER_SIZE..total_len])
}

/// Read one frame's payload from a stream
///
/// Blocks until a complete frame is received or an error occurs
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let payload_len = u32::from_be_bytes(header);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(KvError::Protocol(format!(
            "Payload too large: {} bytes (max {})",
            payload_len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut payload = vec![0u8; payload_len as usize];
    if payload_len > 0 {
        reader.read_exact(&mut payload)?;
    }
    Ok(payload)
}

/// Write one framed payload to a stream
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&frame(payload)?)?;
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Requests
// =============================================================================

/// Encode a request to a complete frame
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    frame(&bincode::serialize(request)?)
}

/// Decode a complete request frame
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let payload = unframe(bytes)?;
    bincode::deserialize(payload).map_err(|e| KvError::Protocol(format!("Malformed request: {}", e)))
}

/// Parse a request payload (no header) into its commands
pub fn parse_request(payload: &[u8]) -> Result<Vec<Command>> {
    let request: Request = bincode::deserialize(payload)
        .map_err(|e| KvError::Protocol(format!("Malformed request: {}", e)))?;
    Ok(request.commands)
}

/// Read a request from a stream and return its commands
pub fn read_request<R: Read>(reader: &mut R) -> Result<Vec<Command>> {
    let payload = read_frame(reader)?;
    parse_request(&payload)
}

/// Write a request to a stream
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<()> {
    write_frame(writer, &bincode::serialize(request)?)
}

// =============================================================================
// Responses
// =============================================================================

/// Encode a response to a complete frame
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    frame(&bincode::serialize(response)?)
}

/// Decode a complete response frame
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let payload = unframe(bytes)?;
    bincode::deserialize(payload).map_err(|e| KvError::Protocol(format!("Malformed response: {}", e)))
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let payload = read_frame(reader)?;
    bincode::deserialize(&payload).map_err(|e| KvError::Protocol(format!("Malformed response: {}", e)))
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    write_frame(writer, &bincode::serialize(response)?)
}

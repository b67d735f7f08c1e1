//! Request and response envelopes for register reads.
//!
//! Request:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Device id
//! 1          | 1        | Function code, 0x03 for reads
//! 2          | 3        | First register, big endian
//! 4          | 5        | Register count, big endian
//! 6          | 7        | MODBUS CRC over bytes 0-5, low byte first
//!
//! Response:
//!
//! Start Byte | End Byte | Meaning
//! 0          | 0        | Device id
//! 1          | 1        | Function code, high bit set on exceptions
//! 2          | 2        | Payload length in bytes (or exception code)
//! 3          | x        | Payload, big endian words
//! x+1        | x+2      | MODBUS CRC over bytes 0-x, low byte first

use crc16::{State, MODBUS};

use super::link::TransportFailure;
use super::span::*;

pub(crate) const READ_REGISTERS: u8 = 0x03;

const EXCEPTION: u8 = 0x80;
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;

pub(crate) fn request(device_id: u8, span: SimpleSpan) -> Vec<u8> {
  let mut frame = Vec::with_capacity(8);
  frame.push(device_id);
  frame.push(READ_REGISTERS);
  frame.extend_from_slice(&span.address.to_be_bytes());
  frame.extend_from_slice(&span.quantity.to_be_bytes());
  let crc = crc(&frame);
  frame.extend_from_slice(&crc);
  frame
}

/// Total frame length once enough of the header has arrived.
pub(crate) fn expected_len(buffer: &[u8]) -> Option<usize> {
  if buffer.len() < HEADER_LEN {
    return None;
  }

  if buffer[1] & EXCEPTION != 0 {
    return Some(HEADER_LEN + CRC_LEN);
  }

  Some(HEADER_LEN + buffer[2] as usize + CRC_LEN)
}

pub(crate) fn parse_response(
  buffer: &[u8],
  span: SimpleSpan,
) -> Result<Vec<u16>, TransportFailure> {
  let expected_len = match expected_len(buffer) {
    Some(expected_len) => expected_len,
    None => {
      return Err(TransportFailure::MalformedResponse(format!(
        "response too short: {}",
        hex::encode(buffer)
      )))
    }
  };

  if buffer.len() != expected_len {
    return Err(TransportFailure::MalformedResponse(format!(
      "expected {} bytes, got {}: {}",
      expected_len,
      buffer.len(),
      hex::encode(buffer)
    )));
  }

  let (body, crc_actual) = buffer.split_at(buffer.len() - CRC_LEN);
  if crc_actual != crc(body) {
    return Err(TransportFailure::ChecksumMismatch {
      raw: buffer.to_vec(),
    });
  }

  let function = buffer[1];
  if function & EXCEPTION != 0 {
    return Err(TransportFailure::MalformedResponse(format!(
      "device exception {:#04x} for function {:#04x}",
      buffer[2],
      function & !EXCEPTION
    )));
  }

  if function != READ_REGISTERS {
    return Err(TransportFailure::MalformedResponse(format!(
      "unexpected function {:#04x}",
      function
    )));
  }

  let payload = &body[HEADER_LEN..];
  if payload.len() != span.quantity as usize * 2 {
    return Err(TransportFailure::MalformedResponse(format!(
      "expected {} words for register {:#06x}, got {} bytes",
      span.quantity,
      span.address,
      payload.len()
    )));
  }

  Ok(
    payload
      .chunks_exact(2)
      .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
      .collect(),
  )
}

/// Builds a well formed response frame for `words`.
#[cfg(test)]
pub(crate) fn response(device_id: u8, words: &[u16]) -> Vec<u8> {
  let mut frame = vec![device_id, READ_REGISTERS, (words.len() * 2) as u8];
  frame.extend(words.iter().flat_map(|word| word.to_be_bytes()));
  let crc = crc(&frame);
  frame.extend_from_slice(&crc);
  frame
}

fn crc(data: &[u8]) -> [u8; 2] {
  State::<MODBUS>::calculate(data).to_le_bytes()
}

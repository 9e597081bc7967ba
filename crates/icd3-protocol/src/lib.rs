//! Wire record shared by the driver-side [`icd3-transport`](../icd3_transport/index.html)
//! endpoint and the model process it talks to.
//!
//! The record is fixed-size and fixed-layout (§3/§6 of the spec): there is no
//! framed length prefix, because every message — request, response, or
//! server-pushed interrupt — is exactly [`MESSAGE_LEN`] bytes on the wire, in
//! host (little-endian) byte order.

use std::fmt;

pub const MAX_DATA_LEN: usize = 256;

/// `device_id(4) + command(1) + address(4) + length(4) + result(1) + data(256)`.
pub const MESSAGE_LEN: usize = 4 + 1 + 4 + 4 + 1 + MAX_DATA_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Read = 1,
    Write = 2,
    Interrupt = 3,
    Init = 4,
    Deinit = 5,
}

impl Command {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Command::Read,
            2 => Command::Write,
            3 => Command::Interrupt,
            4 => Command::Init,
            5 => Command::Deinit,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    Error = 1,
    Timeout = 2,
    InvalidAddr = 3,
}

impl ResultCode {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ResultCode::Success,
            1 => ResultCode::Error,
            2 => ResultCode::Timeout,
            3 => ResultCode::InvalidAddr,
            _ => return None,
        })
    }
}

/// One wire record. `length` is the number of meaningful bytes at the front
/// of `data`; the rest of `data` is wire padding and is not meaningful.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub device_id: u32,
    pub command: Command,
    pub address: u32,
    pub length: u32,
    pub result: ResultCode,
    pub data: [u8; MAX_DATA_LEN],
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("device_id", &self.device_id)
            .field("command", &self.command)
            .field("address", &format_args!("{:#x}", self.address))
            .field("length", &self.length)
            .field("result", &self.result)
            .field("data", &&self.data[..self.length as usize])
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is {0} bytes, expected {MESSAGE_LEN}")]
    WrongSize(usize),
    #[error("unknown command byte {0:#x}")]
    UnknownCommand(u8),
    #[error("unknown result byte {0:#x}")]
    UnknownResult(u8),
    #[error("length field {0} exceeds the {MAX_DATA_LEN}-byte data payload")]
    LengthTooLarge(u32),
}

impl Message {
    pub fn request_read(device_id: u32, address: u32, length: u32) -> Self {
        Message {
            device_id,
            command: Command::Read,
            address,
            length,
            result: ResultCode::Success,
            data: [0; MAX_DATA_LEN],
        }
    }

    pub fn request_write(device_id: u32, address: u32, length: u32, bytes: &[u8]) -> Self {
        let mut data = [0; MAX_DATA_LEN];
        data[..bytes.len()].copy_from_slice(bytes);
        Message {
            device_id,
            command: Command::Write,
            address,
            length,
            result: ResultCode::Success,
            data,
        }
    }

    pub fn interrupt(device_id: u32, irq_id: u32) -> Self {
        Message {
            device_id,
            command: Command::Interrupt,
            address: irq_id,
            length: 0,
            result: ResultCode::Success,
            data: [0; MAX_DATA_LEN],
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..(self.length as usize).min(MAX_DATA_LEN)]
    }

    pub fn encode(&self) -> [u8; MESSAGE_LEN] {
        let mut buf = [0u8; MESSAGE_LEN];
        encode_into(self, &mut buf);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() != MESSAGE_LEN {
            return Err(DecodeError::WrongSize(bytes.len()));
        }
        let device_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let command = Command::from_u8(bytes[4]).ok_or(DecodeError::UnknownCommand(bytes[4]))?;
        let address = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
        let length = u32::from_le_bytes(bytes[9..13].try_into().unwrap());
        if length as usize > MAX_DATA_LEN {
            return Err(DecodeError::LengthTooLarge(length));
        }
        let result = ResultCode::from_u8(bytes[13]).ok_or(DecodeError::UnknownResult(bytes[13]))?;
        let mut data = [0u8; MAX_DATA_LEN];
        data.copy_from_slice(&bytes[14..14 + MAX_DATA_LEN]);
        Ok(Message {
            device_id,
            command,
            address,
            length,
            result,
            data,
        })
    }
}

/// Signal-safe encode path used by the trap handler: writes into a caller-owned
/// buffer so no allocation occurs between fault and resume (see `icd3-trap`).
pub fn encode_into(msg: &Message, out: &mut [u8; MESSAGE_LEN]) {
    out[0..4].copy_from_slice(&msg.device_id.to_le_bytes());
    out[4] = msg.command as u8;
    out[5..9].copy_from_slice(&msg.address.to_le_bytes());
    out[9..13].copy_from_slice(&msg.length.to_le_bytes());
    out[13] = msg.result as u8;
    out[14..14 + MAX_DATA_LEN].copy_from_slice(&msg.data);
}

/// Read access widths a request may carry, per §3: `length ∈ {1,2,4,8}`.
pub fn is_valid_width(length: u32) -> bool {
    matches!(length, 1 | 2 | 4 | 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_len_matches_c_struct_layout() {
        // device_id(4) + command(1) + address(4) + length(4) + result(1) + data(256)
        assert_eq!(MESSAGE_LEN, 277);
    }

    #[test]
    fn read_request_roundtrip() {
        let msg = Message::request_read(1, 0x1000, 4);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), MESSAGE_LEN);
        let decoded = Message::decode(&bytes).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn write_request_roundtrip_preserves_data() {
        let msg = Message::request_write(2, 0x40000001, 1, &[0x5A]);
        let bytes = msg.encode();
        let decoded = Message::decode(&bytes).expect("decode");
        assert_eq!(decoded.data(), &[0x5A]);
        assert_eq!(decoded.command, Command::Write);
    }

    #[test]
    fn interrupt_roundtrip() {
        let msg = Message::interrupt(8, 7);
        let decoded = Message::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded.command, Command::Interrupt);
        assert_eq!(decoded.device_id, 8);
        assert_eq!(decoded.address, 7);
    }

    #[test]
    fn decode_rejects_wrong_size() {
        assert_eq!(Message::decode(&[0; 10]), Err(DecodeError::WrongSize(10)));
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let mut bytes = Message::request_read(1, 0, 4).encode();
        bytes[4] = 0xFF;
        assert_eq!(
            Message::decode(&bytes),
            Err(DecodeError::UnknownCommand(0xFF))
        );
    }

    #[test]
    fn decode_rejects_length_over_payload_cap() {
        let mut bytes = Message::request_read(1, 0, 4).encode();
        bytes[9..13].copy_from_slice(&300u32.to_le_bytes());
        assert_eq!(
            Message::decode(&bytes),
            Err(DecodeError::LengthTooLarge(300))
        );
    }

    #[test]
    fn widths_match_spec_enum() {
        for w in [1, 2, 4, 8] {
            assert!(is_valid_width(w));
        }
        for w in [0, 3, 5, 6, 7, 16] {
            assert!(!is_valid_width(w));
        }
    }
}

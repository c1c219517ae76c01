//! CoAP message codec (RFC 7252 §3)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! |   Token (if any, TKL bytes) ...
//! |   Options (if any) ...
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! ```
//!
//! Options are kept in insertion order and sorted by number on encode.

use crate::utils::error::CodecError;

const VERSION: u8 = 1;
const HEADER_LEN: usize = 4;
const MAX_TOKEN_LEN: usize = 8;
const PAYLOAD_MARKER: u8 = 0xFF;

pub mod code {
    //! Request methods and response codes, packed as `class << 5 | detail`.
    pub const EMPTY: u8 = 0x00;
    pub const GET: u8 = 0x01;
    pub const POST: u8 = 0x02;
    pub const PUT: u8 = 0x03;
    pub const DELETE: u8 = 0x04;

    pub const CONTENT: u8 = 0x45;
    pub const BAD_REQUEST: u8 = 0x80;
    pub const UNAUTHORIZED: u8 = 0x81;
    pub const NOT_FOUND: u8 = 0x84;
    pub const METHOD_NOT_ALLOWED: u8 = 0x85;
    pub const INTERNAL_SERVER_ERROR: u8 = 0xA0;

    /// Render `code` in dotted form, e.g. `2.05`.
    pub fn display(code: u8) -> String {
        format!("{}.{:02}", code >> 5, code & 0x1F)
    }
}

pub mod option {
    pub const OBSERVE: u16 = 6;
    pub const URI_PATH: u16 = 11;
    pub const URI_QUERY: u16 = 15;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: MessageType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub options: Vec<CoapOption>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: MessageType, code: u8, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Vec::new(),
            options: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Piggy-backed response to a confirmable request.
    pub fn ack_for(request: &Packet, code: u8) -> Self {
        let mut packet = Self::new(MessageType::Acknowledgement, code, request.message_id);
        packet.token = request.token.clone();
        packet
    }

    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, code::EMPTY, message_id)
    }

    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, code::EMPTY, message_id)
    }

    pub fn with_token(mut self, token: &[u8]) -> Self {
        self.token = token.to_vec();
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.code == code::EMPTY
    }

    pub fn is_request(&self) -> bool {
        (1..32).contains(&self.code)
    }

    pub fn add_option(&mut self, number: u16, value: impl Into<Vec<u8>>) {
        self.options.push(CoapOption {
            number,
            value: value.into(),
        });
    }

    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    pub fn uri_path(&self) -> Vec<String> {
        self.option_values(option::URI_PATH)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.option_values(option::URI_QUERY)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Value of query parameter `name`, e.g. `auth` in `?auth=...`.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.uri_query().into_iter().find_map(|q| {
            q.split_once('=')
                .filter(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        })
    }

    pub fn observe(&self) -> Option<u32> {
        self.option_values(option::OBSERVE).next().map(decode_uint)
    }

    pub fn set_observe(&mut self, value: u32) {
        self.options.retain(|o| o.number != option::OBSERVE);
        self.add_option(option::OBSERVE, encode_uint(value));
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CodecError::InvalidTokenLength(self.token.len() as u8));
        }

        let mut buf = Vec::with_capacity(HEADER_LEN + self.token.len() + self.payload.len() + 16);
        buf.push((VERSION << 6) | (self.kind.bits() << 4) | self.token.len() as u8);
        buf.push(self.code);
        buf.extend_from_slice(&self.message_id.to_be_bytes());
        buf.extend_from_slice(&self.token);

        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|o| o.number);

        let mut previous = 0u16;
        for opt in options {
            let delta = opt.number - previous;
            let (delta_nibble, delta_ext) = split_extended(delta as usize)?;
            let (len_nibble, len_ext) = split_extended(opt.value.len())?;
            buf.push((delta_nibble << 4) | len_nibble);
            buf.extend_from_slice(&delta_ext);
            buf.extend_from_slice(&len_ext);
            buf.extend_from_slice(&opt.value);
            previous = opt.number;
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::TooShort);
        }

        let version = bytes[0] >> 6;
        if version != VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let kind = MessageType::from_bits(bytes[0] >> 4);
        let tkl = bytes[0] & 0x0F;
        if tkl as usize > MAX_TOKEN_LEN {
            return Err(CodecError::InvalidTokenLength(tkl));
        }
        let code = bytes[1];
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

        let mut offset = HEADER_LEN;
        let token_end = offset + tkl as usize;
        let token = bytes
            .get(offset..token_end)
            .ok_or(CodecError::TooShort)?
            .to_vec();
        offset = token_end;

        let mut packet = Packet {
            kind,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Vec::new(),
        };

        let mut number = 0u16;
        while offset < bytes.len() {
            let byte = bytes[offset];
            offset += 1;

            if byte == PAYLOAD_MARKER {
                if offset == bytes.len() {
                    return Err(CodecError::EmptyPayload);
                }
                packet.payload = bytes[offset..].to_vec();
                break;
            }

            let delta = read_extended(byte >> 4, bytes, &mut offset)?;
            let len = read_extended(byte & 0x0F, bytes, &mut offset)?;
            number = u16::try_from(number as usize + delta).map_err(|_| CodecError::InvalidOption)?;

            let value = bytes
                .get(offset..offset + len)
                .ok_or(CodecError::InvalidOption)?;
            packet.add_option(number, value);
            offset += len;
        }

        Ok(packet)
    }
}

/// Split an option delta or length into its 4-bit nibble and extended bytes.
fn split_extended(value: usize) -> Result<(u8, Vec<u8>), CodecError> {
    match value {
        0..=12 => Ok((value as u8, Vec::new())),
        13..=268 => Ok((13, vec![(value - 13) as u8])),
        269..=65804 => Ok((14, ((value - 269) as u16).to_be_bytes().to_vec())),
        _ => Err(CodecError::InvalidOption),
    }
}

fn read_extended(nibble: u8, bytes: &[u8], offset: &mut usize) -> Result<usize, CodecError> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => {
            let b = *bytes.get(*offset).ok_or(CodecError::InvalidOption)?;
            *offset += 1;
            Ok(b as usize + 13)
        }
        14 => {
            let b = bytes
                .get(*offset..*offset + 2)
                .ok_or(CodecError::InvalidOption)?;
            *offset += 2;
            Ok(u16::from_be_bytes([b[0], b[1]]) as usize + 269)
        }
        // 15 is reserved for the payload marker
        _ => Err(CodecError::InvalidOption),
    }
}

/// Minimal big-endian encoding of an unsigned option value.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

pub fn decode_uint(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .fold(0u32, |acc, b| (acc << 8) | *b as u32)
}

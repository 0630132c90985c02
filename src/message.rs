// SPDX-License-Identifier: MIT OR Apache-2.0

//! The [`Message`] value, its typed accessors, and the request builders for
//! every supported Modbus function code.
//!
//! A `Message` is a thin, safe wrapper around a byte buffer representing a
//! Modbus PDU (`[server_id, function_code, ...payload]`); it exposes explicit
//! capacity and length rather than raw pointers, matching the rest of the
//! library's preference for typed accessors over buffer arithmetic.

use crate::error::{Error, ErrorCode};

/// Largest payload a Modbus PDU may carry (253 bytes total minus fc minus server id).
pub const MAX_PDU_PAYLOAD: usize = 252;

pub const SERVER_ID_BROADCAST: u8 = 0;
pub const SERVER_ID_MIN: u8 = 1;
pub const SERVER_ID_MAX: u8 = 247;

/// Byte order used when two consecutive registers encode a 32-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOrder {
    /// High register first (big-endian word order).
    HighFirst,
    /// Low register first (little-endian word order), common on some PLCs.
    LowFirst,
}

/// A Modbus PDU: server id, function code, and payload, stored as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn server_id(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    pub fn function_code(&self) -> Option<u8> {
        self.buf.get(1).copied()
    }

    /// The payload bytes following the function code.
    pub fn payload(&self) -> &[u8] {
        if self.buf.len() <= 2 {
            &[]
        } else {
            &self.buf[2..]
        }
    }

    pub fn append_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn append_u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn append_u32(&mut self, value: u32, order: RegisterOrder) -> &mut Self {
        let [b0, b1, b2, b3] = value.to_be_bytes();
        match order {
            RegisterOrder::HighFirst => self.buf.extend_from_slice(&[b0, b1, b2, b3]),
            RegisterOrder::LowFirst => self.buf.extend_from_slice(&[b2, b3, b0, b1]),
        }
        self
    }

    pub fn append_f32(&mut self, value: f32, order: RegisterOrder) -> &mut Self {
        self.append_u32(value.to_bits(), order)
    }

    pub fn append_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(data);
        self
    }

    pub fn extract_u8(&self, offset: usize) -> Result<(u8, usize), Error> {
        self.buf
            .get(offset)
            .copied()
            .map(|v| (v, offset + 1))
            .ok_or_else(|| Error::new(ErrorCode::PacketLengthError))
    }

    pub fn extract_u16(&self, offset: usize) -> Result<(u16, usize), Error> {
        let end = offset + 2;
        if end > self.buf.len() {
            return Err(Error::new(ErrorCode::PacketLengthError));
        }
        Ok((u16::from_be_bytes([self.buf[offset], self.buf[offset + 1]]), end))
    }

    pub fn extract_u32(&self, offset: usize, order: RegisterOrder) -> Result<(u32, usize), Error> {
        let end = offset + 4;
        if end > self.buf.len() {
            return Err(Error::new(ErrorCode::PacketLengthError));
        }
        let b = &self.buf[offset..end];
        let bytes = match order {
            RegisterOrder::HighFirst => [b[0], b[1], b[2], b[3]],
            RegisterOrder::LowFirst => [b[2], b[3], b[0], b[1]],
        };
        Ok((u32::from_be_bytes(bytes), end))
    }

    pub fn extract_f32(&self, offset: usize, order: RegisterOrder) -> Result<(f32, usize), Error> {
        let (bits, end) = self.extract_u32(offset, order)?;
        Ok((f32::from_bits(bits), end))
    }
}

/// A request submitted to a transport: the PDU to send plus a caller-chosen
/// correlation token returned unchanged in the matching [`Response`].
#[derive(Debug, Clone)]
pub struct Request {
    pub message: Message,
    pub token: u32,
}

/// The outcome of a request: either a successful reply payload or an error code.
#[derive(Debug, Clone)]
pub struct Response {
    pub server_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
    pub error: ErrorCode,
    pub token: u32,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.error.is_success()
    }
}

/// Validates a server id for use in a request. Broadcast (0) is only legal
/// for write-type function codes, per the Modbus application protocol spec.
pub fn validate_server_id(server_id: u8, function_code: u8) -> Result<(), Error> {
    if server_id == SERVER_ID_BROADCAST {
        if is_write_function(function_code) {
            return Ok(());
        }
        return Err(Error::new(ErrorCode::ParameterLimitError));
    }
    if server_id > SERVER_ID_MAX {
        return Err(Error::new(ErrorCode::ParameterLimitError));
    }
    Ok(())
}

/// Whether `function_code` represents a write-type request (legal to broadcast).
pub fn is_write_function(function_code: u8) -> bool {
    matches!(function_code, 0x05 | 0x06 | 0x0F | 0x10 | 0x16 | 0x17)
}

fn check_quantity(quantity: u16, max: u16) -> Result<(), Error> {
    if quantity == 0 || quantity > max {
        Err(Error::new(ErrorCode::ParameterLimitError))
    } else {
        Ok(())
    }
}

/// Builds a request PDU for function codes that take no parameters
/// (0x07, 0x0B, 0x0C, 0x11: read exception status, poll, get comm event log, report server id).
pub fn build_no_param(server_id: u8, function_code: u8) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    let mut msg = Message::with_capacity(2);
    msg.append_u8(server_id).append_u8(function_code);
    Ok(msg)
}

/// Builds a request PDU for function codes taking a single u16 parameter (0x18: read FIFO queue).
pub fn build_one_param(server_id: u8, function_code: u8, p1: u16) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    let mut msg = Message::with_capacity(4);
    msg.append_u8(server_id).append_u8(function_code).append_u16(p1);
    Ok(msg)
}

/// Builds a request PDU for function codes taking two u16 parameters
/// (0x01, 0x02, 0x03, 0x04: reads; 0x05, 0x06: single writes).
pub fn build_two_param(server_id: u8, function_code: u8, p1: u16, p2: u16) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    match function_code {
        0x01 | 0x02 => check_quantity(p2, 2000)?,
        0x03 | 0x04 => check_quantity(p2, 125)?,
        0x05 => {
            if p2 != 0x0000 && p2 != 0xFF00 {
                return Err(Error::new(ErrorCode::ParameterLimitError));
            }
        }
        0x06 => {}
        _ => {}
    }
    let mut msg = Message::with_capacity(6);
    msg.append_u8(server_id)
        .append_u8(function_code)
        .append_u16(p1)
        .append_u16(p2);
    Ok(msg)
}

/// Builds a request PDU for function code 0x16 (mask write register): address, AND mask, OR mask.
pub fn build_three_param(
    server_id: u8,
    function_code: u8,
    p1: u16,
    p2: u16,
    p3: u16,
) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    let mut msg = Message::with_capacity(8);
    msg.append_u8(server_id)
        .append_u8(function_code)
        .append_u16(p1)
        .append_u16(p2)
        .append_u16(p3);
    Ok(msg)
}

/// Builds a request PDU for function code 0x10 (write multiple registers).
pub fn build_write_registers(
    server_id: u8,
    function_code: u8,
    address: u16,
    words: &[u16],
) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    check_quantity(words.len() as u16, 123)?;
    let byte_count = (words.len() * 2) as u8;
    let mut msg = Message::with_capacity(7 + words.len() * 2);
    msg.append_u8(server_id)
        .append_u8(function_code)
        .append_u16(address)
        .append_u16(words.len() as u16)
        .append_u8(byte_count);
    for &w in words {
        msg.append_u16(w);
    }
    Ok(msg)
}

/// Builds a request PDU for function code 0x0F (write multiple coils).
///
/// `coils` must already be packed LSB-first (see [`crate::coil::CoilData::to_wire`]).
pub fn build_write_coils(
    server_id: u8,
    function_code: u8,
    address: u16,
    quantity: u16,
    coils: &[u8],
) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    check_quantity(quantity, 1968)?;
    let expected_bytes = ((quantity as usize) + 7) / 8;
    if coils.len() != expected_bytes {
        return Err(Error::new(ErrorCode::ParameterCountError));
    }
    let mut msg = Message::with_capacity(7 + coils.len());
    msg.append_u8(server_id)
        .append_u8(function_code)
        .append_u16(address)
        .append_u16(quantity)
        .append_u8(coils.len() as u8)
        .append_bytes(coils);
    Ok(msg)
}

/// Builds a request PDU for function code 0x17 (read/write multiple registers).
pub fn build_read_write_registers(
    server_id: u8,
    function_code: u8,
    read_address: u16,
    read_quantity: u16,
    write_address: u16,
    write_words: &[u16],
) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    check_quantity(read_quantity, 125)?;
    check_quantity(write_words.len() as u16, 121)?;
    let byte_count = (write_words.len() * 2) as u8;
    let mut msg = Message::with_capacity(10 + write_words.len() * 2);
    msg.append_u8(server_id)
        .append_u8(function_code)
        .append_u16(read_address)
        .append_u16(read_quantity)
        .append_u16(write_address)
        .append_u16(write_words.len() as u16)
        .append_u8(byte_count);
    for &w in write_words {
        msg.append_u16(w);
    }
    Ok(msg)
}

/// Builds a request PDU from preformatted bytes, counted in bytes rather than
/// words or coils. Used for custom/vendor-specific function codes.
pub fn build_raw(server_id: u8, function_code: u8, data: &[u8]) -> Result<Message, Error> {
    validate_server_id(server_id, function_code)?;
    if data.len() > MAX_PDU_PAYLOAD {
        return Err(Error::new(ErrorCode::PacketLengthError));
    }
    let mut msg = Message::with_capacity(2 + data.len());
    msg.append_u8(server_id).append_u8(function_code).append_bytes(data);
    Ok(msg)
}

/// Builds the wire bytes (no CRC/MBAP framing) for an exception response.
pub fn build_exception_response(server_id: u8, function_code: u8, error: ErrorCode) -> Vec<u8> {
    let byte = error.exception_byte().unwrap_or(0x04);
    vec![server_id, function_code | 0x80, byte]
}

/// Parses a raw PDU (server id + function code + payload, no transport framing)
/// into a structured [`Response`]. `token` is carried through from the request
/// this reply corresponds to.
pub fn parse_response_pdu(pdu: &[u8], token: u32) -> Result<Response, Error> {
    if pdu.len() < 2 {
        return Err(Error::new(ErrorCode::EmptyMessage));
    }
    let server_id = pdu[0];
    let raw_fc = pdu[1];
    if raw_fc & 0x80 != 0 {
        if pdu.len() < 3 {
            return Err(Error::new(ErrorCode::PacketLengthError));
        }
        return Ok(Response {
            server_id,
            function_code: raw_fc & 0x7F,
            payload: Vec::new(),
            error: ErrorCode::from_exception_byte(pdu[2]),
            token,
        });
    }
    Ok(Response {
        server_id,
        function_code: raw_fc,
        payload: pdu[2..].to_vec(),
        error: ErrorCode::Success,
        token,
    })
}

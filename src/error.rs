// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy shared by the client and server sides of the library.
//!
//! [`ErrorCode`] merges the standard Modbus protocol exceptions (0x01-0x0B, sent
//! on the wire as the second byte of an exception reply) with the transport-level
//! failures a request can suffer before a protocol exception is even possible
//! (timeouts, CRC mismatches, malformed frames, a full request queue, ...).

use std::fmt;

/// A single outcome code for a Modbus request.
///
/// `Success` is not a real wire value; it is the code used internally and in
/// [`crate::message::Response`] to mean "the server replied and nothing went
/// wrong". Every variant up to [`ErrorCode::GatewayTargetNoResponse`] maps to a
/// standard Modbus exception byte via [`ErrorCode::exception_byte`]; the rest
/// never appear on the wire and only describe failures local to this transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The request completed and the server returned a normal response.
    Success,

    // --- standard Modbus protocol exceptions (wire codes 0x01-0x0B) ---
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Acknowledge,
    ServerDeviceBusy,
    NegativeAcknowledgement,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetNoResponse,

    // --- transport-level errors, never sent as an exception byte ---
    /// No reply was received within the configured timeout.
    Timeout,
    /// The CRC trailer of an RTU frame did not match its payload.
    CrcError,
    /// The function code of a response did not match its request.
    FcMismatch,
    /// The server-id (unit id / slave address) of a response did not match its request.
    ServerIdMismatch,
    /// A frame violated a length constraint (too short, inconsistent byte count, ...).
    PacketLengthError,
    /// A caller passed the wrong number of parameters for a function code.
    ParameterCountError,
    /// A caller passed a quantity or address outside of the legal Modbus range.
    ParameterLimitError,
    /// The bounded request queue was full when a new request was submitted.
    RequestQueueFull,
    /// A TCP target's host/port could not be resolved or was invalid.
    IllegalIpOrPort,
    /// A TCP connection attempt failed.
    IpConnectionFailed,
    /// The MBAP header of a TCP frame was inconsistent (bad protocol id, length, ...).
    TcpHeadMismatch,
    /// A frame was received with zero-length payload where a PDU was expected.
    EmptyMessage,
    /// Reserved for a Modbus ASCII transport: malformed `:`/CRLF framing. Unused by RTU/TCP.
    AsciiFrameErr,
    /// Reserved for a Modbus ASCII transport: LRC checksum mismatch. Unused by RTU/TCP.
    AsciiCrcErr,
    /// Reserved for a Modbus ASCII transport: non-hex character in the frame. Unused by RTU/TCP.
    AsciiInvalidChar,
    /// Catch-all for failures that do not fit any other code (I/O errors, etc.).
    UndefinedError,
}

impl ErrorCode {
    /// The byte placed after the exception function code (`fc | 0x80`) on the wire.
    ///
    /// Returns `None` for `Success` and for every transport-level variant, since
    /// those never appear as the second byte of an exception PDU.
    pub fn exception_byte(self) -> Option<u8> {
        use ErrorCode::*;
        Some(match self {
            IllegalFunction => 0x01,
            IllegalDataAddress => 0x02,
            IllegalDataValue => 0x03,
            ServerDeviceFailure => 0x04,
            Acknowledge => 0x05,
            ServerDeviceBusy => 0x06,
            NegativeAcknowledgement => 0x07,
            MemoryParityError => 0x08,
            GatewayPathUnavailable => 0x0A,
            GatewayTargetNoResponse => 0x0B,
            _ => return None,
        })
    }

    /// Recovers an [`ErrorCode`] from an exception byte read off the wire.
    ///
    /// Unknown codes (including the reserved-but-unassigned 0x09) map to
    /// [`ErrorCode::UndefinedError`] rather than panicking, since a faulty or
    /// non-conformant server can send anything in that slot.
    pub fn from_exception_byte(byte: u8) -> Self {
        use ErrorCode::*;
        match byte {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x07 => NegativeAcknowledgement,
            0x08 => MemoryParityError,
            0x0A => GatewayPathUnavailable,
            0x0B => GatewayTargetNoResponse,
            _ => UndefinedError,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, ErrorCode::Success)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::Success => "success",
            ErrorCode::IllegalFunction => "illegal function",
            ErrorCode::IllegalDataAddress => "illegal data address",
            ErrorCode::IllegalDataValue => "illegal data value",
            ErrorCode::ServerDeviceFailure => "server device failure",
            ErrorCode::Acknowledge => "acknowledge",
            ErrorCode::ServerDeviceBusy => "server device busy",
            ErrorCode::NegativeAcknowledgement => "negative acknowledgement",
            ErrorCode::MemoryParityError => "memory parity error",
            ErrorCode::GatewayPathUnavailable => "gateway path unavailable",
            ErrorCode::GatewayTargetNoResponse => "gateway target device failed to respond",
            ErrorCode::Timeout => "request timed out",
            ErrorCode::CrcError => "CRC check failed",
            ErrorCode::FcMismatch => "function code mismatch",
            ErrorCode::ServerIdMismatch => "server id mismatch",
            ErrorCode::PacketLengthError => "packet length error",
            ErrorCode::ParameterCountError => "wrong number of parameters",
            ErrorCode::ParameterLimitError => "parameter outside of the legal range",
            ErrorCode::RequestQueueFull => "request queue full",
            ErrorCode::IllegalIpOrPort => "illegal IP address or port",
            ErrorCode::IpConnectionFailed => "IP connection failed",
            ErrorCode::TcpHeadMismatch => "TCP header mismatch",
            ErrorCode::EmptyMessage => "empty message",
            ErrorCode::AsciiFrameErr => "ASCII frame error",
            ErrorCode::AsciiCrcErr => "ASCII LRC error",
            ErrorCode::AsciiInvalidChar => "ASCII invalid character",
            ErrorCode::UndefinedError => "undefined error",
        };
        f.write_str(text)
    }
}

/// The library's error type, carrying an [`ErrorCode`] plus optional context.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}{}", .detail.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
pub struct Error {
    pub code: ErrorCode,
    detail: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::with_detail(ErrorCode::UndefinedError, err.to_string())
    }
}

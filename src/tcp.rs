// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP (MBAP) framing and the transaction table used to correlate
//! out-of-order responses on a single, potentially-pipelined connection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode};
use crate::message::{parse_response_pdu, Response};

pub const HEADER_LEN: usize = 7;
pub const PROTOCOL_ID: u16 = 0x0000;

/// A TCP connection as seen by the TCP framer: connect once, then exchange
/// bytes. Implementations are expected to be non-blocking on read, returning
/// an empty vector rather than waiting when nothing has arrived yet.
#[async_trait::async_trait]
pub trait TcpConnection: Send {
    async fn connect(&mut self, host: &str, port: u16) -> std::io::Result<()>;
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    async fn read_available(&mut self) -> std::io::Result<Vec<u8>>;
    async fn close(&mut self) -> std::io::Result<()>;
}

/// Encodes an MBAP-framed request: `transaction_id | protocol_id(0) | length | unit_id | pdu`.
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// A single decoded MBAP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`, returning
/// the frame and the number of bytes it consumed, or `None` if `buf` does not
/// yet contain a complete frame. Caller must drain `consumed` bytes from `buf`.
pub fn try_decode_frame(buf: &[u8]) -> Result<Option<(DecodedFrame, usize)>, Error> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol_id != PROTOCOL_ID {
        return Err(Error::new(ErrorCode::TcpHeadMismatch));
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if length == 0 {
        return Err(Error::new(ErrorCode::TcpHeadMismatch));
    }
    let unit_id = buf[6];
    let pdu_len = length - 1;
    let total_len = HEADER_LEN + pdu_len;
    if buf.len() < total_len {
        return Ok(None);
    }
    let pdu = buf[HEADER_LEN..total_len].to_vec();
    Ok(Some((
        DecodedFrame { transaction_id, unit_id, pdu },
        total_len,
    )))
}

#[derive(Debug)]
struct PendingEntry {
    token: u32,
    function_code: u8,
    deadline: Instant,
}

/// Tracks in-flight TCP requests by transaction id so replies can be matched
/// and delivered regardless of the order the server sends them back in.
#[derive(Debug)]
pub struct TransactionTable {
    pending: HashMap<u16, PendingEntry>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    pub fn insert(&mut self, transaction_id: u16, token: u32, function_code: u8, timeout: Duration) {
        self.pending.insert(
            transaction_id,
            PendingEntry {
                token,
                function_code,
                deadline: Instant::now() + timeout,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Matches a decoded frame against a pending entry, removing it and
    /// producing the corresponding [`Response`]. Returns `None` if no request
    /// is waiting on this transaction id (a stray or duplicate reply).
    pub fn resolve(&mut self, frame: DecodedFrame) -> Option<Response> {
        let entry = self.pending.remove(&frame.transaction_id)?;
        Some(match parse_response_pdu(&frame.pdu, entry.token) {
            Ok(mut response) => {
                if response.function_code != entry.function_code {
                    response.error = ErrorCode::FcMismatch;
                }
                response
            }
            Err(err) => Response {
                server_id: frame.unit_id,
                function_code: entry.function_code,
                payload: Vec::new(),
                error: err.code(),
                token: entry.token,
            },
        })
    }

    /// Removes and returns every entry whose deadline has passed, each turned
    /// into a [`ErrorCode::Timeout`] response ready for delivery.
    pub fn sweep_timeouts(&mut self) -> Vec<Response> {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .map(|id| {
                let entry = self.pending.remove(&id).expect("id taken from this map");
                Response {
                    server_id: 0,
                    function_code: entry.function_code,
                    payload: Vec::new(),
                    error: ErrorCode::Timeout,
                    token: entry.token,
                }
            })
            .collect()
    }

    /// Drains every pending entry unconditionally (used on disconnect), each
    /// delivered with `error`.
    pub fn drain_with(&mut self, error: ErrorCode) -> Vec<Response> {
        self.pending
            .drain()
            .map(|(_, entry)| Response {
                server_id: 0,
                function_code: entry.function_code,
                payload: Vec::new(),
                error,
                token: entry.token,
            })
            .collect()
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips_header_fields() {
        let pdu = vec![0x03, 0x02, 0x00, 0x0A];
        let frame = encode_frame(7, 11, &pdu);
        let (decoded, consumed) = try_decode_frame(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.transaction_id, 7);
        assert_eq!(decoded.unit_id, 11);
        assert_eq!(decoded.pdu, pdu);
    }

    #[test]
    fn partial_frame_returns_none() {
        let pdu = vec![0x03, 0x02, 0x00, 0x0A];
        let frame = encode_frame(1, 1, &pdu);
        assert!(try_decode_frame(&frame[..frame.len() - 1]).unwrap().is_none());
        assert!(try_decode_frame(&frame[..4]).unwrap().is_none());
    }

    #[test]
    fn bad_protocol_id_is_rejected() {
        let mut frame = encode_frame(1, 1, &[0x03, 0x00]);
        frame[2] = 0x00;
        frame[3] = 0x01;
        assert!(try_decode_frame(&frame).is_err());
    }

    #[test]
    fn transaction_table_resolves_out_of_order() {
        let mut table = TransactionTable::new();
        table.insert(1, 100, 0x03, Duration::from_secs(5));
        table.insert(2, 200, 0x03, Duration::from_secs(5));

        // Reply to transaction 2 arrives first.
        let frame2 = DecodedFrame { transaction_id: 2, unit_id: 9, pdu: vec![0x03, 0x02, 0, 1] };
        let resp2 = table.resolve(frame2).unwrap();
        assert_eq!(resp2.token, 200);

        let frame1 = DecodedFrame { transaction_id: 1, unit_id: 9, pdu: vec![0x03, 0x02, 0, 2] };
        let resp1 = table.resolve(frame1).unwrap();
        assert_eq!(resp1.token, 100);

        assert!(table.is_empty());
    }

    #[test]
    fn unknown_transaction_id_resolves_to_none() {
        let mut table = TransactionTable::new();
        let frame = DecodedFrame { transaction_id: 99, unit_id: 1, pdu: vec![0x03, 0x00] };
        assert!(table.resolve(frame).is_none());
    }

    #[test]
    fn sweep_timeouts_only_removes_expired_entries() {
        let mut table = TransactionTable::new();
        table.insert(1, 1, 0x03, Duration::from_millis(0));
        table.insert(2, 2, 0x03, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        let timed_out = table.sweep_timeouts();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].token, 1);
        assert_eq!(table.len(), 1);
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU framing: the half-duplex serial byte-level protocol shared by the RTU
//! client worker ([`crate::client`]) and the RTU server loop ([`crate::server`]).
//!
//! A frame is `[server_id, function_code, ...payload, crc_lo, crc_hi]`. There
//! is no length field; frame boundaries are found purely by silence on the
//! line, which is why [`RtuPort::read_available`] is polled rather than read
//! to a fixed length.

use std::time::{Duration, Instant};

use crate::crc;
use crate::error::{Error, ErrorCode};
use crate::message::{parse_response_pdu, Response};

/// Largest RTU frame this library will assemble before giving up and
/// resynchronizing (256 bytes is the conventional Modbus RTU ceiling).
pub const MAX_FRAME_LEN: usize = 256;

/// A half-duplex serial port as seen by the RTU framer.
///
/// Implementations are expected to be non-blocking: [`read_available`] returns
/// immediately with whatever bytes are currently buffered (possibly none)
/// rather than waiting for more to arrive. This mirrors the polling loop of
/// the original embedded implementation this framing logic is ported from.
#[async_trait::async_trait]
pub trait RtuPort: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    async fn flush(&mut self) -> std::io::Result<()>;
    async fn read_available(&mut self) -> std::io::Result<Vec<u8>>;
    fn baud_rate(&self) -> std::io::Result<u32>;
}

/// Controls a half-duplex transceiver's driver-enable (DE/RE) line.
///
/// Implementors toggle a GPIO high before a write and low again afterwards so
/// an RS-485 transceiver does not contend with incoming traffic on the bus.
pub trait DirectionControl: Send {
    fn set_transmit(&mut self, transmit: bool);
}

/// A [`DirectionControl`] that does nothing, for full-duplex lines (plain
/// RS-232, or an RS-485 adapter with automatic direction switching).
#[derive(Debug, Clone, Copy)]
pub struct NoDirectionControl;

impl DirectionControl for NoDirectionControl {
    fn set_transmit(&mut self, _transmit: bool) {}
}

/// Computes the conservative inter-frame silence interval for `baud_rate`,
/// matching the behavior of the implementation this library is based on:
/// roughly four character times, with a 1ms floor for low baud rates where
/// serial hardware FIFOs would otherwise make true 3.5-character gaps
/// unreliable to detect.
pub fn silent_interval(baud_rate: u32) -> Duration {
    let micros = 40_000_000u32.checked_div(baud_rate.max(1)).unwrap_or(u32::MAX);
    Duration::from_micros(micros.max(1000) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    WaitInterval,
    WaitData,
    InPacket,
    DataRead,
    Finished,
}

/// Drives the send/receive half-duplex state machine over an [`RtuPort`].
pub struct RtuFramer<P, D = NoDirectionControl> {
    port: P,
    direction: D,
    silent_interval: Duration,
    last_activity: Instant,
}

impl<P, D> std::fmt::Debug for RtuFramer<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtuFramer")
            .field("silent_interval", &self.silent_interval)
            .finish_non_exhaustive()
    }
}

impl<P: RtuPort> RtuFramer<P, NoDirectionControl> {
    pub fn new(port: P) -> std::io::Result<Self> {
        Self::with_direction_control(port, NoDirectionControl)
    }
}

impl<P: RtuPort, D: DirectionControl> RtuFramer<P, D> {
    pub fn with_direction_control(port: P, direction: D) -> std::io::Result<Self> {
        let baud = port.baud_rate()?;
        Ok(Self {
            port,
            direction,
            silent_interval: silent_interval(baud),
            last_activity: Instant::now(),
        })
    }

    pub fn silent_interval(&self) -> Duration {
        self.silent_interval
    }

    async fn wait_silent(&mut self) {
        let elapsed = self.last_activity.elapsed();
        if elapsed < self.silent_interval {
            tokio::time::sleep(self.silent_interval - elapsed).await;
        }
    }

    /// Sends `pdu`, appending its CRC16 trailer, after waiting out the
    /// mandatory inter-frame silence and toggling the direction line.
    pub async fn send(&mut self, pdu: &[u8]) -> Result<(), Error> {
        self.wait_silent().await;
        self.direction.set_transmit(true);
        let mut frame = pdu.to_vec();
        crc::append_to(&mut frame);
        let result = async {
            self.port.write_all(&frame).await?;
            self.port.flush().await
        }
        .await;
        self.direction.set_transmit(false);
        self.last_activity = Instant::now();
        result.map_err(Error::from)
    }

    /// Waits for and assembles the next silence-delimited frame, verifying its
    /// CRC. Used directly by a server (which has no particular response in
    /// mind); a client additionally validates server id/function code via
    /// [`RtuFramer::recv_response`].
    pub async fn recv_frame(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, Error> {
        let mut buf: Vec<u8> = Vec::new();
        let mut state = RxState::WaitInterval;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut last_byte_at = Instant::now();

        loop {
            match state {
                RxState::WaitInterval => {
                    let elapsed = self.last_activity.elapsed();
                    if elapsed >= self.silent_interval {
                        state = RxState::WaitData;
                    } else {
                        tokio::time::sleep(self.silent_interval - elapsed).await;
                    }
                }
                RxState::WaitData => {
                    let bytes = self.port.read_available().await?;
                    if !bytes.is_empty() {
                        buf.extend_from_slice(&bytes);
                        last_byte_at = Instant::now();
                        state = RxState::InPacket;
                    } else if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(Error::new(ErrorCode::Timeout));
                        }
                        tokio::time::sleep(crate::queue::POLL_INTERVAL).await;
                    } else {
                        tokio::time::sleep(crate::queue::POLL_INTERVAL).await;
                    }
                }
                RxState::InPacket => {
                    let bytes = self.port.read_available().await?;
                    if !bytes.is_empty() {
                        buf.extend_from_slice(&bytes);
                        last_byte_at = Instant::now();
                        if buf.len() >= MAX_FRAME_LEN {
                            state = RxState::DataRead;
                        }
                    } else if last_byte_at.elapsed() >= self.silent_interval {
                        state = RxState::DataRead;
                    } else {
                        tokio::time::sleep(Duration::from_micros(100)).await;
                    }
                }
                RxState::DataRead => {
                    self.last_activity = Instant::now();
                    state = RxState::Finished;
                }
                RxState::Finished => {
                    if !crc::verify(&buf) {
                        return Err(Error::new(ErrorCode::CrcError));
                    }
                    return Ok(buf[..buf.len() - 2].to_vec());
                }
            }
        }
    }

    /// Receives a response to a request previously sent for `expected_server_id`
    /// and `expected_function_code`, validating both against the reply.
    pub async fn recv_response(
        &mut self,
        expected_server_id: u8,
        expected_function_code: u8,
        token: u32,
        timeout: Duration,
    ) -> Response {
        let pdu = match self.recv_frame(Some(timeout)).await {
            Ok(pdu) => pdu,
            Err(err) => {
                return error_response(expected_server_id, expected_function_code, err.code(), token)
            }
        };
        match parse_response_pdu(&pdu, token) {
            Ok(response) => {
                if response.server_id != expected_server_id {
                    return error_response(
                        expected_server_id,
                        expected_function_code,
                        ErrorCode::ServerIdMismatch,
                        token,
                    );
                }
                if response.function_code != expected_function_code {
                    return error_response(
                        expected_server_id,
                        expected_function_code,
                        ErrorCode::FcMismatch,
                        token,
                    );
                }
                response
            }
            Err(err) => error_response(expected_server_id, expected_function_code, err.code(), token),
        }
    }
}

fn error_response(server_id: u8, function_code: u8, code: ErrorCode, token: u32) -> Response {
    Response {
        server_id,
        function_code,
        payload: Vec::new(),
        error: code,
        token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn silent_interval_has_a_floor() {
        assert_eq!(silent_interval(1_000_000), Duration::from_micros(1000));
        assert_eq!(silent_interval(9600), Duration::from_micros(40_000_000 / 9600));
    }

    struct ScriptedPort {
        baud: u32,
        chunks: StdMutex<std::collections::VecDeque<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl RtuPort for ScriptedPort {
        async fn write_all(&mut self, _bytes: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        async fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
        async fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
            Ok(self.chunks.lock().unwrap().pop_front().unwrap_or_default())
        }
        fn baud_rate(&self) -> std::io::Result<u32> {
            Ok(self.baud)
        }
    }

    #[tokio::test]
    async fn recv_response_validates_server_and_function_code() {
        let mut frame = vec![0x11, 0x03, 0x02, 0x00, 0x0A];
        crc::append_to(&mut frame);
        let port = ScriptedPort {
            baud: 115_200,
            chunks: StdMutex::new(vec![frame].into()),
        };
        let mut framer = RtuFramer::new(port).unwrap();
        let resp = framer
            .recv_response(0x11, 0x03, 42, Duration::from_millis(200))
            .await;
        assert!(resp.is_success());
        assert_eq!(resp.token, 42);
        assert_eq!(resp.payload, vec![0x02, 0x00, 0x0A]);
    }

    #[tokio::test]
    async fn recv_response_detects_crc_corruption() {
        let mut frame = vec![0x11, 0x03, 0x02, 0x00, 0x0A];
        crc::append_to(&mut frame);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let port = ScriptedPort {
            baud: 115_200,
            chunks: StdMutex::new(vec![frame].into()),
        };
        let mut framer = RtuFramer::new(port).unwrap();
        let resp = framer
            .recv_response(0x11, 0x03, 1, Duration::from_millis(200))
            .await;
        assert_eq!(resp.error, ErrorCode::CrcError);
    }

    #[tokio::test]
    async fn recv_response_times_out_on_silence() {
        let port = ScriptedPort {
            baud: 115_200,
            chunks: StdMutex::new(std::collections::VecDeque::new()),
        };
        let mut framer = RtuFramer::new(port).unwrap();
        let resp = framer
            .recv_response(0x11, 0x03, 1, Duration::from_millis(20))
            .await;
        assert_eq!(resp.error, ErrorCode::Timeout);
    }
}

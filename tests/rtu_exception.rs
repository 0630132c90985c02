// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenario 2: an illegal-address exception reply is delivered to `on_error`
//! with the corresponding [`ErrorCode`], not treated as a transport failure.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use modbus_rt::client::begin_rtu;
use modbus_rt::error::ErrorCode;
use modbus_rt::rtu::{NoDirectionControl, RtuPort};

struct ScriptedPort {
    baud: u32,
    inbox: Mutex<VecDeque<Vec<u8>>>,
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
        Ok(self.inbox.lock().unwrap().pop_front().unwrap_or_default())
    }
    fn baud_rate(&self) -> std::io::Result<u32> {
        Ok(self.baud)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn illegal_data_address_reaches_on_error() {
    let mut reply = vec![0x01, 0x83, 0x02];
    modbus_rt::crc::append_to(&mut reply);
    let port = ScriptedPort { baud: 19_200, inbox: Mutex::new(vec![reply].into()) };
    let client = begin_rtu(port, NoDirectionControl, Some(4)).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    client.on_error_handler(move |code, token| tx.send((code, token)).unwrap());
    client.add_request_two_param(0x01, 0x03, 0xFFFF, 0x0001, 9).unwrap();

    let (code, token) = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(code, ErrorCode::IllegalDataAddress);
    assert_eq!(token, 9);

    client.end().await;
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenario 5: a request the server never answers must surface `Timeout`
//! once the configured timeout elapses, and the transaction entry must not
//! linger afterwards.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use modbus_rt::client::begin_tcp;
use modbus_rt::error::ErrorCode;
use modbus_rt::tcp::TcpConnection;
use modbus_rt::target::Target;

struct SilentConnection {
    outgoing: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl TcpConnection for SilentConnection {
    async fn connect(&mut self, _host: &str, _port: u16) -> std::io::Result<()> {
        Ok(())
    }
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.outgoing.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
    async fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(Vec::new())
    }
    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_request_times_out() {
    let outgoing = Arc::new(Mutex::new(Vec::new()));
    let conn = SilentConnection { outgoing: Arc::clone(&outgoing) };
    let target = Target::new("10.0.0.6", 502, 1);
    let client = begin_tcp(Box::new(conn), target, Some(4), Duration::ZERO);
    client.set_timeout(Duration::from_millis(100));

    let (tx, rx) = std::sync::mpsc::channel();
    client.on_error_handler(move |code, token| tx.send((code, token)).unwrap());
    client.add_request_two_param(1, 0x03, 0, 1, 77).unwrap();

    let (code, token) = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(code, ErrorCode::Timeout);
    assert_eq!(token, 77);
    assert_eq!(outgoing.lock().unwrap().len(), 1);

    client.end().await;
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scenario 4: three requests submitted back to back, with the server
//! replying in reverse order. Responses must still be matched to the right
//! token via the MBAP transaction-id, and delivered in the order the server
//! actually sent them (not submission order).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modbus_rt::client::begin_tcp;
use modbus_rt::tcp::{self, TcpConnection};
use modbus_rt::target::Target;

struct ScriptedConnection {
    incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
    outgoing: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl TcpConnection for ScriptedConnection {
    async fn connect(&mut self, _host: &str, _port: u16) -> std::io::Result<()> {
        Ok(())
    }
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.outgoing.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
    async fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(self.incoming.lock().unwrap().pop_front().unwrap_or_default())
    }
    async fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn replies_are_matched_by_transaction_id_regardless_of_order() {
    let incoming = Arc::new(Mutex::new(VecDeque::new()));
    let outgoing = Arc::new(Mutex::new(Vec::new()));
    let conn = ScriptedConnection { incoming: Arc::clone(&incoming), outgoing: Arc::clone(&outgoing) };

    let target = Target::new("10.0.0.5", 502, 1);
    let client = begin_tcp(Box::new(conn), target, Some(8), Duration::ZERO);

    let (tx, rx) = std::sync::mpsc::channel();
    client.on_data_handler(move |resp| tx.send(resp).unwrap());

    client.add_request_two_param(1, 0x03, 0, 1, 201).unwrap();
    client.add_request_two_param(1, 0x03, 1, 1, 202).unwrap();
    client.add_request_two_param(1, 0x03, 2, 1, 203).unwrap();

    // Give the writer task time to assign transaction ids 0, 1, 2 in that order.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(outgoing.lock().unwrap().len(), 3);

    // Server answers in reverse: transaction 2 first, then 1, then 0.
    for tid in [2u16, 1, 0] {
        let pdu = vec![0x03, 0x02, 0x00, 0x2A];
        let frame = tcp::encode_frame(tid, 1, &pdu);
        incoming.lock().unwrap().push_back(frame);
    }

    let received = tokio::task::spawn_blocking(move || {
        (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().token)
            .collect::<Vec<_>>()
    })
    .await
    .unwrap();

    assert_eq!(received, vec![203, 202, 201]);

    client.end().await;
}

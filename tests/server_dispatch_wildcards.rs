// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end coverage of the server dispatcher's wildcard lookup order and
//! broadcast semantics, driven through a real [`RtuServer`] receive loop
//! rather than calling the dispatcher directly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use modbus_rt::rtu::RtuPort;
use modbus_rt::server::rtu::RtuServer;
use modbus_rt::server::{fn_handler, Dispatcher, WILDCARD};

struct ScriptedPort {
    inbox: Mutex<VecDeque<Vec<u8>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait::async_trait]
impl RtuPort for ScriptedPort {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
    async fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
    async fn read_available(&mut self) -> std::io::Result<Vec<u8>> {
        Ok(self.inbox.lock().unwrap().pop_front().unwrap_or_default())
    }
    fn baud_rate(&self) -> std::io::Result<u32> {
        Ok(19_200)
    }
}

fn framed(server_id: u8, function_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![server_id, function_code];
    frame.extend_from_slice(payload);
    modbus_rt::crc::append_to(&mut frame);
    frame
}

#[tokio::test(flavor = "multi_thread")]
async fn wildcard_server_id_matches_any_device_and_broadcast_skips_reply() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let broadcasts_seen = Arc::new(AtomicUsize::new(0));

    let dispatcher = Dispatcher::new();
    // Any device, function code 0x06 (write single register).
    dispatcher.register_handler(WILDCARD, 0x06, fn_handler(|_| Ok(vec![0x00, 0x01, 0x00, 0x2A])));
    {
        let broadcasts_seen = Arc::clone(&broadcasts_seen);
        dispatcher.register_handler(
            7,
            WILDCARD,
            fn_handler(move |_| {
                broadcasts_seen.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }),
        );
    }

    let mut inbox = VecDeque::new();
    // Device 3 has no exact registration, falls through to the server-id wildcard.
    inbox.push_back(framed(3, 0x06, &[0x00, 0x01, 0x00, 0x2A]));
    // Broadcast: server id 0, routed to device 7's function-code wildcard handler,
    // but must not produce a reply frame.
    inbox.push_back(framed(0, 0x10, &[0x00, 0x00, 0x00, 0x01, 0x02, 0x00, 0x00]));

    let port = ScriptedPort { inbox: Mutex::new(inbox), sent: Arc::clone(&sent) };
    let server = RtuServer::start(port, dispatcher).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    server.stop().await;

    assert_eq!(broadcasts_seen.load(Ordering::SeqCst), 1);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1, "only the non-broadcast request should get a reply");
    assert_eq!(&sent[0][..sent[0].len() - 2], &[3, 0x06, 0x00, 0x01, 0x00, 0x2A]);
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RTU server loop: receive a silence-delimited frame, dispatch it, frame
//! and send the reply (or nothing, for a broadcast).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::rtu::{DirectionControl, NoDirectionControl, RtuFramer, RtuPort};
use crate::server::{Dispatcher, ServerRequest};

/// A running RTU server: a dedicated receive task driving one [`RtuFramer`]
/// against a shared [`Dispatcher`].
#[derive(Debug)]
pub struct RtuServer {
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl RtuServer {
    /// Starts serving `port` with the given `dispatcher`. Incoming frames are
    /// validated (CRC) and malformed frames are silently dropped, matching
    /// the half-duplex line's lack of any retransmission mechanism at this
    /// layer.
    pub fn start<P>(port: P, dispatcher: Dispatcher) -> std::io::Result<Self>
    where
        P: RtuPort + 'static,
    {
        Self::start_with_direction_control(port, NoDirectionControl, dispatcher)
    }

    pub fn start_with_direction_control<P, D>(
        port: P,
        direction: D,
        dispatcher: Dispatcher,
    ) -> std::io::Result<Self>
    where
        P: RtuPort + 'static,
        D: DirectionControl + 'static,
    {
        let framer = RtuFramer::with_direction_control(port, direction)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(serve(framer, dispatcher.clone(), Arc::clone(&shutdown)));
        Ok(Self {
            dispatcher,
            shutdown,
            task: Some(task),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Stops the receive task and waits for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn serve<P: RtuPort, D: DirectionControl>(
    mut framer: RtuFramer<P, D>,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        let pdu = match framer.recv_frame(Some(std::time::Duration::from_millis(200))).await {
            Ok(pdu) => pdu,
            Err(_) => continue,
        };
        if pdu.len() < 2 {
            continue;
        }
        let server_id = pdu[0];
        let function_code = pdu[1];
        let payload = &pdu[2..];
        let reply = dispatcher
            .dispatch(ServerRequest { server_id, function_code, payload })
            .await;
        if let Some(reply) = reply {
            if let Err(err) = framer.send(&reply).await {
                log::warn!("RTU server failed to send reply: {err}");
            }
        }
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! The TCP server loop: accept connections, reassemble MBAP frames, dispatch
//! them, and write back the MBAP-framed reply (skipped for a broadcast).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::server::{Dispatcher, ServerRequest};
use crate::tcp;

/// A single accepted TCP connection as seen by the server: read/write bytes,
/// close on shutdown. Connection establishment itself is the acceptor's job.
#[async_trait::async_trait]
pub trait ServerTcpStream: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    async fn read_available(&mut self) -> std::io::Result<Vec<u8>>;
    async fn close(&mut self) -> std::io::Result<()>;
}

/// Accepts incoming TCP connections for [`TcpServer`].
#[async_trait::async_trait]
pub trait TcpAcceptor: Send {
    type Stream: ServerTcpStream + 'static;

    async fn accept(&mut self) -> std::io::Result<Self::Stream>;
}

/// A running TCP server: an accept loop spawning one receive task per
/// connection, all sharing the same [`Dispatcher`].
#[derive(Debug)]
pub struct TcpServer {
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    pub fn start<A>(acceptor: A, dispatcher: Dispatcher) -> Self
    where
        A: TcpAcceptor + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());
        let accept_task = tokio::spawn(accept_loop(
            acceptor,
            dispatcher.clone(),
            Arc::clone(&shutdown),
            Arc::clone(&shutdown_notify),
        ));
        Self {
            dispatcher,
            shutdown,
            shutdown_notify,
            accept_task: Some(accept_task),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop<A: TcpAcceptor>(
    mut acceptor: A,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
) {
    while !shutdown.load(Ordering::Acquire) {
        let stream = tokio::select! {
            accepted = acceptor.accept() => accepted,
            () = shutdown_notify.notified() => break,
        };
        match stream {
            Ok(stream) => {
                let dispatcher = dispatcher.clone();
                let shutdown = Arc::clone(&shutdown);
                let shutdown_notify = Arc::clone(&shutdown_notify);
                tokio::spawn(serve_connection(stream, dispatcher, shutdown, shutdown_notify));
            }
            Err(err) => {
                log::warn!("TCP server accept failed: {err}");
            }
        }
    }
}

async fn serve_connection<S: ServerTcpStream>(
    mut stream: S,
    dispatcher: Dispatcher,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        let read = tokio::select! {
            read = stream.read_available() => read,
            () = shutdown_notify.notified() => break,
        };
        match read {
            Ok(bytes) if !bytes.is_empty() => {
                buf.extend_from_slice(&bytes);
                loop {
                    match tcp::try_decode_frame(&buf) {
                        Ok(Some((frame, consumed))) => {
                            buf.drain(..consumed);
                            if frame.pdu.is_empty() {
                                continue;
                            }
                            let function_code = frame.pdu[0];
                            let payload = &frame.pdu[1..];
                            let reply = dispatcher
                                .dispatch(ServerRequest {
                                    server_id: frame.unit_id,
                                    function_code,
                                    payload,
                                })
                                .await;
                            if let Some(reply_pdu) = reply {
                                let out = tcp::encode_frame(frame.transaction_id, frame.unit_id, &reply_pdu);
                                if let Err(err) = stream.write_all(&out).await {
                                    log::warn!("TCP server failed to write reply: {err}");
                                    let _ = stream.close().await;
                                    return;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            if buf.is_empty() {
                                break;
                            }
                            buf.remove(0);
                        }
                    }
                }
            }
            Ok(_) => {
                tokio::time::sleep(crate::queue::POLL_INTERVAL).await;
            }
            Err(_) => {
                let _ = stream.close().await;
                return;
            }
        }
    }
    let _ = stream.close().await;
}

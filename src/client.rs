// SPDX-License-Identifier: MIT OR Apache-2.0

//! The public client API: a queue-backed [`ClientHandle`] with a dedicated
//! worker task per transport, callback dispatch, and a blocking
//! [`ClientHandle::sync_request`] convenience built on top of the same queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, ErrorCode};
use crate::message::{self, Message, RegisterOrder, Request, Response};
use crate::queue::RequestQueue;
#[cfg(feature = "rtu")]
use crate::rtu::{DirectionControl, RtuFramer, RtuPort};
#[cfg(feature = "tcp")]
use crate::target::Target;
#[cfg(feature = "tcp")]
use crate::tcp::{self, TcpConnection, TransactionTable};

pub type DataHandler = Arc<dyn Fn(Response) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(ErrorCode, u32) + Send + Sync>;
pub type GenerateHandler = Arc<dyn Fn(&Message) + Send + Sync>;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_QUEUE_LIMIT: usize = 100;

/// How many times [`tcp_writer`] retries `connect` after a write fails before
/// giving up on the request and reporting [`ErrorCode::IpConnectionFailed`].
#[cfg(feature = "tcp")]
const RECONNECT_ATTEMPTS: u32 = 3;

#[derive(Default)]
struct Callbacks {
    on_data: Option<DataHandler>,
    on_error: Option<ErrorHandler>,
    on_generate: Option<GenerateHandler>,
}

struct Shared {
    queue: RequestQueue,
    callbacks: StdMutex<Callbacks>,
    pending_sync: StdMutex<HashMap<u32, oneshot::Sender<Response>>>,
    next_token: AtomicU32,
    timeout: StdMutex<Duration>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    message_count: AtomicU32,
}

impl Shared {
    fn new(queue_limit: usize, timeout: Duration) -> Self {
        Self {
            queue: RequestQueue::new(queue_limit),
            callbacks: StdMutex::new(Callbacks::default()),
            pending_sync: StdMutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
            timeout: StdMutex::new(timeout),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            message_count: AtomicU32::new(0),
        }
    }

    fn fresh_private_token(&self) -> u32 {
        // Private tokens come from the top half of the u32 space so they never
        // collide with a caller-supplied token in the bottom half.
        0x8000_0000 | self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn dispatch(&self, response: Response) {
        if let Some(tx) = self.pending_sync.lock().unwrap().remove(&response.token) {
            let _ = tx.send(response.clone());
        }
        let callbacks = self.callbacks.lock().unwrap();
        if response.is_success() {
            if let Some(f) = &callbacks.on_data {
                f(response);
            }
        } else if let Some(f) = &callbacks.on_error {
            f(response.error, response.token);
        }
    }

    fn drain_with(&self, code: ErrorCode) {
        for req in self.queue.drain() {
            self.dispatch(Response {
                server_id: req.message.server_id().unwrap_or(0),
                function_code: req.message.function_code().unwrap_or(0),
                payload: Vec::new(),
                error: code,
                token: req.token,
            });
        }
    }
}

// Set around a worker's invocation of a user callback so that `sync_request`
// called from inside that callback (which would deadlock waiting for the
// very worker that is currently blocked running it) fails fast instead.
tokio::task_local! {
    static IN_CALLBACK: ();
}

async fn dispatch_in_scope(shared: &Shared, response: Response) {
    IN_CALLBACK.scope((), async { shared.dispatch(response) }).await;
}

/// A handle to a running client worker for one transport instance.
///
/// Cloning is cheap; every clone shares the same queue, callbacks and worker.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
    worker: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("pending_requests", &self.shared.queue.len())
            .field("timeout", &self.timeout())
            .finish()
    }
}

macro_rules! add_request_fns {
    () => {
        pub fn add_request_no_param(&self, server_id: u8, function_code: u8, token: u32) -> Result<(), Error> {
            self.submit(message::build_no_param(server_id, function_code)?, token)
        }

        pub fn add_request_one_param(
            &self,
            server_id: u8,
            function_code: u8,
            p1: u16,
            token: u32,
        ) -> Result<(), Error> {
            self.submit(message::build_one_param(server_id, function_code, p1)?, token)
        }

        pub fn add_request_two_param(
            &self,
            server_id: u8,
            function_code: u8,
            p1: u16,
            p2: u16,
            token: u32,
        ) -> Result<(), Error> {
            self.submit(message::build_two_param(server_id, function_code, p1, p2)?, token)
        }

        pub fn add_request_three_param(
            &self,
            server_id: u8,
            function_code: u8,
            p1: u16,
            p2: u16,
            p3: u16,
            token: u32,
        ) -> Result<(), Error> {
            self.submit(
                message::build_three_param(server_id, function_code, p1, p2, p3)?,
                token,
            )
        }

        pub fn add_request_write_registers(
            &self,
            server_id: u8,
            function_code: u8,
            address: u16,
            words: &[u16],
            token: u32,
        ) -> Result<(), Error> {
            self.submit(
                message::build_write_registers(server_id, function_code, address, words)?,
                token,
            )
        }

        pub fn add_request_write_coils(
            &self,
            server_id: u8,
            function_code: u8,
            address: u16,
            quantity: u16,
            coils: &[u8],
            token: u32,
        ) -> Result<(), Error> {
            self.submit(
                message::build_write_coils(server_id, function_code, address, quantity, coils)?,
                token,
            )
        }

        pub fn add_request_read_write_registers(
            &self,
            server_id: u8,
            function_code: u8,
            read_address: u16,
            read_quantity: u16,
            write_address: u16,
            write_words: &[u16],
            token: u32,
        ) -> Result<(), Error> {
            self.submit(
                message::build_read_write_registers(
                    server_id,
                    function_code,
                    read_address,
                    read_quantity,
                    write_address,
                    write_words,
                )?,
                token,
            )
        }

        pub fn add_request_raw(
            &self,
            server_id: u8,
            function_code: u8,
            data: &[u8],
            token: u32,
        ) -> Result<(), Error> {
            self.submit(message::build_raw(server_id, function_code, data)?, token)
        }
    };
}

impl ClientHandle {
    fn submit(&self, message: Message, token: u32) -> Result<(), Error> {
        if let Some(f) = &self.shared.callbacks.lock().unwrap().on_generate {
            f(&message);
        }
        self.shared.queue.push(Request { message, token })?;
        self.shared.message_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    add_request_fns!();

    /// Sets the per-request timeout used when waiting for a response.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.shared.timeout.lock().unwrap() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.shared.timeout.lock().unwrap()
    }

    /// Registers the handler invoked on the worker task for every successful response.
    pub fn on_data_handler(&self, handler: impl Fn(Response) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_data = Some(Arc::new(handler));
    }

    /// Registers the handler invoked on the worker task for every failed request.
    pub fn on_error_handler(&self, handler: impl Fn(ErrorCode, u32) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_error = Some(Arc::new(handler));
    }

    /// Registers the handler invoked synchronously, on the caller's own
    /// thread, whenever a request message is built and accepted onto the
    /// queue. Informative only (e.g. wire logging); it runs before the
    /// request ever reaches the worker.
    pub fn on_generate_handler(&self, handler: impl Fn(&Message) + Send + Sync + 'static) {
        self.shared.callbacks.lock().unwrap().on_generate = Some(Arc::new(handler));
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.queue.len()
    }

    /// Total number of request messages this handle has ever accepted onto
    /// the queue, including ones since completed. Informative only.
    pub fn message_count(&self) -> u32 {
        self.shared.message_count.load(Ordering::Relaxed)
    }

    /// Submits `message` and blocks the calling task until the matching
    /// response is dispatched, bypassing the registered `on_data`/`on_error`
    /// handlers for this call's result (they still fire, independently).
    ///
    /// Returns [`ErrorCode::UndefinedError`] immediately, without touching the
    /// queue, if called reentrantly from within a callback running on this
    /// client's own worker task: the worker cannot service a new wait while it
    /// is itself blocked inside the callback that issued it.
    pub async fn sync_request(&self, message: Message) -> Result<Response, Error> {
        if IN_CALLBACK.try_with(|_| ()).is_ok() {
            return Err(Error::with_detail(
                ErrorCode::UndefinedError,
                "sync_request called reentrantly from a callback",
            ));
        }
        let token = self.shared.fresh_private_token();
        let (tx, rx) = oneshot::channel();
        self.shared.pending_sync.lock().unwrap().insert(token, tx);
        if let Err(err) = self.submit(message, token) {
            self.shared.pending_sync.lock().unwrap().remove(&token);
            return Err(err);
        }
        let timeout = self.timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::new(ErrorCode::UndefinedError)),
            Err(_) => {
                self.shared.pending_sync.lock().unwrap().remove(&token);
                Err(Error::new(ErrorCode::Timeout))
            }
        }
    }

    /// Stops the worker task, delivering [`ErrorCode::UndefinedError`] to every
    /// request still sitting in the queue.
    pub async fn end(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.shutdown_notify.notify_waiters();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Starts an RTU client worker over `port`, returning a handle to submit
/// requests through.
#[cfg(feature = "rtu")]
pub fn begin_rtu<P, D>(port: P, direction: D, queue_limit: Option<usize>) -> Result<ClientHandle, Error>
where
    P: RtuPort + 'static,
    D: DirectionControl + 'static,
{
    let shared = Arc::new(Shared::new(queue_limit.unwrap_or(DEFAULT_QUEUE_LIMIT), DEFAULT_TIMEOUT));
    let framer = RtuFramer::with_direction_control(port, direction)?;
    let worker_shared = Arc::clone(&shared);
    let handle = tokio::spawn(rtu_worker(worker_shared, framer));
    Ok(ClientHandle {
        shared,
        worker: Arc::new(StdMutex::new(Some(handle))),
    })
}

#[cfg(feature = "rtu")]
async fn rtu_worker<P: RtuPort, D: DirectionControl>(shared: Arc<Shared>, mut framer: RtuFramer<P, D>) {
    loop {
        if shared.is_shutting_down() {
            break;
        }
        let Some(req) = shared.queue.pop() else {
            tokio::select! {
                () = tokio::time::sleep(crate::queue::POLL_INTERVAL) => {}
                () = shared.shutdown_notify.notified() => {}
            }
            continue;
        };
        let server_id = req.message.server_id().unwrap_or(0);
        let function_code = req.message.function_code().unwrap_or(0);
        let timeout = *shared.timeout.lock().unwrap();
        let response = match framer.send(req.message.as_bytes()).await {
            Ok(()) => {
                if server_id == message::SERVER_ID_BROADCAST {
                    Response {
                        server_id,
                        function_code,
                        payload: Vec::new(),
                        error: ErrorCode::Success,
                        token: req.token,
                    }
                } else {
                    framer.recv_response(server_id, function_code, req.token, timeout).await
                }
            }
            Err(err) => Response {
                server_id,
                function_code,
                payload: Vec::new(),
                error: err.code(),
                token: req.token,
            },
        };
        dispatch_in_scope(&shared, response).await;
    }
    shared.drain_with(ErrorCode::UndefinedError);
}

/// Starts a TCP client worker connected to `target`, returning a handle to
/// submit requests through. The writer and reader halves run as independent
/// tasks: requests are written as soon as they are popped from the queue
/// (subject to per-target spacing) while replies are matched against
/// outstanding transactions as they arrive, possibly out of order.
#[cfg(feature = "tcp")]
pub fn begin_tcp(
    conn: Box<dyn TcpConnection>,
    target: Target,
    queue_limit: Option<usize>,
    min_request_interval: Duration,
) -> ClientHandle {
    let shared = Arc::new(Shared::new(queue_limit.unwrap_or(DEFAULT_QUEUE_LIMIT), DEFAULT_TIMEOUT));
    let conn = Arc::new(tokio::sync::Mutex::new(conn));
    let table = Arc::new(StdMutex::new(TransactionTable::new()));

    let writer = tokio::spawn(tcp_writer(
        Arc::clone(&shared),
        Arc::clone(&conn),
        Arc::clone(&table),
        target.clone(),
        min_request_interval,
    ));
    tokio::spawn(tcp_reader(Arc::clone(&shared), Arc::clone(&conn), Arc::clone(&table)));
    tokio::spawn(tcp_timeout_sweeper(Arc::clone(&shared), table));

    ClientHandle {
        shared,
        worker: Arc::new(StdMutex::new(Some(writer))),
    }
}

#[cfg(feature = "tcp")]
async fn tcp_writer(
    shared: Arc<Shared>,
    conn: Arc<tokio::sync::Mutex<Box<dyn TcpConnection>>>,
    table: Arc<StdMutex<TransactionTable>>,
    target: Target,
    min_interval: Duration,
) {
    let mut next_transaction_id: u16 = 0;
    let mut last_send = tokio::time::Instant::now() - min_interval;
    {
        let mut c = conn.lock().await;
        if let Err(err) = c.connect(&target.host, target.port).await {
            log::warn!("initial connect to {target} failed: {err}");
        }
    }
    loop {
        if shared.is_shutting_down() {
            break;
        }
        let Some(req) = shared.queue.pop() else {
            tokio::select! {
                () = tokio::time::sleep(crate::queue::POLL_INTERVAL) => {}
                () = shared.shutdown_notify.notified() => {}
            }
            continue;
        };
        let elapsed = last_send.elapsed();
        if elapsed < min_interval {
            tokio::time::sleep(min_interval - elapsed).await;
        }
        let server_id = req.message.server_id().unwrap_or(target.unit_id);
        let function_code = req.message.function_code().unwrap_or(0);
        let transaction_id = next_transaction_id;
        next_transaction_id = next_transaction_id.wrapping_add(1);
        let frame = tcp::encode_frame(transaction_id, server_id, req.message.as_bytes());
        let timeout = *shared.timeout.lock().unwrap();

        let write_result = conn.lock().await.write_all(&frame).await;
        last_send = tokio::time::Instant::now();
        match write_result {
            Ok(()) => {
                table.lock().unwrap().insert(transaction_id, req.token, function_code, timeout);
            }
            Err(_) => {
                // The connection is presumably dead: every transaction still
                // waiting on it would otherwise mismatch against whatever
                // comes back on the replacement connection, or just sit out
                // its full timeout. Abandon them now rather than let either
                // happen.
                for response in table.lock().unwrap().drain_with(ErrorCode::IpConnectionFailed) {
                    dispatch_in_scope(&shared, response).await;
                }

                let mut reconnected = false;
                for _ in 0..RECONNECT_ATTEMPTS {
                    if conn.lock().await.connect(&target.host, target.port).await.is_ok() {
                        reconnected = true;
                        break;
                    }
                }

                let resend_result = if reconnected {
                    conn.lock().await.write_all(&frame).await
                } else {
                    Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "reconnect failed"))
                };

                match resend_result {
                    Ok(()) => {
                        table.lock().unwrap().insert(transaction_id, req.token, function_code, timeout);
                    }
                    Err(_) => {
                        dispatch_in_scope(
                            &shared,
                            Response {
                                server_id,
                                function_code,
                                payload: Vec::new(),
                                error: ErrorCode::IpConnectionFailed,
                                token: req.token,
                            },
                        )
                        .await;
                    }
                }
            }
        }
    }
    for response in table.lock().unwrap().drain_with(ErrorCode::Timeout) {
        dispatch_in_scope(&shared, response).await;
    }
    shared.drain_with(ErrorCode::UndefinedError);
}

#[cfg(feature = "tcp")]
async fn tcp_reader(
    shared: Arc<Shared>,
    conn: Arc<tokio::sync::Mutex<Box<dyn TcpConnection>>>,
    table: Arc<StdMutex<TransactionTable>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        if shared.is_shutting_down() {
            break;
        }
        let read = conn.lock().await.read_available().await;
        match read {
            Ok(bytes) if !bytes.is_empty() => {
                buf.extend_from_slice(&bytes);
                loop {
                    match tcp::try_decode_frame(&buf) {
                        Ok(Some((frame, consumed))) => {
                            buf.drain(..consumed);
                            if let Some(response) = table.lock().unwrap().resolve(frame) {
                                dispatch_in_scope(&shared, response).await;
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            // Resynchronize by dropping a byte, matching the
                            // RTU framer's recovery policy for corrupt input.
                            if buf.is_empty() {
                                break;
                            }
                            buf.remove(0);
                        }
                    }
                }
            }
            _ => {
                tokio::select! {
                    () = tokio::time::sleep(crate::queue::POLL_INTERVAL) => {}
                    () = shared.shutdown_notify.notified() => {}
                }
            }
        }
    }
}

#[cfg(feature = "tcp")]
async fn tcp_timeout_sweeper(shared: Arc<Shared>, table: Arc<StdMutex<TransactionTable>>) {
    loop {
        if shared.is_shutting_down() {
            break;
        }
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(50)) => {}
            () = shared.shutdown_notify.notified() => { break; }
        }
        let expired = table.lock().unwrap().sweep_timeouts();
        for response in expired {
            dispatch_in_scope(&shared, response).await;
        }
    }
}

/// Convenience builders mirroring [`message::build_*`] for generating request
/// bytes without submitting them to a transport (e.g. for logging, or a
/// test harness that drives a transport directly).
pub mod generate {
    use super::*;

    pub fn no_param(server_id: u8, function_code: u8) -> Result<Vec<u8>, Error> {
        Ok(message::build_no_param(server_id, function_code)?.into_bytes())
    }

    pub fn two_param(server_id: u8, function_code: u8, p1: u16, p2: u16) -> Result<Vec<u8>, Error> {
        Ok(message::build_two_param(server_id, function_code, p1, p2)?.into_bytes())
    }

    pub fn write_registers(
        server_id: u8,
        function_code: u8,
        address: u16,
        words: &[u16],
    ) -> Result<Vec<u8>, Error> {
        Ok(message::build_write_registers(server_id, function_code, address, words)?.into_bytes())
    }
}

/// Mirrors [`message::Message::append_f32`]/`extract_f32` for callers building
/// or parsing 32-bit floating point values spread across two registers.
pub fn default_register_order() -> RegisterOrder {
    RegisterOrder::HighFirst
}

#[cfg(all(test, feature = "rtu"))]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex2;

    struct LoopbackPort {
        baud: u32,
        inbox: StdMutex2<std::collections::VecDeque<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl RtuPort for LoopbackPort {
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
    async fn add_request_dispatches_to_on_data_handler() {
        let mut frame = vec![0x11, 0x03, 0x02, 0x00, 0x0A];
        crate::crc::append_to(&mut frame);
        let port = LoopbackPort { baud: 19200, inbox: StdMutex2::new(vec![frame].into()) };
        let client = begin_rtu(port, crate::rtu::NoDirectionControl, Some(8)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        client.on_data_handler(move |resp| {
            tx.send(resp).unwrap();
        });
        client.add_request_two_param(0x11, 0x03, 0, 1, 55).unwrap();

        let response = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert!(response.is_success());
        assert_eq!(response.token, 55);
        client.end().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queue_full_does_not_mutate_queue() {
        let port = LoopbackPort { baud: 19200, inbox: StdMutex2::new(std::collections::VecDeque::new()) };
        let client = begin_rtu(port, crate::rtu::NoDirectionControl, Some(1)).unwrap();
        client.shared.shutdown.store(true, Ordering::Release);
        client.add_request_no_param(1, 0x07, 1).unwrap();
        let err = client.add_request_no_param(1, 0x07, 2).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RequestQueueFull);
        assert_eq!(client.pending_requests(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn on_generate_handler_observes_every_accepted_request() {
        let port = LoopbackPort { baud: 19200, inbox: StdMutex2::new(std::collections::VecDeque::new()) };
        let client = begin_rtu(port, crate::rtu::NoDirectionControl, Some(8)).unwrap();
        client.shared.shutdown.store(true, Ordering::Release);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        client.on_generate_handler(move |message| {
            seen_in_handler.lock().unwrap().push(message.function_code());
        });

        client.add_request_no_param(1, 0x07, 1).unwrap();
        client.add_request_two_param(1, 0x03, 0, 1, 2).unwrap();

        assert_eq!(client.message_count(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![Some(0x07), Some(0x03)]);
    }
}

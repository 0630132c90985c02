// SPDX-License-Identifier: MIT OR Apache-2.0

//! The bridge adapter: a [`crate::server::Handler`] whose implementation is
//! "re-issue this request on a client transport and forward whatever comes
//! back", turning a [`Dispatcher`](crate::server::Dispatcher) into a
//! transparent RTU\<->TCP (or TCP\<->TCP) gateway.

use crate::client::ClientHandle;
use crate::error::ErrorCode;
use crate::message::Message;
use crate::server::{async_fn_handler, Handler, ServerRequest};
use std::sync::Arc;

/// Builds a [`Handler`] that forwards every request it receives onto
/// `client`, optionally remapping the server id (e.g. an RTU gateway
/// presenting several slave ids over one TCP unit id, or vice versa).
///
/// A transport-level failure while forwarding (timeout, full queue, a
/// connection drop) is reported to the original caller as
/// [`ErrorCode::GatewayTargetNoResponse`], the standard Modbus exception for
/// "the gateway could not get a response from the target device". A protocol
/// exception returned by the far side is forwarded unchanged.
pub fn forwarding_handler(client: ClientHandle, remap_server_id: Option<u8>) -> Arc<dyn Handler> {
    async_fn_handler(move |request: ServerRequest<'_>| {
        let client = client.clone();
        let server_id = remap_server_id.unwrap_or(request.server_id);
        let function_code = request.function_code;
        let mut bytes = Vec::with_capacity(2 + request.payload.len());
        bytes.push(server_id);
        bytes.push(function_code);
        bytes.extend_from_slice(request.payload);
        let message = Message::from_bytes(bytes);
        async move {
            match client.sync_request(message).await {
                Ok(response) if response.is_success() => Ok(response.payload),
                Ok(response) => Err(response.error),
                Err(_) => Err(ErrorCode::GatewayTargetNoResponse),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::begin_rtu;
    use crate::rtu::{NoDirectionControl, RtuPort};
    use crate::server::{Dispatcher, ServerRequest};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct LoopbackPort {
        baud: u32,
        inbox: StdMutex<VecDeque<Vec<u8>>>,
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
    async fn forwarding_handler_relays_a_successful_response() {
        let mut frame = vec![0x05, 0x03, 0x02, 0x00, 0x2A];
        crate::crc::append_to(&mut frame);
        let port = LoopbackPort { baud: 19200, inbox: StdMutex::new(vec![frame].into()) };
        let downstream = begin_rtu(port, NoDirectionControl, Some(8)).unwrap();

        let dispatcher = Dispatcher::new();
        dispatcher.register_handler(1, 0x03, forwarding_handler(downstream.clone(), Some(5)));

        let reply = dispatcher
            .dispatch(ServerRequest { server_id: 1, function_code: 0x03, payload: &[0, 0, 0, 1] })
            .await
            .unwrap();
        assert_eq!(reply, vec![1, 0x03, 0x02, 0x00, 0x2A]);
        downstream.end().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn forwarding_handler_maps_timeout_to_gateway_exception() {
        let port = LoopbackPort { baud: 19200, inbox: StdMutex::new(VecDeque::new()) };
        let downstream = begin_rtu(port, NoDirectionControl, Some(8)).unwrap();
        downstream.set_timeout(std::time::Duration::from_millis(20));

        let dispatcher = Dispatcher::new();
        dispatcher.register_handler(1, 0x03, forwarding_handler(downstream.clone(), Some(5)));

        let reply = dispatcher
            .dispatch(ServerRequest { server_id: 1, function_code: 0x03, payload: &[0, 0, 0, 1] })
            .await
            .unwrap();
        assert_eq!(reply, vec![1, 0x83, 0x0B]);
        downstream.end().await;
    }
}

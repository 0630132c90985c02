// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded FIFO request queue shared between a [`crate::client`] handle and
//! its dedicated worker task.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{Error, ErrorCode};
use crate::message::Request;

/// How long the worker sleeps between polls of an empty queue.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1);

/// A bounded, FIFO queue of pending requests.
///
/// `push` fails fast with [`ErrorCode::RequestQueueFull`] rather than blocking
/// or evicting older entries, so a caller always knows immediately whether a
/// request was accepted.
pub struct RequestQueue {
    inner: Mutex<VecDeque<Request>>,
    limit: usize,
}

impl RequestQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(limit.min(256))),
            limit,
        }
    }

    pub fn push(&self, request: Request) -> Result<(), Error> {
        let mut guard = self.inner.lock().expect("request queue mutex poisoned");
        if guard.len() >= self.limit {
            return Err(Error::new(ErrorCode::RequestQueueFull));
        }
        guard.push_back(request);
        Ok(())
    }

    pub fn pop(&self) -> Option<Request> {
        self.inner.lock().expect("request queue mutex poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("request queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every pending request, in order. Used during shutdown so each
    /// can be delivered to the error handler instead of silently dropped.
    pub fn drain(&self) -> Vec<Request> {
        self.inner
            .lock()
            .expect("request queue mutex poisoned")
            .drain(..)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn request(token: u32) -> Request {
        Request { message: Message::from_bytes(vec![1, 3, 0, 0, 0, 1]), token }
    }

    #[test]
    fn push_respects_limit() {
        let queue = RequestQueue::new(2);
        queue.push(request(1)).unwrap();
        queue.push(request(2)).unwrap();
        let err = queue.push(request(3)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RequestQueueFull);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pop_is_fifo() {
        let queue = RequestQueue::new(4);
        queue.push(request(1)).unwrap();
        queue.push(request(2)).unwrap();
        assert_eq!(queue.pop().unwrap().token, 1);
        assert_eq!(queue.pop().unwrap().token, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn drain_empties_queue_without_dropping_entries() {
        let queue = RequestQueue::new(4);
        queue.push(request(1)).unwrap();
        queue.push(request(2)).unwrap();
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}

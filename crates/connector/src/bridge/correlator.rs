//! Request/response correlation.
//!
//! The helper protocol has no message ids, so replies are matched to requests
//! purely by order. [`FifoCorrelator`] implements that; the [`Correlator`]
//! trait keeps the event loop independent of the matching strategy.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::oneshot;

use super::protocol::{Message, RequestError};

/// Single-use continuation for one in-flight request.
pub type PendingReply = oneshot::Sender<Result<Value, RequestError>>;

/// What happened to an inbound line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Settled the oldest pending request.
    Delivered,
    /// Consumed the oldest pending request, but its caller had gone away.
    Abandoned,
    /// No request was pending; the line was dropped.
    Orphaned,
}

pub trait Correlator: Send {
    /// Register the continuation for a request that has just been sent.
    fn enqueue(&mut self, reply: PendingReply);

    /// Settle a pending request from one inbound line.
    fn on_line(&mut self, line: &str) -> Dispatch;

    /// Reject everything still pending with `ChannelClosed`.
    ///
    /// Returns how many requests were rejected.
    fn on_closed(&mut self) -> usize;

    /// Number of requests sent but not yet answered.
    fn pending(&self) -> usize;
}

/// Strict FIFO correlation: every inbound line answers the oldest request.
#[derive(Debug, Default)]
pub struct FifoCorrelator {
    queue: VecDeque<PendingReply>,
}

impl FifoCorrelator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Correlator for FifoCorrelator {
    fn enqueue(&mut self, reply: PendingReply) {
        self.queue.push_back(reply);
    }

    fn on_line(&mut self, line: &str) -> Dispatch {
        let Some(reply) = self.queue.pop_front() else {
            return Dispatch::Orphaned;
        };

        let result = Message::parse(line).and_then(Message::into_result);
        match reply.send(result) {
            Ok(()) => Dispatch::Delivered,
            Err(_) => Dispatch::Abandoned,
        }
    }

    fn on_closed(&mut self) -> usize {
        let count = self.queue.len();
        for reply in self.queue.drain(..) {
            let _ = reply.send(Err(RequestError::ChannelClosed));
        }
        count
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

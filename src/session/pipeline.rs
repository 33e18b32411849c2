use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::protocol::redis::{RedisCommand, RespValue};

/// One in-flight command.
///
/// `cmd` is absent for locally generated replies (blacklist rejections and
/// multi-key results), which never travel to the dispatcher; those also
/// carry no pending-counter handle, so only dispatched requests participate
/// in the drain accounting.
pub struct PipelineRequest {
    pub seq: u64,
    pub cmd: Option<RedisCommand>,
    pub slot: u16,
    pub back_q: mpsc::Sender<PipelineResponse>,
    pub wg: Option<Pending>,
}

impl PipelineRequest {
    /// Request shell for a reply produced inside the session itself.
    pub fn local(seq: u64, back_q: mpsc::Sender<PipelineResponse>) -> Self {
        Self {
            seq,
            cmd: None,
            slot: 0,
            back_q,
            wg: None,
        }
    }
}

/// One completed unit: the originating request plus its outcome.
pub struct PipelineResponse {
    pub ctx: PipelineRequest,
    pub rsp: Option<RespValue>,
    pub err: Option<anyhow::Error>,
}

impl PipelineResponse {
    pub fn with_value(ctx: PipelineRequest, value: RespValue) -> Self {
        Self {
            ctx,
            rsp: Some(value),
            err: None,
        }
    }

    pub fn with_error(ctx: PipelineRequest, err: anyhow::Error) -> Self {
        Self {
            ctx,
            rsp: None,
            err: Some(err),
        }
    }
}

/// Counts dispatched requests that have not yet been matched by a response.
///
/// Cloned into every dispatched request; the writer calls `done` as it
/// consumes responses and the reader awaits `wait` during teardown.
#[derive(Clone)]
pub struct Pending {
    count: Arc<watch::Sender<usize>>,
}

impl Default for Pending {
    fn default() -> Self {
        Self::new()
    }
}

impl Pending {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0usize);
        Self {
            count: Arc::new(tx),
        }
    }

    pub fn add(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    pub fn done(&self) {
        self.count.send_modify(|n| {
            *n = n
                .checked_sub(1)
                .expect("pending request counter underflow");
        });
    }

    pub fn outstanding(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once the counter reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // the sender cannot be gone: we hold it
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

/// Min-heap of responses keyed by request sequence, holding completions
/// that arrived ahead of their turn.
#[derive(Default)]
pub struct ResponseHeap {
    heap: BinaryHeap<OrderedResponse>,
}

impl ResponseHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, rsp: PipelineResponse) {
        self.heap.push(OrderedResponse(rsp));
    }

    pub fn peek_seq(&self) -> Option<u64> {
        self.heap.peek().map(|entry| entry.0.ctx.seq)
    }

    pub fn pop(&mut self) -> Option<PipelineResponse> {
        self.heap.pop().map(|entry| entry.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

struct OrderedResponse(PipelineResponse);

impl PartialEq for OrderedResponse {
    fn eq(&self, other: &Self) -> bool {
        self.0.ctx.seq == other.0.ctx.seq
    }
}

impl Eq for OrderedResponse {}

impl PartialOrd for OrderedResponse {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedResponse {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we need the smallest seq on top
        other.0.ctx.seq.cmp(&self.0.ctx.seq)
    }
}

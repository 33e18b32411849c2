//! Interfaces of the session's external collaborators.
//!
//! The dispatcher owns the cluster topology and the backend-side pipeline;
//! the multi-operator fans multi-key commands into per-slot sub-requests.
//! Both live outside the session core and are consumed as trait objects.

use anyhow::Result;
use async_trait::async_trait;

use crate::protocol::redis::{RedisCommand, RespValue};
use crate::session::PipelineRequest;

/// Topology hint naming the master that owns a contiguous slot range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub start: u16,
    pub end: u16,
    pub master: String,
}

#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Take ownership of a request. The dispatcher must eventually publish
    /// exactly one `PipelineResponse` on `request.back_q`, success or error.
    /// Suspends while the dispatcher's input queue is full.
    async fn schedule(&self, request: PipelineRequest);

    /// Apply a slot ownership hint learned from a MOVED redirect. Must be
    /// idempotent: hints race between sessions.
    fn update_slot_info(&self, info: SlotInfo);

    /// Request a full topology refresh. Calls are coalesced by the
    /// implementation; this never blocks.
    fn trigger_reload_slots(&self);
}

#[async_trait]
pub trait MultiOperator: Send + Sync + 'static {
    /// Execute a multi-key command spanning `num_keys` keys and recombine
    /// the per-slot replies into a single value.
    async fn handle_multi_op(&self, command: RedisCommand, num_keys: usize) -> Result<RespValue>;
}

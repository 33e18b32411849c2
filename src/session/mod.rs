//! Per-client session: the reading loop, classification, and teardown.
//!
//! Each accepted connection gets one `Session::handle_connection` call,
//! which runs the reading loop on the caller's task and the writing loop on
//! a spawned task. The two communicate only through a bounded channel of
//! [`PipelineResponse`]s and a close signal.

mod pipeline;
mod writer;

pub use pipeline::{Pending, PipelineRequest, PipelineResponse, ResponseHeap};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::backend::pool::ConnPool;
use crate::config::SessionConfig;
use crate::dispatch::{Dispatcher, MultiOperator};
use crate::protocol::redis::{Blacklist, RedisCommand, RespCodec, RespValue};
use crate::utils::key_to_slot;

use writer::ResponseWriter;

/// Process-wide command counter used purely for access-log sampling.
static ACCESS_LOG_COUNT: AtomicU64 = AtomicU64::new(0);

const UNSUPPORTED_COMMAND: &[u8] = b"unsupported command";

/// Per-client state machine of the proxy. One instance serves one client
/// connection; the struct itself only carries the shared collaborators and
/// is cheap to clone per accept.
#[derive(Clone)]
pub struct Session {
    pool: Arc<ConnPool>,
    dispatcher: Arc<dyn Dispatcher>,
    multi_op: Arc<dyn MultiOperator>,
    blacklist: Arc<Blacklist>,
    config: SessionConfig,
}

impl Session {
    pub fn new(
        pool: Arc<ConnPool>,
        dispatcher: Arc<dyn Dispatcher>,
        multi_op: Arc<dyn MultiOperator>,
        blacklist: Arc<Blacklist>,
        config: SessionConfig,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            multi_op,
            blacklist,
            config,
        }
    }

    /// Serve one client connection until end-of-stream, parse error, or
    /// client write failure, then drain in-flight work and tear down.
    pub async fn handle_connection(&self, socket: TcpStream) -> Result<()> {
        socket
            .set_nodelay(true)
            .context("failed to set TCP_NODELAY")?;
        let peer = socket
            .peer_addr()
            .context("failed to resolve peer address")?;
        let (read_half, write_half) = socket.into_split();
        let mut frames = FramedRead::new(read_half, RespCodec);
        let sink = FramedWrite::new(write_half, RespCodec);

        let (back_tx, back_rx) = mpsc::channel(self.config.response_queue_size);
        let (close_tx, mut close_rx) = watch::channel(false);
        let pending = Pending::new();

        let writer = ResponseWriter::new(
            sink,
            self.pool.clone(),
            self.dispatcher.clone(),
            close_tx,
        );
        let writer_task = tokio::spawn(writer.run(back_rx));

        debug!(%peer, "session started");
        let mut req_seq = 0u64;

        loop {
            let frame = tokio::select! {
                // the writer hit a client write error; stop reading
                _ = close_rx.changed() => break,
                frame = frames.next() => frame,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => {
                    warn!(%peer, error = %err, "failed to read client command");
                    break;
                }
                None => break,
            };
            let cmd = match RedisCommand::from_resp(frame) {
                Ok(cmd) => cmd,
                Err(err) => {
                    warn!(%peer, error = %err, "malformed client command");
                    break;
                }
            };

            self.log_access_sample(&peer, &cmd);
            let name = cmd.upper_name();

            if self.blacklist.is_blacklisted(&name) {
                let ctx = PipelineRequest::local(next_seq(&mut req_seq), back_tx.clone());
                let rsp = PipelineResponse::with_value(
                    ctx,
                    RespValue::Error(Bytes::from_static(UNSUPPORTED_COMMAND)),
                );
                if back_tx.send(rsp).await.is_err() {
                    break;
                }
                continue;
            }

            if let Some(num_keys) = cmd.multi_op_keys() {
                if num_keys > 1 {
                    let ctx = PipelineRequest::local(next_seq(&mut req_seq), back_tx.clone());
                    let rsp = match self.multi_op.handle_multi_op(cmd, num_keys).await {
                        Ok(value) => PipelineResponse::with_value(ctx, value),
                        Err(err) => PipelineResponse::with_value(
                            ctx,
                            RespValue::Error(Bytes::from(err.to_string())),
                        ),
                    };
                    if back_tx.send(rsp).await.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let slot = key_to_slot(cmd.primary_key().unwrap_or(b""));
            pending.add();
            let request = PipelineRequest {
                seq: next_seq(&mut req_seq),
                cmd: Some(cmd),
                slot,
                back_q: back_tx.clone(),
                wg: Some(pending.clone()),
            };
            self.dispatcher.schedule(request).await;
        }

        // wait for every dispatched request to be matched by a response
        let drain = Duration::from_millis(self.config.drain_deadline_ms);
        if timeout(drain, pending.wait()).await.is_err() {
            warn!(
                %peer,
                outstanding = pending.outstanding(),
                "drain deadline elapsed, discarding pending responses"
            );
            writer_task.abort();
        }
        drop(back_tx);
        let _ = writer_task.await;
        debug!(%peer, "session finished");
        Ok(())
    }

    fn log_access_sample(&self, peer: &SocketAddr, cmd: &RedisCommand) {
        let every = self.config.access_log_every;
        if every == 0 {
            return;
        }
        let count = ACCESS_LOG_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if count % every != 0 {
            return;
        }
        let name = String::from_utf8_lossy(cmd.command_name()).into_owned();
        match cmd.primary_key() {
            Some(key) => debug!(
                %peer,
                cmd = %name,
                key = %String::from_utf8_lossy(key),
                "access"
            ),
            None => debug!(%peer, cmd = %name, "access"),
        }
    }
}

fn next_seq(req_seq: &mut u64) -> u64 {
    let seq = *req_seq;
    *req_seq += 1;
    seq
}

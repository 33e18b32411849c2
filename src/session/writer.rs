use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::backend::pool::ConnPool;
use crate::dispatch::{Dispatcher, SlotInfo};
use crate::protocol::redis::RespValue;

use super::pipeline::{PipelineResponse, ResponseHeap};

const MOVED_PREFIX: &[u8] = b"MOVED";
const ASK_PREFIX: &[u8] = b"ASK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Redirect {
    Moved,
    Ask,
}

/// Drains the session's response channel and emits replies to the client in
/// request order. Out-of-turn completions wait in a min-heap; a response is
/// released only once every lower sequence has been written.
pub(crate) struct ResponseWriter<S> {
    sink: S,
    heap: ResponseHeap,
    rsp_seq: u64,
    closed: bool,
    pool: Arc<ConnPool>,
    dispatcher: Arc<dyn Dispatcher>,
    close_tx: watch::Sender<bool>,
}

impl<S> ResponseWriter<S>
where
    S: Sink<RespValue, Error = anyhow::Error> + Unpin,
{
    pub(crate) fn new(
        sink: S,
        pool: Arc<ConnPool>,
        dispatcher: Arc<dyn Dispatcher>,
        close_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            sink,
            heap: ResponseHeap::new(),
            rsp_seq: 0,
            closed: false,
            pool,
            dispatcher,
            close_tx,
        }
    }

    /// Consume the channel until the reader closes it and every producer is
    /// gone. After a client write error the writer keeps consuming so that
    /// in-flight backend completions never block on a full channel.
    pub(crate) async fn run(mut self, mut back_q: mpsc::Receiver<PipelineResponse>) {
        while let Some(rsp) = back_q.recv().await {
            self.handle_resp_pipeline(rsp).await;
        }
        if !self.closed {
            let _ = self.sink.close().await;
        }
    }

    async fn handle_resp_pipeline(&mut self, rsp: PipelineResponse) {
        if rsp.ctx.seq != self.rsp_seq {
            assert!(
                rsp.ctx.seq > self.rsp_seq,
                "response sequence {} arrived after {} was emitted",
                rsp.ctx.seq,
                self.rsp_seq
            );
            self.heap.push(rsp);
            return;
        }

        self.handle_resp(rsp).await;
        while self.heap.peek_seq() == Some(self.rsp_seq) {
            let next = self.heap.pop().expect("peeked response must pop");
            self.handle_resp(next).await;
        }
    }

    async fn handle_resp(&mut self, mut rsp: PipelineResponse) {
        assert_eq!(
            rsp.ctx.seq, self.rsp_seq,
            "pipeline response emitted out of order"
        );
        if let Some(wg) = &rsp.ctx.wg {
            wg.done();
        }
        self.rsp_seq += 1;

        if let Some(err) = rsp.err.take() {
            // transport error between proxy and backend: answer the client
            // with a RESP error and ask for fresh topology
            self.dispatcher.trigger_reload_slots();
            rsp.rsp = Some(RespValue::Error(Bytes::from(err.to_string())));
        } else if let Some((kind, slot, server)) = rsp.rsp.as_ref().and_then(parse_redirect) {
            match kind {
                Redirect::Moved => {
                    debug!(slot, server = %server, "slot moved, following redirect");
                    self.dispatcher.update_slot_info(SlotInfo {
                        start: slot,
                        end: slot,
                        master: server.clone(),
                    });
                    self.redirect(&server, &mut rsp, false).await;
                }
                Redirect::Ask => {
                    debug!(slot, server = %server, "slot migrating, asking new owner");
                    self.redirect(&server, &mut rsp, true).await;
                }
            }
        }

        if let Some(err) = rsp.err.take() {
            warn!(error = %err, "redirected request failed, closing session");
            self.dispatcher.trigger_reload_slots();
            self.close();
            return;
        }

        if self.closed {
            return;
        }
        let payload = rsp
            .rsp
            .take()
            .expect("pipeline response carries a value when no error is set");
        if let Err(err) = self.sink.send(payload).await {
            warn!(error = %err, "failed to write response to client");
            self.close();
        }
    }

    /// Re-issue the original command against `server` once. A further
    /// MOVED/ASK in the new reply is forwarded to the client verbatim.
    async fn redirect(&mut self, server: &str, rsp: &mut PipelineResponse, ask: bool) {
        rsp.err = None;
        let cmd = match rsp.ctx.cmd.as_ref() {
            Some(cmd) => cmd,
            // locally generated replies never carry redirects
            None => return,
        };

        let mut conn = match self.pool.get_conn(server).await {
            Ok(conn) => conn,
            Err(err) => {
                rsp.err = Some(err);
                return;
            }
        };

        let outcome: Result<RespValue> = async {
            if ask {
                // the literal inline form `+ASKING\r\n`
                conn.send(RespValue::SimpleString(Bytes::from_static(b"ASKING")))
                    .await?;
                conn.recv().await?;
            }
            conn.send(cmd.to_resp()).await?;
            conn.recv().await
        }
        .await;

        match outcome {
            Ok(value) => rsp.rsp = Some(value),
            Err(err) => {
                // flag first so the pool cannot reclaim the connection
                conn.mark_unusable();
                rsp.err = Some(err);
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.close_tx.send(true);
        }
    }

    #[cfg(test)]
    fn sink(&self) -> &S {
        &self.sink
    }
}

/// Recognize a MOVED/ASK reply and extract its target.
fn parse_redirect(value: &RespValue) -> Option<(Redirect, u16, String)> {
    let payload = value.as_error()?;
    let kind = if payload.starts_with(MOVED_PREFIX) {
        Redirect::Moved
    } else if payload.starts_with(ASK_PREFIX) {
        Redirect::Ask
    } else {
        return None;
    };
    let (slot, server) = parse_redirect_info(payload);
    Some((kind, slot, server))
}

/// Split a redirect payload into its slot and `host:port` target.
///
/// The payload comes from a cluster node; anything other than exactly three
/// whitespace-separated fields means the backend violated the protocol, and
/// the process fails loudly rather than route on garbage.
pub(crate) fn parse_redirect_info(payload: &[u8]) -> (u16, String) {
    let text = std::str::from_utf8(payload)
        .unwrap_or_else(|_| panic!("invalid redirect message: {:?}", payload));
    let fields: Vec<&str> = text.split_whitespace().collect();
    if fields.len() != 3 {
        panic!("invalid redirect message: {text}");
    }
    let slot = fields[1]
        .parse::<u16>()
        .unwrap_or_else(|_| panic!("invalid redirect message: {text}"));
    (slot, fields[2].to_string())
}

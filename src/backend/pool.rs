use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::protocol::redis::{RedisCommand, RespCodec, RespValue};

pub type BackendStream = Framed<TcpStream, RespCodec>;

/// Per-backend pools of reusable framed TCP connections.
///
/// Sub-pool creation is serialized under the map mutex; dialing is not.
/// Every freshly dialed connection runs the post-connect handshake exactly
/// once before it can be handed out or pooled.
pub struct ConnPool {
    pools: Mutex<HashMap<String, Arc<SubPool>>>,
    max_idle: usize,
    connect_timeout: Duration,
    send_readonly: bool,
}

impl ConnPool {
    pub fn new(max_idle: usize, connect_timeout: Duration, send_readonly: bool) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            max_idle,
            connect_timeout,
            send_readonly,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.max_idle,
            config.connect_timeout(),
            config.send_readonly,
        )
    }

    /// A ready-to-use connection to `server`: reclaimed from the idle pool
    /// when possible, freshly dialed and handshaken otherwise.
    pub async fn get_conn(&self, server: &str) -> Result<PooledConn> {
        let sub = {
            let mut pools = self.pools.lock();
            pools
                .entry(server.to_string())
                .or_insert_with(|| Arc::new(SubPool::new(self.max_idle)))
                .clone()
        };

        if let Some(stream) = sub.checkout() {
            debug!(server, "reusing idle backend connection");
            return Ok(PooledConn::new(server, stream, sub));
        }

        let stream = self.dial(server).await?;
        Ok(PooledConn::new(server, stream, sub))
    }

    /// Evict and close every pooled connection for `server`.
    pub fn remove(&self, server: &str) {
        if let Some(sub) = self.pools.lock().remove(server) {
            debug!(server, "evicting backend pool");
            sub.clear();
        }
    }

    async fn dial(&self, server: &str) -> Result<BackendStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(server))
            .await
            .with_context(|| format!("connect to {server} timed out"))?
            .with_context(|| format!("failed to connect to {server}"))?;
        stream
            .set_nodelay(true)
            .with_context(|| format!("failed to set TCP_NODELAY on {server}"))?;
        let mut framed = Framed::new(stream, RespCodec);
        if let Err(err) = self.post_connect(&mut framed).await {
            warn!(server, error = %err, "backend handshake failed");
            // dropping the framed stream closes the socket
            return Err(err);
        }
        Ok(framed)
    }

    /// Enable replica reads on a fresh connection. Runs before the
    /// connection is visible anywhere else; a failed handshake means the
    /// connection is closed, never pooled.
    async fn post_connect(&self, stream: &mut BackendStream) -> Result<()> {
        if !self.send_readonly {
            return Ok(());
        }
        let readonly = RedisCommand::new(vec![Bytes::from_static(b"READONLY")])?;
        stream
            .send(readonly.to_resp())
            .await
            .context("failed to send READONLY handshake")?;
        match stream.next().await {
            Some(Ok(RespValue::Error(payload))) => bail!(
                "READONLY handshake refused: {}",
                String::from_utf8_lossy(&payload)
            ),
            Some(Ok(_)) => Ok(()),
            Some(Err(err)) => Err(err).context("failed to read READONLY reply"),
            None => bail!("backend closed connection during READONLY handshake"),
        }
    }

    #[cfg(test)]
    fn idle_count(&self, server: &str) -> usize {
        self.pools
            .lock()
            .get(server)
            .map(|sub| sub.idle.lock().len())
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct SubPool {
    idle: Mutex<Vec<BackendStream>>,
    cap: usize,
}

impl SubPool {
    fn new(cap: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            cap,
        }
    }

    fn checkout(&self) -> Option<BackendStream> {
        self.idle.lock().pop()
    }

    fn checkin(&self, stream: BackendStream) {
        let mut idle = self.idle.lock();
        if idle.len() < self.cap {
            idle.push(stream);
        }
        // at capacity the stream is dropped, closing the socket
    }

    fn clear(&self) {
        self.idle.lock().clear();
    }
}

/// Exclusively owned connection checked out of a [`ConnPool`].
///
/// Dropping the guard returns a usable connection to its pool; a connection
/// marked unusable is closed instead. The flag is read by the destructor,
/// so marking always precedes any possible reclaim.
#[derive(Debug)]
pub struct PooledConn {
    server: String,
    stream: Option<BackendStream>,
    home: Arc<SubPool>,
    unusable: bool,
}

impl PooledConn {
    fn new(server: &str, stream: BackendStream, home: Arc<SubPool>) -> Self {
        Self {
            server: server.to_string(),
            stream: Some(stream),
            home,
            unusable: false,
        }
    }

    /// Prevent this connection from re-entering the pool.
    pub fn mark_unusable(&mut self) {
        self.unusable = true;
    }

    pub async fn send(&mut self, value: RespValue) -> Result<()> {
        self.stream_mut().send(value).await
    }

    pub async fn recv(&mut self) -> Result<RespValue> {
        match self.stream_mut().next().await {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(err),
            None => bail!("backend {} closed the connection", self.server),
        }
    }

    fn stream_mut(&mut self) -> &mut BackendStream {
        self.stream
            .as_mut()
            .expect("pooled connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if self.unusable {
                debug!(server = %self.server, "discarding unusable backend connection");
            } else {
                self.home.checkin(stream);
            }
        }
    }
}

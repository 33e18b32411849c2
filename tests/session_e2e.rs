use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::codec::Framed;

use rcproxy::backend::pool::ConnPool;
use rcproxy::config::SessionConfig;
use rcproxy::dispatch::{Dispatcher, MultiOperator, SlotInfo};
use rcproxy::protocol::redis::{Blacklist, RedisCommand, RespCodec, RespValue};
use rcproxy::session::{PipelineRequest, PipelineResponse, Session};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Dispatcher double: forwards every scheduled request to the test's
/// responder task and records topology calls.
struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<PipelineRequest>,
    slot_updates: Mutex<Vec<SlotInfo>>,
    reloads: AtomicUsize,
}

impl ChannelDispatcher {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PipelineRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                slot_updates: Mutex::new(Vec::new()),
                reloads: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    fn slot_updates(&self) -> Vec<SlotInfo> {
        self.slot_updates.lock().unwrap().clone()
    }

    fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn schedule(&self, request: PipelineRequest) {
        let _ = self.tx.send(request);
    }

    fn update_slot_info(&self, info: SlotInfo) {
        self.slot_updates.lock().unwrap().push(info);
    }

    fn trigger_reload_slots(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

/// Multi-operator double answering every multi-key command with an array of
/// nulls, one per key.
struct NullMultiOperator;

#[async_trait]
impl MultiOperator for NullMultiOperator {
    async fn handle_multi_op(&self, _command: RedisCommand, num_keys: usize) -> Result<RespValue> {
        Ok(RespValue::Array(vec![RespValue::NullBulk; num_keys]))
    }
}

/// Backend double for redirect targets: records every received frame,
/// acknowledges `ASKING`, and answers everything else with a fixed reply.
struct FakeBackend {
    addr: SocketAddr,
    frames: Arc<Mutex<Vec<RespValue>>>,
}

impl FakeBackend {
    async fn start(reply: RespValue) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind fake backend")?;
        let addr = listener.local_addr()?;
        let frames = Arc::new(Mutex::new(Vec::new()));
        let recorded = frames.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let reply = reply.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(socket, RespCodec);
                    while let Some(Ok(frame)) = framed.next().await {
                        recorded.lock().unwrap().push(frame.clone());
                        let response = match frame {
                            RespValue::SimpleString(ref name) if name.as_ref() == b"ASKING" => {
                                RespValue::simple("OK")
                            }
                            _ => reply.clone(),
                        };
                        if framed.send(response).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Ok(Self { addr, frames })
    }

    fn server(&self) -> String {
        self.addr.to_string()
    }

    fn frames(&self) -> Vec<RespValue> {
        self.frames.lock().unwrap().clone()
    }
}

async fn start_session(
    dispatcher: Arc<ChannelDispatcher>,
    multi_op: Arc<dyn MultiOperator>,
) -> Result<(Framed<TcpStream, RespCodec>, JoinHandle<Result<()>>)> {
    let pool = Arc::new(ConnPool::new(4, Duration::from_secs(1), false));
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind session listener")?;
    let addr = listener.local_addr()?;
    let session = Session::new(
        pool,
        dispatcher,
        multi_op,
        Arc::new(Blacklist::default()),
        SessionConfig::default(),
    );
    let task = tokio::spawn(async move {
        let (socket, _) = listener.accept().await?;
        session.handle_connection(socket).await
    });
    let client = Framed::new(
        TcpStream::connect(addr).await.context("connect to session")?,
        RespCodec,
    );
    Ok((client, task))
}

async fn send<I, T>(client: &mut Framed<TcpStream, RespCodec>, parts: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let frame = RespValue::Array(
        parts
            .into_iter()
            .map(|part| RespValue::BulkString(Bytes::copy_from_slice(part.as_ref())))
            .collect(),
    );
    client.send(frame).await.context("send command")
}

async fn recv(client: &mut Framed<TcpStream, RespCodec>) -> Result<RespValue> {
    match client.next().await {
        Some(Ok(value)) => Ok(value),
        Some(Err(err)) => Err(err),
        None => Err(anyhow!("session closed the connection unexpectedly")),
    }
}

/// Responder answering in arrival order: `SET` with `+OK`, everything else
/// with a bulk string of the request's first key.
fn echo_responder(mut rx: mpsc::UnboundedReceiver<PipelineRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let cmd = req.cmd.as_ref().expect("dispatched request has a command");
            let value = match cmd.upper_name().as_slice() {
                b"SET" => RespValue::simple("OK"),
                _ => RespValue::BulkString(Bytes::copy_from_slice(
                    cmd.primary_key().unwrap_or(b""),
                )),
            };
            let back_q = req.back_q.clone();
            let _ = back_q.send(PipelineResponse::with_value(req, value)).await;
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipelined_commands_keep_request_order() -> Result<()> {
    init_tracing();
    let (dispatcher, rx) = ChannelDispatcher::new();
    let _responder = echo_responder(rx);
    let (mut client, task) = start_session(dispatcher, Arc::new(NullMultiOperator)).await?;

    send(&mut client, vec![&b"SET"[..], &b"a"[..], &b"1"[..]]).await?;
    send(&mut client, vec![&b"GET"[..], &b"a"[..]]).await?;

    assert_eq!(recv(&mut client).await?, RespValue::simple("OK"));
    assert_eq!(recv(&mut client).await?, RespValue::bulk("a"));

    drop(client);
    task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn out_of_order_backend_completion_is_reordered() -> Result<()> {
    init_tracing();
    let (dispatcher, mut rx) = ChannelDispatcher::new();
    let responder = tokio::spawn(async move {
        let first = rx.recv().await.expect("first request");
        let second = rx.recv().await.expect("second request");
        // complete the second command before the first
        let back_q = second.back_q.clone();
        let _ = back_q
            .send(PipelineResponse::with_value(second, RespValue::NullBulk))
            .await;
        sleep(Duration::from_millis(20)).await;
        let back_q = first.back_q.clone();
        let _ = back_q
            .send(PipelineResponse::with_value(first, RespValue::simple("OK")))
            .await;
    });
    let (mut client, task) = start_session(dispatcher, Arc::new(NullMultiOperator)).await?;

    send(&mut client, vec![&b"SET"[..], &b"a"[..], &b"1"[..]]).await?;
    send(&mut client, vec![&b"GET"[..], &b"missing"[..]]).await?;

    assert_eq!(recv(&mut client).await?, RespValue::simple("OK"));
    assert_eq!(recv(&mut client).await?, RespValue::NullBulk);

    responder.await?;
    drop(client);
    task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn moved_redirect_updates_topology_and_retries() -> Result<()> {
    init_tracing();
    let backend = FakeBackend::start(RespValue::bulk("relocated")).await?;
    let server = backend.server();

    let (dispatcher, mut rx) = ChannelDispatcher::new();
    let redirect_server = server.clone();
    let _responder = tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let payload = format!("MOVED 5823 {redirect_server}");
            let back_q = req.back_q.clone();
            let _ = back_q
                .send(PipelineResponse::with_value(req, RespValue::error(payload)))
                .await;
        }
    });
    let (mut client, task) = start_session(dispatcher.clone(), Arc::new(NullMultiOperator)).await?;

    send(&mut client, vec![&b"GET"[..], &b"x"[..]]).await?;
    assert_eq!(recv(&mut client).await?, RespValue::bulk("relocated"));

    assert_eq!(
        dispatcher.slot_updates(),
        vec![SlotInfo {
            start: 5823,
            end: 5823,
            master: server.clone(),
        }]
    );
    // the retried command goes out as canonical multi-bulk, with no ASKING
    assert_eq!(
        backend.frames(),
        vec![RespValue::Array(vec![
            RespValue::bulk("GET"),
            RespValue::bulk("x"),
        ])]
    );

    drop(client);
    task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ask_redirect_sends_asking_and_skips_topology_update() -> Result<()> {
    init_tracing();
    let backend = FakeBackend::start(RespValue::bulk("migrating")).await?;
    let server = backend.server();

    let (dispatcher, mut rx) = ChannelDispatcher::new();
    let redirect_server = server.clone();
    let _responder = tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let payload = format!("ASK 5823 {redirect_server}");
            let back_q = req.back_q.clone();
            let _ = back_q
                .send(PipelineResponse::with_value(req, RespValue::error(payload)))
                .await;
        }
    });
    let (mut client, task) = start_session(dispatcher.clone(), Arc::new(NullMultiOperator)).await?;

    send(&mut client, vec![&b"GET"[..], &b"x"[..]]).await?;
    assert_eq!(recv(&mut client).await?, RespValue::bulk("migrating"));

    // ASK is transient: the slot map is left alone
    assert!(dispatcher.slot_updates().is_empty());
    assert_eq!(
        backend.frames(),
        vec![
            RespValue::simple("ASKING"),
            RespValue::Array(vec![RespValue::bulk("GET"), RespValue::bulk("x")]),
        ]
    );

    drop(client);
    task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blacklisted_command_is_rejected_locally_in_order() -> Result<()> {
    init_tracing();
    let (dispatcher, rx) = ChannelDispatcher::new();
    let _responder = echo_responder(rx);
    let (mut client, task) = start_session(dispatcher, Arc::new(NullMultiOperator)).await?;

    send(&mut client, vec![&b"SUBSCRIBE"[..], &b"ch"[..]]).await?;
    send(&mut client, vec![&b"GET"[..], &b"k"[..]]).await?;

    assert_eq!(
        recv(&mut client).await?,
        RespValue::error("unsupported command")
    );
    assert_eq!(recv(&mut client).await?, RespValue::bulk("k"));

    drop(client);
    task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_key_commands_are_delegated_and_single_key_ones_dispatched() -> Result<()> {
    init_tracing();
    let (dispatcher, rx) = ChannelDispatcher::new();
    let _responder = echo_responder(rx);
    let (mut client, task) = start_session(dispatcher, Arc::new(NullMultiOperator)).await?;

    send(&mut client, vec![&b"MGET"[..], &b"a"[..], &b"b"[..]]).await?;
    assert_eq!(
        recv(&mut client).await?,
        RespValue::Array(vec![RespValue::NullBulk, RespValue::NullBulk])
    );

    // a single-key MGET takes the ordinary dispatch path
    send(&mut client, vec![&b"MGET"[..], &b"a"[..]]).await?;
    assert_eq!(recv(&mut client).await?, RespValue::bulk("a"));

    drop(client);
    task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backend_error_reaches_client_and_triggers_reload() -> Result<()> {
    init_tracing();
    let (dispatcher, mut rx) = ChannelDispatcher::new();
    let _responder = tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            let back_q = req.back_q.clone();
            let _ = back_q
                .send(PipelineResponse::with_error(
                    req,
                    anyhow!("backend 10.0.0.9:6379 unreachable"),
                ))
                .await;
        }
    });
    let (mut client, task) = start_session(dispatcher.clone(), Arc::new(NullMultiOperator)).await?;

    send(&mut client, vec![&b"GET"[..], &b"x"[..]]).await?;
    assert_eq!(
        recv(&mut client).await?,
        RespValue::error("backend 10.0.0.9:6379 unreachable")
    );
    assert_eq!(dispatcher.reload_count(), 1);

    drop(client);
    task.await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deep_pipeline_with_scrambled_completions_stays_ordered() -> Result<()> {
    init_tracing();
    const COMMANDS: u64 = 20;

    let (dispatcher, mut rx) = ChannelDispatcher::new();
    let _responder = tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            // later requests complete sooner, inverting the natural order
            let delay = Duration::from_millis((COMMANDS - req.seq) * 3);
            tokio::spawn(async move {
                sleep(delay).await;
                let value = RespValue::BulkString(Bytes::from(format!("v{}", req.seq)));
                let back_q = req.back_q.clone();
                let _ = back_q.send(PipelineResponse::with_value(req, value)).await;
            });
        }
    });
    let (mut client, task) = start_session(dispatcher, Arc::new(NullMultiOperator)).await?;

    for i in 0..COMMANDS {
        let key = format!("k{i}");
        send(&mut client, vec![&b"GET"[..], key.as_bytes()]).await?;
    }
    for i in 0..COMMANDS {
        let expected = RespValue::BulkString(Bytes::from(format!("v{i}")));
        assert_eq!(recv(&mut client).await?, expected);
    }

    drop(client);
    task.await??;
    Ok(())
}

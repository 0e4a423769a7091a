use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    compress::{Compressor, CompressorFactory},
    connection::{SEND_QUEUE_DEPTH, SendEntry, send_loop},
    error::{Error, ErrorKind, Result},
    frame::{
        RESPONSE_HEAD_SPACE, RequestFrame, RequestFrameWithTimeout, read_frame_compressed,
        write_response_header,
    },
    gate::{Gate, GateGuard},
    marshal::{Serializer, encode_unknown_verb_exception},
    negotiate::{
        FEATURE_COMPRESS, FEATURE_TIMEOUT, FeatureMap, Features, recv_negotiation_frame,
        send_negotiation_frame,
    },
    protocol::Protocol,
    task_supervisor::{TaskGuard, TaskSupervisor},
};

/// Admission bytes reserved for an unknown-verb exception reply.
const UNKNOWN_VERB_REPLY_SIZE: usize = 28;

/// Per-connection admission budget for in-memory request payloads.
#[serde_inline_default]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    #[serde_inline_default(0)]
    pub basic_request_size: usize,
    #[serde_inline_default(1)]
    pub bloat_factor: usize,
    #[serde_inline_default(10_000_000)]
    pub max_memory: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl ResourceLimits {
    /// Estimated in-memory cost of a request, clamped so a single oversized
    /// request can still be admitted.
    pub(crate) fn estimate(&self, payload_len: usize) -> u32 {
        let bytes = self
            .basic_request_size
            .saturating_add(payload_len.saturating_mul(self.bloat_factor));
        u32::try_from(bytes.min(self.max_memory)).unwrap_or(u32::MAX)
    }
}

#[derive(Default)]
pub struct ServerOptions {
    pub compressor_factory: Option<Arc<dyn CompressorFactory>>,
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("compression", &self.compressor_factory.is_some())
            .finish()
    }
}

/// Per-connection record handed to handlers registered `with_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInfo {
    pub peer: SocketAddr,
    pub features: Features,
}

/// Server side of one accepted connection, shared between its read loop, its
/// send loop and in-flight handler continuations.
pub(crate) struct ServerConn {
    info: ClientInfo,
    tx: mpsc::Sender<SendEntry>,
    error: AtomicBool,
    resources: Arc<Semaphore>,
    limits: ResourceLimits,
    gate: Gate,
}

impl ServerConn {
    pub(crate) fn info(&self) -> ClientInfo {
        self.info
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.info.peer
    }

    pub(crate) fn limits(&self) -> ResourceLimits {
        self.limits
    }

    pub(crate) fn resources(&self) -> Arc<Semaphore> {
        self.resources.clone()
    }

    pub(crate) fn gate(&self) -> &Gate {
        &self.gate
    }

    /// Writes the response header in place and queues the frame. The
    /// admission permit and gate slot ride along and release once the frame
    /// has been written out (or dropped past its deadline).
    pub(crate) async fn respond(
        &self,
        msg_id: i64,
        mut buf: Vec<u8>,
        expires: Option<Instant>,
        permit: Option<OwnedSemaphorePermit>,
        gate: Option<GateGuard>,
    ) {
        if self.error.load(Ordering::SeqCst) {
            return;
        }
        write_response_header(&mut buf, msg_id);
        let entry = SendEntry {
            buf: buf.into(),
            expires,
            permit,
            gate,
        };
        let _ = self.tx.send(entry).await;
    }
}

struct ServerInner<S: Serializer> {
    proto: Arc<Protocol<S>>,
    limits: ResourceLimits,
    options: ServerOptions,
    gate: Gate,
    supervisor: TaskSupervisor,
    accept_token: CancellationToken,
    conns: DashMap<u64, Arc<ServerConn>, RandomState>,
    next_conn_id: AtomicU64,
}

/// Accepts connections and drives their read loops against the protocol's
/// verb registry.
pub struct Server<S: Serializer> {
    inner: Arc<ServerInner<S>>,
}

impl<S: Serializer> Server<S> {
    #[must_use]
    pub fn create(proto: Arc<Protocol<S>>, limits: ResourceLimits, options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                proto,
                limits,
                options,
                gate: Gate::default(),
                supervisor: TaskSupervisor::default(),
                accept_token: CancellationToken::new(),
                conns: DashMap::default(),
                next_conn_id: AtomicU64::new(0),
            }),
        }
    }

    /// Binds and starts the accept loop; returns the bound address.
    ///
    /// # Errors
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;
        let listener_addr = listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::BindFailed, e.to_string()))?;

        let inner = self.inner.clone();
        let accept_token = inner.accept_token.clone();
        let guard = inner.supervisor.start_task();
        tokio::spawn(async move {
            tokio::select! {
                () = accept_token.cancelled() => {
                    tracing::info!("stop accept loop");
                }
                () = guard.stopped() => {}
                () = async {
                    tracing::info!("start listening: {listener_addr}");
                    while let Ok((stream, peer)) = listener.accept().await {
                        inner.clone().start_connection(stream, peer);
                    }
                } => {}
            }
        });

        Ok(listener_addr)
    }

    /// Stops accepting, waits for in-flight handlers behind the reply gate,
    /// then drains and stops every connection.
    pub async fn stop(&self) {
        self.inner.accept_token.cancel();
        self.inner.gate.close().await;
        self.inner.supervisor.stop();
        self.inner.supervisor.all_stopped().await;
    }

    /// Waits until every server task has stopped.
    pub async fn join(&self) {
        self.inner.supervisor.all_stopped().await;
    }
}

impl<S: Serializer> ServerInner<S> {
    fn start_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let guard = self.supervisor.start_task();
        tokio::spawn(async move {
            self.run_connection(stream, peer, guard).await;
        });
    }

    async fn run_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, guard: TaskGuard) {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let negotiated = tokio::select! {
            () = guard.stopped() => return,
            r = self.negotiate(&mut read_half, &mut write_half, peer) => r,
        };
        let (features, compressor) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::error!(%peer, "server connection dropped: {e}");
                return;
            }
        };

        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let conn_token = CancellationToken::new();
        let conn = Arc::new(ServerConn {
            info: ClientInfo { peer, features },
            tx,
            error: AtomicBool::new(false),
            resources: Arc::new(Semaphore::new(
                self.limits.max_memory.min(Semaphore::MAX_PERMITS),
            )),
            limits: self.limits,
            gate: self.gate.clone(),
        });
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        self.conns.insert(conn_id, conn.clone());

        let send_guard = self.supervisor.start_task();
        let send_token = conn_token.clone();
        let send_compressor = compressor.clone();
        let send_handle = tokio::spawn(async move {
            let _guard = send_guard;
            if let Err(e) = send_loop(write_half, rx, send_compressor, send_token).await {
                tracing::debug!(%peer, "server send loop ended: {e}");
            }
        });

        let result = tokio::select! {
            () = guard.stopped() => Ok(()),
            r = self.read_loop(&mut read_half, &conn, compressor, features) => r,
        };
        if let Err(e) = result {
            tracing::error!(%peer, "server connection dropped: {e}");
        }

        conn.error.store(true, Ordering::SeqCst);
        conn_token.cancel();
        let _ = send_handle.await;
        self.conns.remove(&conn_id);
    }

    async fn negotiate(
        &self,
        read_half: &mut OwnedReadHalf,
        write_half: &mut OwnedWriteHalf,
        peer: SocketAddr,
    ) -> Result<(Features, Option<Arc<dyn Compressor>>)> {
        let requested = recv_negotiation_frame(read_half, peer).await?;

        let mut features = Features::default();
        let mut accepted = FeatureMap::default();
        let mut compressor: Option<Arc<dyn Compressor>> = None;
        if let Some(blob) = requested.get(FEATURE_COMPRESS)
            && let Some(factory) = &self.options.compressor_factory
            && let Some(chosen) = factory.negotiate(blob, true)
        {
            compressor = Some(Arc::from(chosen));
            features |= Features::COMPRESS;
            accepted.insert(FEATURE_COMPRESS, factory.supported());
        }
        if requested.get(FEATURE_TIMEOUT).is_some() {
            features |= Features::TIMEOUT;
            accepted.insert(FEATURE_TIMEOUT, Vec::new());
        }

        send_negotiation_frame(write_half, &accepted).await?;
        Ok((features, compressor))
    }

    async fn read_loop(
        &self,
        read_half: &mut OwnedReadHalf,
        conn: &Arc<ServerConn>,
        compressor: Option<Arc<dyn Compressor>>,
        features: Features,
    ) -> Result<()> {
        let peer = conn.peer();
        loop {
            let frame = if features.contains(Features::TIMEOUT) {
                read_frame_compressed::<RequestFrameWithTimeout, _>(
                    read_half,
                    compressor.as_deref(),
                    peer,
                )
                .await?
            } else {
                read_frame_compressed::<RequestFrame, _>(read_half, compressor.as_deref(), peer)
                    .await?
            };
            let Some((header, data)) = frame else {
                return Ok(());
            };

            let deadline = header
                .expire_ms
                .filter(|ms| *ms > 0)
                .map(|ms| Instant::now() + Duration::from_millis(ms));

            match self.proto.handler(header.verb) {
                Some(handler) => handler(conn.clone(), deadline, header.msg_id, data).await,
                None => {
                    self.reply_unknown_verb(conn, header.verb, header.msg_id, deadline)
                        .await;
                }
            }
        }
    }

    async fn reply_unknown_verb(
        &self,
        conn: &Arc<ServerConn>,
        verb: u64,
        msg_id: i64,
        deadline: Option<Instant>,
    ) {
        let need = u32::try_from(UNKNOWN_VERB_REPLY_SIZE.min(self.limits.max_memory))
            .unwrap_or(u32::MAX);
        let Ok(permit) = conn.resources().acquire_many_owned(need).await else {
            return;
        };
        let Ok(gate) = self.gate.enter() else {
            return;
        };
        let buf = encode_unknown_verb_exception(RESPONSE_HEAD_SPACE, verb);
        conn.respond(-msg_id, buf, deadline, Some(permit), Some(gate))
            .await;
    }
}

impl<S: Serializer> std::fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.inner.conns.len())
            .finish()
    }
}

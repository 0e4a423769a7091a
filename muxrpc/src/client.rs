use std::{
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use socket2::SockRef;
use tokio::{
    net::{TcpStream, tcp::OwnedReadHalf},
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    compress::{Compressor, CompressorFactory},
    connection::{SEND_QUEUE_DEPTH, SendEntry, send_loop},
    error::{Error, ErrorKind, Result},
    frame::{REQUEST_HEAD_SPACE, ResponseFrame, read_frame_compressed, write_request_header},
    marshal::{RpcArgs, Serializer, decode_exception},
    negotiate::{
        FEATURE_COMPRESS, FEATURE_TIMEOUT, FeatureMap, recv_negotiation_frame,
        send_negotiation_frame,
    },
    protocol::Verb,
    task_supervisor::TaskSupervisor,
    waiter::Waiter,
};

pub struct ClientOptions {
    /// Advertise the TIMEOUT feature so deadlines ship inline.
    pub send_timeout_data: bool,
    pub keepalive: bool,
    pub compressor_factory: Option<Arc<dyn CompressorFactory>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            send_timeout_data: true,
            keepalive: false,
            compressor_factory: None,
        }
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("send_timeout_data", &self.send_timeout_data)
            .field("keepalive", &self.keepalive)
            .field("compression", &self.compressor_factory.is_some())
            .finish()
    }
}

/// Point-in-time view of a client's counters.
///
/// `replied` counts successful responses only; exception replies land in
/// `exception_received`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClientStats {
    pub sent_messages: u64,
    pub replied: u64,
    pub exception_received: u64,
    pub timed_out: u64,
    pub pending: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sent_messages: AtomicU64,
    replied: AtomicU64,
    exception_received: AtomicU64,
    timed_out: AtomicU64,
}

struct ClientShared {
    peer: SocketAddr,
    tx: mpsc::Sender<SendEntry>,
    waiter: Waiter,
    error: AtomicBool,
    timeout_negotiated: bool,
    stats: Counters,
    supervisor: TaskSupervisor,
    conn_token: CancellationToken,
}

impl Drop for ClientShared {
    fn drop(&mut self) {
        self.conn_token.cancel();
    }
}

/// One negotiated connection to a server. Cheap to clone; all clones share
/// the outstanding-call table and the send loop.
pub struct Client<S: Serializer> {
    serializer: S,
    shared: Arc<ClientShared>,
}

impl<S: Serializer> Clone for Client<S> {
    fn clone(&self) -> Self {
        Self {
            serializer: self.serializer.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S: Serializer> Client<S> {
    /// Connects, negotiates features and spawns the connection loops.
    ///
    /// # Errors
    pub async fn connect(addr: SocketAddr, options: ClientOptions, serializer: S) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))?;
        if options.keepalive {
            SockRef::from(&stream)
                .set_keepalive(true)
                .map_err(|e| Error::new(ErrorKind::ConnectFailed, e.to_string()))?;
        }

        let (mut read_half, mut write_half) = stream.into_split();

        let mut advertised = FeatureMap::default();
        if let Some(factory) = &options.compressor_factory {
            advertised.insert(FEATURE_COMPRESS, factory.supported());
        }
        if options.send_timeout_data {
            advertised.insert(FEATURE_TIMEOUT, Vec::new());
        }
        send_negotiation_frame(&mut write_half, &advertised).await?;
        let accepted = recv_negotiation_frame(&mut read_half, addr).await?;

        let mut compressor: Option<Arc<dyn Compressor>> = None;
        if let Some(blob) = accepted.get(FEATURE_COMPRESS)
            && let Some(factory) = &options.compressor_factory
            && let Some(chosen) = factory.negotiate(blob, false)
        {
            compressor = Some(Arc::from(chosen));
        }
        let timeout_negotiated = accepted.get(FEATURE_TIMEOUT).is_some();

        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let shared = Arc::new(ClientShared {
            peer: addr,
            tx,
            waiter: Waiter::default(),
            error: AtomicBool::new(false),
            timeout_negotiated,
            stats: Counters::default(),
            supervisor: TaskSupervisor::default(),
            conn_token: CancellationToken::new(),
        });

        let send_guard = shared.supervisor.start_task();
        let send_token = shared.conn_token.clone();
        let send_compressor = compressor.clone();
        tokio::spawn(async move {
            let _guard = send_guard;
            if let Err(e) = send_loop(write_half, rx, send_compressor, send_token).await {
                tracing::debug!(peer = %addr, "client send loop ended: {e}");
            }
        });

        let read_guard = shared.supervisor.start_task();
        let read_token = shared.conn_token.clone();
        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            tokio::select! {
                () = read_token.cancelled() => {}
                r = read_loop(read_half, compressor, weak.clone(), addr) => {
                    if let Err(e) = r {
                        tracing::error!(peer = %addr, "client connection dropped: {e}");
                    }
                }
            }
            if let Some(shared) = weak.upgrade() {
                shared.error.store(true, Ordering::SeqCst);
                shared.conn_token.cancel();
                shared.waiter.fail_all();
            }
            drop(read_guard);
        });

        Ok(Self { serializer, shared })
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    #[must_use]
    pub fn stats(&self) -> ClientStats {
        let stats = &self.shared.stats;
        ClientStats {
            sent_messages: stats.sent_messages.load(Ordering::Relaxed),
            replied: stats.replied.load(Ordering::Relaxed),
            exception_received: stats.exception_received.load(Ordering::Relaxed),
            timed_out: stats.timed_out.load(Ordering::Relaxed),
            pending: self.shared.waiter.pending() as u64,
        }
    }

    /// Stops the connection loops, drains the send queue and completes every
    /// outstanding call with `Closed`.
    pub async fn stop(&self) {
        self.shared.error.store(true, Ordering::SeqCst);
        self.shared.conn_token.cancel();
        self.shared.supervisor.stop();
        self.shared.supervisor.all_stopped().await;
        self.shared.waiter.fail_all();
    }

    pub(crate) async fn call<A, R>(
        &self,
        verb: Verb,
        deadline: Option<Instant>,
        cancel: Option<&CancellationToken>,
        args: &A,
    ) -> Result<R>
    where
        A: RpcArgs,
        R: DeserializeOwned + Send + 'static,
    {
        let shared = &self.shared;
        if shared.error.load(Ordering::SeqCst) {
            return Err(Error::kind(ErrorKind::Closed));
        }

        let (msg_id, reply) = shared.waiter.alloc();
        let buf = match self.encode_request(verb, msg_id, deadline, args) {
            Ok(buf) => buf,
            Err(e) => {
                shared.waiter.remove(msg_id);
                return Err(e);
            }
        };
        if shared.tx.send(SendEntry::new(buf)).await.is_err() {
            shared.waiter.remove(msg_id);
            return Err(Error::kind(ErrorKind::Closed));
        }
        shared.stats.sent_messages.fetch_add(1, Ordering::Relaxed);

        let deadline_fired = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let cancel_fired = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = reply => match outcome {
                Ok(Ok(data)) => {
                    let mut input = &data[..];
                    self.serializer.read::<R>(&mut input)
                }
                Ok(Err(remote)) => Err(remote),
                Err(_) => Err(Error::kind(ErrorKind::Closed)),
            },
            () = deadline_fired => {
                shared.waiter.remove(msg_id);
                shared.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(Error::kind(ErrorKind::Timeout))
            }
            () = cancel_fired => {
                shared.waiter.remove(msg_id);
                Err(Error::kind(ErrorKind::Cancelled))
            }
        }
    }

    pub(crate) async fn call_oneway<A: RpcArgs>(&self, verb: Verb, args: &A) -> Result<()> {
        let shared = &self.shared;
        if shared.error.load(Ordering::SeqCst) {
            return Err(Error::kind(ErrorKind::Closed));
        }
        let msg_id = shared.waiter.next_id();
        let buf = self.encode_request(verb, msg_id, None, args)?;
        if shared.tx.send(SendEntry::new(buf)).await.is_err() {
            return Err(Error::kind(ErrorKind::Closed));
        }
        shared.stats.sent_messages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn encode_request<A: RpcArgs>(
        &self,
        verb: Verb,
        msg_id: i64,
        deadline: Option<Instant>,
        args: &A,
    ) -> Result<Bytes> {
        let mut buf = args.marshal(&self.serializer, REQUEST_HEAD_SPACE)?;
        let expire_ms = deadline.map_or(0, |at| {
            let remaining = at.saturating_duration_since(Instant::now());
            u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX).max(1)
        });
        write_request_header(&mut buf, expire_ms, verb, msg_id);
        let bytes = Bytes::from(buf);
        if self.shared.timeout_negotiated {
            Ok(bytes)
        } else {
            // Peer reads 20-byte headers; drop the expiration prefix.
            Ok(bytes.slice(8..))
        }
    }
}

impl<S: Serializer> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("peer", &self.shared.peer)
            .field("pending", &self.shared.waiter.pending())
            .finish()
    }
}

async fn read_loop(
    mut stream: OwnedReadHalf,
    compressor: Option<Arc<dyn Compressor>>,
    shared: Weak<ClientShared>,
    peer: SocketAddr,
) -> Result<()> {
    loop {
        let frame =
            read_frame_compressed::<ResponseFrame, _>(&mut stream, compressor.as_deref(), peer)
                .await?;
        let Some((header, data)) = frame else {
            return Ok(());
        };
        let Some(shared) = shared.upgrade() else {
            return Ok(());
        };

        let abs_id = header.msg_id.wrapping_abs();
        if header.msg_id >= 0 {
            if shared.waiter.post(abs_id, Ok(data)) {
                shared.stats.replied.fetch_add(1, Ordering::Relaxed);
            } else {
                // Reply for an id already timed out or cancelled.
                tracing::debug!(%peer, "late reply for message {abs_id} ignored");
            }
        } else {
            let remote = decode_exception(&data)?;
            let is_unknown_verb = remote.kind == ErrorKind::UnknownVerb;
            let verb = remote.msg.clone();
            if shared.waiter.post(abs_id, Err(remote)) {
                shared.stats.exception_received.fetch_add(1, Ordering::Relaxed);
            } else if is_unknown_verb {
                // A fire-and-forget call hit a verb unknown to the peer.
                tracing::info!(%peer, "unknown verb exception {verb} ignored");
            } else {
                return Err(Error::new(
                    ErrorKind::Protocol,
                    format!("exception reply for unknown message {abs_id}"),
                ));
            }
        }
    }
}

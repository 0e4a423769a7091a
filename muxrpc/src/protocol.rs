use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use serde::{Serialize, de::DeserializeOwned};
use tokio::time::Instant;

use crate::{
    error::Result,
    frame::RESPONSE_HEAD_SPACE,
    marshal::{RpcArgs, Serializer, encode_user_exception},
    server::{ClientInfo, ServerConn},
    stub::{OnewayStub, Stub},
};

/// Caller-chosen scalar identifier of a remote procedure.
pub type Verb = u64;

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Dispatch closure stored per verb: admission, gate entry, argument
/// decoding, handler invocation and the reply all happen behind it.
pub(crate) type Handler =
    Arc<dyn Fn(Arc<ServerConn>, Option<Instant>, i64, Bytes) -> HandlerFuture + Send + Sync>;

/// Verb registry plus the serializer shared by both endpoint roles.
///
/// Handlers are registered once per verb; registration returns the matching
/// client stub so both sides agree on the signature by construction.
pub struct Protocol<S> {
    serializer: S,
    handlers: DashMap<Verb, Handler, RandomState>,
}

impl<S: Serializer> Protocol<S> {
    #[must_use]
    pub fn new(serializer: S) -> Self {
        Self {
            serializer,
            handlers: DashMap::default(),
        }
    }

    pub(crate) fn handler(&self, verb: Verb) -> Option<Handler> {
        self.handlers.get(&verb).map(|h| h.clone())
    }

    /// Returns a typed stub for a verb served by the peer.
    #[must_use]
    pub fn client<A, R>(&self, verb: Verb) -> Stub<A, R>
    where
        A: RpcArgs,
        R: DeserializeOwned + Send + 'static,
    {
        Stub::new(verb)
    }

    /// Returns a fire-and-forget stub for a verb served by the peer.
    #[must_use]
    pub fn oneway_client<A: RpcArgs>(&self, verb: Verb) -> OnewayStub<A> {
        OnewayStub::new(verb)
    }

    /// Registers a handler and returns the matching client stub.
    ///
    /// At most one handler per verb; duplicate registration is a programming
    /// error.
    pub fn register<A, R, E, F, Fut>(&self, verb: Verb, f: F) -> Stub<A, R>
    where
        A: RpcArgs,
        R: Serialize + DeserializeOwned + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.insert(verb, self.wait_handler(move |_info, args| f(args)));
        self.client(verb)
    }

    /// Like [`register`](Self::register), for handlers that also want the
    /// per-connection [`ClientInfo`]. The stub signature does not carry it.
    pub fn register_with_info<A, R, E, F, Fut>(&self, verb: Verb, f: F) -> Stub<A, R>
    where
        A: RpcArgs,
        R: Serialize + DeserializeOwned + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(ClientInfo, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.insert(verb, self.wait_handler(f));
        self.client(verb)
    }

    /// Registers a fire-and-forget handler: it runs on the server but never
    /// produces a response frame; its errors are logged and dropped.
    pub fn register_oneway<A, E, F, Fut>(&self, verb: Verb, f: F) -> OnewayStub<A>
    where
        A: RpcArgs,
        E: std::fmt::Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    {
        self.insert(verb, self.oneway_handler(move |_info, args| f(args)));
        self.oneway_client(verb)
    }

    pub fn register_oneway_with_info<A, E, F, Fut>(&self, verb: Verb, f: F) -> OnewayStub<A>
    where
        A: RpcArgs,
        E: std::fmt::Display + Send + 'static,
        F: Fn(ClientInfo, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    {
        self.insert(verb, self.oneway_handler(f));
        self.oneway_client(verb)
    }

    fn insert(&self, verb: Verb, handler: Handler) {
        let previous = self.handlers.insert(verb, handler);
        assert!(previous.is_none(), "verb {verb} already registered");
    }

    fn wait_handler<A, R, E, F, Fut>(&self, f: F) -> Handler
    where
        A: RpcArgs,
        R: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        F: Fn(ClientInfo, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let serializer = self.serializer.clone();
        let f = Arc::new(f);
        Arc::new(move |conn: Arc<ServerConn>, deadline, msg_id, data| {
            let serializer = serializer.clone();
            let f = f.clone();
            Box::pin(async move {
                let need = conn.limits().estimate(data.len());
                let Ok(permit) = conn.resources().acquire_many_owned(need).await else {
                    return;
                };
                let Ok(gate) = conn.gate().enter() else {
                    return;
                };
                tokio::spawn(async move {
                    let args = A::unmarshal(&serializer, &data);
                    drop(data);
                    let outcome = match args {
                        Ok(args) => match f(conn.info(), args).await {
                            Ok(ret) => {
                                marshal_return(&serializer, &ret).map_err(|e| e.to_string())
                            }
                            Err(e) => Err(e.to_string()),
                        },
                        Err(e) => Err(e.to_string()),
                    };
                    match outcome {
                        Ok(buf) => {
                            conn.respond(msg_id, buf, deadline, Some(permit), Some(gate))
                                .await;
                        }
                        Err(msg) => {
                            let buf = encode_user_exception(RESPONSE_HEAD_SPACE, &msg);
                            conn.respond(-msg_id, buf, deadline, Some(permit), Some(gate))
                                .await;
                        }
                    }
                });
            })
        })
    }

    fn oneway_handler<A, E, F, Fut>(&self, f: F) -> Handler
    where
        A: RpcArgs,
        E: std::fmt::Display + Send + 'static,
        F: Fn(ClientInfo, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    {
        let serializer = self.serializer.clone();
        let f = Arc::new(f);
        Arc::new(move |conn: Arc<ServerConn>, _deadline, _msg_id, data| {
            let serializer = serializer.clone();
            let f = f.clone();
            Box::pin(async move {
                let need = conn.limits().estimate(data.len());
                let Ok(permit) = conn.resources().acquire_many_owned(need).await else {
                    return;
                };
                let Ok(gate) = conn.gate().enter() else {
                    return;
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    let _gate = gate;
                    let args = A::unmarshal(&serializer, &data);
                    drop(data);
                    let result = match args {
                        Ok(args) => f(conn.info(), args).await.map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    };
                    if let Err(e) = result {
                        tracing::warn!(
                            peer = %conn.peer(),
                            "exception \"{e}\" in no_wait handler ignored",
                        );
                    }
                });
            })
        })
    }
}

fn marshal_return<S: Serializer, R: Serialize>(serializer: &S, ret: &R) -> Result<Vec<u8>> {
    let mut out = vec![0u8; RESPONSE_HEAD_SPACE];
    serializer.write(&mut out, ret)?;
    Ok(out)
}

impl<S> std::fmt::Debug for Protocol<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("verbs", &self.handlers.len())
            .finish()
    }
}

use std::{marker::PhantomData, time::Duration};

use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    client::Client,
    error::Result,
    marshal::{RpcArgs, Serializer},
    protocol::Verb,
};

/// Typed handle for one verb; carries no connection state, so it is `Copy`
/// and can be invoked against any client speaking the same protocol.
pub struct Stub<A, R> {
    verb: Verb,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for Stub<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for Stub<A, R> {}

impl<A, R> std::fmt::Debug for Stub<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub").field("verb", &self.verb).finish()
    }
}

impl<A, R> Stub<A, R>
where
    A: RpcArgs,
    R: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(verb: Verb) -> Self {
        Self {
            verb,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// # Errors
    pub async fn call<S: Serializer>(&self, client: &Client<S>, args: A) -> Result<R> {
        client.call(self.verb, None, None, &args).await
    }

    /// Completes with `Timeout` if no reply arrived by `deadline`.
    ///
    /// # Errors
    pub async fn call_with_deadline<S: Serializer>(
        &self,
        client: &Client<S>,
        deadline: Instant,
        args: A,
    ) -> Result<R> {
        client.call(self.verb, Some(deadline), None, &args).await
    }

    /// Relative-deadline variant; converted to an absolute deadline at call
    /// time.
    ///
    /// # Errors
    pub async fn call_with_timeout<S: Serializer>(
        &self,
        client: &Client<S>,
        timeout: Duration,
        args: A,
    ) -> Result<R> {
        self.call_with_deadline(client, Instant::now() + timeout, args)
            .await
    }

    /// Completes with `Cancelled` once `cancel` fires. The wire request is
    /// not rescinded; a late reply is discarded.
    ///
    /// # Errors
    pub async fn call_cancellable<S: Serializer>(
        &self,
        client: &Client<S>,
        cancel: &CancellationToken,
        args: A,
    ) -> Result<R> {
        client.call(self.verb, None, Some(cancel), &args).await
    }
}

/// Fire-and-forget stub: the call resolves as soon as the request is queued
/// and no response frame is ever expected.
pub struct OnewayStub<A> {
    verb: Verb,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for OnewayStub<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A> Copy for OnewayStub<A> {}

impl<A> std::fmt::Debug for OnewayStub<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnewayStub")
            .field("verb", &self.verb)
            .finish()
    }
}

impl<A: RpcArgs> OnewayStub<A> {
    pub(crate) fn new(verb: Verb) -> Self {
        Self {
            verb,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// # Errors
    pub async fn call<S: Serializer>(&self, client: &Client<S>, args: A) -> Result<()> {
        client.call_oneway(self.verb, &args).await
    }
}

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Default)]
struct GateState {
    closed: AtomicBool,
    entered: AtomicU64,
    drained: CancellationToken,
}

/// Counting barrier over in-flight handler invocations.
///
/// `enter` fails once the gate is closed; `close` denies new entries and
/// resolves when every holder has left. Cloned handles share the same gate.
#[derive(Debug, Default, Clone)]
pub(crate) struct Gate(Arc<GateState>);

#[derive(Debug)]
pub(crate) struct GateGuard(Arc<GateState>);

fn leave(state: &GateState) {
    if state.entered.fetch_sub(1, Ordering::SeqCst) == 1 && state.closed.load(Ordering::SeqCst) {
        state.drained.cancel();
    }
}

impl Gate {
    pub fn enter(&self) -> Result<GateGuard> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(Error::kind(ErrorKind::Closed));
        }
        self.0.entered.fetch_add(1, Ordering::SeqCst);
        if self.0.closed.load(Ordering::SeqCst) {
            // Lost the race against close; back out.
            leave(&self.0);
            return Err(Error::kind(ErrorKind::Closed));
        }
        Ok(GateGuard(self.0.clone()))
    }

    pub async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
        if self.0.entered.load(Ordering::SeqCst) == 0 {
            self.0.drained.cancel();
        }
        self.0.drained.cancelled().await;
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        leave(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_close_waits_for_holders() {
        let gate = Gate::default();
        let guard = gate.enter().unwrap();

        let closer = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.close().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!closer.is_finished());

        drop(guard);
        closer.await.unwrap();
        assert!(gate.enter().is_err());
    }

    #[tokio::test]
    async fn test_close_empty_gate() {
        let gate = Gate::default();
        gate.close().await;
        assert_eq!(gate.enter().unwrap_err().kind, ErrorKind::Closed);
    }
}

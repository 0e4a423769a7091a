use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use tokio::sync::oneshot;

use crate::error::Error;

/// What the read loop delivers for one call: the raw success payload, or the
/// already-decoded remote error.
pub(crate) type Reply = std::result::Result<Bytes, Error>;

/// Outstanding-call table correlating requests with responses.
///
/// Ids are strictly increasing positive integers; id 0 is never live. Every
/// entry leaves the table exactly once: through a matching reply, through
/// cancellation or deadline removal, or through `fail_all` when the
/// connection dies (which wakes every holder with a closed channel).
#[derive(Default)]
pub(crate) struct Waiter {
    index: AtomicI64,
    id_map: DashMap<i64, oneshot::Sender<Reply>, RandomState>,
}

impl Waiter {
    /// Allocates the next message id without registering a reply slot
    /// (fire-and-forget calls still consume ids).
    pub fn next_id(&self) -> i64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn alloc(&self) -> (i64, oneshot::Receiver<Reply>) {
        let msg_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.id_map.insert(msg_id, tx);
        (msg_id, rx)
    }

    /// Delivers a reply to the waiting caller. Returns false when the id is
    /// not (or no longer) outstanding.
    pub fn post(&self, msg_id: i64, reply: Reply) -> bool {
        if let Some((_, tx)) = self.id_map.remove(&msg_id) {
            let _ = tx.send(reply);
            true
        } else {
            false
        }
    }

    pub fn remove(&self, msg_id: i64) {
        self.id_map.remove(&msg_id);
    }

    /// Drops every entry; each holder observes its slot closing.
    pub fn fail_all(&self) {
        self.id_map.clear();
    }

    pub fn pending(&self) -> usize {
        self.id_map.len()
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ids_strictly_increase_from_one() {
        let waiter = Waiter::default();
        let (first, _rx) = waiter.alloc();
        assert_eq!(first, 1);
        let mut last = first;
        for _ in 0..100 {
            let id = waiter.next_id();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_post_delivers_once() {
        let waiter = Arc::new(Waiter::default());
        let (msg_id, rx) = waiter.alloc();

        let handle = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move {
                assert!(waiter.post(msg_id, Ok(Bytes::from_static(b"hi"))));
                assert!(!waiter.post(msg_id, Ok(Bytes::new())));
            })
        };

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(&reply[..], b"hi");
        handle.await.unwrap();
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_wakes_holders() {
        let waiter = Waiter::default();
        let (_id, rx) = waiter.alloc();
        waiter.fail_all();
        assert!(rx.await.is_err());
        assert_eq!(waiter.pending(), 0);
    }

    #[tokio::test]
    async fn test_removed_id_drops_late_reply() {
        let waiter = Waiter::default();
        let (msg_id, rx) = waiter.alloc();
        waiter.remove(msg_id);
        assert!(!waiter.post(msg_id, Ok(Bytes::new())));
        assert!(rx.await.is_err());
    }
}

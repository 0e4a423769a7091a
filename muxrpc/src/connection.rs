use std::{io::IoSlice, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::AsyncWriteExt,
    net::tcp::OwnedWriteHalf,
    sync::{OwnedSemaphorePermit, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    compress::Compressor,
    error::{Error, ErrorKind, Result},
    gate::GateGuard,
};

pub(crate) const SEND_QUEUE_DEPTH: usize = 1024;

/// One outbound frame queued for the send loop.
pub(crate) struct SendEntry {
    pub buf: Bytes,
    /// Entries past their deadline are dropped instead of written.
    pub expires: Option<Instant>,
    /// Admission bytes released once the entry has been written (or dropped).
    pub permit: Option<OwnedSemaphorePermit>,
    /// Reply-gate slot released together with the admission.
    pub gate: Option<GateGuard>,
}

impl SendEntry {
    pub fn new(buf: Bytes) -> Self {
        Self {
            buf,
            expires: None,
            permit: None,
            gate: None,
        }
    }
}

/// Writes queued frames in submission order, batching with vectored writes.
///
/// Exits when the queue closes, or after draining what is already queued once
/// `stop` fires. When a compressor is active every frame is wrapped in the
/// length-prefixed compressed envelope.
pub(crate) async fn send_loop(
    mut stream: OwnedWriteHalf,
    mut queue: mpsc::Receiver<SendEntry>,
    compressor: Option<Arc<dyn Compressor>>,
    stop: CancellationToken,
) -> Result<()> {
    const LIMIT: usize = 64;
    let mut entries: Vec<SendEntry> = Vec::with_capacity(LIMIT);
    loop {
        let draining = tokio::select! {
            n = queue.recv_many(&mut entries, LIMIT) => {
                if n == 0 {
                    return Ok(());
                }
                false
            }
            () = stop.cancelled() => {
                while let Ok(entry) = queue.try_recv() {
                    entries.push(entry);
                }
                true
            }
        };

        let now = Instant::now();
        entries.retain(|e| e.expires.is_none_or(|t| t > now));

        let mut bufs: Vec<Bytes> = Vec::with_capacity(entries.len());
        for entry in &entries {
            if let Some(compressor) = &compressor {
                let compressed = compressor.compress(&entry.buf)?;
                let mut envelope = Vec::with_capacity(4 + compressed.len());
                envelope.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
                envelope.extend_from_slice(&compressed);
                bufs.push(envelope.into());
            } else {
                bufs.push(entry.buf.clone());
            }
        }

        let mut slices: Vec<IoSlice> = bufs.iter().map(|b| IoSlice::new(b)).collect();
        let mut slices = &mut slices[..];
        while !slices.is_empty() {
            match stream.write_vectored(slices).await {
                Ok(n) => {
                    IoSlice::advance_slices(&mut slices, n);
                }
                Err(e) => {
                    return Err(Error::new(ErrorKind::SendFailed, e.to_string()));
                }
            }
        }

        // Dropping the entries releases their permits and gate slots.
        entries.clear();
        if draining {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_send_loop_preserves_submission_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = client.into_split();

        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let stop = CancellationToken::new();
        let loop_handle = tokio::spawn(send_loop(write, rx, None, stop.clone()));

        for b in [&b"one "[..], &b"two "[..]] {
            tx.send(SendEntry::new(Bytes::from_static(b))).await.unwrap();
        }
        drop(tx);
        loop_handle.await.unwrap().unwrap();

        let mut got = Vec::new();
        let (mut server_read, _w) = server.into_split();
        server_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, b"one two ");
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = client.into_split();

        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let stop = CancellationToken::new();
        let loop_handle = tokio::spawn(send_loop(write, rx, None, stop.clone()));

        let mut expired = SendEntry::new(Bytes::from_static(b"stale"));
        expired.expires = Some(Instant::now());
        tx.send(expired).await.unwrap();
        tx.send(SendEntry::new(Bytes::from_static(b"fresh"))).await.unwrap();
        drop(tx);
        loop_handle.await.unwrap().unwrap();

        let mut got = Vec::new();
        let (mut server_read, _w) = server.into_split();
        server_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(&got, b"fresh");
    }
}

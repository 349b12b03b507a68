//! Cipher-box mailbox contract.
//!
//! A cipher box is a server-mediated, addressable, bidirectional message pipe
//! keyed by a 64-byte stream id. The transport delivers messages at least
//! once, unordered across restarts and authenticated within a message;
//! duplicates are the receiver's problem. The negotiation state machines are
//! written to tolerate exactly that.
//!
//! [`MemoryMailbox`] is a process-local implementation with the same
//! semantics plus a configurable drop policy, used by the integration tests
//! to simulate the lossy relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::clients::KeyDescriptor;
use crate::error::{Error, Result};
use crate::sidecar::Ticket;

/// Address of one mailbox stream.
pub type StreamId = [u8; 64];

/// Upper bound on buffered messages per stream before `send` applies
/// backpressure.
const STREAM_BUFFER: usize = 64;

/// Client contract of the cipher-box server.
///
/// The two `init` flavors mirror the server's authentication modes: ticket
/// streams are authenticated by possession of the ticket, account streams by
/// possession of the account key. An "already exists" answer from either init
/// is not an error for callers re-creating their mailbox after a restart.
#[async_trait]
pub trait CipherBox: Send + Sync {
    /// Creates the stream authenticated by a sidecar ticket.
    async fn init_ticket_mailbox(&self, stream_id: StreamId, ticket: &Ticket) -> Result<()>;

    /// Creates the stream authenticated by an account key.
    async fn init_account_mailbox(&self, stream_id: StreamId, key: &KeyDescriptor) -> Result<()>;

    /// Enqueues one message. Blocks only when the stream's buffer is full.
    async fn send(&self, stream_id: StreamId, msg: &[u8]) -> Result<()>;

    /// Blocks until one message is available. Callers race this against
    /// their shutdown signal.
    async fn recv(&self, stream_id: StreamId) -> Result<Vec<u8>>;

    async fn delete_ticket_mailbox(&self, stream_id: StreamId, ticket: &Ticket) -> Result<()>;

    async fn delete_account_mailbox(&self, stream_id: StreamId, key: &KeyDescriptor)
        -> Result<()>;
}

/// Returns `Ok(())` for the "stream already exists" answer an init call may
/// produce, passing every other result through.
pub fn ok_if_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::MailboxExists) => Ok(()),
        other => other,
    }
}

struct Stream {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    /// Initialized streams survive deletion checks; lazily created ones only
    /// buffer.
    initialized: bool,
    /// Number of upcoming messages to drop, for loss simulation.
    drop_remaining: usize,
}

impl Stream {
    fn new(initialized: bool) -> Self {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        Stream {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            initialized,
            drop_remaining: 0,
        }
    }
}

/// In-memory cipher-box with per-stream bounded queues.
///
/// `send` lazily creates unknown streams, matching a relay that buffers for
/// mailboxes created later; `init` on a lazily created stream claims it
/// rather than failing.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    streams: Arc<Mutex<HashMap<StreamId, Stream>>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently drops the next `count` messages sent to `stream_id`.
    pub fn drop_next(&self, stream_id: StreamId, count: usize) {
        let mut streams = self.streams.lock().expect("mailbox lock");
        streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(false))
            .drop_remaining = count;
    }

    fn init(&self, stream_id: StreamId) -> Result<()> {
        let mut streams = self.streams.lock().expect("mailbox lock");
        match streams.get_mut(&stream_id) {
            Some(stream) if stream.initialized => Err(Error::MailboxExists),
            Some(stream) => {
                stream.initialized = true;
                Ok(())
            }
            None => {
                streams.insert(stream_id, Stream::new(true));
                Ok(())
            }
        }
    }

    fn delete(&self, stream_id: StreamId) -> Result<()> {
        let mut streams = self.streams.lock().expect("mailbox lock");
        streams
            .remove(&stream_id)
            .map(|_| ())
            .ok_or(Error::MailboxClosed)
    }

    fn sender(&self, stream_id: StreamId) -> Option<mpsc::Sender<Vec<u8>>> {
        let mut streams = self.streams.lock().expect("mailbox lock");
        let stream = streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(false));
        if stream.drop_remaining > 0 {
            stream.drop_remaining -= 1;
            return None;
        }
        Some(stream.tx.clone())
    }

    fn receiver(&self, stream_id: StreamId) -> Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>> {
        let mut streams = self.streams.lock().expect("mailbox lock");
        streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(false))
            .rx
            .clone()
    }
}

#[async_trait]
impl CipherBox for MemoryMailbox {
    async fn init_ticket_mailbox(&self, stream_id: StreamId, _ticket: &Ticket) -> Result<()> {
        self.init(stream_id)
    }

    async fn init_account_mailbox(&self, stream_id: StreamId, _key: &KeyDescriptor) -> Result<()> {
        self.init(stream_id)
    }

    async fn send(&self, stream_id: StreamId, msg: &[u8]) -> Result<()> {
        let Some(tx) = self.sender(stream_id) else {
            // Dropped by policy; the sender believes delivery happened.
            return Ok(());
        };
        tx.send(msg.to_vec())
            .await
            .map_err(|_| Error::MailboxClosed)
    }

    async fn recv(&self, stream_id: StreamId) -> Result<Vec<u8>> {
        let rx = self.receiver(stream_id);
        let mut rx = rx.lock().await;
        rx.recv().await.ok_or(Error::MailboxClosed)
    }

    async fn delete_ticket_mailbox(&self, stream_id: StreamId, _ticket: &Ticket) -> Result<()> {
        self.delete(stream_id)
    }

    async fn delete_account_mailbox(
        &self,
        stream_id: StreamId,
        _key: &KeyDescriptor,
    ) -> Result<()> {
        self.delete(stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(byte: u8) -> StreamId {
        [byte; 64]
    }

    #[tokio::test]
    async fn send_then_recv() {
        let mailbox = MemoryMailbox::new();
        mailbox.send(stream(1), b"hello").await.unwrap();
        assert_eq!(mailbox.recv(stream(1)).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn init_twice_reports_exists() {
        let mailbox = MemoryMailbox::new();
        let key = crate::testing::test_key_descriptor(7);

        mailbox.init_account_mailbox(stream(2), &key).await.unwrap();
        let second = mailbox.init_account_mailbox(stream(2), &key).await;
        assert!(matches!(second, Err(Error::MailboxExists)));
        assert!(ok_if_exists(second).is_ok());
    }

    #[tokio::test]
    async fn init_claims_lazily_created_stream() {
        let mailbox = MemoryMailbox::new();
        let key = crate::testing::test_key_descriptor(7);

        // A peer sent before we created our mailbox; the buffered message
        // must survive the init.
        mailbox.send(stream(3), b"early").await.unwrap();
        mailbox.init_account_mailbox(stream(3), &key).await.unwrap();
        assert_eq!(mailbox.recv(stream(3)).await.unwrap(), b"early");
    }

    #[tokio::test]
    async fn drop_policy_loses_messages() {
        let mailbox = MemoryMailbox::new();
        mailbox.drop_next(stream(4), 1);

        mailbox.send(stream(4), b"lost").await.unwrap();
        mailbox.send(stream(4), b"kept").await.unwrap();
        assert_eq!(mailbox.recv(stream(4)).await.unwrap(), b"kept");
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let mailbox = MemoryMailbox::new();
        mailbox.send(stream(5), b"five").await.unwrap();
        mailbox.send(stream(6), b"six").await.unwrap();

        assert_eq!(mailbox.recv(stream(6)).await.unwrap(), b"six");
        assert_eq!(mailbox.recv(stream(5)).await.unwrap(), b"five");
    }
}

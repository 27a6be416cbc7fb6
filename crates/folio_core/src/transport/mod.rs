//! Streaming transport used for replication and media notifications.
//!
//! A [`Transport`] opens a bidirectional frame channel to a URL. The first
//! frame the client sends is its credential (see [`handshake`]); after the
//! server replies `authenticated`, binary frames carry the y-sync protocol.
//!
//! - [`WebSocketTransport`]: tokio-tungstenite client
//! - [`MemoryServer`]: in-process server for tests and embedded use
//! - [`ReplicationSession`]: keeps one document replicated with reconnects

mod backoff;
pub mod handshake;
mod memory;
mod session;
mod websocket;

pub use backoff::Backoff;
pub use handshake::{HandshakeOutcome, HandshakeReply, authenticate};
pub use memory::MemoryServer;
pub use session::{FirstAttempt, ReplicationSession, SessionEvent, SessionOptions, UpdateSender};
pub use websocket::WebSocketTransport;

use tokio::sync::mpsc;
use url::Url;

use crate::BoxFuture;
use crate::error::{FolioError, Result};
use crate::project_key::{DocumentId, ProjectKey};

/// Path of the replicated document channel.
pub const DOCUMENT_CHANNEL_PATH: &str = "/api/v1/ws/yjs";

/// Path of the media notification channel.
pub const MEDIA_CHANNEL_PATH: &str = "/api/v1/ws/media";

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Something that happened on the receiving side of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// The peer closed the connection, with an optional reason.
    Closed(Option<String>),
    /// Network-level failure; the channel is unusable afterwards.
    Error(String),
}

/// An open connection.
///
/// Dropping `outgoing` closes the connection.
#[derive(Debug)]
pub struct TransportChannel {
    pub outgoing: mpsc::UnboundedSender<Frame>,
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportChannel {
    /// Queue a frame. Returns `false` when the connection is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outgoing.send(frame).is_ok()
    }
}

/// Opens frame channels.
pub trait Transport: Send + Sync {
    fn open<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<TransportChannel>>;
}

fn channel_url(base: &str, path: &str, query: &str) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| FolioError::InvalidConfig(format!("Invalid transport URL '{}': {}", base, e)))?;
    let prefix = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}{}", prefix, path));
    url.set_query(Some(query));
    Ok(url)
}

/// `<base>/api/v1/ws/yjs?documentId=<owner>:<slug>:<suffix>`
pub fn document_url(base: &str, document: &DocumentId) -> Result<Url> {
    channel_url(base, DOCUMENT_CHANNEL_PATH, &format!("documentId={}", document))
}

/// `<base>/api/v1/ws/media?projectKey=<owner>/<slug>`
pub fn media_url(base: &str, project: &ProjectKey) -> Result<Url> {
    channel_url(base, MEDIA_CHANNEL_PATH, &format!("projectKey={}", project))
}

/// Decoded value of a query parameter.
pub(crate) fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

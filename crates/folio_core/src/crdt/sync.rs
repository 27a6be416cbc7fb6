//! Y-sync binary framing used after the authentication handshake.
//!
//! # Wire Format (y-protocols compatible)
//!
//! Messages use varUint encoding (7 bits per byte, MSB = continuation):
//! - `varUint(0)`: Sync message type
//!   - `varUint(0)`: SyncStep1, payload is a state vector
//!   - `varUint(1)`: SyncStep2, payload is the update the peer is missing
//!   - `varUint(2)`: Update, payload is an incremental update
//! - other message types (awareness, auth) are ignored
//!
//! Byte arrays are encoded as `varUint(length) + raw bytes`.
//!
//! A client opens with SyncStep1. The server answers with SyncStep2, which is
//! the convergence signal, and may send its own SyncStep1, which the client
//! answers with SyncStep2. Afterwards both sides exchange Update frames.

use super::project_doc::ProjectDoc;
use super::storage::StorageResult;
use super::types::UpdateOrigin;
use super::worldbuilding_doc::WorldbuildingDoc;
use crate::error::FolioError;

fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Returns `(value, bytes_consumed)`, or `None` if truncated or overflowing.
fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        let shift = 7 * i as u32;
        if shift > 63 {
            return None;
        }
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
    }
    None
}

const MSG_SYNC: u64 = 0;
const SYNC_STEP1: u64 = 0;
const SYNC_STEP2: u64 = 1;
const SYNC_UPDATE: u64 = 2;

/// One y-sync message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn encode(&self) -> Vec<u8> {
        let (sync_type, payload) = match self {
            SyncMessage::SyncStep1(sv) => (SYNC_STEP1, sv),
            SyncMessage::SyncStep2(update) => (SYNC_STEP2, update),
            SyncMessage::Update(update) => (SYNC_UPDATE, update),
        };
        let mut buf = Vec::with_capacity(payload.len() + 8);
        write_var_uint(&mut buf, MSG_SYNC);
        write_var_uint(&mut buf, sync_type);
        write_var_uint(&mut buf, payload.len() as u64);
        buf.extend_from_slice(payload);
        buf
    }

    /// Decode every sync sub-message of a frame.
    ///
    /// Non-sync frames decode to an empty list. Servers may pack several
    /// sub-messages (e.g. SyncStep2 followed by SyncStep1) into one frame.
    pub fn decode_all(data: &[u8]) -> StorageResult<Vec<Self>> {
        let mut messages = Vec::new();
        let Some((msg_type, mut offset)) = read_var_uint(data) else {
            return Ok(messages);
        };
        if msg_type != MSG_SYNC {
            log::debug!("[Y-sync] Ignoring message type {}", msg_type);
            return Ok(messages);
        }

        while offset < data.len() {
            let rest = &data[offset..];
            let (sync_type, type_len) = read_var_uint(rest)
                .ok_or_else(|| FolioError::Crdt("Truncated sync type".to_string()))?;
            let (payload_len, len_len) = read_var_uint(&rest[type_len..])
                .ok_or_else(|| FolioError::Crdt("Truncated payload length".to_string()))?;
            let start = type_len + len_len;
            let end = start
                .checked_add(payload_len as usize)
                .filter(|end| *end <= rest.len())
                .ok_or_else(|| FolioError::Crdt("Truncated payload".to_string()))?;
            let payload = rest[start..end].to_vec();

            messages.push(match sync_type {
                SYNC_STEP1 => SyncMessage::SyncStep1(payload),
                SYNC_STEP2 => SyncMessage::SyncStep2(payload),
                SYNC_UPDATE => SyncMessage::Update(payload),
                other => {
                    return Err(FolioError::Crdt(format!("Unknown sync type: {}", other)));
                }
            });
            offset += end;
        }
        Ok(messages)
    }
}

/// A replicated document that can take part in the y-sync exchange.
pub trait SyncTarget: Send + Sync {
    fn state_vector(&self) -> Vec<u8>;

    fn diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>>;

    /// Apply and persist a remote update.
    fn apply_remote(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()>;
}

impl SyncTarget for ProjectDoc {
    fn state_vector(&self) -> Vec<u8> {
        self.encode_state_vector()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        self.encode_diff(remote_state_vector)
    }

    fn apply_remote(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()> {
        self.apply_update(update, origin)
    }
}

impl SyncTarget for WorldbuildingDoc {
    fn state_vector(&self) -> Vec<u8> {
        self.encode_state_vector()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        self.encode_diff(remote_state_vector)
    }

    fn apply_remote(&self, update: &[u8], origin: UpdateOrigin) -> StorageResult<()> {
        self.apply_update(update, origin)
    }
}

/// Result of feeding one message to a [`SyncTarget`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Message to send back, if any.
    pub reply: Option<SyncMessage>,
    /// The peer's SyncStep2 was applied.
    pub converged: bool,
}

/// Handle one incoming message against `target`.
pub fn handle_message(target: &dyn SyncTarget, message: SyncMessage) -> StorageResult<SyncOutcome> {
    match message {
        SyncMessage::SyncStep1(remote_sv) => {
            let diff = target.diff(&remote_sv)?;
            Ok(SyncOutcome {
                reply: Some(SyncMessage::SyncStep2(diff)),
                converged: false,
            })
        }
        SyncMessage::SyncStep2(update) => {
            target.apply_remote(&update, UpdateOrigin::Sync)?;
            Ok(SyncOutcome {
                reply: None,
                converged: true,
            })
        }
        SyncMessage::Update(update) => {
            target.apply_remote(&update, UpdateOrigin::Remote)?;
            Ok(SyncOutcome::default())
        }
    }
}

//! Wire protocol helpers.
//!
//! Frames are `yrs::sync::Message` values in their v1 encoding: a message
//! kind varint (0 = document sync, 1 = awareness) followed by the payload.
//! This module owns the outbound frame builders and the close codes; frame
//! *interpretation* lives in [`crate::room`], next to the document state it
//! mutates.

use std::fmt;
use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

/// Websocket close codes used by the relay.
pub mod close_code {
    /// Orderly teardown, e.g. server shutdown.
    pub const NORMAL: u16 = 1000;
    /// The peer sent something the relay does not speak: a non-binary
    /// payload, an undecodable frame, or an unsupported message kind.
    pub const UNSUPPORTED: u16 = 1003;
    /// A server-side failure, e.g. a document that could not be loaded.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Application-range code for a peer that stopped answering pings.
    pub const PING_TIMEOUT: u16 = 4000;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame could not be decoded as a protocol message.
    Malformed(String),
    /// The frame decoded to a message kind the relay does not handle.
    UnsupportedKind(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(e) => write!(f, "malformed frame: {e}"),
            ProtocolError::UnsupportedKind(kind) => {
                write!(f, "unsupported message kind: {kind}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Decode a binary frame into a protocol message.
pub fn decode_frame(data: &[u8]) -> Result<Message, ProtocolError> {
    Message::decode_v1(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Human-readable name for a message kind, for logs and errors.
pub fn kind_name(msg: &Message) -> &'static str {
    match msg {
        Message::Sync(_) => "sync",
        Message::Awareness(_) => "awareness",
        Message::AwarenessQuery => "awareness-query",
        Message::Auth(_) => "auth",
        Message::Custom(_, _) => "custom",
    }
}

/// SyncStep1 carrying the document's current state vector. First frame of
/// the bootstrap sequence for a newly attached connection.
pub fn sync_step1(doc: &Doc) -> Vec<u8> {
    let sv = doc.transact().state_vector();
    Message::Sync(SyncMessage::SyncStep1(sv)).encode_v1()
}

/// SyncStep2 with the diff the remote is missing, per its state vector.
pub fn sync_step2(doc: &Doc, remote: &StateVector) -> Vec<u8> {
    let diff = doc.transact().encode_diff_v1(remote);
    Message::Sync(SyncMessage::SyncStep2(diff)).encode_v1()
}

/// An incremental document update, re-framed for broadcast.
pub fn sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode_v1()
}

/// An awareness (presence) update frame.
pub fn awareness_frame(update: AwarenessUpdate) -> Vec<u8> {
    Message::Awareness(update).encode_v1()
}

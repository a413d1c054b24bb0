//! Peer session wire protocol: message variants and bridge method names.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Bridge method names. One per remote procedure a peer can invoke.
pub mod method {
    pub const TEXT: &str = "text";
    pub const FILE_CHUNK: &str = "file-chunk";
    pub const ACK_CHUNK: &str = "ack-chunk";
    pub const TYPING: &str = "typing";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const END_CALL: &str = "end-call";
}

/// A text event typed by one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEvent {
    pub sender_id: String,
    pub created_at: u64,
    pub msg: String,
}

/// One chunk of a file. Every chunk carries the full file metadata so the receiver can
/// initialize its state from whichever chunk it sees first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub sender_id: String,
    pub created_at: u64,
    pub msg: String,
    pub file_id: String,
    pub file_name: String,
    pub chunk_index: u32,
    pub chunk: Bytes,
    pub total_bytes: u64,
    pub total_chunks: u32,
}

/// Receiver's acknowledgement of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckChunk {
    pub file_id: String,
    pub chunk_index_received: u32,
    pub bytes_received: u64,
}

/// All payloads carried inside an envelope. Encoding is bincode, which tags each variant
/// with its index, so decoding is exhaustive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Text(TextEvent),
    FileChunk(FileChunk),
    AckChunk(AckChunk),
    Typing,
    Heartbeat,
    EndCall,
}

impl Message {
    /// Bridge method that carries this payload as a request.
    pub fn method(&self) -> &'static str {
        match self {
            Message::Text(_) => method::TEXT,
            Message::FileChunk(_) => method::FILE_CHUNK,
            Message::AckChunk(_) => method::ACK_CHUNK,
            Message::Typing => method::TYPING,
            Message::Heartbeat => method::HEARTBEAT,
            Message::EndCall => method::END_CALL,
        }
    }
}

//! Registry wire protocol
//!
//! This module defines the messages exchanged between workers and the
//! coordinator's registry server. Messages are serialized with MessagePack
//! (rmp-serde) for full serde feature support and framed with a 4-byte
//! little-endian length prefix:
//!
//! ```text
//! [4 bytes: message length (little-endian u32)][N bytes: MessagePack message]
//! ```
//!
//! # Message Flow
//!
//! ```text
//! Worker                         Coordinator
//!   |-------- HELLO(secret) -------->|
//!   |<------- HELLO_ACK -------------|      (or ERROR + close on bad secret)
//!   |                                |
//!   |-------- FETCH_ALL ------------>|
//!   |<------- TASKS(snapshot) -------|
//!   |                                |
//!   |---- PROPOSE_IMPROVEMENT ------>|
//!   |<--- PROPOSE_OUTCOME(accepted) -|
//!   |                                |
//!   |---- RECORD_EXHAUSTED --------->|
//!   |<--- EXHAUSTED_ACK -------------|
//! ```
//!
//! Every mutation is a single round trip resolved inside one server-side
//! critical section; the protocol deliberately has no "write task" message
//! that a client could use for a read-modify-write sequence.

use crate::registry::CurveTask;
use anyhow::{Context, Result};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// Coordinator and workers must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Protocol message
///
/// All messages exchanged between workers and the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Handshake (Worker → Coordinator)
    ///
    /// First message on every connection. The coordinator refuses the
    /// connection with an `Error` reply if the secret does not match; no
    /// registry state is exchanged before the handshake succeeds.
    Hello(HelloMessage),

    /// Handshake accepted (Coordinator → Worker)
    HelloAck(HelloAckMessage),

    /// Request a full registry snapshot (Worker → Coordinator)
    FetchAll,

    /// Registry snapshot (Coordinator → Worker)
    Tasks(TasksMessage),

    /// Atomically propose a better curve for one task (Worker → Coordinator)
    ProposeImprovement(ProposeImprovementMessage),

    /// Outcome of a propose operation (Coordinator → Worker)
    ProposeOutcome(ProposeOutcomeMessage),

    /// Credit a batch of trials that found nothing (Worker → Coordinator)
    RecordExhausted(RecordExhaustedMessage),

    /// Acknowledgment of a RECORD_EXHAUSTED (Coordinator → Worker)
    ExhaustedAck,

    /// Error reply (Coordinator → Worker)
    ///
    /// Sent for authentication failures, version mismatches and unknown
    /// task names.
    Error(ErrorMessage),
}

/// Handshake message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version (must match)
    pub protocol_version: u32,

    /// Shared secret supplied out-of-band
    pub secret: String,
}

/// Handshake acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAckMessage {
    /// Protocol version
    pub protocol_version: u32,

    /// Number of tasks the registry currently holds
    pub task_count: usize,
}

/// Registry snapshot message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksMessage {
    /// Consistent snapshot of every task at call time
    pub tasks: Vec<CurveTask>,
}

/// Propose improvement message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeImprovementMessage {
    /// Task being improved
    pub name: String,

    /// The best score the worker observed when it fetched the task
    ///
    /// Carried for diagnostics; acceptance is decided against the
    /// registry's current value on the server side.
    pub observed_best: f64,

    /// Smoothness score of the candidate curve
    pub candidate_score: f64,

    /// Candidate curve coefficient a
    pub a: BigUint,

    /// Candidate curve coefficient b
    pub b: BigUint,

    /// Trials consumed to find this candidate (including the hit)
    pub samples_delta: u64,
}

/// Propose outcome message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeOutcomeMessage {
    /// Whether the candidate replaced the registry's best curve
    pub accepted: bool,

    /// The registry's best score after the operation
    pub current_best: f64,
}

/// Record exhausted batch message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordExhaustedMessage {
    /// Task the batch was run against
    pub name: String,

    /// Number of trials in the exhausted batch
    pub samples_delta: u64,
}

/// Error message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error description
    pub error: String,
}

/// Serialize a message to bytes with the 4-byte length prefix
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from bytes
///
/// Expects a 4-byte length prefix followed by a MessagePack message.
/// Returns (message, bytes_consumed) where bytes_consumed includes the
/// length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!(
            "Buffer too small for message length (need 4 bytes, got {})",
            buf.len()
        );
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + msg_len {
        anyhow::bail!(
            "Incomplete message (need {} bytes, got {})",
            4 + msg_len,
            buf.len()
        );
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read a complete message from a TCP stream
///
/// Reads the length prefix, then the complete message body.
pub async fn read_message(stream: &mut tokio::net::TcpStream) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;

    // Sanity check: a full snapshot of a large dataset is well under this
    if msg_len > 64 * 1024 * 1024 {
        anyhow::bail!("Message too large: {} bytes (max 64MB)", msg_len);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream
        .read_exact(&mut msg_buf)
        .await
        .context("Failed to read message body")?;

    let msg = rmp_serde::from_slice(&msg_buf).context("Failed to deserialize message")?;

    Ok(msg)
}

/// Write a message to a TCP stream
pub async fn write_message(stream: &mut tokio::net::TcpStream, msg: &Message) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let framed = serialize_message(msg)?;

    stream
        .write_all(&framed)
        .await
        .context("Failed to write message")?;

    // Flush to ensure the message is sent immediately
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

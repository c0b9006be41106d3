//! Wire codec and protocol command names.
//!
//! Every frame is one [`Envelope`] serialized as compact JSON followed by a
//! `\n`. The challenge-phase frames use the same shape with group
//! [`CHALLENGE_GROUP`].

use crate::error::WireError;
use copilot_types::Envelope;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted line, excluding the newline.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Group of the frames exchanged before a session is established.
pub const CHALLENGE_GROUP: &str = "challenge";
/// Group of the transport's bus commands and events.
pub const TLS_GROUP: &str = "tls";

pub const CMD_NEW_SECRET: &str = "newSecret";
pub const CMD_NEW_SECRET_SAVED: &str = "newSecretSaved";
pub const CMD_CHALLENGE_REQUEST: &str = "challengeRequest";
pub const CMD_CHALLENGE_RESPONSE: &str = "challengeResponse";

pub const EVT_NODE_REQ: &str = "nodeReq";
pub const EVT_NODE_CONNECTED: &str = "nodeConnected";
pub const EVT_NODE_DISCONNECT: &str = "nodeDisconnect";

pub const CMD_NODE_ACCEPT: &str = "nodeAccept";
pub const CMD_NODE_REJECT: &str = "nodeReject";
pub const CMD_NODE_ADD: &str = "nodeAdd";
pub const CMD_NODE_DELETE: &str = "nodeDelete";
pub const CMD_ERROR: &str = "error";

/// Encode an envelope as one wire line, newline included.
pub fn encode_line(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(envelope)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode one wire line. A trailing `\n` or `\r\n` is ignored.
pub fn decode_line(line: &[u8]) -> Result<Envelope, WireError> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.len() > MAX_LINE_LEN {
        return Err(WireError::LineTooLong { max: MAX_LINE_LEN });
    }
    Ok(serde_json::from_slice(line)?)
}

/// Read the next envelope from a buffered stream.
///
/// Returns [`WireError::ConnectionClosed`] on a clean end of stream. Never
/// buffers more than [`MAX_LINE_LEN`] bytes of a single line.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Envelope, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_LINE_LEN as u64 + 1;
    let n = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Err(WireError::ConnectionClosed);
    }
    if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
        return Err(WireError::LineTooLong { max: MAX_LINE_LEN });
    }
    decode_line(&buf)
}

/// Write one envelope as a line and flush.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_line(envelope)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

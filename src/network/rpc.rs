//! Wire messages for peer-to-peer communication.
//!
//! Frames are a 4-byte big-endian length followed by a bincode body, capped
//! at [`MAX_FRAME_SIZE`]. The same framing is used in both directions.

use crate::error::{Error, NetworkError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Request sent to a peer node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Request {
    /// Fetch a value from the peer's group.
    Get { group: String, key: String },

    /// Delete a key from the peer's group.
    Delete { group: String, key: String },
}

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// The request itself was malformed (empty key, unknown group).
    BadRequest,
    /// The value does not exist.
    NotFound,
    /// The peer failed internally.
    Internal,
}

/// Response returned by a peer node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Response {
    /// Value bytes for a successful `Get`.
    Value(Vec<u8>),

    /// Outcome of a `Delete`.
    Deleted(bool),

    /// The request failed on the peer.
    Error {
        kind: RemoteErrorKind,
        message: String,
    },
}

impl Response {
    /// Map a local error into its wire representation. Coalesced-waiter
    /// wrappers are peeled so the underlying kind crosses the wire.
    pub fn from_error(err: &Error) -> Self {
        let err = err.unshared();
        let kind = if err.is_caller_error() {
            RemoteErrorKind::BadRequest
        } else if matches!(err, Error::NotFound) {
            RemoteErrorKind::NotFound
        } else {
            RemoteErrorKind::Internal
        };
        Response::Error {
            kind,
            message: err.to_string(),
        }
    }

    /// Map a wire error back into a local error on the requesting side.
    pub fn into_error(kind: RemoteErrorKind, message: String) -> Error {
        match kind {
            RemoteErrorKind::NotFound => Error::NotFound,
            RemoteErrorKind::BadRequest | RemoteErrorKind::Internal => Error::Remote(message),
        }
    }
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(Error::from)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data)
        .map_err(|e| NetworkError::Deserialization(e.to_string()).into())
}

/// Write one length-prefixed message.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = encode(msg)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(data.len()).into());
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed message. Returns `None` on a clean EOF before
/// the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(len).into());
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(NetworkError::Io)?;
    Ok(Some(decode(&data)?))
}

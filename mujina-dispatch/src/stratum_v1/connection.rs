//! Line-delimited JSON over TCP.
//!
//! The stream is split so the receive loop and the share sender can own
//! their halves independently.

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;
use crate::tracing::prelude::*;

/// Longest line accepted from a pool.
const MAX_LINE: usize = 64 * 1024;

impl From<LinesCodecError> for StratumError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(e) => StratumError::Io(e),
            LinesCodecError::MaxLineLengthExceeded => {
                StratumError::InvalidMessage(format!("line longer than {MAX_LINE} bytes"))
            }
        }
    }
}

/// Receiving half of a stratum connection.
pub struct MessageReader {
    inner: FramedRead<OwnedReadHalf, LinesCodec>,
}

/// Sending half of a stratum connection.
pub struct MessageWriter {
    inner: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

/// Connect to `addr` (`host:port`).
pub async fn connect(addr: &str) -> StratumResult<(MessageReader, MessageWriter)> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(split(stream))
}

pub fn split(stream: TcpStream) -> (MessageReader, MessageWriter) {
    let (read, write) = stream.into_split();
    (
        MessageReader {
            inner: FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE)),
        },
        MessageWriter {
            inner: FramedWrite::new(write, LinesCodec::new()),
        },
    )
}

impl MessageReader {
    /// Next message, or `None` once the pool closes the connection.
    /// Blank lines are skipped.
    pub async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        loop {
            let Some(line) = self.inner.next().await.transpose()? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!(rx = line, "Stratum message");
            return Ok(Some(serde_json::from_str(line)?));
        }
    }
}

impl MessageWriter {
    pub async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let line = serde_json::to_string(msg)?;
        trace!(tx = %line, "Stratum message");
        self.inner.send(line).await?;
        Ok(())
    }
}

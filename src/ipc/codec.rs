//! One JSON document per line.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use super::IpcError;

/// Serialize `message` and write it followed by `\n`.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

pub struct MessageReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next message, or `None` at end of stream. Blank lines are skipped.
    /// A line that does not parse is consumed and reported as
    /// [`IpcError::Malformed`]; reading can continue afterwards.
    ///
    /// Cancel safe, so it can be used as a `select!` branch.
    pub async fn read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>, IpcError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
    }
}

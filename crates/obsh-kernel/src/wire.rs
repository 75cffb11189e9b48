//! Newline-delimited JSON framing for child channels.
//!
//! Every message between a parent and a worker, runner or job is one JSON
//! document on one line. Results travel as [`Frame`]s and end with
//! [`Frame::End`]; a channel that closes without `End` was truncated.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use obsh_types::Frame;

use crate::error::WireError;

/// Read one JSON line. `Ok(None)` at end of input.
///
/// Blank lines are skipped.
pub async fn read_json_line<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(serde_json::from_str(trimmed)?));
        }
    }
}

/// Write one value as a JSON line and flush it.
pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads result frames and tracks whether the stream ended cleanly.
pub struct FrameReader<R> {
    inner: R,
    ended: bool,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            ended: false,
        }
    }

    /// Next frame, or `None` once the channel is exhausted.
    ///
    /// Nothing is read after [`Frame::End`].
    pub async fn next(&mut self) -> Result<Option<Frame>, WireError> {
        if self.ended {
            return Ok(None);
        }
        let frame: Option<Frame> = read_json_line(&mut self.inner).await?;
        if matches!(frame, Some(Frame::End)) {
            self.ended = true;
        }
        Ok(frame)
    }

    /// Whether the end marker has been seen.
    pub fn ended(&self) -> bool {
        self.ended
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writes result frames.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write(&mut self, frame: &Frame) -> Result<(), WireError> {
        write_json_line(&mut self.inner, frame).await
    }

    /// Write the end marker and shut the channel down.
    pub async fn finish(&mut self) -> Result<(), WireError> {
        self.write(&Frame::End).await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsh_types::{ErrorValue, Value};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_frames_through_a_buffer() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write(&Frame::Data(Value::Int(1))).await.unwrap();
            writer
                .write(&Frame::Error(ErrorValue::new("bad")))
                .await
                .unwrap();
            writer.finish().await.unwrap();
        }

        let mut reader = FrameReader::new(BufReader::new(buf.as_slice()));
        assert_eq!(reader.next().await.unwrap(), Some(Frame::Data(Value::Int(1))));
        assert!(matches!(reader.next().await.unwrap(), Some(Frame::Error(_))));
        assert_eq!(reader.next().await.unwrap(), Some(Frame::End));
        assert!(reader.ended());
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_truncated_stream_has_no_end() {
        let data = b"{\"kind\":\"data\",\"body\":{\"Int\":0}}\n";
        let mut reader = FrameReader::new(BufReader::new(&data[..]));
        assert!(reader.next().await.unwrap().is_some());
        assert_eq!(reader.next().await.unwrap(), None);
        assert!(!reader.ended());
    }

    #[tokio::test]
    async fn test_malformed_line() {
        let mut reader = FrameReader::new(BufReader::new(&b"not json\n"[..]));
        assert!(matches!(reader.next().await, Err(WireError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let data = b"\n\n42\n";
        let mut reader = BufReader::new(&data[..]);
        let n: Option<i32> = read_json_line(&mut reader).await.unwrap();
        assert_eq!(n, Some(42));
    }
}

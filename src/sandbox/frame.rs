//! Demultiplexer for the Docker attach stream.
//!
//! A non-TTY container's attached output is a sequence of frames:
//!
//! ```text
//! +------+-------+-------+-------+-------+-------+-------+-------+---------+
//! | type |   0   |   0   |   0   |            length (u32, BE)   | payload |
//! +------+-------+-------+-------+-------+-------+-------+-------+---------+
//! ```
//!
//! The type byte (stdout/stderr) is ignored and payloads are concatenated.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, ReadBuf};

pub const HEADER_LEN: usize = 8;

/// Largest payload a single frame may announce. The daemon splits output
/// into frames of a few kilobytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

enum State {
    Header { filled: usize },
    Payload { filled: usize },
    Emit { pos: usize },
    Done,
}

/// `AsyncRead` over the payload bytes of a framed stream.
///
/// A frame is fully buffered before any of it is handed out. End of input is
/// only accepted on a frame boundary; a truncated header or payload is an
/// `UnexpectedEof` error. A header announcing more than [`MAX_FRAME_LEN`]
/// bytes is `InvalidData`.
pub struct FrameReader<R> {
    inner: R,
    header: [u8; HEADER_LEN],
    payload: Vec<u8>,
    state: State,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: [0; HEADER_LEN],
            payload: Vec::new(),
            state: State::Header { filled: 0 },
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn payload_len(header: &[u8; HEADER_LEN]) -> usize {
    u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize
}

impl<R: AsyncRead + Unpin> AsyncRead for FrameReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.state {
                State::Header { filled } => {
                    if filled == HEADER_LEN {
                        let len = payload_len(&this.header);
                        if len > MAX_FRAME_LEN {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                format!("frame of {} bytes exceeds {} bytes", len, MAX_FRAME_LEN),
                            )));
                        }
                        this.payload.clear();
                        this.payload.resize(len, 0);
                        this.state = State::Payload { filled: 0 };
                        continue;
                    }
                    let mut chunk = ReadBuf::new(&mut this.header[filled..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
                    let n = chunk.filled().len();
                    if n == 0 {
                        if filled == 0 {
                            this.state = State::Done;
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("stream ended inside a frame header ({} of {} bytes)", filled, HEADER_LEN),
                        )));
                    }
                    this.state = State::Header { filled: filled + n };
                }
                State::Payload { filled } => {
                    if filled == this.payload.len() {
                        this.state = State::Emit { pos: 0 };
                        continue;
                    }
                    let mut chunk = ReadBuf::new(&mut this.payload[filled..]);
                    ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
                    let n = chunk.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "stream ended inside a frame payload ({} of {} bytes)",
                                filled,
                                this.payload.len()
                            ),
                        )));
                    }
                    this.state = State::Payload { filled: filled + n };
                }
                State::Emit { pos } => {
                    if pos == this.payload.len() {
                        this.state = State::Header { filled: 0 };
                        continue;
                    }
                    let n = buf.remaining().min(this.payload.len() - pos);
                    buf.put_slice(&this.payload[pos..pos + n]);
                    this.state = State::Emit { pos: pos + n };
                    return Poll::Ready(Ok(()));
                }
                State::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Read `reader` to the end as text lines, without their `\n`/`\r\n`
/// terminators. Invalid UTF-8 is replaced rather than rejected.
///
/// More than `limit` bytes in total is an `InvalidData` error; nothing past
/// the limit is buffered.
pub async fn read_lines<R: AsyncBufRead + Unpin>(reader: R, limit: usize) -> io::Result<Vec<String>> {
    let mut reader = reader.take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1));
    let mut lines = Vec::new();
    let mut line = Vec::new();
    let mut total = 0usize;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        total += n;
        if total > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("output exceeds {} bytes", limit),
            ));
        }
        let text = String::from_utf8_lossy(&line);
        lines.push(text.trim_end_matches(['\n', '\r']).to_string());
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![stream, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    async fn decode(bytes: Vec<u8>) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        FrameReader::new(bytes.as_slice()).read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_frames_concatenate() {
        let mut bytes = frame(1, b"hello");
        bytes.extend(frame(2, b", world"));
        assert_eq!(decode(bytes).await.unwrap(), b"hello, world");
    }

    #[tokio::test]
    async fn test_payload_larger_than_read_buffer() {
        let payload: Vec<u8> = (0..257u32).map(|i| (i % 251) as u8).collect();
        let mut reader = FrameReader::new(std::io::Cursor::new(frame(1, &payload)));
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let mut bytes = frame(1, &[7u8; 257]);
        bytes.truncate(HEADER_LEN + 128);
        let err = decode(bytes).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let mut bytes = frame(1, b"ok");
        bytes.extend_from_slice(&[1, 0, 0]);
        let err = decode(bytes).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_empty_stream_and_empty_frames() {
        assert!(decode(Vec::new()).await.unwrap().is_empty());

        let mut bytes = frame(1, b"");
        bytes.extend(frame(1, b"x"));
        bytes.extend(frame(2, b""));
        assert_eq!(decode(bytes).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_fragmented_transport() {
        // A tiny pipe forces the header and payload to arrive in pieces.
        let (mut tx, rx) = tokio::io::duplex(3);
        let writer = tokio::spawn(async move {
            let mut bytes = frame(1, b"first line\nsecond ");
            bytes.extend(frame(2, b"line\r\nno newline"));
            tx.write_all(&bytes).await.unwrap();
        });
        let lines = read_lines(BufReader::new(FrameReader::new(rx)), 1024).await.unwrap();
        writer.await.unwrap();
        assert_eq!(lines, vec!["first line", "second line", "no newline"]);
    }

    #[tokio::test]
    async fn test_read_lines_propagates_decode_error() {
        let mut bytes = frame(1, b"line\n");
        bytes.extend_from_slice(&[1, 0, 0, 0, 0, 0, 0, 9, b'a']);
        let result = read_lines(BufReader::new(FrameReader::new(bytes.as_slice())), 1024).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_header_is_rejected() {
        let mut bytes = vec![1, 0, 0, 0];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = decode(bytes).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_lines_caps_total_output() {
        let bytes = frame(1, b"0123456789\nabcdefghij\n");
        let lines = read_lines(BufReader::new(FrameReader::new(bytes.as_slice())), 22)
            .await
            .unwrap();
        assert_eq!(lines, vec!["0123456789", "abcdefghij"]);

        let err = read_lines(BufReader::new(FrameReader::new(bytes.as_slice())), 21)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        // A single endless line is cut off at the limit
        let endless = frame(1, &[b'x'; 4096]);
        let err = read_lines(BufReader::new(FrameReader::new(endless.as_slice())), 100)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

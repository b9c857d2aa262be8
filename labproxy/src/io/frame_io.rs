//! Frame streams over `std::io` (client) and `tokio::io` (server).
//!
//! Readers hand out one header at a time. The caller then either buffers the
//! payload (`read_payload`, bounded by [`MAX_INLINE_LEN`]), streams it into a
//! writer (`copy_payload`), or discards it (`skip_payload`). Each of these
//! also consumes the CRLF trailer.

use std::io::{self, BufRead, Read, Write};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite};

use crate::core::frame::{FrameError, FrameHeader, MAX_HEADER_LINE, MAX_INLINE_LEN};

#[derive(Debug, Error)]
pub enum FrameIoError {
    #[error("stream ended before the end marker")]
    UnexpectedEof,
    #[error("frame header exceeds {MAX_HEADER_LINE} bytes")]
    HeaderTooLong,
    #[error("frame header is not valid UTF-8")]
    HeaderEncoding,
    #[error("frame payload of {0} bytes exceeds the inline limit")]
    TooLarge(usize),
    #[error("frame does not end with CRLF")]
    MissingTrailer,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameIoError {
    fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameIoError::UnexpectedEof
        } else {
            FrameIoError::Io(err)
        }
    }
}

/// Render a complete frame (header, payload, trailer).
pub fn encode_frame(header: FrameHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let line = header.with_len(payload.len()).format()?;
    let mut buf = Vec::with_capacity(line.len() + payload.len() + 2);
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}

fn parse_line(line: Vec<u8>) -> Result<FrameHeader, FrameIoError> {
    if line.is_empty() {
        return Err(FrameIoError::UnexpectedEof);
    }
    if line.last() != Some(&b'\n') {
        return Err(if line.len() >= MAX_HEADER_LINE {
            FrameIoError::HeaderTooLong
        } else {
            FrameIoError::UnexpectedEof
        });
    }
    let line = String::from_utf8(line).map_err(|_| FrameIoError::HeaderEncoding)?;
    Ok(FrameHeader::parse(&line)?)
}

fn check_inline(header: &FrameHeader) -> Result<(), FrameIoError> {
    if header.len > MAX_INLINE_LEN {
        Err(FrameIoError::TooLarge(header.len))
    } else {
        Ok(())
    }
}

/// Blocking frame reader.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn next_header(&mut self) -> Result<FrameHeader, FrameIoError> {
        let mut line = Vec::new();
        (&mut self.inner)
            .take(MAX_HEADER_LINE as u64)
            .read_until(b'\n', &mut line)?;
        parse_line(line)
    }

    pub fn read_payload(&mut self, header: &FrameHeader) -> Result<Vec<u8>, FrameIoError> {
        check_inline(header)?;
        let mut payload = vec![0u8; header.len];
        self.inner
            .read_exact(&mut payload)
            .map_err(FrameIoError::from_read)?;
        self.read_trailer()?;
        Ok(payload)
    }

    pub fn copy_payload<W: Write>(
        &mut self,
        header: &FrameHeader,
        dst: &mut W,
    ) -> Result<u64, FrameIoError> {
        let expected = header.len as u64;
        let copied = io::copy(&mut (&mut self.inner).take(expected), dst)?;
        if copied < expected {
            return Err(FrameIoError::UnexpectedEof);
        }
        self.read_trailer()?;
        Ok(copied)
    }

    pub fn skip_payload(&mut self, header: &FrameHeader) -> Result<(), FrameIoError> {
        self.copy_payload(header, &mut io::sink()).map(|_| ())
    }

    fn read_trailer(&mut self) -> Result<(), FrameIoError> {
        let mut trailer = [0u8; 2];
        self.inner
            .read_exact(&mut trailer)
            .map_err(FrameIoError::from_read)?;
        if &trailer != b"\r\n" {
            return Err(FrameIoError::MissingTrailer);
        }
        Ok(())
    }
}

/// Async frame reader for request bodies on the server.
pub struct AsyncFrameReader<R> {
    inner: R,
}

impl<R: AsyncBufRead + Unpin> AsyncFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub async fn next_header(&mut self) -> Result<FrameHeader, FrameIoError> {
        let mut line = Vec::new();
        (&mut self.inner)
            .take(MAX_HEADER_LINE as u64)
            .read_until(b'\n', &mut line)
            .await?;
        parse_line(line)
    }

    pub async fn read_payload(&mut self, header: &FrameHeader) -> Result<Vec<u8>, FrameIoError> {
        check_inline(header)?;
        let mut payload = vec![0u8; header.len];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(FrameIoError::from_read)?;
        self.read_trailer().await?;
        Ok(payload)
    }

    pub async fn copy_payload<W: AsyncWrite + Unpin>(
        &mut self,
        header: &FrameHeader,
        dst: &mut W,
    ) -> Result<u64, FrameIoError> {
        let expected = header.len as u64;
        let copied = tokio::io::copy(&mut (&mut self.inner).take(expected), dst).await?;
        if copied < expected {
            return Err(FrameIoError::UnexpectedEof);
        }
        self.read_trailer().await?;
        Ok(copied)
    }

    pub async fn skip_payload(&mut self, header: &FrameHeader) -> Result<(), FrameIoError> {
        self.copy_payload(header, &mut tokio::io::sink())
            .await
            .map(|_| ())
    }

    async fn read_trailer(&mut self) -> Result<(), FrameIoError> {
        let mut trailer = [0u8; 2];
        self.inner
            .read_exact(&mut trailer)
            .await
            .map_err(FrameIoError::from_read)?;
        if &trailer != b"\r\n" {
            return Err(FrameIoError::MissingTrailer);
        }
        Ok(())
    }
}

/// Read a body to completion, discarding it. Used to drain a rejected request.
pub async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<u64> {
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{END_MARKER, FrameId};
    use std::io::Cursor;

    fn body(frames: &[Vec<u8>]) -> Vec<u8> {
        let mut buf: Vec<u8> = frames.concat();
        buf.extend_from_slice(END_MARKER);
        buf
    }

    #[test]
    fn encodes_frame_with_length_and_trailer() {
        let frame = encode_frame(FrameHeader::new(FrameId::Stdout), b"hello").expect("encode");
        assert_eq!(frame, b"5;id=1\r\nhello\r\n");
    }

    #[test]
    fn reads_frames_until_end_marker() {
        let data = body(&[
            encode_frame(FrameHeader::new(FrameId::Arg(0)), b"adb").expect("a0"),
            encode_frame(FrameHeader::new(FrameId::Arg(1)), b"devices").expect("a1"),
        ]);
        let mut reader = FrameReader::new(Cursor::new(data));

        let first = reader.next_header().expect("header");
        assert_eq!(first.id, Some(FrameId::Arg(0)));
        assert_eq!(reader.read_payload(&first).expect("payload"), b"adb");

        let second = reader.next_header().expect("header");
        assert_eq!(reader.read_payload(&second).expect("payload"), b"devices");

        assert!(reader.next_header().expect("end").is_end());
    }

    #[test]
    fn copies_binary_payload_exactly() {
        let content: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let data = body(&[encode_frame(FrameHeader::new(FrameId::Output(2)), &content).expect("o2")]);
        let mut reader = FrameReader::new(Cursor::new(data));

        let header = reader.next_header().expect("header");
        let mut out = Vec::new();
        let copied = reader.copy_payload(&header, &mut out).expect("copy");
        assert_eq!(copied, 3000);
        assert_eq!(out, content);
    }

    #[test]
    fn truncated_stream_is_unexpected_eof() {
        let frame = encode_frame(FrameHeader::new(FrameId::Stdout), b"hello world").expect("frame");
        let mut reader = FrameReader::new(Cursor::new(frame[..frame.len() - 6].to_vec()));
        let header = reader.next_header().expect("header");
        let mut out = Vec::new();
        assert!(matches!(
            reader.copy_payload(&header, &mut out),
            Err(FrameIoError::UnexpectedEof)
        ));

        let mut empty = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(empty.next_header(), Err(FrameIoError::UnexpectedEof)));
    }

    #[test]
    fn bad_trailer_is_rejected() {
        let mut reader = FrameReader::new(Cursor::new(b"2;id=1\r\nhiXX".to_vec()));
        let header = reader.next_header().expect("header");
        assert!(matches!(
            reader.read_payload(&header),
            Err(FrameIoError::MissingTrailer)
        ));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let line = format!("5;id=1,pad={}\r\n", "x".repeat(2 * MAX_HEADER_LINE));
        let mut reader = FrameReader::new(Cursor::new(line.into_bytes()));
        assert!(matches!(
            reader.next_header(),
            Err(FrameIoError::HeaderTooLong)
        ));
    }

    #[test]
    fn inline_payloads_are_bounded() {
        let header = FrameHeader::new(FrameId::Arg(1)).with_len(MAX_INLINE_LEN + 1);
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            reader.read_payload(&header),
            Err(FrameIoError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn async_reader_matches_sync_reader() {
        let data = body(&[
            encode_frame(
                FrameHeader::new(FrameId::Input(1)).with_input_name("a.bin"),
                b"\x00\x01\x02",
            )
            .expect("i1"),
        ]);
        let mut reader = AsyncFrameReader::new(Cursor::new(data));
        let header = reader.next_header().await.expect("header");
        assert_eq!(header.input_name.as_deref(), Some("a.bin"));
        let mut out = Vec::new();
        reader.copy_payload(&header, &mut out).await.expect("copy");
        assert_eq!(out, b"\x00\x01\x02");
        assert!(reader.next_header().await.expect("end").is_end());
    }
}

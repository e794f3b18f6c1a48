//! Byte-level ICAP framing: line reads, chunk headers, chunk payloads and
//! pre-rendered status lines.
//!
//! Every reader here is written against [`AsyncBufRead`] and loops until the
//! requested amount is available; a TCP segment boundary falling in the middle
//! of a size line or of a chunk payload never changes the result.

use crate::MAX_HDR_BYTES;
use crate::error::{Error, IcapResult};
use std::future::poll_fn;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

pub const CRLF: &[u8] = b"\r\n";
/// Terminal zero chunk followed by the empty trailer.
pub const END_CHUNK: &[u8] = b"0\r\n\r\n";

pub const OK_200: &str = "ICAP/1.0 200 OK\r\n";
pub const NO_CONTENT_204: &str = "ICAP/1.0 204 No Content\r\n";
pub const CONTINUE_100: &[u8] = b"ICAP/1.0 100 Continue\r\n\r\n";
pub const BAD_REQUEST_400: &[u8] = b"ICAP/1.0 400 Bad Request\r\n\r\n";
pub const SERVER_ERROR_500: &[u8] = b"ICAP/1.0 500 Server Error\r\n\r\n";
pub const SERVICE_TIMEOUT_504: &[u8] = b"ICAP/1.0 504 Service timeout\r\n\r\n";

pub const HEAD_CONNECTION_KEEPALIVE: &str = "Connection: keep-alive\r\n";
pub const HEAD_CONNECTION_CLOSE: &str = "Connection: close\r\n";

/// Payload budget of one outgoing TCP segment (1448 byte MSS minus the
/// worst-case chunk framing).
pub const MTU: usize = 1448 - 7;

/// Parsed chunk-size line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub size: usize,
    /// `ieof` extension: the preview already holds the whole body.
    pub ieof: bool,
}

impl ChunkHeader {
    pub fn is_terminal(&self) -> bool {
        self.size == 0
    }
}

/// Reads one line and strips the trailing `\r\n` (or bare `\n`).
///
/// Returns `None` on a clean EOF before any byte of the line was read.
pub async fn read_line<R>(r: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut raw = Vec::new();
    loop {
        let buf = r.fill_buf().await?;
        if buf.is_empty() {
            if raw.is_empty() {
                return Ok(None);
            }
            break;
        }
        match memchr::memchr(b'\n', buf) {
            Some(i) => {
                raw.extend_from_slice(&buf[..=i]);
                r.consume(i + 1);
                break;
            }
            None => {
                let n = buf.len();
                raw.extend_from_slice(buf);
                r.consume(n);
            }
        }
        if raw.len() > MAX_HDR_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line exceeds header size limit",
            ));
        }
    }
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

/// Appends up to `n` bytes to `out`, looping over short reads.
///
/// Returns the number of bytes appended; less than `n` only when the stream
/// reached EOF. `n` comes from the peer, so `out` only grows by what has
/// actually arrived.
pub async fn read_exact_into<R>(r: &mut R, out: &mut Vec<u8>, n: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut remaining = n;
    while remaining > 0 {
        let buf = r.fill_buf().await?;
        if buf.is_empty() {
            break;
        }
        let take = buf.len().min(remaining);
        out.try_reserve(take)
            .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        out.extend_from_slice(&buf[..take]);
        r.consume(take);
        remaining -= take;
    }
    Ok(n - remaining)
}

/// Parses `<hex-size>[;ext[=value]]*`.
pub fn parse_chunk_size(line: &str) -> IcapResult<ChunkHeader> {
    let mut parts = line.split(';');
    let size_str = parts.next().unwrap_or_default().trim();
    if size_str.is_empty() {
        return Err(Error::malformed_chunk("empty chunk-size line"));
    }
    let size = usize::from_str_radix(size_str, 16)
        .map_err(|_| Error::malformed_chunk(format!("invalid chunk size: {size_str}")))?;
    let ieof = parts.any(|ext| ext.trim().eq_ignore_ascii_case("ieof"));
    Ok(ChunkHeader { size, ieof })
}

/// Reads the next chunk-size line.
///
/// One leading empty line is tolerated: it is the trailer CRLF of a previous
/// zero chunk that had not arrived yet when the preview was closed.
/// Returns `None` on EOF.
pub async fn read_chunk_header<R>(r: &mut R) -> IcapResult<Option<ChunkHeader>>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = match read_line(r).await? {
        Some(line) => line,
        None => return Ok(None),
    };
    if line.trim().is_empty() {
        line = match read_line(r).await? {
            Some(line) => line,
            None => return Ok(None),
        };
    }
    parse_chunk_size(&line).map(Some)
}

/// Appends exactly `size` payload bytes to `out` and consumes the CRLF that
/// follows them.
pub async fn read_chunk_data<R>(r: &mut R, out: &mut Vec<u8>, size: usize) -> IcapResult<()>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let got = read_exact_into(r, out, size).await?;
    if got < size {
        return Err(Error::Network(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("chunk truncated: expected {size} bytes, got {got}"),
        )));
    }
    match read_line(r).await? {
        Some(rest) if rest.is_empty() => Ok(()),
        Some(rest) => Err(Error::malformed_chunk(format!(
            "missing CRLF after chunk data, found {:?}",
            rest.chars().take(16).collect::<String>()
        ))),
        None => Err(Error::Network(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "EOF after chunk data",
        ))),
    }
}

/// Reads a full chunk (size line, payload, CRLF) and appends the payload.
pub async fn read_chunk<R>(r: &mut R, out: &mut Vec<u8>) -> IcapResult<ChunkHeader>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let header = read_chunk_header(r)
        .await?
        .ok_or_else(|| Error::malformed_chunk("EOF instead of chunk-size line"))?;
    if header.size > 0 {
        read_chunk_data(r, out, header.size).await?;
    }
    Ok(header)
}

/// Consumes the CRLF trailing a zero chunk, but only as far as it is already
/// readable. Never waits for more input.
pub async fn skip_trailing_crlf<R>(r: &mut R) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut skipped = 0;
    loop {
        let next = poll_fn(|cx| match Pin::new(&mut *r).poll_fill_buf(cx) {
            Poll::Ready(Ok(buf)) => Poll::Ready(Ok(buf.first().copied())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Ready(Ok(None)),
        })
        .await?;
        match next {
            Some(b'\r') if skipped == 0 => {
                r.consume(1);
                skipped += 1;
            }
            Some(b'\n') => {
                r.consume(1);
                return Ok(skipped + 1);
            }
            _ => return Ok(skipped),
        }
    }
}

/// Writes one chunk to the stream.
pub async fn write_chunk<W>(stream: &mut W, data: &[u8]) -> IcapResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(16 + data.len() + 2);
    write_chunk_into(&mut buf, data);
    stream.write_all(&buf).await?;
    Ok(())
}

/// Appends one chunk to an already assembled buffer.
pub fn write_chunk_into(out: &mut Vec<u8>, data: &[u8]) {
    // Writing into a Vec cannot fail.
    let _ = write!(out, "{:X}\r\n", data.len());
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF);
}

pub fn write_terminal_chunk_into(out: &mut Vec<u8>) {
    out.extend_from_slice(END_CHUNK);
}

/// Appends `body` as a chunked stream sized to TCP segments.
///
/// `head_len` is the number of bytes already queued in front of the body
/// (ICAP and HTTP headers); the first chunk fills what remains of that first
/// segment, every later chunk carries [`MTU`] bytes. An empty body produces
/// nothing, not even the terminal chunk.
pub fn write_chunks_into(out: &mut Vec<u8>, head_len: usize, body: &[u8]) {
    if body.is_empty() {
        return;
    }
    let first = if head_len < MTU { MTU - head_len } else { MTU };
    let (head, tail) = body.split_at(first.min(body.len()));
    write_chunk_into(out, head);
    for piece in tail.chunks(MTU) {
        write_chunk_into(out, piece);
    }
    write_terminal_chunk_into(out);
}

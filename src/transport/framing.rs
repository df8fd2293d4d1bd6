//! Content-Length message framing over byte streams.
//!
//! This module implements HTTP-style Content-Length framing, the same protocol
//! used by the Language Server Protocol (LSP). It gives stream sockets
//! reliable message boundaries.
//!
//! # Wire Format
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <message-body>
//! ```
//!
//! The header parsing is case-insensitive and handles both CRLF and LF line endings.

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum message size (100MB) to prevent OOM from malicious/buggy peers.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Longest header line accepted, terminator included.
pub const MAX_HEADER_LINE: usize = 8 * 1024;

/// Read a Content-Length framed message from the stream.
///
/// Returns `Ok(None)` when the stream ends cleanly between messages.
///
/// # Protocol
///
/// 1. Read headers until an empty line (handles both CRLF and LF)
/// 2. Extract Content-Length header (case-insensitive)
/// 3. Read exactly that many bytes for the body
///
/// # Errors
///
/// Returns an error if:
/// - The stream ends in the middle of a message
/// - A header line is longer than MAX_HEADER_LINE
/// - No Content-Length header is found
/// - Content-Length exceeds MAX_MESSAGE_SIZE (100MB)
/// - The body cannot be read completely
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        let bytes_read = (&mut *reader)
            .take(MAX_HEADER_LINE as u64)
            .read_line(&mut line)
            .await
            .context("Failed to read header line")?;

        if bytes_read == MAX_HEADER_LINE && !line.ends_with('\n') {
            return Err(anyhow!(
                "Header line exceeds maximum {} bytes",
                MAX_HEADER_LINE
            ));
        }

        if bytes_read == 0 {
            if saw_header {
                return Err(anyhow!("Connection closed in the middle of a message"));
            }
            return Ok(None);
        }

        let trimmed = line.trim();

        // Empty line signals end of headers
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            // Tolerate stray blank lines between messages
            continue;
        }
        saw_header = true;

        // Parse Content-Length header (case-insensitive, as in HTTP)
        if let Some(colon_pos) = trimmed.find(':') {
            let key = trimmed[..colon_pos].trim();
            let value = trimmed[colon_pos + 1..].trim();

            if key.eq_ignore_ascii_case("Content-Length") {
                content_length = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid Content-Length value: {}", value))?,
                );
            }
            // Ignore other headers (e.g., Content-Type)
        }
    }

    let size = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;

    if size > MAX_MESSAGE_SIZE {
        return Err(anyhow!(
            "Message size {} exceeds maximum {} bytes",
            size,
            MAX_MESSAGE_SIZE
        ));
    }

    let mut body = vec![0u8; size];
    reader
        .read_exact(&mut body)
        .await
        .context("Failed to read message body")?;

    Ok(Some(body))
}

/// Write a Content-Length framed message to the stream.
///
/// # Errors
///
/// Returns an error if the write or flush fails.
pub async fn write_message<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = format!("Content-Length: {}\r\n\r\n", body.len());

    writer
        .write_all(header.as_bytes())
        .await
        .context("Failed to write message header")?;

    writer
        .write_all(body)
        .await
        .context("Failed to write message body")?;

    writer.flush().await.context("Failed to flush message")?;

    Ok(())
}

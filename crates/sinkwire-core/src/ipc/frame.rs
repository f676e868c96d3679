//! IPC wire framing.
//!
//! A request or response is two length-prefixed fields written back to back
//! on the same duplex stream: the serialized header bag, then the body.
//!
//! ```text
//! [u32 LE: header_len][header bytes][u32 LE: body_len][body bytes]
//! ```
//!
//! Both lengths are always present; an empty body is written as a zero
//! length with no bytes following.

use crate::error::{ChannelError, Result};
use crate::headers::{Exchange, HeaderBag};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame. Returns `None` on a clean EOF before the first byte.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_field_size: usize,
) -> Result<Option<Exchange>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ChannelError::Frame {
                message: format!("stream ended after {} of 4 header length bytes", filled),
            });
        }
        filled += n;
    }
    let header_bytes = read_field(reader, u32::from_le_bytes(len_buf), max_field_size, "header").await?;

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| truncated(e, "body length"))?;
    let body = read_field(reader, u32::from_le_bytes(len_buf), max_field_size, "body").await?;

    let headers = HeaderBag::from_wire(&header_bytes).map_err(|e| ChannelError::Frame {
        message: format!("undecodable header bag: {}", e),
    })?;
    Ok(Some(Exchange::new(headers, body)))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, exchange: &Exchange) -> Result<()> {
    let header_bytes = exchange.headers.to_wire()?;
    write_field(writer, &header_bytes).await?;
    write_field(writer, &exchange.body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_field<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: u32,
    max_field_size: usize,
    what: &str,
) -> Result<Bytes> {
    let len = len as usize;
    if len > max_field_size {
        return Err(ChannelError::Frame {
            message: format!(
                "{} field of {} bytes exceeds maximum {}",
                what, len, max_field_size
            ),
        });
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| truncated(e, what))?;
    Ok(Bytes::from(buf))
}

async fn write_field<W: AsyncWrite + Unpin>(writer: &mut W, field: &[u8]) -> Result<()> {
    let len = u32::try_from(field.len()).map_err(|_| ChannelError::Frame {
        message: format!("field of {} bytes does not fit a frame", field.len()),
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(field).await?;
    Ok(())
}

fn truncated(err: std::io::Error, what: &str) -> ChannelError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ChannelError::Frame {
            message: format!("stream ended inside the {} field", what),
        }
    } else {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::headers::keys;

    const MAX: usize = TransportConfig::MAX_IPC_FRAME_SIZE;

    fn sample() -> Exchange {
        let headers = HeaderBag::new()
            .with(keys::REQUEST_URI, "/Foo")
            .with(keys::REQUEST_VERB, "POST")
            .with(keys::CONTENT_TYPE, "application/octet-stream");
        Exchange::new(headers, vec![0x01u8, 0x02])
    }

    #[tokio::test]
    async fn test_frame_layout_is_little_endian_length_prefixed() {
        let exchange = sample();
        let mut buf = Vec::new();
        write_frame(&mut buf, &exchange).await.unwrap();

        let header_bytes = exchange.headers.to_wire().unwrap();
        let header_len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        assert_eq!(header_len, header_bytes.len());
        assert_eq!(&buf[4..4 + header_len], &header_bytes[..]);

        let body_at = 4 + header_len;
        assert_eq!(&buf[body_at..body_at + 4], &2u32.to_le_bytes());
        assert_eq!(&buf[body_at + 4..], &[0x01, 0x02]);
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let exchange = sample();
        let mut buf = Vec::new();
        write_frame(&mut buf, &exchange).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor, MAX).await.unwrap();
        assert_eq!(read_back, Some(exchange));
    }

    #[tokio::test]
    async fn test_empty_body_keeps_zero_length() {
        let exchange = Exchange::new(HeaderBag::new(), Bytes::new());
        let mut buf = Vec::new();
        write_frame(&mut buf, &exchange).await.unwrap();

        assert_eq!(&buf[buf.len() - 4..], &0u32.to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor, MAX).await.unwrap().unwrap();
        assert!(read_back.body.is_empty());
    }

    #[tokio::test]
    async fn test_frames_are_read_sequentially() {
        let first = sample();
        let second = Exchange::new(HeaderBag::new().with("n", "2"), &b"second"[..]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &first).await.unwrap();
        write_frame(&mut buf, &second).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, MAX).await.unwrap(), Some(first));
        assert_eq!(read_frame(&mut cursor, MAX).await.unwrap(), Some(second));
        assert_eq!(read_frame(&mut cursor, MAX).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor, MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_length_prefix_is_an_error() {
        for partial in [&[0x05u8][..], &[0x05, 0x00][..], &[0x05, 0x00, 0x00][..]] {
            let mut cursor = std::io::Cursor::new(partial.to_vec());
            let err = read_frame(&mut cursor, MAX).await.unwrap_err();
            assert!(
                matches!(err, ChannelError::Frame { .. }),
                "{} bytes: {:?}",
                partial.len(),
                err
            );
        }
    }

    #[tokio::test]
    async fn test_length_prefix_arriving_in_pieces_is_read() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample()).await.unwrap();
        let (first, rest) = buf.split_at(2);

        let mut reader = split_reader(first, rest);
        let read_back = read_frame(&mut reader, MAX).await.unwrap();
        assert_eq!(read_back, Some(sample()));
    }

    /// A reader that yields `first`, then `rest`, as separate reads.
    fn split_reader(first: &[u8], rest: &[u8]) -> impl AsyncRead + Unpin {
        std::io::Cursor::new(first.to_vec()).chain(std::io::Cursor::new(rest.to_vec()))
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &sample()).await.unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, MAX).await.unwrap_err();
        assert!(matches!(err, ChannelError::Frame { .. }));
    }

    #[tokio::test]
    async fn test_oversized_field_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1024u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor, 16).await.unwrap_err();
        assert!(matches!(err, ChannelError::Frame { .. }));
    }

    #[tokio::test]
    async fn test_garbage_header_bag_is_an_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"{{{");
        buf.extend_from_slice(&0u32.to_le_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, MAX).await.is_err());
    }
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Transports and DNS-over-TCP framing: 2-byte big-endian length prefix + payload
// (RFC 7766 Section 8), used for both handshake and encrypted traffic.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum framed payload; also the UDP receive buffer size.
pub const MAX_PAYLOAD: usize = 65535;

/// Smallest DNS message worth looking at: 12-byte header + 5-byte root question.
pub const MIN_DNS_PACKET_LEN: usize = 12 + 5;

/// Transport a message travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// Wildcard local address of the same family as `peer`, for binding an
/// ephemeral socket.
pub(crate) fn unspecified_for(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

/// Read a length-prefixed message from a stream.
///
/// Format: `[2 bytes: big-endian length] [N bytes: payload]`
pub async fn read_framed<R: AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;

    if len == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "zero-length message",
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed message to a stream.
///
/// Format: `[2 bytes: big-endian length] [N bytes: payload]`
pub async fn write_framed<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> std::io::Result<()> {
    if data.len() > MAX_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("payload too large: {} > {}", data.len(), MAX_PAYLOAD),
        ));
    }

    let len = (data.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framed_roundtrip() {
        let data = b"hello, dnscrypt";
        let mut buf = Vec::new();
        write_framed(&mut buf, data).await.unwrap();
        assert_eq!(&buf[..2], &[0, data.len() as u8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_framed(&mut cursor).await.unwrap();
        assert_eq!(result, data);
    }

    #[tokio::test]
    async fn reads_consecutive_frames_in_order() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"first").await.unwrap();
        write_framed(&mut buf, b"second").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_framed(&mut cursor).await.unwrap(), b"first");
        assert_eq!(read_framed(&mut cursor).await.unwrap(), b"second");

        let eof = read_framed(&mut cursor).await.unwrap_err();
        assert_eq!(eof.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn rejects_zero_length() {
        let wire = [0u8, 0]; // length = 0
        let mut cursor = std::io::Cursor::new(wire.to_vec());
        let result = read_framed(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_payload() {
        let mut buf = Vec::new();
        let result = write_framed(&mut buf, &vec![0u8; MAX_PAYLOAD + 1]).await;
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::InvalidInput);
    }
}

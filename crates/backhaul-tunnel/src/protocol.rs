//! Wire constants shared by both roles
//!
//! Every stream starts with one role tag byte. After the tag, a heartbeat
//! stream carries bare probe bytes and a tunnel stream carries the tunneled
//! connection's bytes untouched.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StreamTagError;

/// Byte the bridge sends once per heartbeat interval
pub const PROBE: u8 = 12;

/// Role of a stream, announced by its first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Opened once per session by the bridge, carries probes
    Heartbeat,
    /// Opened by the proxy for each client connection
    Tunnel,
}

impl StreamRole {
    pub const HEARTBEAT_TAG: u8 = 0x48;
    pub const TUNNEL_TAG: u8 = 0x54;

    pub fn tag(self) -> u8 {
        match self {
            StreamRole::Heartbeat => Self::HEARTBEAT_TAG,
            StreamRole::Tunnel => Self::TUNNEL_TAG,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            Self::HEARTBEAT_TAG => Some(StreamRole::Heartbeat),
            Self::TUNNEL_TAG => Some(StreamRole::Tunnel),
            _ => None,
        }
    }
}

/// Announce the stream's role; this also makes the stream visible to the peer
pub async fn write_role<S>(stream: &mut S, role: StreamRole) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[role.tag()]).await?;
    stream.flush().await
}

pub async fn read_role<S>(stream: &mut S) -> Result<StreamRole, StreamTagError>
where
    S: AsyncRead + Unpin,
{
    let mut tag = [0u8; 1];
    match stream.read(&mut tag).await? {
        0 => Err(StreamTagError::Eof),
        _ => StreamRole::from_tag(tag[0]).ok_or(StreamTagError::Unknown(tag[0])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for role in [StreamRole::Heartbeat, StreamRole::Tunnel] {
            assert_eq!(StreamRole::from_tag(role.tag()), Some(role));
        }
        assert_eq!(StreamRole::from_tag(PROBE), None);
        assert_eq!(StreamRole::from_tag(0), None);
    }

    #[tokio::test]
    async fn test_read_role_leaves_payload_untouched() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_role(&mut a, StreamRole::Tunnel).await.unwrap();
        a.write_all(b"SSH-2.0").await.unwrap();

        assert_eq!(read_role(&mut b).await.unwrap(), StreamRole::Tunnel);
        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"SSH-2.0");
    }

    #[tokio::test]
    async fn test_read_role_rejects_unknown_and_eof() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0xff]).await.unwrap();
        assert!(matches!(
            read_role(&mut b).await,
            Err(StreamTagError::Unknown(0xff))
        ));

        drop(a);
        assert!(matches!(read_role(&mut b).await, Err(StreamTagError::Eof)));
    }
}

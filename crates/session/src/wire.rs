use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SessionError};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_SIZE: usize = 17 * 1024 * 1024; // payload cap plus AEAD overhead

const ANNOUNCE_MAGIC: &[u8; 7] = b"PEERLOG";
const ANNOUNCE_HELLO: u8 = 0x01;
const ANNOUNCE_GOODBYE: u8 = 0x02;

/// Frames exchanged on a LAN connection. Only `Hello` travels in the clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Hello {
        protocol_version: u32,
        display_name: String,
        service_type: String,
        x25519_pubkey: [u8; 32],
    },
    Sealed(Vec<u8>),
}

/// Contents of a `Frame::Sealed` after decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SealedFrame {
    Data(Vec<u8>),
    Bye,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

impl SealedFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Write a 4-byte big-endian length followed by the encoded frame.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(SessionError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            bytes.len()
        )));
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(SessionError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::decode(&buf)
}

/// Multicast discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub display_name: String,
    pub service_type: String,
    pub port: u16,
    /// Sent once when advertising stops.
    pub goodbye: bool,
}

impl Announcement {
    /// `PEERLOG | kind:u8 | port:u16 | service_len:u8 | service | name_len:u8 | name`
    pub fn encode(&self) -> Vec<u8> {
        let service = self.service_type.as_bytes();
        let name = self.display_name.as_bytes();

        let mut packet = Vec::with_capacity(12 + service.len() + name.len());
        packet.extend_from_slice(ANNOUNCE_MAGIC);
        packet.push(if self.goodbye {
            ANNOUNCE_GOODBYE
        } else {
            ANNOUNCE_HELLO
        });
        packet.extend_from_slice(&self.port.to_be_bytes());
        packet.push(service.len().min(u8::MAX as usize) as u8);
        packet.extend_from_slice(&service[..service.len().min(u8::MAX as usize)]);
        packet.push(name.len().min(u8::MAX as usize) as u8);
        packet.extend_from_slice(&name[..name.len().min(u8::MAX as usize)]);
        packet
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let rest = data.strip_prefix(ANNOUNCE_MAGIC.as_slice())?;
        let (&kind, rest) = rest.split_first()?;
        let goodbye = match kind {
            ANNOUNCE_HELLO => false,
            ANNOUNCE_GOODBYE => true,
            _ => return None,
        };

        if rest.len() < 2 {
            return None;
        }
        let port = u16::from_be_bytes([rest[0], rest[1]]);
        let (service_type, rest) = take_short_string(&rest[2..])?;
        let (display_name, _) = take_short_string(rest)?;

        if display_name.is_empty() {
            return None;
        }

        Some(Self {
            display_name,
            service_type,
            port,
            goodbye,
        })
    }
}

fn take_short_string(data: &[u8]) -> Option<(String, &[u8])> {
    let (&len, rest) = data.split_first()?;
    let len = len as usize;
    if rest.len() < len {
        return None;
    }
    let value = std::str::from_utf8(&rest[..len]).ok()?.to_string();
    Some((value, &rest[len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_parse() {
        let announcement = Announcement {
            display_name: "Ben's iPhone".to_string(),
            service_type: "photo-share".to_string(),
            port: 7656,
            goodbye: false,
        };
        let parsed = Announcement::parse(&announcement.encode()).unwrap();
        assert_eq!(parsed, announcement);
    }

    #[test]
    fn test_announcement_rejects_garbage() {
        assert!(Announcement::parse(b"").is_none());
        assert!(Announcement::parse(b"PEERLAG\x01\x00\x00").is_none());
        assert!(Announcement::parse(b"PEERLOG\x09\x1e\x90\x00\x00").is_none());

        let mut truncated = Announcement {
            display_name: "bob".to_string(),
            service_type: "svc".to_string(),
            port: 1,
            goodbye: true,
        }
        .encode();
        truncated.pop();
        assert!(Announcement::parse(&truncated).is_none());
    }

    #[tokio::test]
    async fn test_frame_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let hello = Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            display_name: "alice".to_string(),
            service_type: "photos".to_string(),
            x25519_pubkey: [9u8; 32],
        };
        write_frame(&mut client, &hello).await.unwrap();
        write_frame(&mut client, &Frame::Sealed(vec![1, 2, 3])).await.unwrap();

        match read_frame(&mut server).await.unwrap() {
            Frame::Hello { display_name, .. } => assert_eq!(display_name, "alice"),
            other => panic!("unexpected frame {:?}", other),
        }
        match read_frame(&mut server).await.unwrap() {
            Frame::Sealed(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            read_frame(&mut server).await,
            Err(SessionError::Protocol(_))
        ));
    }
}

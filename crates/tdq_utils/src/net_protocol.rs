//! Read/write protocol for messages exchanged between the queue, workers, and clients.
//! The first 4 bytes of any message is the size of the message (in big-endian order).
//! The rest of the message are the contents, which are serde-serialized json.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod ids;
pub mod models;
pub mod queue;
pub mod workers;

/// Messages larger than this are refused rather than buffered.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Reads a single framed message.
pub async fn async_read<R, T>(reader: &mut R) -> Result<T, io::Error>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut msg_size_buf = [0; 4];
    reader.read_exact(&mut msg_size_buf).await?;
    let msg_size = u32::from_be_bytes(msg_size_buf);
    if msg_size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {msg_size} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}"),
        ));
    }

    let mut msg_buf = vec![0; msg_size as usize];
    reader.read_exact(&mut msg_buf).await?;

    let msg = serde_json::from_slice(&msg_buf)?;
    Ok(msg)
}

/// Writes a single framed message and flushes the writer.
pub async fn async_write<W, T>(writer: &mut W, msg: &T) -> Result<(), io::Error>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_json = serde_json::to_vec(msg)?;
    let msg_size = u32::try_from(msg_json.len())
        .ok()
        .filter(|size| *size <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message of {} bytes is too large to send", msg_json.len()),
            )
        })?;

    let mut msg_buf = Vec::with_capacity(4 + msg_json.len());
    msg_buf.extend_from_slice(&u32::to_be_bytes(msg_size));
    msg_buf.extend_from_slice(&msg_json);
    writer.write_all(&msg_buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::io;

    use ntest::timeout;
    use tokio::io::AsyncWriteExt;

    use super::{async_read, async_write, MAX_MESSAGE_SIZE};
    use crate::net_protocol::queue::QueueVersionResponse;

    #[tokio::test]
    #[timeout(10000)]
    async fn framed_message_is_readable() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = QueueVersionResponse {
            version: "1.2.3".to_owned(),
        };

        async_write(&mut client, &msg).await.unwrap();
        let received: QueueVersionResponse = async_read(&mut server).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn length_prefix_is_big_endian() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        async_write(&mut client, &"ab").await.unwrap();
        drop(client);

        let mut raw = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(&raw[..4], &[0, 0, 0, 4]);
        assert_eq!(&raw[4..], b"\"ab\"");
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn refuses_oversized_message() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();

        let err = async_read::<_, String>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    #[timeout(10000)]
    async fn refuses_malformed_json() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{{{").await.unwrap();

        let err = async_read::<_, String>(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

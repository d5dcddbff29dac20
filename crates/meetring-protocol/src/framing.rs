//! Length-prefixed message framing.
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON payload    |
//! +----------------+------------------+
//! ```

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

fn check_len(len: usize) -> ProtocolResult<u32> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_MESSAGE_SIZE => Ok(len),
        _ => Err(ProtocolError::MessageTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        }),
    }
}

/// Serializes `message` into a complete frame.
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    let len = check_len(json.len())?;

    let mut buffer = Vec::with_capacity(4 + json.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes one complete frame from `data`.
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    let Some((prefix, rest)) = data.split_first_chunk::<4>() else {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4,
            received: data.len(),
        });
    };
    let len = check_len(u32::from_be_bytes(*prefix) as usize)? as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    if rest.len() < len {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4 + len,
            received: data.len(),
        });
    }
    Ok(serde_json::from_slice(&rest[..len])?)
}

/// Reads one frame from an async stream.
///
/// Returns `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<R, T>(reader: &mut R) -> ProtocolResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = check_len(u32::from_be_bytes(len_buf) as usize)? as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }

    let mut payload = vec![0u8; len];
    let mut received = 0;
    while received < len {
        let n = reader.read(&mut payload[received..]).await?;
        if n == 0 {
            return Err(ProtocolError::IncompleteMessage {
                expected: len,
                received,
            });
        }
        received += n;
    }
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Writes one frame and flushes.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = encode_message(message)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Envelope, Request, Response};

    #[test]
    fn length_prefix_matches_payload() {
        let bytes = encode_message(&Envelope::request("req-123", Request::Ping)).unwrap();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded: Envelope<Request> = decode_message(&bytes).unwrap();
        assert_eq!(decoded.request_id, "req-123");
    }

    #[test]
    fn short_input_is_incomplete() {
        let result: ProtocolResult<Envelope<Request>> = decode_message(&[0, 0]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteMessage { expected: 4, .. })
        ));

        let mut data = vec![0, 0, 0, 100];
        data.extend_from_slice(&[b' '; 10]);
        let result: ProtocolResult<Envelope<Request>> = decode_message(&data);
        assert!(matches!(result, Err(ProtocolError::IncompleteMessage { expected: 104, .. })));
    }

    #[test]
    fn oversized_and_empty_frames() {
        let data = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let result: ProtocolResult<Envelope<Request>> = decode_message(&data);
        assert!(matches!(result, Err(ProtocolError::MessageTooLarge { .. })));

        let result: ProtocolResult<Envelope<Request>> = decode_message(&[0, 0, 0, 0]);
        assert!(matches!(result, Err(ProtocolError::EmptyMessage)));
    }

    mod streams {
        use super::*;

        #[tokio::test]
        async fn frames_cross_a_duplex_pipe() {
            let (mut client, mut server) = tokio::io::duplex(64);

            let writer = tokio::spawn(async move {
                write_frame(&mut client, &Envelope::request("a", Request::SignIn))
                    .await
                    .unwrap();
                write_frame(&mut client, &Envelope::request("b", Request::GetUpcomingMeetings))
                    .await
                    .unwrap();
            });

            let first: Envelope<Request> = read_frame(&mut server).await.unwrap().unwrap();
            let second: Envelope<Request> = read_frame(&mut server).await.unwrap().unwrap();
            writer.await.unwrap();

            assert_eq!(first.payload, Request::SignIn);
            assert_eq!(second.request_id, "b");
            let eof: Option<Envelope<Request>> = read_frame(&mut server).await.unwrap();
            assert!(eof.is_none());
        }

        #[tokio::test]
        async fn truncated_payload_is_reported() {
            let bytes = encode_message(&Envelope::response("r", Response::Pong)).unwrap();
            let truncated = bytes[..bytes.len() - 3].to_vec();
            let mut reader = truncated.as_slice();

            let result: ProtocolResult<Option<Envelope<Response>>> = read_frame(&mut reader).await;
            assert!(matches!(result, Err(ProtocolError::IncompleteMessage { .. })));
        }

        #[tokio::test]
        async fn garbage_payload_is_a_serialization_error() {
            let mut data = 3u32.to_be_bytes().to_vec();
            data.extend_from_slice(b"{{{");
            let mut reader = data.as_slice();

            let result: ProtocolResult<Option<Envelope<Request>>> = read_frame(&mut reader).await;
            assert!(matches!(result, Err(ProtocolError::Serialization(_))));
        }
    }
}

//! Line framing over any byte stream, using tokio-util's `LinesCodec`.

use crate::error::{ErrorKind, Result};
use crate::protocol::MAX_LINE_LENGTH;
use exn::ResultExt;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// A bidirectional stream of JSON lines.
pub struct Channel<S> {
    inner: Framed<S, LinesCodec>,
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            inner: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
        }
    }

    /// Encode and send one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let line = serde_json::to_string(message).or_raise(|| ErrorKind::Protocol("unencodable message".to_string()))?;
        self.inner.send(line).await.or_raise(|| ErrorKind::Io)
    }

    /// Receive the next raw line, or `None` once the peer has closed.
    ///
    /// An over-long line is reported as [`ErrorKind::Protocol`]; the codec
    /// terminates the stream after it.
    pub async fn recv_line(&mut self) -> Result<Option<String>> {
        match self.inner.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                exn::bail!(ErrorKind::Protocol(format!("line exceeds {MAX_LINE_LENGTH} bytes")))
            },
            Some(Err(LinesCodecError::Io(e))) => Err(e).or_raise(|| ErrorKind::Io),
            None => Ok(None),
        }
    }

    /// Receive and decode the next message, or `None` once the peer has closed.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let Some(line) = self.recv_line().await? else {
            return Ok(None);
        };
        let message = serde_json::from_str(&line).or_raise(|| ErrorKind::Protocol("malformed message".to_string()))?;
        Ok(Some(message))
    }

    pub fn get_ref(&self) -> &S {
        self.inner.get_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Pong;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn test_messages_are_newline_delimited() {
        let (client, mut server) = duplex(1024);
        let mut channel = Channel::new(client);
        channel.send(&Pong::default()).await.unwrap();
        let mut buf = vec![0; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"{\"protocol\":\"dmirror/1\"}\n");
    }

    #[tokio::test]
    async fn test_recv_decodes_and_reports_eof() {
        let (client, mut server) = duplex(1024);
        let mut channel = Channel::new(client);
        server.write_all(b"{\"protocol\":\"x\"}\nnot json\n").await.unwrap();
        drop(server);

        let pong: Pong = channel.recv().await.unwrap().unwrap();
        assert_eq!(pong.protocol, "x");
        let err = channel.recv::<Pong>().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Protocol(_)));
        assert!(channel.recv::<Pong>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected() {
        let (client, mut server) = duplex(4 * MAX_LINE_LENGTH);
        let mut channel = Channel::new(client);
        let line = vec![b'a'; MAX_LINE_LENGTH + 1];
        server.write_all(&line).await.unwrap();
        server.write_all(b"\n").await.unwrap();
        let err = channel.recv_line().await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Protocol(_)));
    }
}

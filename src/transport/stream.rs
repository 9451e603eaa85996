use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info};

use bytes::BytesMut;

use super::{SipAddr, TransportEvent, TransportSender};
use crate::error::Result;
use crate::message::framing::{CRLF_PONG, MAX_MESSAGE_SIZE};
use crate::message::{Frame, Message, SipCodec};

pub const MAX_SIP_MESSAGE_SIZE: usize = MAX_MESSAGE_SIZE;

/// Owns a connection-oriented stream's two halves independently, so a
/// reader loop and a writer can run concurrently without contending on
/// the same lock. Shared by the TCP and TLS transports, which differ
/// only in what `R`/`W` are.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: &Message) -> Result<()> {
        send_to_stream(&self.write_half, msg).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        send_raw_to_stream(&self.write_half, data).await
    }

    /// Reads from the stream until it closes, handing every framed
    /// message to `sender` and all but discarding keepalive traffic.
    /// A decode error drops just the offending buffered bytes; a single
    /// malformed message shouldn't take the whole connection down.
    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                error!("connection already being served");
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr;
        let local_addr = self.local_addr;
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(MAX_SIP_MESSAGE_SIZE);
        let mut read_buf = [0u8; 8192];

        loop {
            use tokio::io::AsyncReadExt;
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    info!(%local_addr, %remote_addr, "stream connection closed");
                    let _ = sender.send(TransportEvent::ConnectionClosed(remote_addr));
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(Frame::Message(message))) => {
                                debug!(%remote_addr, "received message");
                                if sender
                                    .send(TransportEvent::Incoming {
                                        message,
                                        source: remote_addr,
                                        local: local_addr,
                                    })
                                    .is_err()
                                {
                                    return Ok(());
                                }
                            }
                            Ok(Some(Frame::KeepaliveRequest)) => {
                                if self.send_raw(CRLF_PONG).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(Some(Frame::KeepaliveResponse)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                error!(%remote_addr, error = %e, "error decoding stream message");
                                buffer.clear();
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(%remote_addr, error = %e, "error reading from stream");
                    let _ = sender.send(TransportEvent::ConnectionClosed(remote_addr));
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await?;
        Ok(())
    }
}

pub async fn send_to_stream<W>(write_half: &Mutex<W>, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut encoded = BytesMut::new();
    SipCodec::new().encode(msg.clone(), &mut encoded)?;
    send_raw_to_stream(write_half, &encoded).await
}

pub async fn send_raw_to_stream<W>(write_half: &Mutex<W>, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut lock = write_half.lock().await;
    lock.write_all(data).await?;
    lock.flush().await?;
    Ok(())
}

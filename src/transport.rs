//! Multipart frame transport over TCP.
//!
//! Wire format of one frame:
//!
//! ```text
//! u16 part count (big endian), at least 2: identity and verb
//! per part: u32 length (big endian), then the bytes
//! ```
//!
//! An endpoint runs [`serve`]: every frame received from any client goes into
//! one inbound queue, and every frame published on the outbound broadcast channel
//! is written to all connected clients. Clients use [`FrameClient`].

use crate::error::{AppResult, DaqError};
use crate::messages::{Frame, Reply};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest accepted part.
pub const MAX_PART_LEN: usize = 1024 * 1024;

/// Largest accepted number of parts.
pub const MAX_PARTS: usize = 64;

/// Codec for multipart frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DaqError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Frame>> {
        if src.len() < 2 {
            return Ok(None);
        }
        let count = usize::from(u16::from_be_bytes([src[0], src[1]]));
        if !(2..=MAX_PARTS).contains(&count) {
            return Err(DaqError::Frame(format!("invalid part count {count}")));
        }

        // Check the whole frame is buffered before consuming anything
        let mut cursor = 2;
        for _ in 0..count {
            let Some(header) = src.get(cursor..cursor + 4) else {
                src.reserve(cursor + 4 - src.len());
                return Ok(None);
            };
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            if len > MAX_PART_LEN {
                return Err(DaqError::Frame(format!("part of {len} bytes exceeds limit")));
            }
            cursor += 4 + len;
            if src.len() < cursor {
                src.reserve(cursor - src.len());
                return Ok(None);
            }
        }

        src.advance(2);
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let len = src.get_u32() as usize;
            parts.push(src.split_to(len).freeze());
        }
        let mut parts = parts.into_iter();
        let (Some(identity), Some(verb)) = (parts.next(), parts.next()) else {
            return Err(DaqError::Frame("missing identity or verb".into()));
        };
        Ok(Some(Frame {
            identity: String::from_utf8_lossy(&identity).into_owned(),
            verb,
            args: parts.collect(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DaqError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> AppResult<()> {
        let count = frame.args.len() + 2;
        if count > MAX_PARTS {
            return Err(DaqError::Frame(format!("{count} parts exceed limit")));
        }
        let identity = Bytes::from(frame.identity.into_bytes());
        let parts: Vec<Bytes> = [identity, frame.verb].into_iter().chain(frame.args).collect();
        if let Some(big) = parts.iter().find(|p| p.len() > MAX_PART_LEN) {
            return Err(DaqError::Frame(format!("part of {} bytes exceeds limit", big.len())));
        }

        dst.reserve(2 + parts.iter().map(|p| 4 + p.len()).sum::<usize>());
        dst.put_u16(count as u16);
        for part in parts {
            dst.put_u32(part.len() as u32);
            dst.put_slice(&part);
        }
        Ok(())
    }
}

/// Accept clients on `listener` until `cancel` fires.
///
/// Received frames are sent to `inbound`; frames published on `outbound` are
/// written to every client connected at the time.
pub async fn serve(
    listener: TcpListener,
    inbound: mpsc::Sender<Frame>,
    outbound: broadcast::Sender<Frame>,
    cancel: CancellationToken,
) -> AppResult<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for clients");
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Client connected");
                        tokio::spawn(handle_connection(
                            stream,
                            peer,
                            inbound.clone(),
                            outbound.subscribe(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                }
            }
        }
    }
    info!("Transport stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<Frame>,
    mut outbound: broadcast::Receiver<Frame>,
    cancel: CancellationToken,
) {
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec).split();
    loop {
        tokio::select! {
            // Pending replies go out before a cancellation is honored
            biased;
            published = outbound.recv() => match published {
                Ok(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(%peer, error = %e, "Write failed, dropping client");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(%peer, missed, "Client too slow, frames skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            received = frames.next() => match received {
                Some(Ok(frame)) => {
                    debug!(%peer, %frame, "Frame received");
                    if inbound.send(frame).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(%peer, error = %e, "Malformed frame, dropping client");
                    break;
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    debug!(%peer, "Client disconnected");
}

/// Client side of a frame endpoint.
#[derive(Debug)]
pub struct FrameClient {
    identity: String,
    framed: Framed<TcpStream, FrameCodec>,
}

impl FrameClient {
    /// Connect to `addr`, sending frames as `identity`.
    pub async fn connect(addr: impl ToSocketAddrs, identity: impl Into<String>) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            identity: identity.into(),
            framed: Framed::new(stream, FrameCodec),
        })
    }

    /// Identity used for outgoing frames.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Send a frame and flush it.
    pub async fn send(&mut self, frame: Frame) -> AppResult<()> {
        self.framed.send(frame).await
    }

    /// Next frame from the endpoint, `None` once it closed the connection.
    pub async fn recv(&mut self) -> AppResult<Option<Frame>> {
        self.framed.next().await.transpose()
    }

    /// Wait up to `timeout` for the next `OK` or `ERR` reply.
    ///
    /// Notifications received in the meantime are handed to `on_status`.
    pub async fn await_reply<F>(&mut self, timeout: Duration, mut on_status: F) -> AppResult<Reply>
    where
        F: FnMut(&str),
    {
        let wait = async {
            while let Some(frame) = self.recv().await? {
                match Reply::from_frame(&frame) {
                    Some(Reply::Status(text)) => on_status(&text),
                    Some(reply) => return Ok(reply),
                    None => debug!(%frame, "Ignoring unexpected frame"),
                }
            }
            Err(DaqError::Frame("connection closed before a reply arrived".into()))
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DaqError::Frame(format!("no reply within {timeout:?}")))?
    }
}

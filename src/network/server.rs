//! Framing and per-connection I/O
//!
//! A connection task owns the socket. It decodes frames into [`PeerEvent`]s for
//! the event loop and writes whatever the loop queues in the peer's outbox.
//! It never touches node state.

use crate::network::message::Message;
use crate::network::params::{CONNECT_TIMEOUT, MAGIC, MAX_MESSAGE_SIZE};
use crate::network::peer::{PeerError, PeerToken};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

const HEADER_SIZE: usize = 8;

/// What a connection task reports to the event loop
#[derive(Debug)]
pub enum PeerEvent {
    Message { token: PeerToken, message: Message },
    Closed { token: PeerToken, error: PeerError },
}

/// Magic + big-endian length + JSON payload
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| PeerError::Codec(e.to_string()))?;

        if data.len() > self.max_message_size {
            return Err(PeerError::Codec(format!(
                "outgoing {} of {} bytes exceeds the limit",
                item.type_name(),
                data.len()
            )));
        }

        dst.reserve(HEADER_SIZE + data.len());
        dst.put_slice(&MAGIC);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(PeerError::Codec("invalid magic bytes".to_string()));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > self.max_message_size {
            return Err(PeerError::Codec(format!(
                "frame of {} bytes exceeds the limit of {}",
                len, self.max_message_size
            )));
        }

        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let data = src.split_to(len);

        let msg = Message::from_bytes(&data).map_err(|e| PeerError::Codec(e.to_string()))?;
        Ok(Some(msg))
    }
}

/// Open an outgoing connection
pub async fn connect_to_peer(host: &str, port: u16) -> Result<TcpStream, PeerError> {
    let connect = TcpStream::connect((host, port));
    match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(PeerError::ConnectionFailed(e.to_string())),
        Err(_) => Err(PeerError::ConnectionFailed("timed out".to_string())),
    }
}

/// Dial `host:port` and, once connected, drive the connection
pub async fn connect_and_handle(
    token: PeerToken,
    host: String,
    port: u16,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    outbox_rx: mpsc::Receiver<Message>,
) {
    match connect_to_peer(&host, port).await {
        Ok(stream) => handle_connection(token, stream, events_tx, outbox_rx).await,
        Err(error) => {
            let _ = events_tx.send(PeerEvent::Closed { token, error });
        }
    }
}

/// Drive one connection until it fails, the remote closes it, or the loop
/// drops its outbox
pub async fn handle_connection(
    token: PeerToken,
    stream: TcpStream,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    mut outbox_rx: mpsc::Receiver<Message>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        log::debug!("Could not disable Nagle for {}: {}", token, e);
    }

    let framed = Framed::new(stream, MessageCodec::default());
    let (mut writer, mut reader) = framed.split();

    let error = loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(message)) => {
                    if events_tx.send(PeerEvent::Message { token, message }).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => break e,
                None => break PeerError::Closed,
            },
            outgoing = outbox_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = writer.send(message).await {
                        break e;
                    }
                }
                // The loop already forgot this peer
                None => return,
            },
        }
    };

    let _ = events_tx.send(PeerEvent::Closed { token, error });
}

//! One connection to another table node.
//!
//! Frames are a 4-byte big-endian length followed by a bincode-encoded
//! [`Envelope`]. A freshly formed [`Peer`] owns the whole stream for the
//! handshake; once the node accepts it, [`Peer::activate`] splits the stream,
//! spawns the receive task on the read half and returns a [`PeerHandle`] that
//! keeps the write half.

use super::messages::{Envelope, PeerAddr};
use crate::error::{NodeError, NodeResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum frame size (10MB)
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Which side opened the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A decoded envelope together with the connection it arrived on
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer: PeerAddr,
    pub conn_id: u64,
    pub envelope: Envelope,
}

/// Posted by a receive task when its connection ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerClosed {
    pub peer: PeerAddr,
    pub conn_id: u64,
}

/// A connection that has not finished its handshake yet
#[derive(Debug)]
pub struct Peer {
    id: u64,
    stream: TcpStream,
    remote_addr: SocketAddr,
    direction: Direction,
    dialed: Option<PeerAddr>,
}

impl Peer {
    pub fn new(
        id: u64,
        stream: TcpStream,
        remote_addr: SocketAddr,
        direction: Direction,
        dialed: Option<PeerAddr>,
    ) -> Self {
        Self {
            id,
            stream,
            remote_addr,
            direction,
            dialed,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Address this connection was dialed to, for outbound peers
    pub fn dialed(&self) -> Option<&str> {
        self.dialed.as_deref()
    }

    pub async fn send(&mut self, envelope: &Envelope) -> NodeResult<()> {
        write_frame(&mut self.stream, envelope).await
    }

    pub async fn recv(&mut self) -> NodeResult<Envelope> {
        read_frame(&mut self.stream).await
    }

    /// Split the connection and start its receive task.
    ///
    /// The task forwards every decoded envelope to `inbound` and posts a
    /// [`PeerClosed`] on `closed` when the connection ends for any reason.
    pub fn activate(
        self,
        listen_addr: PeerAddr,
        inbound: mpsc::Sender<InboundMessage>,
        closed: mpsc::Sender<PeerClosed>,
        cancel: CancellationToken,
    ) -> PeerHandle {
        let (reader, writer) = self.stream.into_split();
        let task = tokio::spawn(read_loop(
            reader,
            listen_addr.clone(),
            self.id,
            inbound,
            closed,
            cancel.clone(),
        ));

        PeerHandle {
            id: self.id,
            listen_addr,
            direction: self.direction,
            writer: Arc::new(Mutex::new(writer)),
            cancel,
            task,
        }
    }
}

/// An active connection, owned by the node's peer map
#[derive(Debug)]
pub struct PeerHandle {
    id: u64,
    listen_addr: PeerAddr,
    direction: Direction,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PeerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub async fn send(&self, envelope: &Envelope) -> NodeResult<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, envelope).await
    }

    /// Stop the receive task. The socket closes once the handle is dropped.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    peer: PeerAddr,
    conn_id: u64,
    inbound: mpsc::Sender<InboundMessage>,
    closed: mpsc::Sender<PeerClosed>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %peer, conn_id, "receive task cancelled");
                break;
            }
            result = read_frame(&mut reader) => match result {
                Ok(envelope) => envelope,
                Err(NodeError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!(peer = %peer, conn_id, "connection closed by remote");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, conn_id, error = %e, "dropping connection");
                    break;
                }
            },
        };

        let msg = InboundMessage {
            peer: peer.clone(),
            conn_id,
            envelope,
        };
        if inbound.send(msg).await.is_err() {
            break;
        }
    }

    let _ = closed.send(PeerClosed { peer, conn_id }).await;
}

/// Encode an envelope as one length-prefixed frame.
pub fn encode_frame(envelope: &Envelope) -> NodeResult<Vec<u8>> {
    let data = bincode::serialize(envelope).map_err(NodeError::Encode)?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(NodeError::FrameTooLarge(data.len()));
    }

    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

/// Write one frame with a single `write_all`, so frames never interleave.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> NodeResult<()> {
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> NodeResult<Envelope> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(NodeError::FrameTooLarge(len));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    bincode::deserialize(&data).map_err(NodeError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::messages::{EncryptedDeck, Payload, PeerList};
    use tokio::net::TcpListener;

    async fn connected_pair() -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let dialed = dialed.unwrap();
        let (accepted, remote) = accepted.unwrap();
        (
            Peer::new(1, dialed, addr, Direction::Outbound, Some(addr.to_string())),
            Peer::new(2, accepted, remote, Direction::Inbound, None),
        )
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (mut a, mut b) = connected_pair().await;

        let first = Envelope::new(
            "127.0.0.1:3000",
            Payload::PeerList(PeerList {
                peers: vec!["127.0.0.1:4000".into()],
            }),
        );
        let second = Envelope::new(
            "127.0.0.1:3000",
            Payload::EncryptedDeck(EncryptedDeck {
                deck: vec![vec![1, 2, 3], vec![]],
            }),
        );
        a.send(&first).await.unwrap();
        a.send(&second).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), first);
        assert_eq!(b.recv().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_garbage_frame_is_decode_error() {
        let (a, mut b) = connected_pair().await;
        let mut stream = a.stream;
        stream.write_all(&3u32.to_be_bytes()).await.unwrap();
        stream.write_all(&[0xff, 0xff, 0xff]).await.unwrap();

        assert!(matches!(b.recv().await, Err(NodeError::Decode(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (a, mut b) = connected_pair().await;
        let mut stream = a.stream;
        stream
            .write_all(&((MAX_MESSAGE_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(b.recv().await, Err(NodeError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_receive_task_forwards_and_reports_close() {
        let (mut a, b) = connected_pair().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (closed_tx, mut closed_rx) = mpsc::channel(8);
        let handle = b.activate(
            "127.0.0.1:3000".into(),
            inbound_tx,
            closed_tx,
            CancellationToken::new(),
        );

        let envelope = Envelope::new("127.0.0.1:3000", Payload::PeerList(PeerList::default()));
        a.send(&envelope).await.unwrap();

        let msg = inbound_rx.recv().await.unwrap();
        assert_eq!(msg.envelope, envelope);
        assert_eq!(msg.peer, "127.0.0.1:3000");
        assert_eq!(msg.conn_id, handle.id());

        drop(a);
        let closed = closed_rx.recv().await.unwrap();
        assert_eq!(
            closed,
            PeerClosed {
                peer: "127.0.0.1:3000".into(),
                conn_id: 2
            }
        );
    }

    #[tokio::test]
    async fn test_decode_failure_terminates_receive_task() {
        let (a, b) = connected_pair().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (closed_tx, mut closed_rx) = mpsc::channel(8);
        let _handle = b.activate(
            "127.0.0.1:3000".into(),
            inbound_tx,
            closed_tx,
            CancellationToken::new(),
        );

        let mut stream = a.stream;
        stream.write_all(&2u32.to_be_bytes()).await.unwrap();
        stream.write_all(&[0xff, 0xff]).await.unwrap();

        assert_eq!(closed_rx.recv().await.unwrap().conn_id, 2);
        assert!(inbound_rx.recv().await.is_none());
    }
}

use std::net::SocketAddr;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{Challenge, Error, MessageCodec, ParticipantIndex, PublicKey, Result, CHALLENGE_SIZE};

/// Local handle of a connection, unique within one agent.
pub type PeerId = u64;

/// A bidirectional byte stream to another participant.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn remote_addr(&self) -> Option<SocketAddr>;
}

impl PeerStream for TcpStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl PeerStream for DuplexStream {
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// What the reader task of a peer reports to the agent.
#[derive(Debug)]
pub(crate) enum PeerEvent {
    Frame { peer: PeerId, bytes: Vec<u8> },
    Closed(PeerId),
}

/// Sending side of a peer. The stream itself is owned by the peer's reader
/// and writer tasks; the handle only enqueues outbound frames.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    remote_addr: Option<SocketAddr>,
    public_key: PublicKey,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Key of the participant on the other end, proven by the handshake.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Enqueues a frame without waiting. A full queue drops the frame.
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("[PEER-{}] outbound queue full, dropping frame", self.id);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::PeerClosed),
        }
    }
}

/// Mutual proof of key ownership on a fresh connection. Each side sends a
/// random challenge and signs the one it receives, so a recorded answer is
/// useless on another connection.
pub(crate) async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut S,
    codec: &MessageCodec,
    max_frame: usize,
) -> Result<(ParticipantIndex, PublicKey)> {
    let challenge: Challenge = rand::random();
    write_frame(conn, &challenge).await?;

    let theirs = read_frame(conn, CHALLENGE_SIZE).await?;
    let theirs = Challenge::try_from(theirs.as_slice())
        .map_err(|_| Error::InvalidHandshake("challenge has the wrong size"))?;
    write_frame(conn, &codec.answer_challenge(&theirs)?).await?;

    let answer = read_frame(conn, max_frame).await?;
    codec.verify_answer(&answer, &challenge)
}

/// Splits `conn` between a reader and a writer task and returns the handle
/// feeding the writer.
pub(crate) fn spawn<S: PeerStream>(
    id: PeerId,
    conn: S,
    public_key: PublicKey,
    capacity: usize,
    max_frame: usize,
    events: mpsc::Sender<PeerEvent>,
    shutdown: CancellationToken,
) -> PeerHandle {
    let remote_addr = conn.remote_addr();
    let (reader, writer) = tokio::io::split(conn);
    let (outbound, outbound_rx) = mpsc::channel(capacity);

    tokio::spawn(write_loop(id, writer, outbound_rx, shutdown.clone()));
    tokio::spawn(read_loop(id, reader, max_frame, events, shutdown));

    info!("[PEER-{}] connected to {:?} at {:?}", id, public_key, remote_addr);
    PeerHandle {
        id,
        remote_addr,
        public_key,
        outbound,
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    id: PeerId,
    mut reader: R,
    max_frame: usize,
    events: mpsc::Sender<PeerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = read_frame(&mut reader, max_frame) => frame,
        };
        match frame {
            Ok(bytes) => {
                if events.send(PeerEvent::Frame { peer: id, bytes }).await.is_err() {
                    break;
                }
            }
            Err(Error::IO(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("[PEER-{}] connection closed by remote", id);
                break;
            }
            Err(err) => {
                warn!("[PEER-{}] dropping connection: {}", id, err);
                break;
            }
        }
    }
    let _ = events.send(PeerEvent::Closed(id)).await;
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: PeerId,
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_frame(&mut writer, &frame).await {
            warn!("[PEER-{}] failed to write: {}", id, err);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Reads one `u32` big-endian length prefixed frame.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame: usize,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(Error::MessageTooLarge {
            size: len,
            max: max_frame,
        });
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(data)
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| Error::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ParticipantSet, SecretKey, StateCapabilities, StateHash};
    use core::cmp::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    struct Opaque;

    impl StateCapabilities for Opaque {
        fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
            a.cmp(b)
        }
        fn validate(&self, _state: &[u8]) -> bool {
            true
        }
        fn hash(&self, _state: &[u8]) -> StateHash {
            StateHash::default()
        }
    }

    fn codecs(n: usize) -> Vec<Arc<MessageCodec>> {
        let keys = Vec::from_iter((0..n).map(|_| SecretKey::random()));
        let participants = Arc::new(
            ParticipantSet::new(Vec::from_iter(keys.iter().map(SecretKey::public_key))).unwrap(),
        );
        Vec::from_iter(keys.into_iter().map(|sk| {
            Arc::new(MessageCodec::new(participants.clone(), Arc::new(Opaque), sk, 1024).unwrap())
        }))
    }

    #[tokio::test]
    async fn test_frames_keep_their_boundaries() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            write_frame(&mut a, b"first").await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
            write_frame(&mut a, &[7u8; 200]).await.unwrap();
        });
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), b"first");
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), b"");
        assert_eq!(read_frame(&mut b, 1024).await.unwrap(), vec![7u8; 200]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_is_refused_before_reading_it() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, 1024).await,
            Err(Error::MessageTooLarge { max: 1024, .. })
        ));
    }

    #[tokio::test]
    async fn test_peer_tasks_carry_frames_both_ways() {
        let (a, mut remote) = tokio::io::duplex(1024);
        let (events_tx, mut events) = mpsc::channel(8);
        let shutdown = CancellationToken::new();
        let public_key = SecretKey::random().public_key();
        let handle = spawn(3, a, public_key, 8, 1024, events_tx, shutdown.clone());
        assert_eq!(handle.id(), 3);
        assert_eq!(handle.remote_addr(), None);
        assert_eq!(handle.public_key(), &public_key);

        handle.send(b"out".to_vec()).unwrap();
        assert_eq!(read_frame(&mut remote, 1024).await.unwrap(), b"out");

        write_frame(&mut remote, b"in").await.unwrap();
        match events.recv().await {
            Some(PeerEvent::Frame { peer: 3, bytes }) => assert_eq!(bytes, b"in"),
            other => panic!("unexpected event {:?}", other),
        }

        drop(remote);
        assert!(matches!(events.recv().await, Some(PeerEvent::Closed(3))));

        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(handle.send(b"late".to_vec()), Err(Error::PeerClosed)));
    }

    #[tokio::test]
    async fn test_handshake_proves_both_identities() {
        let codecs = codecs(4);
        let (mut a, mut b) = tokio::io::duplex(1024);
        let (left, right) = tokio::join!(
            handshake(&mut a, &codecs[0], 1024),
            handshake(&mut b, &codecs[3], 1024)
        );
        assert_eq!(left.unwrap(), (3, *codecs[0].participants().get(3).unwrap()));
        assert_eq!(right.unwrap(), (0, *codecs[3].participants().get(0).unwrap()));
    }

    #[tokio::test]
    async fn test_replayed_handshake_answer_is_refused() {
        let codecs = codecs(4);
        let (mut a, mut remote) = tokio::io::duplex(1024);
        let honest = tokio::spawn({
            let codec = codecs[0].clone();
            async move { handshake(&mut a, &codec, 1024).await }
        });

        // the remote answers with a signature of participant 2 over some
        // other challenge, as if captured from another connection
        let _challenge = read_frame(&mut remote, 1024).await.unwrap();
        write_frame(&mut remote, &[9u8; CHALLENGE_SIZE]).await.unwrap();
        let _answer = read_frame(&mut remote, 1024).await.unwrap();
        let recorded = codecs[2].answer_challenge(&[1u8; CHALLENGE_SIZE]).unwrap();
        write_frame(&mut remote, &recorded).await.unwrap();

        assert!(matches!(
            honest.await.unwrap(),
            Err(Error::InvalidSignature { voter: 2 })
        ));
    }
}

//! TCP server and connection handling
//!
//! Accepts incoming connections, dials outbound ones and runs one driver
//! task per connection. The driver owns the socket: it feeds parsed
//! messages to the [`Peer`], runs its send cadence on a short tick, checks
//! liveness, and hands committed bytes to a writer task that writes them
//! in order.

use crate::network::codec::MessageParser;
use crate::network::context::NetContext;
use crate::network::endpoint::{unix_time, unix_time_micros, Endpoint};
use crate::network::manager::{PeerId, PeerRef};
use crate::network::message::{Message, WireError};
use crate::network::peer::{Peer, PeerError};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::FramedRead;

/// Cadence of reply / trickle processing
const SEND_TICK: Duration = Duration::from_millis(100);

/// How often the activity timer fires
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Buffers queued to the writer before the peer counts as stalled
const WRITE_QUEUE_DEPTH: usize = 64;

/// Time allowed to flush queued bytes on teardown
const LINGER: Duration = Duration::from_secs(5);

/// Default outbound connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind and create the server
    pub async fn bind(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, PeerError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(PeerError::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(PeerError::ConnectionFailed(format!("{}: timed out", addr))),
    }
}

/// Register a peer for `stream`, start its handshake and spawn its driver
pub fn start_peer(
    ctx: Arc<NetContext>,
    stream: TcpStream,
    addr: SocketAddr,
    inbound: bool,
) -> Result<PeerRef, PeerError> {
    let _ = stream.set_nodelay(true);
    let endpoint = Endpoint::from_socket_addr(addr);
    let id = ctx.peers.next_id();

    let mut peer = Peer::new(id, endpoint, inbound, ctx.params.magic, unix_time());
    let wake = peer.waker();
    peer.start(&ctx, unix_time())?;

    let handle = ctx.peers.register(peer);
    tokio::spawn(drive_peer(ctx, id, Arc::downgrade(&handle), stream, wake));
    Ok(handle)
}

/// Read half that records when bytes last arrived, so a peer slowly
/// sending one large message still counts as active
struct ActivityReader<R> {
    inner: R,
    last_read: Arc<AtomicI64>,
}

impl<R> ActivityReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            last_read: Arc::new(AtomicI64::new(0)),
        }
    }

    fn last_read(&self) -> Arc<AtomicI64> {
        self.last_read.clone()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ActivityReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.last_read.store(unix_time(), Ordering::Relaxed);
        }
        poll
    }
}

enum Event {
    Frame(Option<Result<Message, WireError>>),
    Tick,
    Liveness,
    Wake,
}

async fn drive_peer(
    ctx: Arc<NetContext>,
    id: PeerId,
    peer: Weak<Mutex<Peer>>,
    stream: TcpStream,
    wake: Arc<Notify>,
) {
    let (read_half, write_half) = stream.into_split();
    let read_half = ActivityReader::new(read_half);
    let last_read = read_half.last_read();
    let mut reader = FramedRead::new(read_half, MessageParser::new(ctx.params.magic));
    let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(write_half, rx));

    let mut tick = tokio::time::interval(SEND_TICK);
    let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
    let mut event = Event::Wake;

    loop {
        let Some(handle) = peer.upgrade() else {
            break;
        };

        let (alive, outbound, relay) = {
            let mut p = handle.lock();
            let now = unix_time();
            p.touch(last_read.load(Ordering::Relaxed));
            match event {
                Event::Frame(Some(Ok(message))) => {
                    p.receive(message, now);
                    p.process_messages(&ctx, now);
                }
                Event::Frame(Some(Err(e))) => {
                    log::warn!("Bad data from {}: {}", p.endpoint(), e);
                    p.stop();
                }
                Event::Frame(None) => {
                    log::info!("Peer {} disconnected", p.endpoint());
                    p.stop();
                }
                Event::Tick => {
                    let now_us = unix_time_micros();
                    let result = p.reply(&ctx, now_us).and_then(|_| p.trickle(now_us));
                    if let Err(e) = result {
                        log::warn!("Send to {} failed: {}", p.endpoint(), e);
                        p.stop();
                    }
                }
                Event::Liveness => {
                    p.check_activity(now);
                }
                Event::Wake => {}
            }
            (!p.is_stopped(), p.take_outbound(), p.take_relay())
        };

        if !outbound.is_empty() {
            match tx.try_send(outbound) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let mut p = handle.lock();
                    log::warn!("{} is not reading, disconnecting", p.endpoint());
                    p.stop();
                }
                Err(TrySendError::Closed(_)) => handle.lock().stop(),
            }
        }

        let (inventory, addresses) = relay;
        if !inventory.is_empty() || !addresses.is_empty() {
            ctx.peers.relay(id, &inventory, &addresses);
        }

        if !alive || handle.lock().is_stopped() {
            break;
        }
        drop(handle);

        event = tokio::select! {
            frame = reader.next() => Event::Frame(frame),
            _ = tick.tick() => Event::Tick,
            _ = liveness.tick() => Event::Liveness,
            _ = wake.notified() => Event::Wake,
        };
    }

    drop(tx);
    if tokio::time::timeout(LINGER, writer).await.is_err() {
        log::debug!("Gave up flushing to peer {}", id);
    }

    if let Some(handle) = peer.upgrade() {
        handle.lock().close();
    }
    ctx.peers.unregister(id);
}

async fn write_loop(mut socket: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(buf) = rx.recv().await {
        if let Err(e) = socket.write_all(&buf).await {
            log::debug!("Write failed: {}", e);
            return;
        }
    }
    let _ = socket.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::context::ProtocolParams;
    use crate::network::handler::NullHandler;
    use crate::network::peer::PeerState;
    use crate::network::pool::{EndpointPool, PoolConfig};
    use crate::storage::FileStore;

    fn context() -> Arc<NetContext> {
        let pool =
            EndpointPool::open(Box::new(FileStore::in_memory()), 8333, PoolConfig::default())
                .unwrap();
        NetContext::new(pool, Arc::new(NullHandler), ProtocolParams::default())
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_loopback_handshake() {
        let server_ctx = context();
        let client_ctx = context();

        let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr();

        let accept_ctx = server_ctx.clone();
        let accepted = tokio::spawn(async move {
            let (stream, remote) = server.accept().await.unwrap();
            start_peer(accept_ctx, stream, remote, true).unwrap()
        });

        let stream = connect_to_peer(addr, CONNECT_TIMEOUT).await.unwrap();
        let client = start_peer(client_ctx.clone(), stream, addr, false).unwrap();
        let inbound = accepted.await.unwrap();

        assert!(wait_for(|| client.lock().is_active() && inbound.lock().is_active()).await);
        assert_eq!(client_ctx.peers.outbound_count(), 1);
        assert_eq!(server_ctx.peers.inbound_count(), 1);

        // closing one side tears down the other
        client.lock().stop();
        assert!(wait_for(|| server_ctx.peers.count() == 0).await);
        assert!(wait_for(|| client_ctx.peers.count() == 0).await);
        assert_eq!(client.lock().state(), PeerState::Closed);
    }

    #[tokio::test]
    async fn test_self_connection_torn_down() {
        let ctx = context();
        let server = Server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = server.local_addr();

        let accept_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Ok((stream, remote)) = server.accept().await {
                let _ = start_peer(accept_ctx, stream, remote, true);
            }
        });

        let stream = connect_to_peer(addr, CONNECT_TIMEOUT).await.unwrap();
        let client = start_peer(ctx.clone(), stream, addr, false).unwrap();

        assert!(wait_for(|| ctx.peers.count() == 0).await);
        assert!(!client.lock().is_active());
    }

    #[tokio::test]
    async fn test_partial_frame_counts_as_read() {
        use tokio::io::AsyncReadExt;

        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = ActivityReader::new(server);
        let last_read = reader.last_read();
        assert_eq!(last_read.load(Ordering::Relaxed), 0);

        // half a header is not a message, but it is traffic
        client.write_all(&crate::network::message::MAGIC).await.unwrap();
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert!(last_read.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect_to_peer(addr, CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(PeerError::ConnectionFailed(_))));
    }
}

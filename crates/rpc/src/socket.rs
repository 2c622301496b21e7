//! A single framed connection.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{Message, NewBodyFn};
use crate::pool::{Pool, Pooled, Recycle};
use crate::proto::{Proto, WireContext};

/// Any bidirectional byte stream a socket can own.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Conn for T {}

/// Type-erased connection.
pub type BoxConn = Box<dyn Conn>;

/// Network address of a listener or connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetAddr {
    /// TCP address.
    Inet(SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

type SwapValue = Arc<dyn Any + Send + Sync>;

/// Shared key/value storage attached to a connection.
///
/// Clones share the same map. The swap outlives the raw connection, so a
/// redialed session can carry it over to its new socket.
#[derive(Clone, Default)]
pub struct Swap {
    inner: Arc<DashMap<String, SwapValue>>,
}

impl Swap {
    /// Empty swap.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, returning whether a value was replaced.
    pub fn insert<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) -> bool {
        self.inner.insert(key.into(), Arc::new(value)).is_some()
    }

    /// Fetch the value under `key` if it has type `V`.
    #[must_use]
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        let value = Arc::clone(self.inner.get(key)?.value());
        value.downcast::<V>().ok()
    }

    /// Remove `key`, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.remove(key).is_some()
    }

    /// True if `key` is present.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True if there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Swap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<_> = self.inner.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("Swap").field("keys", &keys).finish()
    }
}

/// Everything a socket needs from its endpoint.
#[derive(Clone)]
pub(crate) struct SocketEnv {
    pub(crate) wire: WireContext,
    pub(crate) messages: Arc<Pool<Message>>,
    pub(crate) new_body: Option<NewBodyFn>,
}

/// Adapts a [`Proto`] to [`Decoder`], drawing messages from the pool.
pub(crate) struct ProtoDecoder {
    proto: Arc<dyn Proto>,
    env: SocketEnv,
    partial: Option<Pooled<Message>>,
}

impl Decoder for ProtoDecoder {
    type Item = Pooled<Message>;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let mut msg = match self.partial.take() {
            Some(msg) => msg,
            None => {
                let mut msg = self.env.messages.acquire();
                msg.set_new_body(self.env.new_body.clone());
                msg
            }
        };
        if self.proto.unpack(src, &self.env.wire, &mut msg)? {
            Ok(Some(msg))
        } else {
            self.partial = Some(msg);
            Ok(None)
        }
    }
}

/// Upper bound for flushing the shutdown of a closed socket.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct Writer {
    half: WriteHalf<BoxConn>,
    buf: BytesMut,
}

/// Poisons the socket if a frame write is dropped halfway; the peer would
/// otherwise see a truncated frame followed by the next one.
struct FrameWrite<'a> {
    cancel: &'a CancellationToken,
    finished: bool,
}

impl Drop for FrameWrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

/// Owns one connection and speaks one [`Proto`] over it.
///
/// Reads and writes may happen concurrently; writes are serialized against
/// each other so frames never interleave. Closing aborts writes that are
/// queued or blocked on a peer that stopped reading.
pub struct Socket {
    id: RwLock<String>,
    local_addr: Option<NetAddr>,
    remote_addr: Option<NetAddr>,
    proto: Option<Arc<dyn Proto>>,
    wire: WireContext,
    reader: Mutex<Option<FramedRead<ReadHalf<BoxConn>, ProtoDecoder>>>,
    writer: Mutex<Option<Writer>>,
    swap: RwLock<Swap>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Socket {
    /// A socket that owns no connection yet; see [`Socket::new`].
    pub(crate) fn empty() -> Self {
        Self {
            id: RwLock::new(String::new()),
            local_addr: None,
            remote_addr: None,
            proto: None,
            wire: WireContext::default(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            swap: RwLock::new(Swap::new()),
            closed: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    /// Wrap a standalone connection.
    #[must_use]
    pub fn new(conn: impl Conn, proto: Arc<dyn Proto>, wire: WireContext) -> Self {
        let env = SocketEnv {
            wire,
            messages: Pool::new(16, Message::default),
            new_body: None,
        };
        let mut socket = Self::empty();
        socket.reset(Box::new(conn), None, None, proto, &env);
        socket
    }

    /// Bind this socket to a fresh connection.
    pub(crate) fn reset(
        &mut self,
        conn: BoxConn,
        local_addr: Option<NetAddr>,
        remote_addr: Option<NetAddr>,
        proto: Arc<dyn Proto>,
        env: &SocketEnv,
    ) {
        let (read_half, write_half) = tokio::io::split(conn);
        let decoder = ProtoDecoder {
            proto: Arc::clone(&proto),
            env: env.clone(),
            partial: None,
        };
        // Unix peers are usually unnamed, so only TCP addresses make unique ids.
        *self.id.get_mut() = match &remote_addr {
            Some(NetAddr::Inet(addr)) => addr.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        self.local_addr = local_addr;
        self.remote_addr = remote_addr;
        self.proto = Some(proto);
        self.wire = env.wire.clone();
        *self.reader.get_mut() = Some(FramedRead::new(read_half, decoder));
        *self.writer.get_mut() = Some(Writer {
            half: write_half,
            buf: BytesMut::with_capacity(4096),
        });
        *self.swap.get_mut() = Swap::new();
        *self.closed.get_mut() = false;
        self.cancel = CancellationToken::new();
    }

    /// Identity; defaults to the remote address.
    #[must_use]
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// Rename the socket.
    pub fn set_id(&self, id: impl Into<String>) {
        *self.id.write() = id.into();
    }

    /// Local address, when the transport has one.
    #[must_use]
    pub const fn local_addr(&self) -> Option<&NetAddr> {
        self.local_addr.as_ref()
    }

    /// Remote address, when the transport has one.
    #[must_use]
    pub const fn remote_addr(&self) -> Option<&NetAddr> {
        self.remote_addr.as_ref()
    }

    /// Protocol version and name.
    #[must_use]
    pub fn proto_version(&self) -> Option<(u8, &'static str)> {
        self.proto.as_ref().map(|p| p.version())
    }

    /// Auxiliary storage.
    #[must_use]
    pub fn swap(&self) -> Swap {
        self.swap.read().clone()
    }

    /// Replace the auxiliary storage.
    pub fn set_swap(&self, swap: Swap) {
        *self.swap.write() = swap;
    }

    /// True once [`Socket::close`] has been called or a write was abandoned
    /// mid-frame.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }

    /// Read the next message; `Ok(None)` means the peer closed cleanly.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is malformed or the read fails.
    pub async fn read_message(&self) -> Result<Option<Pooled<Message>>> {
        let mut reader = self.reader.lock().await;
        let Some(framed) = reader.as_mut() else {
            return Err(Error::ProactivelyClosed);
        };
        let next = tokio::select! {
            () = self.cancel.cancelled() => return Err(Error::ProactivelyClosed),
            next = framed.next() => next,
        };
        match next {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(_)) | None if self.is_closed() => Err(Error::ProactivelyClosed),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Pack and write one message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProactivelyClosed`] once the socket is closed, or the
    /// encoding or I/O error.
    pub async fn write_message(&self, msg: &mut Message) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ProactivelyClosed);
        }
        let mut writer = tokio::select! {
            () = self.cancel.cancelled() => return Err(Error::ProactivelyClosed),
            writer = self.writer.lock() => writer,
        };
        let (Some(w), Some(proto)) = (writer.as_mut(), self.proto.as_ref()) else {
            return Err(Error::ProactivelyClosed);
        };
        w.buf.clear();
        proto.pack(msg, &self.wire, &mut w.buf)?;
        let Writer { half, buf } = w;
        let mut frame = FrameWrite {
            cancel: &self.cancel,
            finished: false,
        };
        let written = tokio::select! {
            () = self.cancel.cancelled() => return Err(Error::ProactivelyClosed),
            written = async {
                half.write_all(&buf[..]).await?;
                half.flush().await
            } => written,
        };
        frame.finished = true;
        written.map_err(|e| {
            if self.is_closed() {
                Error::ProactivelyClosed
            } else {
                Error::Io(e)
            }
        })
    }

    /// Abort pending writes and shut down the write side; idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        // Every writer gives the lock up once the token fires.
        let Some(mut w) = self.writer.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, w.half.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Socket {} shutdown: {e}", self.id()),
            Err(_) => debug!("Socket {} shutdown timed out", self.id()),
        }
    }
}

impl Recycle for Socket {
    fn recycle(&mut self) {
        self.id.get_mut().clear();
        self.local_addr = None;
        self.remote_addr = None;
        self.proto = None;
        self.wire = WireContext::default();
        *self.reader.get_mut() = None;
        *self.writer.get_mut() = None;
        *self.swap.get_mut() = Swap::new();
        *self.closed.get_mut() = true;
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &*self.id.read())
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JSON_CODEC_ID;
    use crate::message::MessageType;
    use crate::proto::RawProto;

    fn call(seq: i32) -> Message {
        let mut msg = Message::default();
        msg.set_seq(seq);
        msg.set_mtype(MessageType::Call);
        msg.set_service_method("/echo");
        msg.set_body_codec(JSON_CODEC_ID);
        msg.set_body(&format!("hello {seq}")).unwrap();
        msg
    }

    #[tokio::test]
    async fn test_write_then_read_over_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let left = Socket::new(a, Arc::new(RawProto), WireContext::default());
        let right = Socket::new(b, Arc::new(RawProto), WireContext::default());

        for seq in 1..=3 {
            left.write_message(&mut call(seq)).await.unwrap();
        }
        for seq in 1..=3 {
            let msg = right.read_message().await.unwrap().unwrap();
            assert_eq!(msg.seq(), seq);
            let body: String = msg.decode_body(&WireContext::default().codecs).unwrap();
            assert_eq!(body, format!("hello {seq}"));
        }

        left.close().await;
        assert!(right.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_write_fails_proactively() {
        let (a, _b) = tokio::io::duplex(64);
        let socket = Socket::new(a, Arc::new(RawProto), WireContext::default());
        socket.close().await;
        socket.close().await;
        assert!(socket.is_closed());
        let err = socket.write_message(&mut call(1)).await.unwrap_err();
        assert!(err.is_proactively_closed());
    }

    #[tokio::test]
    async fn test_close_aborts_write_to_stalled_peer() {
        let (a, _b) = tokio::io::duplex(64);
        let socket = Arc::new(Socket::new(a, Arc::new(RawProto), WireContext::default()));

        let writer = Arc::clone(&socket);
        let blocked = tokio::spawn(async move {
            let mut msg = call(1);
            msg.set_body(&"x".repeat(100_000)).unwrap();
            writer.write_message(&mut msg).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        tokio::time::timeout(Duration::from_secs(2), socket.close())
            .await
            .unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_proactively_closed());
    }

    #[tokio::test]
    async fn test_abandoned_write_poisons_socket() {
        let (a, _b) = tokio::io::duplex(64);
        let socket = Socket::new(a, Arc::new(RawProto), WireContext::default());
        let mut msg = call(1);
        msg.set_body(&"x".repeat(100_000)).unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), socket.write_message(&mut msg)).await;
        assert!(abandoned.is_err());
        assert!(socket.is_closed());
        let err = socket.write_message(&mut call(2)).await.unwrap_err();
        assert!(err.is_proactively_closed());
        assert!(socket.read_message().await.unwrap_err().is_proactively_closed());

        // Shutting the writer down is still possible after poisoning.
        tokio::time::timeout(Duration::from_secs(2), socket.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reads_scripted_frames() {
        let ctx = WireContext::default();
        let mut frame = BytesMut::new();
        RawProto.pack(&mut call(9), &ctx, &mut frame).unwrap();
        let (head, tail) = frame.split_at(5);
        let mock = tokio_test::io::Builder::new().read(head).read(tail).build();

        let socket = Socket::new(mock, Arc::new(RawProto), ctx);
        let msg = socket.read_message().await.unwrap().unwrap();
        assert_eq!(msg.seq(), 9);
        assert_eq!(msg.service_method(), "/echo");
    }

    #[test]
    fn test_swap_is_shared_and_typed() {
        let swap = Swap::new();
        let view = swap.clone();
        assert!(!swap.insert("user", 7u64));
        assert_eq!(*view.get::<u64>("user").unwrap(), 7);
        assert!(view.get::<String>("user").is_none());
        assert!(swap.insert("user", 8u64));
        assert!(view.remove("user"));
        assert!(swap.is_empty());
    }

    #[test]
    fn test_recycle_drops_connection_state() {
        let pool = Pool::new(2, Socket::empty);
        {
            let (a, _b) = tokio::io::duplex(64);
            let mut socket = pool.acquire();
            let env = SocketEnv {
                wire: WireContext::default(),
                messages: Pool::new(1, Message::default),
                new_body: None,
            };
            socket.reset(Box::new(a), None, None, Arc::new(RawProto), &env);
            socket.swap().insert("k", 1u8);
            assert!(!socket.is_closed());
        }
        let reused = pool.acquire();
        assert!(reused.id().is_empty());
        assert!(reused.swap().is_empty());
        assert!(reused.proto_version().is_none());
        assert!(reused.is_closed());
    }
}

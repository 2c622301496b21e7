//! Sessions: one connection, one read loop, many concurrent calls.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::codec::{CodecRegistry, NIL_CODEC_ID};
use crate::context::{CallCtx, PushCtx};
use crate::endpoint::EndpointCore;
use crate::message::{Body, Message, MessageType, Meta};
use crate::plugin::Phase;
use crate::pool::Pooled;
use crate::proto::ProtoFunc;
use crate::router::Handler;
use crate::socket::{NetAddr, Socket, Swap};
use crate::status::{
    CODE_BAD_MESSAGE, CODE_DEADLINE_EXCEEDED, CODE_HANDLE_TIMEOUT, Status,
};
use crate::xfer::XferPipe;

const ACTIVE: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

type CallOutcome = Result<Pooled<Message>, Status>;
type SharedSocket = Arc<Pooled<Socket>>;

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Give up waiting for the REPLY after this long.
    pub timeout: Option<Duration>,
    /// Body codec id; defaults to the endpoint's codec.
    pub body_codec: Option<u8>,
    /// Metadata sent with the CALL.
    pub meta: Meta,
    /// Transfer filters applied to the CALL body.
    pub xfer_pipe: XferPipe,
}

impl CallOptions {
    /// Set the reply deadline.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pick the body codec.
    #[must_use]
    pub const fn body_codec(mut self, id: u8) -> Self {
        self.body_codec = Some(id);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Append transfer filters.
    #[must_use]
    pub fn xfer(mut self, ids: &[u8]) -> Self {
        self.xfer_pipe.append(ids);
        self
    }
}

/// A decoded REPLY body with its metadata.
#[derive(Debug, Clone)]
pub struct Reply<R> {
    /// Decoded body.
    pub body: R,
    /// Metadata the handler attached to the REPLY.
    pub meta: Meta,
}

/// Per-push settings.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Body codec id; defaults to the endpoint's codec.
    pub body_codec: Option<u8>,
    /// Metadata sent with the PUSH.
    pub meta: Meta,
    /// Transfer filters applied to the PUSH body.
    pub xfer_pipe: XferPipe,
}

impl PushOptions {
    /// Pick the body codec.
    #[must_use]
    pub const fn body_codec(mut self, id: u8) -> Self {
        self.body_codec = Some(id);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Append transfer filters.
    #[must_use]
    pub fn xfer(mut self, ids: &[u8]) -> Self {
        self.xfer_pipe.append(ids);
        self
    }
}

/// Why a read loop stopped.
enum LoopEnd {
    /// Closed on purpose: local close, endpoint shutdown, age, or a hook.
    Local,
    /// The connection failed or the peer went away.
    Lost,
}

/// Removes a pending call on drop unless the reply was taken.
struct PendingSlot<'a> {
    pending: &'a DashMap<i32, oneshot::Sender<CallOutcome>>,
    seq: i32,
    armed: bool,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.remove(&self.seq);
        }
    }
}

/// A live connection with request/reply correlation.
///
/// State only moves forward: active, closing, closed.
pub struct Session {
    id: RwLock<String>,
    core: Arc<EndpointCore>,
    socket: ArcSwapOption<Pooled<Socket>>,
    swap: Swap,
    seq: AtomicI32,
    pending: DashMap<i32, oneshot::Sender<CallOutcome>>,
    state: AtomicU8,
    shutdown: CancellationToken,
    done: CancellationToken,
    proto_func: ProtoFunc,
    redial_addr: Option<String>,
    created: Instant,
    session_age: Mutex<Option<Duration>>,
    context_age: Mutex<Option<Duration>>,
}

impl Session {
    pub(crate) fn new(
        core: Arc<EndpointCore>,
        socket: Pooled<Socket>,
        proto_func: ProtoFunc,
        redial_addr: Option<String>,
    ) -> Arc<Self> {
        let session_age = core.config.default_session_age;
        let context_age = core.config.default_context_age;
        Arc::new(Self {
            id: RwLock::new(socket.id()),
            swap: socket.swap(),
            shutdown: core.token.child_token(),
            core,
            socket: ArcSwapOption::from_pointee(socket),
            seq: AtomicI32::new(1),
            pending: DashMap::new(),
            state: AtomicU8::new(ACTIVE),
            done: CancellationToken::new(),
            proto_func,
            redial_addr,
            created: Instant::now(),
            session_age: Mutex::new(session_age),
            context_age: Mutex::new(context_age),
        })
    }

    /// Spawn the read loop.
    pub(crate) fn start(self: &Arc<Self>) {
        let session = Arc::clone(self);
        self.core.tracker.spawn(async move { session.run().await });
    }

    /// Session id, by default the remote address.
    #[must_use]
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// Rename the session; the endpoint's session hub is re-keyed.
    pub fn set_id(self: &Arc<Self>, id: impl Into<String>) {
        let id = id.into();
        let old = std::mem::replace(&mut *self.id.write(), id.clone());
        if let Some(socket) = self.socket.load_full() {
            socket.set_id(id.clone());
        }
        if self
            .core
            .hub
            .remove_if(&old, |_, s| Arc::ptr_eq(s, self))
            .is_some()
        {
            self.core.hub.insert(id, Arc::clone(self));
        }
    }

    /// Local address of the current connection.
    #[must_use]
    pub fn local_addr(&self) -> Option<NetAddr> {
        self.socket.load().as_ref()?.local_addr().cloned()
    }

    /// Remote address of the current connection.
    #[must_use]
    pub fn remote_addr(&self) -> Option<NetAddr> {
        self.socket.load().as_ref()?.remote_addr().cloned()
    }

    /// Auxiliary storage; survives redials.
    #[must_use]
    pub fn swap(&self) -> Swap {
        self.swap.clone()
    }

    /// True until the session starts closing.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == ACTIVE
    }

    /// True if the session is active and currently connected.
    #[must_use]
    pub fn health(&self) -> bool {
        self.is_active() && self.socket.load().is_some()
    }

    /// Resolves once the session is fully closed.
    pub async fn closed(&self) {
        self.done.cancelled().await;
    }

    /// Maximum session lifetime.
    #[must_use]
    pub fn session_age(&self) -> Option<Duration> {
        *self.session_age.lock()
    }

    /// Change the maximum session lifetime, counted from creation.
    pub fn set_session_age(&self, age: Option<Duration>) {
        *self.session_age.lock() = age.filter(|d| !d.is_zero());
    }

    /// Time limit for inbound handlers.
    #[must_use]
    pub fn context_age(&self) -> Option<Duration> {
        *self.context_age.lock()
    }

    /// Change the time limit for inbound handlers.
    pub fn set_context_age(&self, age: Option<Duration>) {
        *self.context_age.lock() = age.filter(|d| !d.is_zero());
    }

    /// Number of calls waiting for a REPLY.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn codecs(&self) -> &CodecRegistry {
        &self.core.env.wire.codecs
    }

    /// Call `service_method` and decode the reply.
    ///
    /// # Errors
    ///
    /// Returns the remote status, a local failure status, or
    /// [`CODE_DEADLINE_EXCEEDED`] if no reply arrives in time.
    pub async fn call<A, R>(&self, service_method: &str, arg: &A) -> Result<R, Status>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.call_with(service_method, arg, CallOptions::default())
            .await
    }

    /// Call with explicit options.
    ///
    /// # Errors
    ///
    /// See [`Session::call`].
    pub async fn call_with<A, R>(
        &self,
        service_method: &str,
        arg: &A,
        options: CallOptions,
    ) -> Result<R, Status>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.call_reply(service_method, arg, options)
            .await
            .map(|reply| reply.body)
    }

    /// Call and keep the REPLY metadata next to the decoded body.
    ///
    /// # Errors
    ///
    /// See [`Session::call`].
    #[instrument(skip(self, arg, options), fields(session = %self.id()))]
    pub async fn call_reply<A, R>(
        &self,
        service_method: &str,
        arg: &A,
        options: CallOptions,
    ) -> Result<Reply<R>, Status>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        let start = Instant::now();
        let (result, detail) = match self.call_message(service_method, arg, options).await {
            Ok(mut reply) => {
                let detail = self.core.config.print_detail.then(|| reply.detail());
                let decoded = reply
                    .decode_body::<R>(self.codecs())
                    .map(|body| Reply {
                        body,
                        meta: std::mem::take(reply.meta_mut()),
                    })
                    .map_err(Status::bad_message);
                (decoded, detail)
            }
            Err(status) => (Err(status), None),
        };
        let status = result.as_ref().err().cloned().unwrap_or_else(Status::ok);
        self.trace("CALL", service_method, &status, start.elapsed(), detail);
        result
    }

    async fn call_message<A>(
        &self,
        service_method: &str,
        arg: &A,
        options: CallOptions,
    ) -> Result<Pooled<Message>, Status>
    where
        A: Serialize + Sync + ?Sized,
    {
        let socket = self.live_socket()?;
        let mut msg = self.core.env.messages.acquire();
        msg.set_mtype(MessageType::Call);
        msg.set_service_method(service_method);
        msg.set_body_codec(options.body_codec.unwrap_or(self.core.default_body_codec));
        msg.set_body(arg)?;
        *msg.meta_mut() = options.meta;
        msg.xfer_pipe_mut().append(options.xfer_pipe.ids());

        let (seq, waiter) = self.register_waiter();
        let mut slot = PendingSlot {
            pending: &self.pending,
            seq,
            armed: true,
        };
        msg.set_seq(seq);

        // A close that drained the table before we registered must not strand us.
        if !self.is_active() {
            return Err(Status::conn_closed(format!("session {} closed", self.id())));
        }

        self.core
            .plugins
            .run(Phase::PreWriteCall, |p| p.pre_write_call(self, &mut msg))?;

        // The deadline covers the write too, so a stalled peer cannot hold us.
        let deadline = options
            .timeout
            .and_then(|limit| Instant::now().checked_add(limit));
        let exchange = async {
            socket.write_message(&mut msg).await?;
            self.core
                .plugins
                .run_logged(Phase::PostWriteCall, |p| p.post_write_call(self, &msg));
            drop(msg);
            let outcome = waiter.await;
            slot.armed = false;
            match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(Status::conn_closed(format!("session {} closed", self.id()))),
            }
        };
        let reply = tokio::select! {
            outcome = exchange => outcome?,
            () = self.shutdown.cancelled() => {
                return Err(Status::conn_closed(format!("session {} closed", self.id())));
            }
            () = sleep_until(deadline) => {
                let limit = options.timeout.unwrap_or_default();
                return Err(Status::new(CODE_DEADLINE_EXCEEDED, "Deadline Exceeded")
                    .with_cause(format!("no reply to {service_method} within {limit:?}")));
            }
        };
        if let Some(status) = reply.status().filter(|s| !s.is_ok()) {
            return Err(status.clone());
        }
        self.core
            .plugins
            .run(Phase::PostReadReplyBody, |p| p.post_read_reply_body(self, &reply))?;
        Ok(reply)
    }

    /// Send a one-way message.
    ///
    /// # Errors
    ///
    /// Returns a status if the session is closed, a hook refuses the push or
    /// the write fails.
    pub async fn push<A>(&self, service_method: &str, arg: &A) -> Result<(), Status>
    where
        A: Serialize + Sync + ?Sized,
    {
        self.push_with(service_method, arg, PushOptions::default())
            .await
    }

    /// Push with explicit options.
    ///
    /// # Errors
    ///
    /// See [`Session::push`].
    #[instrument(skip(self, arg, options), fields(session = %self.id()))]
    pub async fn push_with<A>(
        &self,
        service_method: &str,
        arg: &A,
        options: PushOptions,
    ) -> Result<(), Status>
    where
        A: Serialize + Sync + ?Sized,
    {
        let start = Instant::now();
        let socket = self.live_socket()?;
        let mut msg = self.core.env.messages.acquire();
        msg.set_mtype(MessageType::Push);
        msg.set_seq(self.seq.fetch_add(1, Ordering::Relaxed));
        msg.set_service_method(service_method);
        msg.set_body_codec(options.body_codec.unwrap_or(self.core.default_body_codec));
        msg.set_body(arg)?;
        *msg.meta_mut() = options.meta;
        msg.xfer_pipe_mut().append(options.xfer_pipe.ids());

        self.core
            .plugins
            .run(Phase::PreWritePush, |p| p.pre_write_push(self, &mut msg))?;
        let written = socket.write_message(&mut msg).await.map_err(Status::from);
        let status = written.as_ref().err().cloned().unwrap_or_else(Status::ok);
        if written.is_ok() {
            self.core
                .plugins
                .run_logged(Phase::PostWritePush, |p| p.post_write_push(self, &msg));
        }
        let detail = self.core.config.print_detail.then(|| msg.detail());
        self.trace("PUSH", service_method, &status, start.elapsed(), detail);
        written
    }

    /// Close the session; idempotent.
    ///
    /// Pending calls fail with a connection-closed status, the socket is shut
    /// down and the session leaves the endpoint's hub.
    pub async fn close(&self) {
        if self
            .state
            .compare_exchange(ACTIVE, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.done.cancelled().await;
            return;
        }
        self.shutdown.cancel();

        let id = self.id();
        self.core
            .hub
            .remove_if(&id, |_, s| std::ptr::eq(Arc::as_ptr(s), self));
        self.fail_pending(&Status::conn_closed(format!("session {id} closed")));
        if let Some(socket) = self.socket.swap(None) {
            socket.close().await;
        }

        self.state.store(CLOSED, Ordering::Release);
        self.core
            .plugins
            .run_logged(Phase::PostDisconnect, |p| p.post_disconnect(self));
        self.done.cancel();
        debug!("Session {id} closed");
    }

    fn live_socket(&self) -> Result<SharedSocket, Status> {
        if !self.is_active() {
            return Err(Status::conn_closed(format!("session {} closed", self.id())));
        }
        self.socket
            .load_full()
            .ok_or_else(|| Status::conn_closed(format!("session {} is reconnecting", self.id())))
    }

    /// Allocate a sequence number not used by any pending call.
    fn register_waiter(&self) -> (i32, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.pending.entry(seq) {
                slot.insert(tx);
                return (seq, rx);
            }
        }
    }

    fn fail_pending(&self, status: &Status) {
        let seqs: Vec<i32> = self.pending.iter().map(|e| *e.key()).collect();
        for seq in seqs {
            if let Some((_, waiter)) = self.pending.remove(&seq) {
                let _ = waiter.send(Err(status.clone()));
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            match self.read_loop().await {
                LoopEnd::Lost if self.redial().await => {}
                _ => break,
            }
        }
        self.close().await;
    }

    async fn read_loop(self: &Arc<Self>) -> LoopEnd {
        let Some(socket) = self.socket.load_full() else {
            return LoopEnd::Local;
        };
        loop {
            if let Err(e) = self
                .core
                .plugins
                .run(Phase::PreReadHeader, |p| p.pre_read_header(self))
            {
                warn!("Closing session {}: {e}", self.id());
                return LoopEnd::Local;
            }

            let deadline = self
                .session_age()
                .and_then(|age| self.created.checked_add(age));
            let read = tokio::select! {
                () = self.shutdown.cancelled() => return LoopEnd::Local,
                () = sleep_until(deadline) => {
                    info!("Session {} reached its maximum age", self.id());
                    return LoopEnd::Local;
                }
                read = socket.read_message() => read,
            };

            match read {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => {
                    debug!("Session {} closed by peer", self.id());
                    return LoopEnd::Lost;
                }
                Err(e) if e.is_proactively_closed() => return LoopEnd::Local,
                Err(e) => {
                    warn!("Session {} read failed: {e}", self.id());
                    return LoopEnd::Lost;
                }
            }
        }
    }

    fn dispatch(self: &Arc<Self>, msg: Pooled<Message>) {
        match msg.mtype() {
            MessageType::Reply => self.on_reply(msg),
            MessageType::Call => self.on_call(msg),
            MessageType::Push => self.on_push(msg),
        }
    }

    fn on_reply(&self, msg: Pooled<Message>) {
        let Some((_, waiter)) = self.pending.remove(&msg.seq()) else {
            warn!(
                "Session {} dropped REPLY for {} with unknown seq {}",
                self.id(),
                msg.service_method(),
                msg.seq()
            );
            return;
        };
        let outcome = match self
            .core
            .plugins
            .run(Phase::PostReadReplyHeader, |p| p.post_read_reply_header(self, &msg))
        {
            Ok(()) => Ok(msg),
            Err(e) => Err(Status::from(e)),
        };
        let _ = waiter.send(outcome);
    }

    fn on_call(self: &Arc<Self>, msg: Pooled<Message>) {
        let header = self
            .core
            .plugins
            .run(Phase::PostReadCallHeader, |p| p.post_read_call_header(self, &msg))
            .map_err(Status::from);
        let handler = self.core.router.get_call(msg.service_method());
        let session = Arc::clone(self);
        tokio::spawn(async move { session.handle_call(msg, header, handler).await });
    }

    fn on_push(self: &Arc<Self>, msg: Pooled<Message>) {
        if let Err(e) = self
            .core
            .plugins
            .run(Phase::PostReadPushHeader, |p| p.post_read_push_header(self, &msg))
        {
            debug!("Dropping PUSH {}: {e}", msg.service_method());
            return;
        }
        let Some(handler) = self.core.router.get_push(msg.service_method()) else {
            debug!("No handler for PUSH {}, dropping", msg.service_method());
            return;
        };
        let session = Arc::clone(self);
        tokio::spawn(async move { session.handle_push(msg, handler).await });
    }

    async fn handle_call(
        self: Arc<Self>,
        msg: Pooled<Message>,
        header: Result<(), Status>,
        handler: Option<Arc<Handler>>,
    ) {
        let start = Instant::now();
        let ctx = CallCtx::new(Arc::clone(&self), &msg);
        let result = match (header, handler) {
            (Err(status), _) => Err(status),
            (Ok(()), None) => Err(Status::not_found(msg.service_method())),
            (Ok(()), Some(handler)) => self.run_call(&handler, ctx.clone(), &msg).await,
        };
        self.write_reply(&ctx, &msg, result, start).await;
    }

    async fn run_call(
        &self,
        handler: &Handler,
        ctx: CallCtx,
        msg: &Message,
    ) -> Result<Body, Status> {
        let hooks = handler.plugins();
        hooks.run(Phase::PreReadCallBody, |p| p.pre_read_call_body(self, msg))?;
        let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke_call(ctx, msg)))
            .unwrap_or_else(|panic| Err(panic_status(handler.name(), &*panic)))?;
        hooks.run(Phase::PostReadCallBody, |p| p.post_read_call_body(self, msg))?;
        self.guard(handler.name(), fut).await
    }

    async fn handle_push(self: Arc<Self>, msg: Pooled<Message>, handler: Arc<Handler>) {
        let start = Instant::now();
        let ctx = PushCtx::new(Arc::clone(&self), &msg);
        let status = match self.run_push(&handler, ctx, &msg).await {
            Ok(()) => Status::ok(),
            Err(status) => {
                warn!("PUSH {} failed: {status}", msg.service_method());
                status
            }
        };
        let detail = self.core.config.print_detail.then(|| msg.detail());
        self.trace("PUSH handled", msg.service_method(), &status, start.elapsed(), detail);
    }

    async fn run_push(&self, handler: &Handler, ctx: PushCtx, msg: &Message) -> Result<(), Status> {
        let hooks = handler.plugins();
        hooks.run(Phase::PreReadPushBody, |p| p.pre_read_push_body(self, msg))?;
        let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke_push(ctx, msg)))
            .unwrap_or_else(|panic| Err(panic_status(handler.name(), &*panic)))?;
        hooks.run(Phase::PostReadPushBody, |p| p.post_read_push_body(self, msg))?;
        self.guard(handler.name(), fut).await
    }

    /// Run a handler future with panic isolation and the context age.
    async fn guard<T>(
        &self,
        name: &str,
        fut: BoxFuture<'static, Result<T, Status>>,
    ) -> Result<T, Status> {
        let fut = AssertUnwindSafe(fut).catch_unwind();
        let outcome = match self.context_age() {
            Some(age) => match tokio::time::timeout(age, fut).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(Status::new(CODE_HANDLE_TIMEOUT, "Handle Timeout")
                        .with_cause(format!("{name} exceeded {age:?}")));
                }
            },
            None => fut.await,
        };
        outcome.unwrap_or_else(|panic| Err(panic_status(name, &*panic)))
    }

    async fn write_reply(
        &self,
        ctx: &CallCtx,
        req: &Message,
        result: Result<Body, Status>,
        start: Instant,
    ) {
        let mut reply = self.core.env.messages.acquire();
        reply.set_mtype(MessageType::Reply);
        reply.set_seq(req.seq());
        reply.set_service_method(req.service_method());
        let (meta, codec) = ctx.take_reply();
        *reply.meta_mut() = meta;
        reply.set_body_codec(codec.unwrap_or(match req.body_codec() {
            NIL_CODEC_ID => self.core.default_body_codec,
            id => id,
        }));
        reply.xfer_pipe_mut().append(req.xfer_pipe().ids());
        let status = match result {
            Ok(body) => {
                reply.replace_body(body);
                Status::ok()
            }
            Err(status) => status,
        };
        reply.set_status(Some(status));

        if let Err(e) = self
            .core
            .plugins
            .run(Phase::PreWriteReply, |p| p.pre_write_reply(self, &mut reply))
        {
            reply.replace_body(Body::Empty);
            reply.set_status(Some(Status::from(e)));
        }

        let mut written = self.write(&mut reply).await;
        if let Err(status) = &written {
            // The body could not be encoded; the caller still gets an answer.
            if status.code() == CODE_BAD_MESSAGE {
                reply.replace_body(Body::Empty);
                reply.set_status(Some(Status::internal(status)));
                written = self.write(&mut reply).await;
            }
        }
        match written {
            Ok(()) => self
                .core
                .plugins
                .run_logged(Phase::PostWriteReply, |p| p.post_write_reply(self, &reply)),
            Err(status) => debug!("REPLY to {} not sent: {status}", req.service_method()),
        }

        let status = reply.status().cloned().unwrap_or_else(Status::ok);
        let detail = self.core.config.print_detail.then(|| req.detail());
        self.trace("CALL handled", req.service_method(), &status, start.elapsed(), detail);
    }

    async fn write(&self, msg: &mut Message) -> Result<(), Status> {
        let socket = self.live_socket()?;
        socket.write_message(msg).await.map_err(Status::from)
    }

    async fn redial(self: &Arc<Self>) -> bool {
        let times = self.core.config.redial_times;
        let Some(addr) = self.redial_addr.as_deref() else {
            return false;
        };
        if times == 0 || !self.is_active() {
            return false;
        }

        if let Some(old) = self.socket.swap(None) {
            old.close().await;
        }
        self.fail_pending(&Status::conn_closed(format!("connection to {addr} lost")));

        for attempt in 1..=times {
            tokio::select! {
                () = self.shutdown.cancelled() => return false,
                () = tokio::time::sleep(self.core.config.redial_interval) => {}
            }
            let socket = match self.core.connect(addr, &self.proto_func, true).await {
                Ok(socket) => socket,
                Err(status) => {
                    warn!("Redial {attempt}/{times} of {addr} failed: {status}");
                    continue;
                }
            };
            socket.set_id(self.id());
            socket.set_swap(self.swap.clone());
            self.socket.store(Some(Arc::new(socket)));

            let refused = self
                .core
                .plugins
                .run(Phase::PostDial, |p| p.post_dial(self, true));
            if refused.is_err() || !self.is_active() {
                if let Some(socket) = self.socket.swap(None) {
                    socket.close().await;
                }
                if let Err(e) = refused {
                    warn!("Redial of {addr} refused: {e}");
                    continue;
                }
                return false;
            }
            info!("Session {} redialed {addr} (attempt {attempt})", self.id());
            return true;
        }
        false
    }

    fn trace(
        &self,
        event: &'static str,
        service_method: &str,
        status: &Status,
        elapsed: Duration,
        detail: Option<String>,
    ) {
        let config = &self.core.config;
        let cost = config.count_time.then(|| format!("{elapsed:?}"));
        if elapsed >= config.slow_comet_duration {
            warn!(
                session = %self.id(),
                service_method,
                code = status.code(),
                cost = ?cost,
                detail = ?detail,
                "Slow {event}"
            );
        } else {
            debug!(
                session = %self.id(),
                service_method,
                code = status.code(),
                cost = ?cost,
                detail = ?detail,
                "{event}"
            );
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_status(name: &str, panic: &(dyn Any + Send)) -> Status {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!("Handler {name} panicked: {reason}");
    Status::internal(format!("handler {name} panicked: {reason}"))
}

//! Per-request handler contexts.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::codec::CodecRegistry;
use crate::message::{Message, Meta};
use crate::session::Session;
use crate::socket::{NetAddr, Swap};

struct Incoming {
    session: Arc<Session>,
    seq: i32,
    service_method: String,
    meta: Meta,
    body_codec: u8,
}

impl Incoming {
    fn new(session: Arc<Session>, msg: &Message) -> Self {
        Self {
            session,
            seq: msg.seq(),
            service_method: msg.service_method().to_string(),
            meta: msg.meta().clone(),
            body_codec: msg.body_codec(),
        }
    }
}

#[derive(Default)]
struct ReplyState {
    meta: Meta,
    body_codec: Option<u8>,
}

struct CallInner {
    incoming: Incoming,
    reply: Mutex<ReplyState>,
}

/// Context handed to CALL handlers.
///
/// Cheap to clone. Reply metadata and codec set here are applied to the
/// REPLY once the handler returns.
#[derive(Clone)]
pub struct CallCtx {
    inner: Arc<CallInner>,
}

impl CallCtx {
    pub(crate) fn new(session: Arc<Session>, msg: &Message) -> Self {
        Self {
            inner: Arc::new(CallInner {
                incoming: Incoming::new(session, msg),
                reply: Mutex::new(ReplyState::default()),
            }),
        }
    }

    /// Session the CALL arrived on.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.incoming.session
    }

    /// Sequence number of the CALL.
    #[must_use]
    pub fn seq(&self) -> i32 {
        self.inner.incoming.seq
    }

    /// Requested service-method path.
    #[must_use]
    pub fn service_method(&self) -> &str {
        &self.inner.incoming.service_method
    }

    /// Metadata sent with the CALL.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.inner.incoming.meta
    }

    /// One metadata value.
    #[must_use]
    pub fn peek_meta(&self, key: &str) -> Option<&Bytes> {
        self.inner.incoming.meta.get(key)
    }

    /// Body codec of the CALL.
    #[must_use]
    pub fn body_codec(&self) -> u8 {
        self.inner.incoming.body_codec
    }

    /// Remote address of the session.
    #[must_use]
    pub fn remote_addr(&self) -> Option<NetAddr> {
        self.session().remote_addr()
    }

    /// Session auxiliary storage.
    #[must_use]
    pub fn swap(&self) -> Swap {
        self.session().swap()
    }

    /// Add metadata to the REPLY.
    pub fn set_reply_meta(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.inner.reply.lock().meta.insert(key.into(), value.into());
    }

    /// Encode the REPLY with a different codec than the CALL used.
    pub fn set_reply_body_codec(&self, id: u8) {
        self.inner.reply.lock().body_codec = Some(id);
    }

    pub(crate) fn codecs(&self) -> &CodecRegistry {
        self.session().codecs()
    }

    pub(crate) fn take_reply(&self) -> (Meta, Option<u8>) {
        let mut reply = self.inner.reply.lock();
        (std::mem::take(&mut reply.meta), reply.body_codec)
    }
}

/// Context handed to PUSH handlers.
#[derive(Clone)]
pub struct PushCtx {
    inner: Arc<Incoming>,
}

impl PushCtx {
    pub(crate) fn new(session: Arc<Session>, msg: &Message) -> Self {
        Self {
            inner: Arc::new(Incoming::new(session, msg)),
        }
    }

    /// Session the PUSH arrived on.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    /// Pushed service-method path.
    #[must_use]
    pub fn service_method(&self) -> &str {
        &self.inner.service_method
    }

    /// Metadata sent with the PUSH.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.inner.meta
    }

    /// One metadata value.
    #[must_use]
    pub fn peek_meta(&self, key: &str) -> Option<&Bytes> {
        self.inner.meta.get(key)
    }

    /// Body codec of the PUSH.
    #[must_use]
    pub fn body_codec(&self) -> u8 {
        self.inner.body_codec
    }

    /// Remote address of the session.
    #[must_use]
    pub fn remote_addr(&self) -> Option<NetAddr> {
        self.session().remote_addr()
    }

    /// Session auxiliary storage.
    #[must_use]
    pub fn swap(&self) -> Swap {
        self.session().swap()
    }

    pub(crate) fn codecs(&self) -> &CodecRegistry {
        self.session().codecs()
    }
}

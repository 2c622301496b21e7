//! Multi-phase plugin pipeline.
//!
//! A plugin declares the phases it handles through [`Plugin::phases`]; the
//! container sorts plugins into per-phase lists once, when it is built, so
//! invoking a phase only walks the plugins that actually hook it. Hooks run in
//! registration order and the first non-OK [`Status`] aborts the operation in
//! flight.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::config::EndpointConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::router::Handler;
use crate::session::Session;
use crate::socket::NetAddr;
use crate::status::Status;

/// Protocol phases a plugin can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Phase {
    PreNewEndpoint,
    PostNewEndpoint,
    PostRegister,
    PostListen,
    PreDial,
    PostDial,
    PostAccept,
    PreWriteCall,
    PostWriteCall,
    PreWriteReply,
    PostWriteReply,
    PreWritePush,
    PostWritePush,
    PreReadHeader,
    PostReadCallHeader,
    PreReadCallBody,
    PostReadCallBody,
    PostReadPushHeader,
    PreReadPushBody,
    PostReadPushBody,
    PostReadReplyHeader,
    PostReadReplyBody,
    PostDisconnect,
}

impl Phase {
    /// Number of phases.
    pub const COUNT: usize = 23;

    /// Snake-case name used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreNewEndpoint => "pre_new_endpoint",
            Self::PostNewEndpoint => "post_new_endpoint",
            Self::PostRegister => "post_register",
            Self::PostListen => "post_listen",
            Self::PreDial => "pre_dial",
            Self::PostDial => "post_dial",
            Self::PostAccept => "post_accept",
            Self::PreWriteCall => "pre_write_call",
            Self::PostWriteCall => "post_write_call",
            Self::PreWriteReply => "pre_write_reply",
            Self::PostWriteReply => "post_write_reply",
            Self::PreWritePush => "pre_write_push",
            Self::PostWritePush => "post_write_push",
            Self::PreReadHeader => "pre_read_header",
            Self::PostReadCallHeader => "post_read_call_header",
            Self::PreReadCallBody => "pre_read_call_body",
            Self::PostReadCallBody => "post_read_call_body",
            Self::PostReadPushHeader => "post_read_push_header",
            Self::PreReadPushBody => "pre_read_push_body",
            Self::PostReadPushBody => "post_read_push_body",
            Self::PostReadReplyHeader => "post_read_reply_header",
            Self::PostReadReplyBody => "post_read_reply_body",
            Self::PostDisconnect => "post_disconnect",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a plugin hook.
pub type HookResult = std::result::Result<(), Status>;

/// An endpoint extension.
///
/// Only the hooks for phases listed by [`Plugin::phases`] are ever called.
#[allow(unused_variables)]
pub trait Plugin: Send + Sync + 'static {
    /// Unique name within a container.
    fn name(&self) -> &str;

    /// Phases this plugin hooks.
    fn phases(&self) -> &[Phase];

    /// May adjust the configuration before it is validated.
    fn pre_new_endpoint(&self, config: &mut EndpointConfig) -> HookResult {
        Ok(())
    }

    /// Runs once the endpoint is fully built.
    fn post_new_endpoint(&self, endpoint: &Endpoint) -> HookResult {
        Ok(())
    }

    /// Runs before a handler becomes routable.
    fn post_register(&self, handler: &Handler) -> HookResult {
        Ok(())
    }

    /// Runs after a listener is bound.
    fn post_listen(&self, addr: &NetAddr) -> HookResult {
        Ok(())
    }

    /// Runs before connecting; a failure refuses the dial.
    fn pre_dial(&self, addr: &str, is_redial: bool) -> HookResult {
        Ok(())
    }

    /// Runs after connecting; a failure closes the new session.
    fn post_dial(&self, session: &Session, is_redial: bool) -> HookResult {
        Ok(())
    }

    /// Runs for every inbound connection; a failure rejects it.
    fn post_accept(&self, session: &Session) -> HookResult {
        Ok(())
    }

    /// Runs before a CALL is written; a failure cancels the call.
    fn pre_write_call(&self, session: &Session, msg: &mut Message) -> HookResult {
        Ok(())
    }

    /// Runs after a CALL is written.
    fn post_write_call(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs before a REPLY is written.
    fn pre_write_reply(&self, session: &Session, msg: &mut Message) -> HookResult {
        Ok(())
    }

    /// Runs after a REPLY is written.
    fn post_write_reply(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs before a PUSH is written; a failure cancels the push.
    fn pre_write_push(&self, session: &Session, msg: &mut Message) -> HookResult {
        Ok(())
    }

    /// Runs after a PUSH is written.
    fn post_write_push(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs before each frame is read; a failure closes the session.
    fn pre_read_header(&self, session: &Session) -> HookResult {
        Ok(())
    }

    /// Runs once a CALL header is decoded.
    fn post_read_call_header(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs before a CALL body is decoded into the handler argument.
    fn pre_read_call_body(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs after a CALL body is decoded.
    fn post_read_call_body(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs once a PUSH header is decoded.
    fn post_read_push_header(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs before a PUSH body is decoded into the handler argument.
    fn pre_read_push_body(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs after a PUSH body is decoded.
    fn post_read_push_body(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs once a REPLY header is decoded.
    fn post_read_reply_header(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs before the caller decodes a REPLY body.
    fn post_read_reply_body(&self, session: &Session, msg: &Message) -> HookResult {
        Ok(())
    }

    /// Runs after a session is closed.
    fn post_disconnect(&self, session: &Session) -> HookResult {
        Ok(())
    }
}

struct Inner {
    plugins: Vec<Arc<dyn Plugin>>,
    by_phase: Vec<Vec<Arc<dyn Plugin>>>,
}

/// Ordered, immutable set of plugins indexed by phase.
#[derive(Clone)]
pub struct PluginContainer {
    inner: Arc<Inner>,
}

impl PluginContainer {
    /// Build a container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicatePlugin`] if two plugins share a name.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Result<Self> {
        let mut names = HashSet::new();
        for plugin in &plugins {
            if !names.insert(plugin.name().to_string()) {
                return Err(Error::DuplicatePlugin(plugin.name().to_string()));
            }
        }
        let mut by_phase = vec![Vec::new(); Phase::COUNT];
        for plugin in &plugins {
            for phase in plugin.phases() {
                let slot = &mut by_phase[*phase as usize];
                if !slot.iter().any(|p: &Arc<dyn Plugin>| Arc::ptr_eq(p, plugin)) {
                    slot.push(Arc::clone(plugin));
                }
            }
        }
        Ok(Self {
            inner: Arc::new(Inner { plugins, by_phase }),
        })
    }

    /// A container holding these plugins followed by `more`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicatePlugin`] on a name clash.
    pub fn extend(&self, more: Vec<Arc<dyn Plugin>>) -> Result<Self> {
        if more.is_empty() {
            return Ok(self.clone());
        }
        let mut plugins = self.inner.plugins.clone();
        plugins.extend(more);
        Self::new(plugins)
    }

    /// All plugins in registration order.
    #[must_use]
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.inner.plugins
    }

    /// True if any plugin hooks `phase`.
    #[must_use]
    pub fn hooks(&self, phase: Phase) -> bool {
        !self.inner.by_phase[phase as usize].is_empty()
    }

    /// Run `phase` on every plugin hooking it, stopping at the first failure.
    pub(crate) fn run(
        &self,
        phase: Phase,
        mut hook: impl FnMut(&dyn Plugin) -> HookResult,
    ) -> Result<()> {
        for plugin in &self.inner.by_phase[phase as usize] {
            if let Err(status) = hook(plugin.as_ref()) {
                return Err(Error::Plugin {
                    plugin: plugin.name().to_string(),
                    phase: phase.as_str(),
                    status,
                });
            }
        }
        Ok(())
    }

    /// Like [`PluginContainer::run`] but only logs failures.
    pub(crate) fn run_logged(&self, phase: Phase, hook: impl FnMut(&dyn Plugin) -> HookResult) {
        if let Err(e) = self.run(phase, hook) {
            warn!("{e}");
        }
    }
}

impl Default for PluginContainer {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                plugins: Vec::new(),
                by_phase: vec![Vec::new(); Phase::COUNT],
            }),
        }
    }
}

impl fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.inner.plugins.iter().map(|p| p.name()).collect();
        f.debug_struct("PluginContainer")
            .field("plugins", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::CODE_DIAL_FAILED;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        refuse: bool,
    }

    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn phases(&self) -> &[Phase] {
            &[Phase::PreDial]
        }

        fn pre_dial(&self, addr: &str, _is_redial: bool) -> HookResult {
            self.log.lock().push(format!("{}:{addr}", self.name));
            if self.refuse {
                return Err(Status::new(CODE_DIAL_FAILED, "refused"));
            }
            Ok(())
        }
    }

    fn recorder(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        refuse: bool,
    ) -> Arc<dyn Plugin> {
        Arc::new(Recorder {
            name,
            log: Arc::clone(log),
            refuse,
        })
    }

    #[test]
    fn test_hooks_run_in_order_and_stop_on_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let container = PluginContainer::new(vec![
            recorder("a", &log, false),
            recorder("b", &log, true),
            recorder("c", &log, false),
        ])
        .unwrap();
        assert!(container.hooks(Phase::PreDial));
        assert!(!container.hooks(Phase::PostDial));

        let err = container
            .run(Phase::PreDial, |p| p.pre_dial("host:1", false))
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::Plugin { plugin, phase: "pre_dial", .. } if plugin == "b"
        ));
        assert_eq!(Status::from(err).code(), CODE_DIAL_FAILED);
        assert_eq!(*log.lock(), ["a:host:1", "b:host:1"]);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let container = PluginContainer::new(vec![recorder("a", &log, false)]).unwrap();
        assert!(matches!(
            container.extend(vec![recorder("a", &log, false)]),
            Err(Error::DuplicatePlugin(name)) if name == "a"
        ));
        let extended = container.extend(vec![recorder("b", &log, false)]).unwrap();
        assert_eq!(extended.plugins().len(), 2);
        assert_eq!(container.plugins().len(), 1);
    }
}

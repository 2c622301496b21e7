//! Service-method routing.
//!
//! Handlers are typed closures checked by the compiler at registration. Each
//! one is wrapped into an immutable [`Handler`] descriptor holding its path,
//! type names, route-level plugins and an invoke closure that decodes the
//! argument and returns a boxed future. The route tables are copy-on-write
//! maps behind [`ArcSwap`], so dispatch is a lock-free lookup.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::context::{CallCtx, PushCtx};
use crate::error::{Error, Result};
use crate::message::{Body, Message};
use crate::plugin::{Phase, Plugin, PluginContainer};
use crate::status::Status;

/// Maps a route prefix and a `Type.Method` name to a service-method path.
pub type ServiceMethodMapper = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Default mapper: snake-case segments joined by `/`.
///
/// `("", "Math.Add")` becomes `/math/add` and `("/v1", "HTTPServer.GetURL")`
/// becomes `/v1/http_server/get_url`.
#[must_use]
pub fn snake_path_mapper(prefix: &str, name: &str) -> String {
    let mut path = String::new();
    for segment in prefix.split('/').filter(|s| !s.is_empty()) {
        path.push('/');
        path.push_str(segment);
    }
    for segment in name.split(['.', '/']).filter(|s| !s.is_empty()) {
        path.push('/');
        path.push_str(&to_snake_case(segment));
    }
    path
}

/// Keeps names as written, joined by `.`: `("", "Math.Add")` stays `Math.Add`.
#[must_use]
pub fn dotted_mapper(prefix: &str, name: &str) -> String {
    prefix
        .split(['/', '.'])
        .chain(name.split(['/', '.']))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

fn to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase() || prev.is_ascii_digit() || (prev.is_uppercase() && next_lower)
            {
                out.push('_');
            }
        }
        out.extend(c.to_lowercase());
    }
    out
}

fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Whether a handler serves CALLs or PUSHes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Replies to CALL messages.
    Call,
    /// Consumes PUSH messages.
    Push,
}

type CallFuture = BoxFuture<'static, std::result::Result<Body, Status>>;
type PushFuture = BoxFuture<'static, std::result::Result<(), Status>>;
type CallInvoke =
    dyn Fn(CallCtx, &Message) -> std::result::Result<CallFuture, Status> + Send + Sync;
type PushInvoke =
    dyn Fn(PushCtx, &Message) -> std::result::Result<PushFuture, Status> + Send + Sync;

enum Invoke {
    Call(Box<CallInvoke>),
    Push(Box<PushInvoke>),
}

/// Immutable description of a routable handler.
pub struct Handler {
    name: String,
    arg_type: &'static str,
    reply_type: Option<&'static str>,
    is_unknown: bool,
    plugins: PluginContainer,
    invoke: Invoke,
}

impl Handler {
    /// Service-method path.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// CALL or PUSH.
    #[must_use]
    pub fn kind(&self) -> HandlerKind {
        match &self.invoke {
            Invoke::Call(_) => HandlerKind::Call,
            Invoke::Push(_) => HandlerKind::Push,
        }
    }

    /// Rust type name of the argument.
    #[must_use]
    pub const fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Rust type name of the reply; `None` for PUSH handlers.
    #[must_use]
    pub const fn reply_type(&self) -> Option<&'static str> {
        self.reply_type
    }

    /// True for the fallback handlers.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        self.is_unknown
    }

    /// Plugins in effect for this route.
    #[must_use]
    pub const fn plugins(&self) -> &PluginContainer {
        &self.plugins
    }

    /// Decode the argument and start the CALL handler.
    pub(crate) fn invoke_call(
        &self,
        ctx: CallCtx,
        msg: &Message,
    ) -> std::result::Result<CallFuture, Status> {
        match &self.invoke {
            Invoke::Call(f) => f(ctx, msg),
            Invoke::Push(_) => Err(Status::internal(format!("{} is a PUSH handler", self.name))),
        }
    }

    /// Decode the argument and start the PUSH handler.
    pub(crate) fn invoke_push(
        &self,
        ctx: PushCtx,
        msg: &Message,
    ) -> std::result::Result<PushFuture, Status> {
        match &self.invoke {
            Invoke::Push(f) => f(ctx, msg),
            Invoke::Call(_) => Err(Status::internal(format!("{} is a CALL handler", self.name))),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("is_unknown", &self.is_unknown)
            .finish_non_exhaustive()
    }
}

fn call_invoke<A, R, F, Fut>(f: F) -> Box<CallInvoke>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<R, Status>> + Send + 'static,
{
    Box::new(move |ctx: CallCtx, msg: &Message| -> std::result::Result<CallFuture, Status> {
        let arg: A = msg.decode_body(ctx.codecs()).map_err(Status::bad_message)?;
        let fut = f(ctx, arg);
        Ok(async move {
            let reply = fut.await?;
            serde_value::to_value(&reply)
                .map(Body::Value)
                .map_err(Status::internal)
        }
        .boxed())
    })
}

fn push_invoke<A, F, Fut>(f: F) -> Box<PushInvoke>
where
    A: DeserializeOwned + Send + 'static,
    F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
{
    Box::new(move |ctx: PushCtx, msg: &Message| -> std::result::Result<PushFuture, Status> {
        let arg: A = msg.decode_body(ctx.codecs()).map_err(Status::bad_message)?;
        Ok(f(ctx, arg).boxed())
    })
}

/// A type whose methods serve CALLs.
///
/// ```ignore
/// struct Math;
///
/// impl CallController for Math {
///     fn register(methods: &mut CallMethods<Self>) {
///         methods.add("Add", Self::add);
///     }
/// }
///
/// impl Math {
///     async fn add(self: Arc<Self>, _ctx: CallCtx, arg: Vec<i64>) -> Result<i64, Status> {
///         Ok(arg.iter().sum())
///     }
/// }
/// ```
pub trait CallController: Send + Sync + Sized + 'static {
    /// Type segment of the routes; defaults to the short type name.
    fn name() -> String {
        short_type_name::<Self>()
    }

    /// Declare the methods to route.
    fn register(methods: &mut CallMethods<Self>);
}

/// A type whose methods serve PUSHes.
pub trait PushController: Send + Sync + Sized + 'static {
    /// Type segment of the routes; defaults to the short type name.
    fn name() -> String {
        short_type_name::<Self>()
    }

    /// Declare the methods to route.
    fn register(methods: &mut PushMethods<Self>);
}

struct MethodEntry<I: ?Sized> {
    name: String,
    arg_type: &'static str,
    reply_type: Option<&'static str>,
    invoke: Box<I>,
}

/// Collects the CALL methods of a controller.
pub struct CallMethods<C> {
    controller: Arc<C>,
    entries: Vec<MethodEntry<CallInvoke>>,
}

impl<C: CallController> CallMethods<C> {
    /// Route `Type.name` to `f`.
    pub fn add<A, R, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<C>, CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, Status>> + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        self.entries.push(MethodEntry {
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: Some(std::any::type_name::<R>()),
            invoke: call_invoke(move |ctx, arg| f(Arc::clone(&controller), ctx, arg)),
        });
        self
    }
}

/// Collects the PUSH methods of a controller.
pub struct PushMethods<C> {
    controller: Arc<C>,
    entries: Vec<MethodEntry<PushInvoke>>,
}

impl<C: PushController> PushMethods<C> {
    /// Route `Type.name` to `f`.
    pub fn add<A, F, Fut>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(Arc<C>, PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        self.entries.push(MethodEntry {
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: None,
            invoke: push_invoke(move |ctx, arg| f(Arc::clone(&controller), ctx, arg)),
        });
        self
    }
}

type RouteMap = HashMap<String, Arc<Handler>>;

/// Route tables shared by a root router and all its sub-routers.
struct RouteTree {
    calls: ArcSwap<RouteMap>,
    pushes: ArcSwap<RouteMap>,
    unknown_call: ArcSwapOption<Handler>,
    unknown_push: ArcSwapOption<Handler>,
    write: Mutex<()>,
    mapper: ServiceMethodMapper,
}

/// Registers handlers and resolves service-method paths.
///
/// Clones and sub-routers share one route tree, so a route registered
/// anywhere is visible everywhere.
#[derive(Clone)]
pub struct Router {
    tree: Arc<RouteTree>,
    prefix: String,
    plugins: PluginContainer,
}

impl Router {
    pub(crate) fn new(mapper: ServiceMethodMapper, plugins: PluginContainer) -> Self {
        Self {
            tree: Arc::new(RouteTree {
                calls: ArcSwap::from_pointee(RouteMap::new()),
                pushes: ArcSwap::from_pointee(RouteMap::new()),
                unknown_call: ArcSwapOption::empty(),
                unknown_push: ArcSwapOption::empty(),
                write: Mutex::new(()),
                mapper,
            }),
            prefix: String::new(),
            plugins,
        }
    }

    /// A router registering under `prefix` with extra route-level plugins.
    ///
    /// # Errors
    ///
    /// Returns an error if a plugin name is already in use on this router.
    pub fn sub_route(&self, prefix: &str, plugins: Vec<Arc<dyn Plugin>>) -> Result<Self> {
        let prefix = prefix.trim_matches('/');
        Ok(Self {
            tree: Arc::clone(&self.tree),
            prefix: match (self.prefix.is_empty(), prefix.is_empty()) {
                (_, true) => self.prefix.clone(),
                (true, false) => prefix.to_string(),
                (false, false) => format!("{}/{prefix}", self.prefix),
            },
            plugins: self.plugins.extend(plugins)?,
        })
    }

    /// Prefix applied to routes registered through this router.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Route every method of `controller`; returns the registered paths.
    ///
    /// # Errors
    ///
    /// Returns an error on a duplicate or empty path, or if a `post_register`
    /// hook refuses a handler. Earlier methods stay registered.
    pub fn route_call<C: CallController>(
        &self,
        controller: C,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Vec<String>> {
        let mut methods = CallMethods {
            controller: Arc::new(controller),
            entries: Vec::new(),
        };
        C::register(&mut methods);
        let plugins = self.plugins.extend(plugins)?;
        let type_name = C::name();
        methods
            .entries
            .into_iter()
            .map(|entry| {
                self.register(
                    &format!("{type_name}.{}", entry.name),
                    entry.arg_type,
                    entry.reply_type,
                    &plugins,
                    Invoke::Call(entry.invoke),
                )
            })
            .collect()
    }

    /// Route every method of a PUSH `controller`; returns the registered paths.
    ///
    /// # Errors
    ///
    /// See [`Router::route_call`].
    pub fn route_push<C: PushController>(
        &self,
        controller: C,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Vec<String>> {
        let mut methods = PushMethods {
            controller: Arc::new(controller),
            entries: Vec::new(),
        };
        C::register(&mut methods);
        let plugins = self.plugins.extend(plugins)?;
        let type_name = C::name();
        methods
            .entries
            .into_iter()
            .map(|entry| {
                self.register(
                    &format!("{type_name}.{}", entry.name),
                    entry.arg_type,
                    entry.reply_type,
                    &plugins,
                    Invoke::Push(entry.invoke),
                )
            })
            .collect()
    }

    /// Route a bare CALL function under `name`.
    ///
    /// # Errors
    ///
    /// See [`Router::route_call`].
    pub fn route_call_func<A, R, F, Fut>(
        &self,
        name: &str,
        f: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<String>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, Status>> + Send + 'static,
    {
        let plugins = self.plugins.extend(plugins)?;
        self.register(
            name,
            std::any::type_name::<A>(),
            Some(std::any::type_name::<R>()),
            &plugins,
            Invoke::Call(call_invoke(f)),
        )
    }

    /// Route a bare PUSH function under `name`.
    ///
    /// # Errors
    ///
    /// See [`Router::route_call`].
    pub fn route_push_func<A, F, Fut>(
        &self,
        name: &str,
        f: F,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<String>
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(PushCtx, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    {
        let plugins = self.plugins.extend(plugins)?;
        self.register(
            name,
            std::any::type_name::<A>(),
            None,
            &plugins,
            Invoke::Push(push_invoke(f)),
        )
    }

    /// Fallback for CALLs with no route; receives the encoded body.
    ///
    /// # Errors
    ///
    /// Returns an error if a `post_register` hook refuses the handler.
    pub fn set_unknown_call<R, F, Fut>(&self, f: F, plugins: Vec<Arc<dyn Plugin>>) -> Result<()>
    where
        R: Serialize + Send + 'static,
        F: Fn(CallCtx, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, Status>> + Send + 'static,
    {
        let invoke: Box<CallInvoke> = Box::new(
            move |ctx: CallCtx, msg: &Message| -> std::result::Result<CallFuture, Status> {
                let body = msg.marshal_body(ctx.codecs()).map_err(Status::bad_message)?;
                let fut = f(ctx, body);
                Ok(async move {
                    let reply = fut.await?;
                    serde_value::to_value(&reply)
                        .map(Body::Value)
                        .map_err(Status::internal)
                }
                .boxed())
            },
        );
        let handler = self.unknown_handler(
            Invoke::Call(invoke),
            Some(std::any::type_name::<R>()),
            plugins,
        )?;
        self.tree.unknown_call.store(Some(Arc::new(handler)));
        Ok(())
    }

    /// Fallback for PUSHes with no route; receives the encoded body.
    ///
    /// # Errors
    ///
    /// Returns an error if a `post_register` hook refuses the handler.
    pub fn set_unknown_push<F, Fut>(&self, f: F, plugins: Vec<Arc<dyn Plugin>>) -> Result<()>
    where
        F: Fn(PushCtx, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), Status>> + Send + 'static,
    {
        let invoke: Box<PushInvoke> = Box::new(
            move |ctx: PushCtx, msg: &Message| -> std::result::Result<PushFuture, Status> {
                let body = msg.marshal_body(ctx.codecs()).map_err(Status::bad_message)?;
                Ok(f(ctx, body).boxed())
            },
        );
        let handler = self.unknown_handler(Invoke::Push(invoke), None, plugins)?;
        self.tree.unknown_push.store(Some(Arc::new(handler)));
        Ok(())
    }

    /// Handler for a CALL path, falling back to the unknown handler.
    #[must_use]
    pub fn get_call(&self, service_method: &str) -> Option<Arc<Handler>> {
        self.tree
            .calls
            .load()
            .get(service_method)
            .cloned()
            .or_else(|| self.tree.unknown_call.load_full())
    }

    /// Handler for a PUSH path, falling back to the unknown handler.
    #[must_use]
    pub fn get_push(&self, service_method: &str) -> Option<Arc<Handler>> {
        self.tree
            .pushes
            .load()
            .get(service_method)
            .cloned()
            .or_else(|| self.tree.unknown_push.load_full())
    }

    /// Registered CALL paths, sorted.
    #[must_use]
    pub fn call_paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.tree.calls.load().keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    /// Registered PUSH paths, sorted.
    #[must_use]
    pub fn push_paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.tree.pushes.load().keys().cloned().collect();
        paths.sort_unstable();
        paths
    }

    fn unknown_handler(
        &self,
        invoke: Invoke,
        reply_type: Option<&'static str>,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<Handler> {
        let handler = Handler {
            name: "unknown".to_string(),
            arg_type: std::any::type_name::<Bytes>(),
            reply_type,
            is_unknown: true,
            plugins: self.plugins.extend(plugins)?,
            invoke,
        };
        post_register(&handler)?;
        Ok(handler)
    }

    fn register(
        &self,
        name: &str,
        arg_type: &'static str,
        reply_type: Option<&'static str>,
        plugins: &PluginContainer,
        invoke: Invoke,
    ) -> Result<String> {
        if name.trim_matches(['.', '/']).is_empty() {
            return Err(Error::InvalidRoute(format!("empty name {name:?}")));
        }
        let path = (self.tree.mapper)(&self.prefix, name);
        let handler = Handler {
            name: path.clone(),
            arg_type,
            reply_type,
            is_unknown: false,
            plugins: plugins.clone(),
            invoke,
        };
        let table = match handler.kind() {
            HandlerKind::Call => &self.tree.calls,
            HandlerKind::Push => &self.tree.pushes,
        };

        let _guard = self.tree.write.lock();
        if table.load().contains_key(&path) {
            return Err(Error::DuplicateRoute(path));
        }
        post_register(&handler)?;
        let mut routes = RouteMap::clone(&table.load());
        routes.insert(path.clone(), Arc::new(handler));
        table.store(Arc::new(routes));
        debug!("Registered {path}");
        Ok(path)
    }
}

fn post_register(handler: &Handler) -> Result<()> {
    handler
        .plugins
        .run(Phase::PostRegister, |p| p.post_register(handler))
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("prefix", &self.prefix)
            .field("calls", &self.call_paths())
            .field("pushes", &self.push_paths())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Math;

    impl CallController for Math {
        fn register(methods: &mut CallMethods<Self>) {
            methods.add("Add", Self::add).add("Neg", Self::neg);
        }
    }

    impl Math {
        async fn add(
            self: Arc<Self>,
            _ctx: CallCtx,
            arg: Vec<i64>,
        ) -> std::result::Result<i64, Status> {
            Ok(arg.iter().sum())
        }

        async fn neg(self: Arc<Self>, _ctx: CallCtx, arg: i64) -> std::result::Result<i64, Status> {
            Ok(-arg)
        }
    }

    fn router() -> Router {
        Router::new(Arc::new(snake_path_mapper), PluginContainer::default())
    }

    #[test]
    fn test_snake_path_mapper() {
        assert_eq!(snake_path_mapper("", "Math.Add"), "/math/add");
        assert_eq!(snake_path_mapper("", "HTTPServer.GetURL"), "/http_server/get_url");
        assert_eq!(snake_path_mapper("/v1", "Math.Add"), "/v1/math/add");
        assert_eq!(snake_path_mapper("v1/", "push.status"), "/v1/push/status");
        assert_eq!(snake_path_mapper("", "Stats.Top10Items"), "/stats/top10_items");
    }

    #[test]
    fn test_dotted_mapper() {
        assert_eq!(dotted_mapper("", "Math.Add"), "Math.Add");
        assert_eq!(dotted_mapper("v1", "Math.Add"), "v1.Math.Add");
    }

    #[test]
    fn test_controller_routes_and_duplicates() {
        let router = router();
        let paths = router.route_call(Math, vec![]).unwrap();
        assert_eq!(paths, ["/math/add", "/math/neg"]);

        let handler = router.get_call("/math/add").unwrap();
        assert_eq!(handler.kind(), HandlerKind::Call);
        assert!(handler.arg_type().contains("Vec<i64>"));
        assert_eq!(handler.reply_type(), Some("i64"));
        assert!(!handler.is_unknown());

        assert!(matches!(
            router.route_call(Math, vec![]),
            Err(Error::DuplicateRoute(path)) if path == "/math/add"
        ));
        assert!(router.get_call("/math/sub").is_none());
        assert!(router.get_push("/math/add").is_none());
    }

    #[test]
    fn test_sub_router_shares_tree() {
        let root = router();
        let v1 = root.sub_route("/v1", vec![]).unwrap();
        let admin = v1.sub_route("admin", vec![]).unwrap();
        assert_eq!(admin.prefix(), "v1/admin");

        v1.route_call(Math, vec![]).unwrap();
        admin
            .route_push_func("Audit.Log", |_ctx: PushCtx, _line: String| async { Ok(()) }, vec![])
            .unwrap();
        assert!(root.get_call("/v1/math/add").is_some());
        assert_eq!(root.push_paths(), ["/v1/admin/audit/log"]);
    }

    #[test]
    fn test_unknown_fallback_and_invalid_names() {
        let router = router();
        router
            .set_unknown_call(
                |ctx: CallCtx, _body: Bytes| async move { Ok(ctx.service_method().to_string()) },
                vec![],
            )
            .unwrap();
        let handler = router.get_call("/nowhere").unwrap();
        assert!(handler.is_unknown());

        assert!(matches!(
            router.route_call_func("..", |_ctx: CallCtx, x: i32| async move { Ok(x) }, vec![]),
            Err(Error::InvalidRoute(_))
        ));
    }

    #[test]
    fn test_post_register_can_refuse() {
        struct Deny;

        impl Plugin for Deny {
            fn name(&self) -> &str {
                "deny"
            }

            fn phases(&self) -> &[Phase] {
                &[Phase::PostRegister]
            }

            fn post_register(&self, handler: &Handler) -> crate::plugin::HookResult {
                if handler.name().ends_with("neg") {
                    return Err(Status::internal("no negation"));
                }
                Ok(())
            }
        }

        let router = router();
        let deny: Arc<dyn Plugin> = Arc::new(Deny);
        let err = router.route_call(Math, vec![deny]).unwrap_err();
        assert!(matches!(err, Error::Plugin { phase: "post_register", .. }));
        assert!(router.get_call("/math/add").is_some());
        assert!(router.get_call("/math/neg").is_none());
    }
}

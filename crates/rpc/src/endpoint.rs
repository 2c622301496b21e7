//! The endpoint: listener, dialer and session hub in one.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecRegistry};
use crate::config::{EndpointConfig, Network};
use crate::error::{Error, Result};
use crate::message::{Message, NewBodyFn};
use crate::plugin::{Phase, Plugin, PluginContainer};
use crate::pool::{Pool, Pooled};
use crate::proto::{ProtoFunc, WireContext, raw_proto_func};
use crate::router::{Router, ServiceMethodMapper, snake_path_mapper};
use crate::session::Session;
use crate::socket::{BoxConn, Conn, NetAddr, Socket, SocketEnv};
use crate::status::{CODE_DIAL_FAILED, Status};
use crate::xfer::{XferFilter, XferRegistry};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type Accepted = (BoxConn, Option<NetAddr>, Option<NetAddr>);

/// Address a listener is bound to.
pub type ListenAddr = NetAddr;

#[cfg(feature = "tls")]
#[derive(Clone, Default)]
struct TlsSettings {
    acceptor: Option<tokio_rustls::TlsAcceptor>,
    connector: Option<(
        tokio_rustls::TlsConnector,
        rustls::pki_types::ServerName<'static>,
    )>,
}

/// State shared by the endpoint handle and all of its sessions.
pub(crate) struct EndpointCore {
    pub(crate) config: EndpointConfig,
    pub(crate) router: Router,
    pub(crate) plugins: PluginContainer,
    pub(crate) hub: DashMap<String, Arc<Session>>,
    pub(crate) env: SocketEnv,
    pub(crate) default_body_codec: u8,
    pub(crate) token: CancellationToken,
    pub(crate) tracker: TaskTracker,
    sockets: Arc<Pool<Socket>>,
    proto_func: ProtoFunc,
    #[cfg(feature = "tls")]
    tls: TlsSettings,
}

impl EndpointCore {
    /// Open a client connection, running the dial hooks.
    pub(crate) async fn connect(
        &self,
        addr: &str,
        proto_func: &ProtoFunc,
        is_redial: bool,
    ) -> std::result::Result<Pooled<Socket>, Status> {
        if self.token.is_cancelled() {
            return Err(Status::conn_closed("endpoint closed"));
        }
        self.plugins
            .run(Phase::PreDial, |p| p.pre_dial(addr, is_redial))?;

        let dial = self.open(addr);
        let opened = match self.config.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .unwrap_or_else(|_| {
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection within {limit:?}"),
                    ))
                }),
            None => dial.await,
        };
        let (conn, local, remote) = opened.map_err(|e| {
            Status::new(CODE_DIAL_FAILED, "Dial Failed").with_cause(format!("{addr}: {e}"))
        })?;
        Ok(self.new_socket(conn, local, remote, proto_func))
    }

    async fn open(&self, addr: &str) -> io::Result<Accepted> {
        if self.config.network == Network::Unix {
            return connect_unix(addr).await;
        }
        let stream = connect_tcp(self.config.network, addr).await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok().map(NetAddr::Inet);
        let remote = stream.peer_addr().ok().map(NetAddr::Inet);

        #[cfg(feature = "tls")]
        if let Some((connector, name)) = &self.tls.connector {
            let stream = connector.connect(name.clone(), stream).await?;
            return Ok((Box::new(stream), local, remote));
        }
        Ok((Box::new(stream), local, remote))
    }

    fn new_socket(
        &self,
        conn: BoxConn,
        local: Option<NetAddr>,
        remote: Option<NetAddr>,
        proto_func: &ProtoFunc,
    ) -> Pooled<Socket> {
        let mut socket = self.sockets.acquire();
        socket.reset(conn, local, remote, proto_func(), &self.env);
        socket
    }

    /// Turn an inbound connection into a registered, running session.
    async fn admit(
        self: &Arc<Self>,
        conn: BoxConn,
        local: Option<NetAddr>,
        remote: Option<NetAddr>,
        proto_func: ProtoFunc,
    ) -> Result<Arc<Session>> {
        let socket = self.new_socket(conn, local, remote, &proto_func);
        let session = Session::new(Arc::clone(self), socket, proto_func, None);
        if let Err(e) = self
            .plugins
            .run(Phase::PostAccept, |p| p.post_accept(&session))
        {
            session.close().await;
            return Err(e);
        }
        self.hub.insert(session.id(), Arc::clone(&session));
        session.start();
        debug!("Accepted session {}", session.id());
        Ok(session)
    }

    async fn accept_one(
        self: Arc<Self>,
        conn: BoxConn,
        local: Option<NetAddr>,
        remote: Option<NetAddr>,
    ) {
        #[cfg(feature = "tls")]
        let conn = match self.tls_accept(conn, remote.as_ref()).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("TLS handshake with {remote:?} failed: {e}");
                return;
            }
        };
        let proto_func = Arc::clone(&self.proto_func);
        if let Err(e) = self.admit(conn, local, remote.clone(), proto_func).await {
            warn!("Rejected connection from {remote:?}: {e}");
        }
    }

    #[cfg(feature = "tls")]
    async fn tls_accept(&self, conn: BoxConn, remote: Option<&NetAddr>) -> io::Result<BoxConn> {
        match (&self.tls.acceptor, remote) {
            (Some(acceptor), Some(NetAddr::Inet(_))) => {
                let stream = acceptor.accept(conn).await?;
                Ok(Box::new(stream))
            }
            _ => Ok(conn),
        }
    }
}

/// A source of inbound connections.
trait Acceptor: Send + Sync + 'static {
    fn next_conn(&self) -> impl Future<Output = io::Result<Accepted>> + Send;
}

impl Acceptor for TcpListener {
    async fn next_conn(&self) -> io::Result<Accepted> {
        let (stream, peer) = self.accept().await?;
        stream.set_nodelay(true)?;
        let local = stream.local_addr().ok().map(NetAddr::Inet);
        Ok((Box::new(stream), local, Some(NetAddr::Inet(peer))))
    }
}

#[cfg(unix)]
struct UnixAcceptor {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl Acceptor for UnixAcceptor {
    async fn next_conn(&self) -> io::Result<Accepted> {
        let (stream, peer) = self.listener.accept().await?;
        let remote = peer.as_pathname().map(|p| NetAddr::Unix(p.to_path_buf()));
        Ok((Box::new(stream), Some(NetAddr::Unix(self.path.clone())), remote))
    }
}

#[cfg(unix)]
async fn connect_unix(addr: &str) -> io::Result<Accepted> {
    let stream = tokio::net::UnixStream::connect(addr).await?;
    Ok((Box::new(stream), None, Some(NetAddr::Unix(addr.into()))))
}

#[cfg(not(unix))]
async fn connect_unix(_addr: &str) -> io::Result<Accepted> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "unix sockets are not available on this platform",
    ))
}

const fn family_matches(network: Network, addr: &SocketAddr) -> bool {
    match network {
        Network::Tcp4 => addr.is_ipv4(),
        Network::Tcp6 => addr.is_ipv6(),
        Network::Tcp | Network::Unix => true,
    }
}

async fn resolve(network: Network, addr: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<_> = tokio::net::lookup_host(addr)
        .await?
        .filter(|a| family_matches(network, a))
        .collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {network} address for {addr}"),
        ));
    }
    Ok(addrs)
}

async fn connect_tcp(network: Network, addr: &str) -> io::Result<TcpStream> {
    let mut last = None;
    for candidate in resolve(network, addr).await? {
        match TcpStream::connect(candidate).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
}

/// Builder for [`Endpoint`].
pub struct EndpointBuilder {
    config: EndpointConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    codecs: Vec<Arc<dyn Codec>>,
    xfers: Vec<Arc<dyn XferFilter>>,
    proto_func: Option<ProtoFunc>,
    mapper: Option<ServiceMethodMapper>,
    new_body: Option<NewBodyFn>,
    #[cfg(feature = "tls")]
    tls: TlsSettings,
}

impl EndpointBuilder {
    fn new() -> Self {
        Self {
            config: EndpointConfig::default(),
            plugins: Vec::new(),
            codecs: Vec::new(),
            xfers: Vec::new(),
            proto_func: None,
            mapper: None,
            new_body: None,
            #[cfg(feature = "tls")]
            tls: TlsSettings::default(),
        }
    }

    /// Use this configuration.
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an endpoint-wide plugin.
    #[must_use]
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Register a body codec next to JSON and CBOR.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codecs.push(codec);
        self
    }

    /// Register a transfer filter next to gzip.
    #[must_use]
    pub fn xfer_filter(mut self, filter: Arc<dyn XferFilter>) -> Self {
        self.xfers.push(filter);
        self
    }

    /// Default wire protocol for accepted and dialed connections.
    #[must_use]
    pub fn proto_func(mut self, proto_func: ProtoFunc) -> Self {
        self.proto_func = Some(proto_func);
        self
    }

    /// How handler names become service-method paths.
    #[must_use]
    pub fn service_method_mapper(mut self, mapper: ServiceMethodMapper) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Decide per inbound message whether its body is decoded eagerly.
    #[must_use]
    pub fn new_body_fn(mut self, f: NewBodyFn) -> Self {
        self.new_body = Some(f);
        self
    }

    /// Wrap accepted TCP connections in TLS.
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn tls_acceptor(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls.acceptor = Some(acceptor);
        self
    }

    /// Wrap dialed TCP connections in TLS.
    #[cfg(feature = "tls")]
    #[must_use]
    pub fn tls_connector(
        mut self,
        connector: tokio_rustls::TlsConnector,
        server_name: rustls::pki_types::ServerName<'static>,
    ) -> Self {
        self.tls.connector = Some((connector, server_name));
        self
    }

    /// Build the endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a codec or filter id
    /// clashes, the default codec is unknown, or a plugin hook refuses.
    pub fn build(self) -> Result<Endpoint> {
        let plugins = PluginContainer::new(self.plugins)?;
        let mut config = self.config;
        plugins.run(Phase::PreNewEndpoint, |p| p.pre_new_endpoint(&mut config))?;
        config.check()?;

        let mut codecs = CodecRegistry::with_defaults();
        for codec in self.codecs {
            codecs = codecs.with(codec)?;
        }
        let mut xfers = XferRegistry::with_defaults();
        for filter in self.xfers {
            xfers = xfers.with(filter)?;
        }
        let default_body_codec = codecs.by_name(&config.default_body_codec)?.id();

        let size_limit = config.message_size_limit;
        let env = SocketEnv {
            wire: WireContext { codecs, xfers },
            messages: Pool::new(config.message_pool_size, move || Message::new(size_limit)),
            new_body: self.new_body,
        };
        let router = Router::new(
            self.mapper.unwrap_or_else(|| Arc::new(snake_path_mapper)),
            plugins.clone(),
        );

        let endpoint = Endpoint {
            core: Arc::new(EndpointCore {
                sockets: Pool::new(config.socket_pool_size, Socket::empty),
                proto_func: self.proto_func.unwrap_or_else(raw_proto_func),
                config,
                router,
                plugins,
                hub: DashMap::new(),
                env,
                default_body_codec,
                token: CancellationToken::new(),
                tracker: TaskTracker::new(),
                #[cfg(feature = "tls")]
                tls: self.tls,
            }),
        };
        endpoint
            .core
            .plugins
            .run(Phase::PostNewEndpoint, |p| p.post_new_endpoint(&endpoint))?;
        Ok(endpoint)
    }
}

impl fmt::Debug for EndpointBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointBuilder")
            .field("config", &self.config)
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

/// An RPC peer: serves inbound sessions and dials outbound ones.
///
/// Both sides of a session are symmetric; either may CALL or PUSH.
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    core: Arc<EndpointCore>,
}

impl Endpoint {
    /// Start building an endpoint.
    #[must_use]
    pub fn builder() -> EndpointBuilder {
        EndpointBuilder::new()
    }

    /// Endpoint with the given configuration and no plugins.
    ///
    /// # Errors
    ///
    /// See [`EndpointBuilder::build`].
    pub fn new(config: EndpointConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Root router.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.core.router
    }

    /// Normalised configuration.
    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.core.config
    }

    /// Endpoint-wide plugins.
    #[must_use]
    pub fn plugins(&self) -> &PluginContainer {
        &self.core.plugins
    }

    /// Id of the default body codec.
    #[must_use]
    pub fn default_body_codec(&self) -> u8 {
        self.core.default_body_codec
    }

    /// Bind the configured address and accept connections in the background.
    ///
    /// Returns the bound address, useful when listening on port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or a `PostListen` hook refuses.
    pub async fn listen(&self) -> Result<ListenAddr> {
        let network = self.core.config.network;
        let listen_addr = self.core.config.listen_addr.as_str();
        if network == Network::Unix {
            return self.listen_unix(listen_addr).await;
        }

        let addrs = resolve(network, listen_addr).await?;
        let listener = TcpListener::bind(&addrs[..]).await?;
        let addr = NetAddr::Inet(listener.local_addr()?);
        self.core
            .plugins
            .run(Phase::PostListen, |p| p.post_listen(&addr))?;
        info!("Listening on {network}://{addr}");
        self.spawn_accept(listener, addr.clone());
        Ok(addr)
    }

    #[cfg(unix)]
    async fn listen_unix(&self, path: &str) -> Result<NetAddr> {
        let listener = tokio::net::UnixListener::bind(path)?;
        let addr = NetAddr::Unix(path.into());
        self.core
            .plugins
            .run(Phase::PostListen, |p| p.post_listen(&addr))?;
        info!("Listening on unix://{addr}");
        let acceptor = UnixAcceptor {
            listener,
            path: path.into(),
        };
        self.spawn_accept(acceptor, addr.clone());
        Ok(addr)
    }

    #[cfg(not(unix))]
    async fn listen_unix(&self, _path: &str) -> Result<NetAddr> {
        Err(Error::Config(
            "unix sockets are not available on this platform".to_string(),
        ))
    }

    fn spawn_accept<A: Acceptor>(&self, acceptor: A, addr: NetAddr) {
        let core = Arc::clone(&self.core);
        self.core.tracker.spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = core.token.cancelled() => break,
                    accepted = acceptor.next_conn() => accepted,
                };
                match accepted {
                    Ok((conn, local, remote)) => {
                        let task = Arc::clone(&core).accept_one(conn, local, remote);
                        core.tracker.spawn(task);
                    }
                    Err(e) => {
                        warn!("Accept on {addr} failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            info!("Stopped listening on {addr}");
        });
    }

    /// Listen and block until the endpoint is closed.
    ///
    /// # Errors
    ///
    /// See [`Endpoint::listen`].
    pub async fn listen_and_serve(&self) -> Result<()> {
        self.listen().await?;
        self.core.token.cancelled().await;
        Ok(())
    }

    /// Serve an already established connection with the default protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if a `PostAccept` hook refuses the session.
    pub async fn serve_conn(&self, conn: impl Conn) -> Result<Arc<Session>> {
        let proto_func = Arc::clone(&self.core.proto_func);
        self.serve_conn_with_proto(conn, proto_func).await
    }

    /// Serve an established connection with a specific protocol.
    ///
    /// # Errors
    ///
    /// See [`Endpoint::serve_conn`].
    pub async fn serve_conn_with_proto(
        &self,
        conn: impl Conn,
        proto_func: ProtoFunc,
    ) -> Result<Arc<Session>> {
        if self.core.token.is_cancelled() {
            return Err(Error::ProactivelyClosed);
        }
        self.core.admit(Box::new(conn), None, None, proto_func).await
    }

    /// Dial `addr` with the default protocol.
    ///
    /// # Errors
    ///
    /// Returns [`CODE_DIAL_FAILED`] if the connection cannot be opened, or the
    /// status of a refusing dial hook.
    pub async fn dial(&self, addr: &str) -> std::result::Result<Arc<Session>, Status> {
        let proto_func = Arc::clone(&self.core.proto_func);
        self.dial_with_proto(addr, proto_func).await
    }

    /// Dial `addr` with a specific protocol.
    ///
    /// # Errors
    ///
    /// See [`Endpoint::dial`].
    pub async fn dial_with_proto(
        &self,
        addr: &str,
        proto_func: ProtoFunc,
    ) -> std::result::Result<Arc<Session>, Status> {
        let socket = self.core.connect(addr, &proto_func, false).await?;
        let session = Session::new(
            Arc::clone(&self.core),
            socket,
            proto_func,
            Some(addr.to_string()),
        );
        if let Err(e) = self
            .core
            .plugins
            .run(Phase::PostDial, |p| p.post_dial(&session, false))
        {
            session.close().await;
            return Err(e.into());
        }
        self.core.hub.insert(session.id(), Arc::clone(&session));
        session.start();
        info!("Dialed {addr} as session {}", session.id());
        Ok(session)
    }

    /// Session by id.
    #[must_use]
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.core.hub.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Snapshot of all live sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.core.hub.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Visit sessions until `f` returns false.
    pub fn range_session(&self, mut f: impl FnMut(&Arc<Session>) -> bool) {
        for session in self.sessions() {
            if !f(&session) {
                break;
            }
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count_session(&self) -> usize {
        self.core.hub.len()
    }

    /// True once [`Endpoint::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.token.is_cancelled()
    }

    /// Stop listening, close every session and wait for background tasks.
    pub async fn close(&self) {
        self.core.token.cancel();
        let sessions = self.sessions();
        futures::future::join_all(sessions.iter().map(|s| s.close())).await;
        self.core.tracker.close();
        self.core.tracker.wait().await;
        info!("Endpoint closed");
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("network", &self.core.config.network)
            .field("listen_addr", &self.core.config.listen_addr)
            .field("sessions", &self.core.hub.len())
            .finish_non_exhaustive()
    }
}

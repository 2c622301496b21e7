//! Plugin hooks observed through real sessions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use proven_rpc::status::{CODE_CONN_CLOSED, CODE_UNAUTHORIZED};
use proven_rpc::{
    CBOR_CODEC_ID, CallCtx, Endpoint, EndpointConfig, Error, HookResult, Message, Phase, Plugin,
    Session, Status,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn loopback() -> EndpointConfig {
    EndpointConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..EndpointConfig::default()
    }
}

async fn add(_ctx: CallCtx, args: Vec<i64>) -> Result<i64, Status> {
    Ok(args.iter().sum())
}

fn unauthorized(reason: &str) -> Status {
    Status::new(CODE_UNAUTHORIZED, "Unauthorized").with_cause(reason)
}

struct DenyDial;

impl Plugin for DenyDial {
    fn name(&self) -> &str {
        "deny-dial"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::PreDial]
    }

    fn pre_dial(&self, addr: &str, _is_redial: bool) -> HookResult {
        Err(unauthorized(addr))
    }
}

#[tokio::test]
async fn test_pre_dial_refusal() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = Endpoint::new(loopback()).unwrap();
    let addr = server.listen().await.unwrap().to_string();

    let client = Endpoint::builder()
        .plugin(Arc::new(DenyDial))
        .build()
        .unwrap();
    let status = client.dial(&addr).await.unwrap_err();
    assert_eq!(status.code(), CODE_UNAUTHORIZED);
    assert_eq!(client.count_session(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.count_session(), 0);

    client.close().await;
    server.close().await;
}

/// Refuses every second inbound connection.
struct EveryOther {
    accepted: AtomicUsize,
}

impl Plugin for EveryOther {
    fn name(&self) -> &str {
        "every-other"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::PostAccept]
    }

    fn post_accept(&self, _session: &Session) -> HookResult {
        if self.accepted.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
            return Err(unauthorized("odd connection"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_post_accept_refusal_leaves_other_sessions_alone() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = Endpoint::builder()
        .config(loopback())
        .plugin(Arc::new(EveryOther {
            accepted: AtomicUsize::new(0),
        }))
        .build()
        .unwrap();
    server
        .router()
        .route_call_func("math/add", add, vec![])
        .unwrap();
    let addr = server.listen().await.unwrap().to_string();

    let first = Endpoint::new(EndpointConfig::default()).unwrap();
    let accepted = first.dial(&addr).await.unwrap();
    let sum: i64 = accepted.call("/math/add", &[1, 2]).await.unwrap();
    assert_eq!(sum, 3);

    let second = Endpoint::new(EndpointConfig::default()).unwrap();
    let refused = second.dial(&addr).await.unwrap();
    timeout(WAIT, refused.closed()).await.unwrap();
    let status = refused.call::<_, i64>("/math/add", &[1]).await.unwrap_err();
    assert_eq!(status.code(), CODE_CONN_CLOSED);

    let sum: i64 = accepted.call("/math/add", &[4, 5]).await.unwrap();
    assert_eq!(sum, 9);
    assert_eq!(server.count_session(), 1);

    first.close().await;
    second.close().await;
    server.close().await;
}

/// Logs every phase it sees on the server side.
struct Journal {
    log: Arc<Mutex<Vec<Phase>>>,
}

impl Journal {
    fn record(&self, phase: Phase) -> HookResult {
        self.log.lock().push(phase);
        Ok(())
    }
}

impl Plugin for Journal {
    fn name(&self) -> &str {
        "journal"
    }

    fn phases(&self) -> &[Phase] {
        &[
            Phase::PostAccept,
            Phase::PostReadCallHeader,
            Phase::PreReadCallBody,
            Phase::PostReadCallBody,
            Phase::PreWriteReply,
            Phase::PostWriteReply,
            Phase::PostDisconnect,
        ]
    }

    fn post_accept(&self, _session: &Session) -> HookResult {
        self.record(Phase::PostAccept)
    }

    fn post_read_call_header(&self, _session: &Session, _msg: &Message) -> HookResult {
        self.record(Phase::PostReadCallHeader)
    }

    fn pre_read_call_body(&self, _session: &Session, _msg: &Message) -> HookResult {
        self.record(Phase::PreReadCallBody)
    }

    fn post_read_call_body(&self, _session: &Session, _msg: &Message) -> HookResult {
        self.record(Phase::PostReadCallBody)
    }

    fn pre_write_reply(&self, _session: &Session, _msg: &mut Message) -> HookResult {
        self.record(Phase::PreWriteReply)
    }

    fn post_write_reply(&self, _session: &Session, _msg: &Message) -> HookResult {
        self.record(Phase::PostWriteReply)
    }

    fn post_disconnect(&self, _session: &Session) -> HookResult {
        self.record(Phase::PostDisconnect)
    }
}

#[tokio::test]
async fn test_hooks_run_in_message_order() {
    let _ = tracing_subscriber::fmt::try_init();
    let log = Arc::new(Mutex::new(Vec::new()));
    let server = Endpoint::builder()
        .config(loopback())
        .plugin(Arc::new(Journal {
            log: Arc::clone(&log),
        }))
        .build()
        .unwrap();
    server
        .router()
        .route_call_func("math/add", add, vec![])
        .unwrap();
    let addr = server.listen().await.unwrap().to_string();

    let client = Endpoint::new(EndpointConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();
    let _: i64 = session.call("/math/add", &[1]).await.unwrap();
    session.close().await;

    timeout(WAIT, async {
        while !log.lock().contains(&Phase::PostDisconnect) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        *log.lock(),
        [
            Phase::PostAccept,
            Phase::PostReadCallHeader,
            Phase::PreReadCallBody,
            Phase::PostReadCallBody,
            Phase::PreWriteReply,
            Phase::PostWriteReply,
            Phase::PostDisconnect,
        ]
    );

    client.close().await;
    server.close().await;
}

/// Rejects CALL headers for one path.
struct Gate;

impl Plugin for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::PostReadCallHeader, Phase::PreWriteCall]
    }

    fn post_read_call_header(&self, _session: &Session, msg: &Message) -> HookResult {
        if msg.service_method() == "/admin/add" {
            return Err(unauthorized("admin only"));
        }
        Ok(())
    }

    fn pre_write_call(&self, _session: &Session, msg: &mut Message) -> HookResult {
        if msg.service_method() == "/local/forbidden" {
            return Err(unauthorized("not sent"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_header_and_write_hooks_return_their_status() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = Endpoint::builder()
        .config(loopback())
        .plugin(Arc::new(Gate))
        .build()
        .unwrap();
    server
        .router()
        .route_call_func("math/add", add, vec![])
        .unwrap();
    server
        .router()
        .sub_route("admin", vec![])
        .unwrap()
        .route_call_func("add", add, vec![])
        .unwrap();
    let addr = server.listen().await.unwrap().to_string();

    let client = Endpoint::builder().plugin(Arc::new(Gate)).build().unwrap();
    let session = client.dial(&addr).await.unwrap();

    let status = session.call::<_, i64>("/admin/add", &[1]).await.unwrap_err();
    assert_eq!(status.code(), CODE_UNAUTHORIZED);
    assert_eq!(status.cause(), Some("admin only"));

    let status = session
        .call::<_, i64>("/local/forbidden", &[1])
        .await
        .unwrap_err();
    assert_eq!(status.cause(), Some("not sent"));
    assert_eq!(session.pending_calls(), 0);

    let sum: i64 = session.call("/math/add", &[1, 1]).await.unwrap();
    assert_eq!(sum, 2);

    client.close().await;
    server.close().await;
}

/// Guards the routes it is attached to.
struct RouteGuard;

impl Plugin for RouteGuard {
    fn name(&self) -> &str {
        "route-guard"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::PreReadCallBody]
    }

    fn pre_read_call_body(&self, _session: &Session, msg: &Message) -> HookResult {
        if msg.meta().contains_key("ticket") {
            Ok(())
        } else {
            Err(unauthorized("missing ticket"))
        }
    }
}

#[tokio::test]
async fn test_route_level_plugins_only_guard_their_routes() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = Endpoint::new(loopback()).unwrap();
    let router = server.router();
    router.route_call_func("open/add", add, vec![]).unwrap();
    let guard: Arc<dyn Plugin> = Arc::new(RouteGuard);
    router
        .sub_route("v1", vec![guard])
        .unwrap()
        .route_call_func("math/add", add, vec![])
        .unwrap();
    let addr = server.listen().await.unwrap().to_string();

    let client = Endpoint::new(EndpointConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    let status = session.call::<_, i64>("/v1/math/add", &[1]).await.unwrap_err();
    assert_eq!(status.code(), CODE_UNAUTHORIZED);

    let options = proven_rpc::CallOptions::default().meta("ticket", "1");
    let sum: i64 = session
        .call_with("/v1/math/add", &[2, 3], options)
        .await
        .unwrap();
    assert_eq!(sum, 5);

    let sum: i64 = session.call("/open/add", &[2, 3]).await.unwrap();
    assert_eq!(sum, 5);

    client.close().await;
    server.close().await;
}

/// Switches the default codec before the configuration is checked.
struct PreferCbor;

impl Plugin for PreferCbor {
    fn name(&self) -> &str {
        "prefer-cbor"
    }

    fn phases(&self) -> &[Phase] {
        &[Phase::PreNewEndpoint, Phase::PostNewEndpoint]
    }

    fn pre_new_endpoint(&self, config: &mut EndpointConfig) -> HookResult {
        config.default_body_codec = "cbor".to_string();
        Ok(())
    }

    fn post_new_endpoint(&self, endpoint: &Endpoint) -> HookResult {
        if endpoint.config().message_size_limit < 1024 {
            return Err(Status::new(CODE_UNAUTHORIZED, "limit too small"));
        }
        Ok(())
    }
}

#[test]
fn test_endpoint_creation_hooks() {
    let endpoint = Endpoint::builder()
        .plugin(Arc::new(PreferCbor))
        .build()
        .unwrap();
    assert_eq!(endpoint.default_body_codec(), CBOR_CODEC_ID);
    assert_eq!(endpoint.config().default_body_codec, "cbor");

    let refused = Endpoint::builder()
        .config(EndpointConfig {
            message_size_limit: 512,
            ..EndpointConfig::default()
        })
        .plugin(Arc::new(PreferCbor))
        .build();
    assert!(matches!(
        refused,
        Err(Error::Plugin { phase: "post_new_endpoint", .. })
    ));

    let duplicate = Endpoint::builder()
        .plugin(Arc::new(PreferCbor))
        .plugin(Arc::new(PreferCbor))
        .build();
    assert!(matches!(duplicate, Err(Error::DuplicatePlugin(_))));
}

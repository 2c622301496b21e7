//! Server and client in one process: a CALL, a PUSH back, and a clean shutdown.

use std::sync::Arc;
use std::time::Duration;

use proven_rpc::{
    CallController, CallCtx, CallMethods, Endpoint, EndpointConfig, PushCtx, Status,
};
use tracing::info;

struct Math;

impl CallController for Math {
    fn register(methods: &mut CallMethods<Self>) {
        methods.add("Add", Self::add);
    }
}

impl Math {
    async fn add(self: Arc<Self>, ctx: CallCtx, args: Vec<i64>) -> Result<i64, Status> {
        let sum = args.iter().sum();
        // Tell the caller about it out of band.
        let session = Arc::clone(ctx.session());
        tokio::spawn(async move {
            let _ = session.push("/push/status", &format!("summed {} numbers", args.len())).await;
        });
        Ok(sum)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let server = Endpoint::new(EndpointConfig {
        listen_addr: "127.0.0.1:9090".to_string(),
        count_time: true,
        ..EndpointConfig::default()
    })?;
    server.router().route_call(Math, vec![])?;
    let addr = server.listen().await?;

    let client = Endpoint::new(EndpointConfig::default())?;
    client.router().route_push_func(
        "push/status",
        |_ctx: PushCtx, status: String| async move {
            info!("server says: {status}");
            Ok(())
        },
        vec![],
    )?;

    let session = client.dial(&addr.to_string()).await?;
    let sum: i64 = session.call("/math/add", &[1, 2, 3, 4, 5]).await?;
    info!("1 + 2 + 3 + 4 + 5 = {sum}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close().await;
    server.close().await;
    Ok(())
}

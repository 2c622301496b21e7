//! Symmetric, peer-to-peer RPC over TCP and Unix sockets.
//!
//! Every connection is a [`Session`] on which either side may CALL the other
//! and wait for a REPLY, or PUSH a one-way message. Handlers are registered on
//! a [`Router`] under service-method paths, and plugins can observe or refuse
//! each stage of a message's life.
//!
//! # Features
//!
//! - **Symmetric sessions**: servers can call clients just as clients call servers
//! - **Pluggable framing**: the wire layout is a [`Proto`] chosen per connection
//! - **Body codecs**: JSON and CBOR out of the box, selectable per message
//! - **Transfer filters**: gzip body compression, chainable
//! - **Plugins**: hooks from endpoint creation to disconnect
//! - **Redial**: client sessions reconnect transparently when configured
//!
//! # Example
//!
//! ```no_run
//! use proven_rpc::{CallCtx, Endpoint, EndpointConfig, Status};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Endpoint::new(EndpointConfig {
//!         listen_addr: "127.0.0.1:9090".to_string(),
//!         ..EndpointConfig::default()
//!     })?;
//!     server.router().route_call_func(
//!         "math/add",
//!         |_ctx: CallCtx, args: Vec<i64>| async move {
//!             Ok::<_, Status>(args.iter().sum::<i64>())
//!         },
//!         vec![],
//!     )?;
//!     let addr = server.listen().await?;
//!
//!     let client = Endpoint::new(EndpointConfig::default())?;
//!     let session = client.dial(&addr.to_string()).await?;
//!     let sum: i64 = session.call("/math/add", &[1, 2, 3, 4, 5]).await?;
//!     assert_eq!(sum, 15);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod plugin;
pub mod pool;
pub mod proto;
pub mod router;
pub mod session;
pub mod socket;
pub mod status;
pub mod xfer;

// Re-export commonly used types
pub use codec::{CBOR_CODEC_ID, CborCodec, Codec, CodecRegistry, JSON_CODEC_ID, JsonCodec};
pub use config::{EndpointConfig, Network};
pub use context::{CallCtx, PushCtx};
pub use endpoint::{Endpoint, EndpointBuilder, ListenAddr};
pub use error::{Error, Result};
pub use message::{Body, BodyKind, Message, MessageType, Meta};
pub use plugin::{HookResult, Phase, Plugin, PluginContainer};
pub use proto::{Proto, ProtoFunc, RawProto, WireContext, raw_proto_func};
pub use router::{
    CallController, CallMethods, Handler, HandlerKind, PushController, PushMethods, Router,
    ServiceMethodMapper, dotted_mapper, snake_path_mapper,
};
pub use session::{CallOptions, PushOptions, Reply, Session};
pub use socket::{NetAddr, Socket, Swap};
pub use status::Status;
pub use xfer::{GZIP_FILTER_ID, GzipFilter, XferFilter, XferPipe, XferRegistry};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use serde_value::Value;

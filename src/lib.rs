#![cfg_attr(docsrs, feature(doc_cfg))]

//! # http-negotiate
//!
//! HTTP `Negotiate` (SPNEGO) authentication on top of `hyper` and `tower`.
//!
//! - A [`Client`] that answers `401 Negotiate` challenges transparently,
//!   replays request bodies safely and verifies mutual authentication.
//! - A [`NegotiateLayer`] for servers that runs the acceptor side of the
//!   handshake and hands the authenticated [`InitiatorName`] to the wrapped
//!   service.
//!
//! The security mechanism itself (Kerberos, NTLM, ...) is not part of this
//! crate. Implement [`Provider`] and [`SecurityContext`] on top of the
//! platform's GSS-API or SSPI, or register one with [`register_provider`].
//!
//! ## Making requests
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn run(provider: Arc<dyn http_negotiate::Provider>) -> http_negotiate::Result<()> {
//! let client = http_negotiate::Client::builder(provider)
//!     .host_based_spn()
//!     .mutual(true)
//!     .build()?;
//!
//! let res = client
//!     .post("http://intranet.example.org/upload")
//!     .body("I love GSSAPI!")
//!     .send()
//!     .await?;
//!
//! println!("status: {}", res.status());
//! # Ok(())
//! # }
//! ```
//!
//! ## Request bodies
//!
//! A negotiation may take several round trips, but the body is only sent
//! with the final, authenticated attempt. Bodies made from bytes can be
//! resent at will. A streaming [`Body::wrap`] body is read once; the client
//! sends it with `Expect: 100-continue` so that a challenge arrives before
//! any of it is consumed, or you can provide a way to recreate it with
//! [`RequestBuilder::rewind`].
//!
//! ## Logging
//!
//! The crate logs through the `log` facade. Negotiation decisions are logged
//! at `debug` and per-token detail at `trace`. With
//! [`ClientBuilder::http_logging`] the request and response heads of every
//! round trip are logged under the [`WIRE_LOG_TARGET`] target.

pub use http::header;
pub use http::{Method, StatusCode, Version};
pub use url::Url;

pub use self::body::Body;
pub use self::client::{
    Client, ClientBuilder, Request, RequestBuilder, Response, ResponseFuture, WIRE_LOG_TARGET,
};
pub use self::context::{Continuation, ContextGuard, InitiatorName, Provider, SecurityContext};
pub use self::error::{Error, Result};
pub use self::flags::{flag_name, ContextFlags};
pub use self::lifetime::Lifetime;
pub use self::registry::{is_registered, new_provider, register_provider, registered_providers};
pub use self::server::{Negotiate, NegotiateLayer, Negotiated};
pub use self::status::{Cause, FatalError, Informational, Status};
pub use self::trace::Trace;
pub use self::transport::{HttpTransport, ResponseBody, Transport};

mod body;
mod client;
mod context;
mod error;
mod flags;
mod lifetime;
mod registry;
pub mod server;
mod status;
pub mod token;
mod trace;
mod transport;

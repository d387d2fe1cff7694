//! The acceptor side: a tower middleware that authenticates requests with
//! the `Negotiate` scheme before handing them to the wrapped service.
//!
//! ```ignore
//! let svc = ServiceBuilder::new()
//!     .layer(NegotiateLayer::new(provider))
//!     .service_fn(|req: Request<Incoming>| async move {
//!         let who = http_negotiate::server::initiator_name(&req);
//!         // ...
//!     });
//! ```
//!
//! Requests without a usable `Authorization: Negotiate <token>` header are
//! answered with `401` and a `WWW-Authenticate: Negotiate` challenge. Once a
//! context is established the initiator's [`InitiatorName`] is placed in the
//! request extensions and the acceptor's final token, if any, is returned in
//! the response's `WWW-Authenticate` header.
//!
//! A handshake that takes more than one leg is tied to the connection it
//! runs on, as HTTP `Negotiate` has no other way to correlate the legs. Call
//! [`Layer::layer`] once per accepted connection so that every connection gets
//! its own pending context; a service shared by several connections would let
//! one client continue another's handshake.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use http::header::WWW_AUTHENTICATE;
use http::{HeaderValue, Request, Response, StatusCode};
use pin_project_lite::pin_project;
use tower::Layer;
use tower_service::Service;

use crate::context::{ContextGuard, InitiatorName, Provider};
use crate::status::{FatalError, Status};
use crate::token;
use crate::Result;

/// Returns the authenticated initiator of a request that passed through
/// [`Negotiate`].
pub fn initiator_name<B>(req: &Request<B>) -> Option<&InitiatorName> {
    req.extensions().get::<InitiatorName>()
}

/// The result of a single acceptor step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Token for the initiator, empty if there is none.
    pub token: Vec<u8>,
    /// The initiator, once the context is established.
    pub initiator: Option<InitiatorName>,
    /// Whether the context is established.
    pub done: bool,
}

struct Acceptor {
    provider: Arc<dyn Provider>,
}

impl Acceptor {
    fn new_context(&self) -> Result<ContextGuard> {
        self.provider
            .acceptor()
            .map(ContextGuard::new)
            .map_err(crate::error::mechanism)
    }

    fn step(&self, ctx: &mut ContextGuard, token: &str) -> Result<Negotiated> {
        let input = token::decode_token68(token)?;
        let step = ctx.accept_step(&input).map_err(crate::error::mechanism)?;
        log::trace!(
            "acceptor step: {} bytes in, {} bytes out, done: {}",
            input.len(),
            step.token.len(),
            step.done
        );

        if !step.done {
            return Ok(Negotiated {
                token: step.token,
                initiator: None,
                done: false,
            });
        }

        if ctx.lifetime().is_expired() {
            return Err(crate::error::mechanism(Status::fatal(
                FatalError::ContextExpired,
            )));
        }
        let initiator = ctx.identity().map_err(crate::error::mechanism)?;

        Ok(Negotiated {
            token: step.token,
            initiator: Some(initiator),
            done: true,
        })
    }
}

/// Layer that applies [`Negotiate`] authentication to a service.
#[derive(Clone)]
pub struct NegotiateLayer {
    acceptor: Arc<Acceptor>,
}

impl NegotiateLayer {
    /// Creates a layer accepting contexts from `provider` with its default
    /// acceptor credentials.
    pub fn new(provider: Arc<dyn Provider>) -> NegotiateLayer {
        NegotiateLayer {
            acceptor: Arc::new(Acceptor { provider }),
        }
    }

    /// Runs one acceptor step on a fresh context with the base64 token from
    /// an `Authorization: Negotiate` header, without any HTTP exchange.
    ///
    /// # Errors
    ///
    /// A token that is not base64 is a protocol error; a token the mechanism
    /// rejects is a mechanism error.
    pub fn negotiate_once(&self, token: &str) -> Result<Negotiated> {
        let mut ctx = self.acceptor.new_context()?;
        self.acceptor.step(&mut ctx, token)
    }
}

impl std::fmt::Debug for NegotiateLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiateLayer")
            .field("provider", &self.acceptor.provider.name())
            .finish()
    }
}

impl<S> Layer<S> for NegotiateLayer {
    type Service = Negotiate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Negotiate {
            acceptor: self.acceptor.clone(),
            pending: Arc::new(Mutex::new(None)),
            inner,
        }
    }
}

/// Middleware performing the acceptor half of a `Negotiate` handshake.
///
/// A context that needs more than one round is kept in the service (and its
/// clones) until the next request on it carries `Negotiate` credentials.
/// Build one instance per connection.
#[derive(Clone)]
pub struct Negotiate<S> {
    acceptor: Arc<Acceptor>,
    pending: Arc<Mutex<Option<ContextGuard>>>,
    inner: S,
}

impl<S: std::fmt::Debug> std::fmt::Debug for Negotiate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiate")
            .field("provider", &self.acceptor.provider.name())
            .field("inner", &self.inner)
            .finish()
    }
}

enum Outcome {
    Challenge(Vec<u8>),
    Proceed {
        ctx: ContextGuard,
        reply: Option<HeaderValue>,
    },
}

impl<S> Negotiate<S> {
    fn take_pending(&self) -> Option<ContextGuard> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn authenticate<B>(&self, req: &mut Request<B>) -> Outcome {
        // a request that does not continue the handshake leaves it pending
        let credentials = match token::parse_authorization(req.headers()) {
            Some((scheme, credentials))
                if scheme.eq_ignore_ascii_case(token::SCHEME) && !credentials.is_empty() =>
            {
                credentials.to_owned()
            }
            _ => return Outcome::Challenge(Vec::new()),
        };

        let mut ctx = match self.take_pending() {
            Some(ctx) => ctx,
            None => match self.acceptor.new_context() {
                Ok(ctx) => ctx,
                Err(err) => {
                    log::debug!("failed to create acceptor context: {}", err);
                    return Outcome::Challenge(Vec::new());
                }
            },
        };

        let negotiated = match self.acceptor.step(&mut ctx, &credentials) {
            Ok(negotiated) => negotiated,
            Err(err) => {
                log::debug!("rejecting Negotiate token for {}: {}", req.uri(), err);
                return Outcome::Challenge(Vec::new());
            }
        };

        if !negotiated.done {
            *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
            return Outcome::Challenge(negotiated.token);
        }

        let reply = if negotiated.token.is_empty() {
            None
        } else {
            token::header_value(&negotiated.token).ok()
        };
        if let Some(initiator) = negotiated.initiator {
            log::debug!("authenticated {} for {}", initiator, req.uri());
            req.extensions_mut().insert(initiator);
        }

        Outcome::Proceed { ctx, reply }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Negotiate<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Default,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        match self.authenticate(&mut req) {
            Outcome::Challenge(token) => ResponseFuture::Challenge {
                token,
                _body: std::marker::PhantomData,
            },
            Outcome::Proceed { ctx, reply } => ResponseFuture::Authenticated {
                future: self.inner.call(req),
                ctx: Some(ctx),
                reply,
            },
        }
    }
}

pin_project! {
    /// Response future for [`Negotiate`].
    #[project = ResponseFutureProj]
    pub enum ResponseFuture<F, B> {
        Challenge {
            token: Vec<u8>,
            _body: std::marker::PhantomData<fn() -> B>,
        },
        Authenticated {
            #[pin]
            future: F,
            ctx: Option<ContextGuard>,
            reply: Option<HeaderValue>,
        },
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = std::result::Result<Response<B>, E>>,
    B: Default,
{
    type Output = std::result::Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ResponseFutureProj::Challenge { token, .. } => {
                Poll::Ready(Ok(unauthorized(std::mem::take(token))))
            }
            ResponseFutureProj::Authenticated { future, ctx, reply } => {
                let mut res = futures_util::ready!(future.poll(cx))?;
                if let Some(value) = reply.take() {
                    res.headers_mut().entry(WWW_AUTHENTICATE).or_insert(value);
                }
                // the context lives until the wrapped service is done with the request
                drop(ctx.take());
                Poll::Ready(Ok(res))
            }
        }
    }
}

fn unauthorized<B: Default>(token: Vec<u8>) -> Response<B> {
    let mut res = Response::new(B::default());
    *res.status_mut() = StatusCode::UNAUTHORIZED;
    let challenge = token::header_value(&token)
        .unwrap_or_else(|_| HeaderValue::from_static(token::SCHEME));
    res.headers_mut().insert(WWW_AUTHENTICATE, challenge);
    res
}

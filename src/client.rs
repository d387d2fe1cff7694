use std::fmt;
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, EXPECT};
use http::{Method, StatusCode, Uri, Version};
use http_body_util::BodyExt;
use url::Url;

use crate::body::{Replay, Rewind};
use crate::context::{Continuation, ContextGuard, Provider};
use crate::flags::ContextFlags;
use crate::token::{self, AuthzChallenge};
use crate::trace::Trace;
use crate::transport::{Affinity, HttpTransport, ResponseBody, Transport};
use crate::{Body, Result};

/// Target of the HTTP wire log enabled by [`ClientBuilder::http_logging`].
pub const WIRE_LOG_TARGET: &str = "http_negotiate::wire";

/// Default number of challenge rounds before a negotiation is abandoned.
const MAX_ROUNDTRIPS: usize = 5;

/// Bodies at least this large are sent with `Expect: 100-continue`.
const DEFAULT_EXPECT_CONTINUE_THRESHOLD: u64 = 4096;

type SpnResolver = Arc<dyn Fn(&Url) -> String + Send + Sync>;

/// An HTTP client that authenticates with the `Negotiate` scheme.
///
/// Each request runs its own security-context handshake: the client sends
/// the request, answers `401 Negotiate` challenges with tokens from the
/// [`Provider`], and finally sends the body with the last token. Contexts are
/// never shared between requests.
///
/// The `Client` holds its configuration in an `Arc`, so cloning it is cheap.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    provider: Arc<dyn Provider>,
    spn_resolver: SpnResolver,
    mutual: bool,
    opportunistic: bool,
    expect_continue: bool,
    expect_continue_threshold: u64,
    max_rounds: usize,
    http_logging: bool,
    transport: Arc<dyn Transport>,
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    provider: Arc<dyn Provider>,
    spn_resolver: Option<SpnResolver>,
    mutual: bool,
    opportunistic: bool,
    expect_continue: bool,
    expect_continue_threshold: u64,
    max_rounds: usize,
    http_logging: bool,
    transport: Option<Arc<dyn Transport>>,
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder` using `provider` for security contexts.
    pub fn new(provider: Arc<dyn Provider>) -> ClientBuilder {
        ClientBuilder {
            config: Config {
                provider,
                spn_resolver: None,
                mutual: false,
                opportunistic: false,
                expect_continue: true,
                expect_continue_threshold: DEFAULT_EXPECT_CONTINUE_THRESHOLD,
                max_rounds: MAX_ROUNDTRIPS,
                http_logging: false,
                transport: None,
            },
        }
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    ///
    /// # Errors
    ///
    /// This method fails if no service principal name resolver was set.
    pub fn build(self) -> Result<Client> {
        let config = self.config;
        let spn_resolver = config.spn_resolver.ok_or_else(|| {
            crate::error::builder("no service principal name resolver configured")
        })?;
        if config.max_rounds == 0 {
            return Err(crate::error::builder("max_rounds must be at least 1"));
        }

        Ok(Client {
            inner: Arc::new(ClientRef {
                provider: config.provider,
                spn_resolver,
                mutual: config.mutual,
                opportunistic: config.opportunistic,
                expect_continue: config.expect_continue,
                expect_continue_threshold: config.expect_continue_threshold,
                max_rounds: config.max_rounds,
                http_logging: config.http_logging,
                transport: match config.transport {
                    Some(transport) => transport,
                    None => Arc::new(HttpTransport::new()),
                },
            }),
        })
    }

    /// Maps a request URL to the service principal name to authenticate to.
    ///
    /// There is no default; the right name depends on the deployment.
    pub fn spn_resolver<F>(mut self, resolver: F) -> ClientBuilder
    where
        F: Fn(&Url) -> String + Send + Sync + 'static,
    {
        self.config.spn_resolver = Some(Arc::new(resolver));
        self
    }

    /// Uses the host-based service name `HTTP@<host>` of each request URL.
    pub fn host_based_spn(self) -> ClientBuilder {
        self.spn_resolver(host_based_spn)
    }

    /// Requests mutual authentication.
    ///
    /// The final response must then carry a `Negotiate` token that the
    /// security context accepts, otherwise the request fails even on a
    /// success status.
    pub fn mutual(mut self, enabled: bool) -> ClientBuilder {
        self.config.mutual = enabled;
        self
    }

    /// Sends a token with the first request instead of waiting for a `401`.
    pub fn opportunistic(mut self, enabled: bool) -> ClientBuilder {
        self.config.opportunistic = enabled;
        self
    }

    /// Enables or disables `Expect: 100-continue` altogether.
    ///
    /// Enabled by default.
    pub fn expect_continue(mut self, enabled: bool) -> ClientBuilder {
        self.config.expect_continue = enabled;
        self
    }

    /// Bodies of known size at or above `threshold` bytes are sent with
    /// `Expect: 100-continue`. Read-once bodies always are, unless the
    /// request is opportunistic. Zero disables the header.
    ///
    /// Default is 4096.
    pub fn expect_continue_threshold(mut self, threshold: u64) -> ClientBuilder {
        self.config.expect_continue_threshold = threshold;
        self
    }

    /// Maximum number of `401` challenges answered for one request.
    ///
    /// Default is 5.
    pub fn max_rounds(mut self, rounds: usize) -> ClientBuilder {
        self.config.max_rounds = rounds;
        self
    }

    /// Logs request and response heads at debug level under the
    /// `http_negotiate::wire` target.
    pub fn http_logging(mut self, enabled: bool) -> ClientBuilder {
        self.config.http_logging = enabled;
        self
    }

    /// Sends requests through `transport` instead of the built-in
    /// [`HttpTransport`].
    pub fn transport<T: Transport>(mut self, transport: T) -> ClientBuilder {
        self.config.transport = Some(Arc::new(transport));
        self
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("provider", &self.config.provider.name())
            .field("mutual", &self.config.mutual)
            .field("opportunistic", &self.config.opportunistic)
            .finish()
    }
}

fn host_based_spn(url: &Url) -> String {
    format!("HTTP@{}", url.host_str().unwrap_or_default())
}

impl Client {
    /// Creates a `ClientBuilder` to configure a `Client`.
    pub fn builder(provider: Arc<dyn Provider>) -> ClientBuilder {
        ClientBuilder::new(provider)
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = Url::parse(url)
            .map(|url| Request::new(method, url))
            .map_err(crate::error::builder);
        RequestBuilder {
            client: self.clone(),
            request: req,
        }
    }

    /// Executes a `Request`, negotiating authentication as needed.
    ///
    /// # Errors
    ///
    /// This method fails if the request cannot be sent, the server's
    /// `Negotiate` headers are malformed, the security context rejects a
    /// token, a read-once body would have to be sent twice, or mutual
    /// authentication was requested and could not be verified.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let url = request.url.clone();
        match self.negotiate(request).await {
            Ok(res) => Ok(Response { res, url }),
            Err(err) => Err(err.with_url(url)),
        }
    }

    async fn negotiate(&self, request: Request) -> Result<http::Response<ResponseBody>> {
        let client = &self.inner;
        let Request {
            method,
            url,
            headers,
            body,
            rewind,
            trace,
        } = request;

        if url.host_str().is_none() {
            return Err(crate::error::builder("URL has no host"));
        }
        let uri = url.as_str().parse::<Uri>().map_err(crate::error::builder)?;
        let target = (client.spn_resolver)(&url);

        let mut replay = Replay::new(body, rewind);
        let expect = client.wants_expect_continue(replay.is_replayable(), replay.content_length());
        if expect {
            log::debug!(
                "sending {} with Expect: 100-continue (replayable: {}, length: {:?})",
                url,
                replay.is_replayable(),
                replay.content_length()
            );
        }

        let attempt = Attempt {
            method: &method,
            uri: &uri,
            headers: &headers,
            trace: trace.as_ref(),
            affinity: Affinity::default(),
        };
        let mut session = ClientSession::new(client.requested_flags());

        let mut res = if client.opportunistic {
            let step = session.step(&*client.provider, &target, &[])?;
            self.send(&attempt, &step.token, replay.next(false)?, false)
                .await?
        } else {
            self.send(&attempt, &[], replay.next(expect)?, expect)
                .await?
        };

        let mut rounds = 0;
        while res.status() == StatusCode::UNAUTHORIZED {
            let challenge = match token::find_negotiate(res.headers())? {
                Some(challenge) => AuthzChallenge::try_from(&challenge)?,
                None => {
                    log::debug!("{} answered 401 without a Negotiate challenge", url);
                    return Ok(res);
                }
            };

            if challenge.token.is_none() && session.sent_token {
                log::debug!("{} rejected the Negotiate token", url);
                return Ok(res);
            }

            rounds += 1;
            if rounds > client.max_rounds {
                return Err(crate::error::protocol(format!(
                    "negotiation did not complete within {} rounds",
                    client.max_rounds
                )));
            }

            let input = challenge.token.unwrap_or_default();
            let step = session.step(&*client.provider, &target, &input)?;

            // frees the connection for the next leg
            drop(res);
            res = if step.done {
                self.send(&attempt, &step.token, replay.next(expect)?, expect)
                    .await?
            } else {
                // challenge legs never carry the body
                self.send(&attempt, &step.token, Body::empty(), false)
                    .await?
            };
        }

        if client.mutual {
            session.verify_mutual(&target, res.headers())?;
        } else if session.ctx.is_some()
            && res.headers().contains_key(http::header::WWW_AUTHENTICATE)
        {
            log::trace!("ignoring reply token, mutual authentication was not requested");
        }

        Ok(res)
    }

    async fn send(
        &self,
        attempt: &Attempt<'_>,
        token: &[u8],
        body: Body,
        expect: bool,
    ) -> Result<http::Response<ResponseBody>> {
        let bodyless = body.content_length() == Some(0);

        let mut req = http::Request::new(body);
        *req.method_mut() = attempt.method.clone();
        *req.uri_mut() = attempt.uri.clone();
        *req.headers_mut() = attempt.headers.clone();

        let headers = req.headers_mut();
        if !token.is_empty() {
            headers.insert(AUTHORIZATION, token::header_value(token)?);
        }
        if expect {
            headers.insert(EXPECT, HeaderValue::from_static("100-continue"));
        } else {
            headers.remove(EXPECT);
        }
        if bodyless {
            headers.remove(CONTENT_LENGTH);
        }
        if let Some(trace) = attempt.trace {
            req.extensions_mut().insert(trace.clone());
        }
        req.extensions_mut().insert(attempt.affinity.clone());

        if self.inner.http_logging {
            log_request(&req);
        }

        let res = self
            .inner
            .transport
            .round_trip(req)
            .await
            .map_err(crate::error::request)?;

        if self.inner.http_logging {
            log_response(&res);
        }
        Ok(res)
    }
}

impl ClientRef {
    fn requested_flags(&self) -> ContextFlags {
        if self.mutual {
            ContextFlags::INTEG | ContextFlags::MUTUAL
        } else {
            ContextFlags::INTEG
        }
    }

    // A read-once body sent without the header is lost if the server
    // challenges, so it gets the header whenever the header is allowed at all.
    fn wants_expect_continue(&self, replayable: bool, len: Option<u64>) -> bool {
        if self.opportunistic || !self.expect_continue || self.expect_continue_threshold == 0 {
            return false;
        }
        !replayable || len.map_or(false, |len| len >= self.expect_continue_threshold)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Client")
            .field("provider", &self.inner.provider.name())
            .field("mutual", &self.inner.mutual)
            .field("opportunistic", &self.inner.opportunistic)
            .field("expect_continue_threshold", &self.inner.expect_continue_threshold)
            .finish()
    }
}

/// The parts of a request shared by every attempt.
struct Attempt<'a> {
    method: &'a Method,
    uri: &'a Uri,
    headers: &'a HeaderMap,
    trace: Option<&'a Trace>,
    affinity: Affinity,
}

/// Initiator state for one logical request, across all its attempts.
struct ClientSession {
    ctx: Option<ContextGuard>,
    flags: ContextFlags,
    established: bool,
    sent_token: bool,
}

impl ClientSession {
    fn new(flags: ContextFlags) -> ClientSession {
        ClientSession {
            ctx: None,
            flags,
            established: false,
            sent_token: false,
        }
    }

    fn step(
        &mut self,
        provider: &dyn Provider,
        target: &str,
        input: &[u8],
    ) -> Result<Continuation> {
        let ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => ContextGuard::new(
                provider
                    .initiator(self.flags)
                    .map_err(crate::error::mechanism)?,
            ),
        };
        let ctx = self.ctx.insert(ctx);

        let step = ctx
            .initiate_step(target, input)
            .map_err(crate::error::mechanism)?;
        log::trace!(
            "initiator step for {}: {} bytes in, {} bytes out, done: {}",
            target,
            input.len(),
            step.token.len(),
            step.done
        );

        self.established = step.done;
        self.sent_token = true;
        Ok(step)
    }

    fn verify_mutual(&mut self, target: &str, headers: &HeaderMap) -> Result<()> {
        let reply = token::find_negotiate(headers)
            .and_then(|c| c.map(|c| AuthzChallenge::try_from(&c)).transpose())
            .map_err(crate::error::mutual_auth_failed)?
            .and_then(|c| c.token);

        let ctx = match self.ctx.as_mut() {
            Some(ctx) => ctx,
            None if reply.is_none() => {
                log::debug!("server did not ask for authentication");
                return Ok(());
            }
            None => {
                return Err(crate::error::mutual_auth_failed(
                    "reply token received without a security context",
                ))
            }
        };

        if !self.established {
            return Err(crate::error::mutual_auth_failed(
                "server accepted an incomplete security context",
            ));
        }

        let reply = reply.ok_or_else(|| {
            crate::error::mutual_auth_failed("response carries no Negotiate reply token")
        })?;

        ctx.initiate_step(target, &reply)
            .map_err(|status| crate::error::mutual_auth_failed(crate::error::mechanism(status)))?;

        let flags = ctx.flags();
        if !flags.contains(ContextFlags::MUTUAL) {
            return Err(crate::error::mutual_auth_failed(format!(
                "context was established without mutual authentication ({})",
                flags
            )));
        }

        log::debug!("mutual authentication with {} verified", target);
        Ok(())
    }
}

fn log_request(req: &http::Request<Body>) {
    log::debug!(
        target: WIRE_LOG_TARGET,
        "> {} {} {:?}",
        req.method(),
        req.uri(),
        req.version()
    );
    for (name, value) in req.headers() {
        let value = String::from_utf8_lossy(value.as_bytes());
        log::debug!(target: WIRE_LOG_TARGET, "> {}: {}", name, value);
    }
}

fn log_response(res: &http::Response<ResponseBody>) {
    log::debug!(target: WIRE_LOG_TARGET, "< {:?} {}", res.version(), res.status());
    for (name, value) in res.headers() {
        let value = String::from_utf8_lossy(value.as_bytes());
        log::debug!(target: WIRE_LOG_TARGET, "< {}: {}", name, value);
    }
}

/// A request to be executed by a [`Client`].
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Body,
    rewind: Option<Rewind>,
    trace: Option<Trace>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: Body::empty(),
            rewind: None,
            trace: None,
        }
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }

    #[inline]
    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("rewindable", &self.rewind.is_some())
            .finish()
    }
}

/// A builder to construct the properties of a `Request`.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
}

impl RequestBuilder {
    /// Add a `Header` to this Request.
    pub fn header<K, V>(mut self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(value) => {
                        req.headers_mut().append(key, value);
                    }
                    Err(e) => error = Some(crate::error::builder::<http::Error>(e.into())),
                },
                Err(e) => error = Some(crate::error::builder::<http::Error>(e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = body.into();
        }
        self
    }

    /// Supplies a function that produces a fresh copy of a streaming body,
    /// so the body can be sent again after a challenge.
    pub fn rewind<F>(mut self, rewind: F) -> RequestBuilder
    where
        F: Fn() -> io::Result<Body> + Send + Sync + 'static,
    {
        if let Ok(ref mut req) = self.request {
            req.rewind = Some(Arc::new(rewind));
        }
        self
    }

    /// Attaches a [`Trace`] that records `100 Continue` responses.
    pub fn trace(mut self, trace: Trace) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.trace = Some(trace);
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    pub fn build(self) -> Result<Request> {
        self.request
    }

    /// Constructs the Request and sends it to the target URL, returning a
    /// future Response.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while building the request,
    /// sending it, or authenticating.
    pub async fn send(self) -> Result<Response> {
        let req = self.request?;
        self.client.execute(req).await
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.request {
            Ok(ref req) => req.fmt(f),
            Err(ref err) => f.debug_tuple("RequestBuilder").field(err).finish(),
        }
    }
}

/// A Response to a submitted `Request`.
pub struct Response {
    res: http::Response<ResponseBody>,
    url: Url,
}

impl Response {
    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.res.status()
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.res.version()
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        self.res.headers()
    }

    /// Get the final `Url` of this `Response`.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the full response body as `Bytes`.
    pub async fn bytes(self) -> Result<Bytes> {
        self.res
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(crate::error::body)
    }

    /// Get the full response text, replacing invalid UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Returns the underlying `http::Response`.
    pub fn into_inner(self) -> http::Response<ResponseBody> {
        self.res
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status())
            .field("headers", self.headers())
            .finish()
    }
}

/// The future returned by `Client` as a `tower::Service`.
pub type ResponseFuture = BoxFuture<'static, Result<Response>>;

impl tower_service::Service<Request> for Client {
    type Response = Response;
    type Error = crate::Error;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.execute(req).await })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http_body_util::Full;

    use super::*;
    use crate::context::mock::MockProvider;
    use crate::error::BoxError;

    fn client() -> ClientBuilder {
        Client::builder(Arc::new(MockProvider::default())).host_based_spn()
    }

    fn expect_policy(builder: ClientBuilder) -> ClientRef {
        Arc::try_unwrap(builder.build().unwrap().inner)
            .ok()
            .unwrap()
    }

    #[test]
    fn test_build_requires_spn_resolver() {
        let err = Client::builder(Arc::new(MockProvider::default()))
            .build()
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn test_host_based_spn() {
        let url = Url::parse("http://www.example.com:8080/a").unwrap();
        assert_eq!(host_based_spn(&url), "HTTP@www.example.com");
    }

    #[test]
    fn test_expect_continue_policy() {
        let default = expect_policy(client());
        // replayable: only at or above the threshold
        assert!(!default.wants_expect_continue(true, Some(2048)));
        assert!(default.wants_expect_continue(true, Some(4096)));
        assert!(!default.wants_expect_continue(true, None));
        // read-once: always
        assert!(default.wants_expect_continue(false, Some(14)));
        assert!(default.wants_expect_continue(false, None));

        let low = expect_policy(client().expect_continue_threshold(100));
        assert!(low.wants_expect_continue(true, Some(2048)));

        let opportunistic =
            expect_policy(client().opportunistic(true).expect_continue_threshold(100));
        assert!(!opportunistic.wants_expect_continue(true, Some(2048)));
        assert!(!opportunistic.wants_expect_continue(false, Some(2048)));

        let zero = expect_policy(client().expect_continue_threshold(0));
        assert!(!zero.wants_expect_continue(false, Some(14)));

        let disabled = expect_policy(client().expect_continue(false));
        assert!(!disabled.wants_expect_continue(false, Some(14)));
    }

    #[test]
    fn test_requested_flags() {
        assert_eq!(expect_policy(client()).requested_flags(), ContextFlags::INTEG);
        assert_eq!(
            expect_policy(client().mutual(true)).requested_flags(),
            ContextFlags::INTEG | ContextFlags::MUTUAL
        );
    }

    // Answers every request with the same status and challenges, recording
    // the Authorization header, the Expect header and the connection slot of
    // each request.
    #[derive(Clone)]
    struct Canned {
        status: StatusCode,
        challenges: Vec<&'static str>,
        seen: Arc<Mutex<Vec<Option<HeaderValue>>>>,
        expects: Arc<Mutex<Vec<bool>>>,
        slots: Arc<Mutex<Vec<Option<Affinity>>>>,
    }

    impl Canned {
        fn new(status: StatusCode, challenges: Vec<&'static str>) -> Canned {
            Canned {
                status,
                challenges,
                seen: Arc::new(Mutex::new(Vec::new())),
                expects: Arc::new(Mutex::new(Vec::new())),
                slots: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Transport for Canned {
        fn round_trip(
            &self,
            req: http::Request<Body>,
        ) -> BoxFuture<'static, std::result::Result<http::Response<ResponseBody>, BoxError>> {
            self.seen
                .lock()
                .unwrap()
                .push(req.headers().get(AUTHORIZATION).cloned());
            self.expects
                .lock()
                .unwrap()
                .push(req.headers().contains_key(EXPECT));
            self.slots
                .lock()
                .unwrap()
                .push(req.extensions().get::<Affinity>().cloned());

            let body: ResponseBody = Full::new(Bytes::new())
                .map_err(|never| match never {})
                .boxed_unsync();
            let mut res = http::Response::new(body);
            *res.status_mut() = self.status;
            for challenge in &self.challenges {
                res.headers_mut().append(
                    http::header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(*challenge),
                );
            }
            Box::pin(async move { Ok(res) })
        }
    }

    #[tokio::test]
    async fn test_rejection_after_token_is_returned() {
        let canned = Canned::new(StatusCode::UNAUTHORIZED, vec!["Negotiate"]);
        let client = client().transport(canned.clone()).build().unwrap();

        let res = client.get("http://example.com/").send().await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let seen = canned.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_none());
        assert_eq!(
            seen[1].as_ref().unwrap(),
            &token::encode(b"hello:HTTP@example.com")
        );
    }

    #[tokio::test]
    async fn test_ambiguous_challenge_is_protocol_error() {
        let canned = Canned::new(
            StatusCode::UNAUTHORIZED,
            vec!["Negotiate", "Negotiate d2VsY29tZQ=="],
        );
        let client = client().transport(canned).build().unwrap();

        let err = client.get("http://example.com/").send().await.unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(err.url().map(Url::as_str), Some("http://example.com/"));
    }

    #[tokio::test]
    async fn test_round_limit() {
        // "welcome" is always accepted by the mock initiator, so the
        // exchange never ends
        let canned = Canned::new(StatusCode::UNAUTHORIZED, vec!["Negotiate d2VsY29tZQ=="]);
        let client = client()
            .max_rounds(3)
            .transport(canned.clone())
            .build()
            .unwrap();

        let err = client.get("http://example.com/").send().await.unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(canned.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_mutual_requires_reply_token() {
        let canned = Canned::new(StatusCode::OK, vec![]);
        let client = client()
            .mutual(true)
            .opportunistic(true)
            .transport(canned)
            .build()
            .unwrap();

        let err = client.get("http://example.com/").send().await.unwrap_err();
        assert!(err.is_mutual_auth_failed());
    }

    #[tokio::test]
    async fn test_mutual_without_challenge_passes_through() {
        let canned = Canned::new(StatusCode::OK, vec![]);
        let client = client().mutual(true).transport(canned).build().unwrap();

        let res = client.get("http://example.com/").send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_streaming_body_not_rewindable() {
        let canned = Canned::new(StatusCode::UNAUTHORIZED, vec!["Negotiate"]);
        let client = client()
            .expect_continue(false)
            .transport(canned)
            .build()
            .unwrap();

        let err = client
            .post("http://example.com/")
            .body(Body::wrap(Full::new(Bytes::from_static(b"once"))))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_body_not_rewindable());
    }

    #[tokio::test]
    async fn test_legs_share_one_connection_slot() {
        let canned = Canned::new(StatusCode::UNAUTHORIZED, vec!["Negotiate"]);
        let client = client().transport(canned.clone()).build().unwrap();

        client.get("http://example.com/").send().await.unwrap();
        client.get("http://example.com/").send().await.unwrap();

        let slots = canned.slots.lock().unwrap();
        assert_eq!(slots.len(), 4);
        let slots: Vec<&Affinity> = slots.iter().map(|s| s.as_ref().unwrap()).collect();
        assert!(slots[0].same_slot(slots[1]));
        assert!(slots[2].same_slot(slots[3]));
        // separate requests never share a connection slot
        assert!(!slots[1].same_slot(slots[2]));
    }

    #[tokio::test]
    async fn test_sized_rewindable_stream_waits_for_continue() {
        let canned = Canned::new(StatusCode::OK, vec![]);
        let client = client().transport(canned.clone()).build().unwrap();

        let large = || Body::wrap(Full::new(Bytes::from(vec![b'x'; 5000])));
        let small = || Body::wrap(Full::new(Bytes::from_static(b"tiny")));

        client
            .post("http://example.com/")
            .body(large())
            .rewind(move || Ok(large()))
            .send()
            .await
            .unwrap();
        client
            .post("http://example.com/")
            .body(small())
            .rewind(move || Ok(small()))
            .send()
            .await
            .unwrap();

        assert_eq!(*canned.expects.lock().unwrap(), vec![true, false]);
    }
}

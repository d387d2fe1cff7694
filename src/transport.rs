//! Sending a single HTTP exchange.
//!
//! The negotiation engine only needs "send this request, give me the
//! response". [`HttpTransport`] does that over plain HTTP/1.1, keeping the
//! legs of one negotiation on one connection, and implements the client half of
//! `Expect: 100-continue`: the request body is held back until the server
//! sends `100 Continue` (or a timeout passes), and a body the server never
//! asked for is left untouched.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{HeaderValue, EXPECT, HOST};
use http::{Request, Response, Uri};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::error::BoxError;
use crate::trace::Trace;
use crate::Body;

/// The body of a response returned by a [`Transport`].
pub type ResponseBody = UnsyncBoxBody<Bytes, Box<dyn StdError + Send + Sync>>;

/// Sends one request and returns its final response.
///
/// Requests carry an absolute URI. A [`Trace`] may be present in the request
/// extensions and should be marked when an interim `100 Continue` arrives.
pub trait Transport: Send + Sync + 'static {
    fn round_trip(
        &self,
        req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, Box<dyn StdError + Send + Sync>>>;
}

/// Plain-TCP HTTP/1.1 transport.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    expect_continue_timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> HttpTransport {
        HttpTransport {
            expect_continue_timeout: Duration::from_secs(1),
        }
    }

    /// How long to hold back a body sent with `Expect: 100-continue` before
    /// sending it anyway.
    ///
    /// Default is 1 second.
    pub fn expect_continue_timeout(mut self, timeout: Duration) -> HttpTransport {
        self.expect_continue_timeout = timeout;
        self
    }
}

impl Default for HttpTransport {
    fn default() -> HttpTransport {
        HttpTransport::new()
    }
}

impl Transport for HttpTransport {
    fn round_trip(
        &self,
        req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<ResponseBody>, BoxError>> {
        Box::pin(send(req, self.expect_continue_timeout))
    }
}

/// Keeps the connection of one negotiation between its legs.
///
/// Acceptors hold a half-finished security context per connection, so every
/// leg of a handshake has to reach the server on the connection that carried
/// the previous one. The client puts one of these in the extensions of each
/// attempt; [`HttpTransport`] parks the connection in it after a response
/// that leaves the connection clean, and picks it up for the next leg.
#[derive(Clone, Default)]
pub(crate) struct Affinity {
    idle: Arc<Mutex<Option<Idle>>>,
}

struct Idle {
    sender: SendRequest<Gated>,
    watch: Watch,
    task: Arc<ConnTask>,
}

impl Affinity {
    async fn checkout(&self) -> Option<Idle> {
        let mut idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match idle.sender.ready().await {
            Ok(()) => Some(idle),
            Err(err) => {
                log::debug!("kept connection is gone: {}", err);
                None
            }
        }
    }

    fn checkin(&self, idle: Idle) {
        *self.idle.lock().unwrap_or_else(PoisonError::into_inner) = Some(idle);
    }

    #[cfg(test)]
    pub(crate) fn same_slot(&self, other: &Affinity) -> bool {
        Arc::ptr_eq(&self.idle, &other.idle)
    }

    #[cfg(test)]
    fn is_holding(&self) -> bool {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Affinity").finish()
    }
}

/// The spawned task driving a connection; aborted when the last user of the
/// connection goes away.
struct ConnTask(JoinHandle<()>);

impl Drop for ConnTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn connect(host: &str, port: u16) -> Result<Idle, BoxError> {
    let addr = host.trim_start_matches('[').trim_end_matches(']');
    log::trace!("connecting to {}:{}", addr, port);
    let stream = TcpStream::connect((addr, port)).await?;
    let watch = Watch::new();
    let io = TokioIo::new(Sniff::new(stream, watch.clone()));

    let (sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    let task = tokio::spawn(async move {
        if let Err(err) = conn.await {
            log::debug!("connection error: {}", err);
        }
    });

    Ok(Idle {
        sender,
        watch,
        task: Arc::new(ConnTask(task)),
    })
}

async fn send(
    mut req: Request<Body>,
    expect_continue_timeout: Duration,
) -> Result<Response<ResponseBody>, BoxError> {
    let uri = req.uri().clone();
    if uri.scheme_str() != Some("http") {
        return Err(format!("unsupported URI scheme {:?}", uri.scheme_str().unwrap_or("")).into());
    }
    let host = uri.host().ok_or("request URI has no host")?;
    let port = uri.port_u16().unwrap_or(80);

    if !req.headers().contains_key(HOST) {
        let value = match uri.port_u16() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_owned(),
        };
        req.headers_mut().insert(HOST, HeaderValue::from_str(&value)?);
    }
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    *req.uri_mut() = path.parse::<Uri>()?;

    let expects = req
        .headers()
        .get(EXPECT)
        .map_or(false, |v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"));
    let trace = req.extensions().get::<Trace>().cloned();
    let affinity = req.extensions_mut().remove::<Affinity>();

    let kept = match affinity {
        Some(ref affinity) => affinity.checkout().await,
        None => None,
    };
    let Idle {
        mut sender,
        watch,
        task,
    } = match kept {
        Some(idle) => {
            log::trace!("reusing connection to {}:{}", host, port);
            idle
        }
        None => connect(host, port).await?,
    };

    let gate = Gate::new();
    watch.arm(trace.clone(), gate.clone());

    let timer = if expects {
        if let Some(ref trace) = trace {
            trace.record_wait();
        }
        let gate = gate.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(expect_continue_timeout).await;
            if gate.open() {
                log::debug!("no 100 Continue after {:?}, sending body", expect_continue_timeout);
            }
        }))
    } else {
        gate.open();
        None
    };

    let (parts, body) = req.into_parts();
    let res = sender
        .send_request(Request::from_parts(
            parts,
            Gated {
                gate: gate.clone(),
                inner: body,
            },
        ))
        .await;

    if let Some(timer) = timer {
        timer.abort();
    }
    let body_sent = gate.abandon();
    if !body_sent {
        log::debug!("final response arrived before the request body was sent");
    }

    let res = res?;
    // a held-back body or an unread response leaves the connection unusable
    if body_sent && res.body().is_end_stream() {
        if let Some(affinity) = affinity {
            affinity.checkin(Idle {
                sender,
                watch,
                task: task.clone(),
            });
        }
    }

    Ok(res.map(|incoming| {
        Tethered {
            inner: incoming.map_err(|e| Box::new(e) as BoxError).boxed_unsync(),
            _conn: task,
        }
        .boxed_unsync()
    }))
}

#[derive(Debug)]
enum Phase {
    Waiting,
    Open,
    Abandoned,
}

struct GateState {
    phase: Phase,
    waker: Option<Waker>,
}

/// Holds a request body back until it is released or given up on.
#[derive(Clone)]
struct Gate {
    state: Arc<Mutex<GateState>>,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            state: Arc::new(Mutex::new(GateState {
                phase: Phase::Waiting,
                waker: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases the body. Returns false if it was already released or
    /// abandoned.
    fn open(&self) -> bool {
        let mut state = self.lock();
        if !matches!(state.phase, Phase::Waiting) {
            return false;
        }
        state.phase = Phase::Open;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        true
    }

    /// Stops a body that was never released from ever being sent. Returns
    /// true if the body had been released.
    fn abandon(&self) -> bool {
        let mut state = self.lock();
        match state.phase {
            Phase::Waiting => {
                state.phase = Phase::Abandoned;
                state.waker = None;
                false
            }
            Phase::Open => true,
            Phase::Abandoned => false,
        }
    }

    fn poll_open(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.lock();
        match state.phase {
            Phase::Open => Poll::Ready(()),
            Phase::Waiting => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            // the connection is torn down along with the response
            Phase::Abandoned => Poll::Pending,
        }
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gate").field(&self.lock().phase).finish()
    }
}

struct Gated {
    gate: Gate,
    inner: Body,
}

impl HttpBody for Gated {
    type Data = Bytes;
    type Error = crate::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, crate::Error>>> {
        futures_util::ready!(self.gate.poll_open(cx));
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// A response body that keeps its connection task alive.
struct Tethered {
    inner: ResponseBody,
    _conn: Arc<ConnTask>,
}

impl HttpBody for Tethered {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BoxError>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

const STATUS_PREFIX: usize = 12;

struct WatchState {
    head: [u8; STATUS_PREFIX],
    seen: usize,
    trace: Option<Trace>,
    gate: Option<Gate>,
}

/// Watches the first status line coming back for the request in flight. An
/// interim `HTTP/1.x 100` marks the trace and releases the request body.
#[derive(Clone)]
struct Watch {
    state: Arc<Mutex<WatchState>>,
}

impl Watch {
    fn new() -> Watch {
        Watch {
            state: Arc::new(Mutex::new(WatchState {
                head: [0; STATUS_PREFIX],
                seen: STATUS_PREFIX,
                trace: None,
                gate: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts watching for the response to the next request.
    fn arm(&self, trace: Option<Trace>, gate: Gate) {
        let mut state = self.lock();
        state.seen = 0;
        state.trace = trace;
        state.gate = Some(gate);
    }

    fn inspect(&self, fresh: &[u8]) {
        let mut state = self.lock();
        if state.seen >= STATUS_PREFIX {
            return;
        }

        let seen = state.seen;
        let n = fresh.len().min(STATUS_PREFIX - seen);
        state.head[seen..seen + n].copy_from_slice(&fresh[..n]);
        state.seen += n;

        if state.seen == STATUS_PREFIX {
            if is_continue(&state.head) {
                if let Some(ref trace) = state.trace {
                    trace.record_100_continue();
                }
                if let Some(ref gate) = state.gate {
                    gate.open();
                }
            }
            state.trace = None;
            state.gate = None;
        }
    }
}

struct Sniff<T> {
    io: T,
    watch: Watch,
}

impl<T> Sniff<T> {
    fn new(io: T, watch: Watch) -> Sniff<T> {
        Sniff { io, watch }
    }
}

fn is_continue(status_line: &[u8; STATUS_PREFIX]) -> bool {
    status_line.starts_with(b"HTTP/1.") && &status_line[8..] == b" 100"
}

impl<T: AsyncRead + Unpin> AsyncRead for Sniff<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        futures_util::ready!(Pin::new(&mut self.io).poll_read(cx, buf))?;
        self.watch.inspect(&buf.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Sniff<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_is_continue() {
        assert!(is_continue(b"HTTP/1.1 100"));
        assert!(is_continue(b"HTTP/1.0 100"));
        assert!(!is_continue(b"HTTP/1.1 200"));
        assert!(!is_continue(b"HTTP/1.1 401"));
    }

    #[test]
    fn test_gate_transitions() {
        let gate = Gate::new();
        assert!(gate.open());
        assert!(!gate.open());
        assert!(gate.abandon());

        let gate = Gate::new();
        assert!(!gate.abandon());
        assert!(!gate.open());
    }

    fn armed(trace: &Trace, gate: &Gate) -> Watch {
        let watch = Watch::new();
        watch.arm(Some(trace.clone()), gate.clone());
        watch
    }

    #[tokio::test]
    async fn test_sniff_split_status_line() {
        let trace = Trace::new();
        let gate = Gate::new();
        let wire: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n";
        let mut sniff = Sniff::new(wire, armed(&trace, &gate));

        // a short first read must still be recognized
        let mut first = [0u8; 5];
        sniff.read_exact(&mut first).await.unwrap();
        assert!(!trace.seen_100_continue());

        let mut rest = Vec::new();
        sniff.read_to_end(&mut rest).await.unwrap();
        assert!(trace.seen_100_continue());
        // already released by the sniffer
        assert!(!gate.open());
    }

    #[tokio::test]
    async fn test_sniff_ignores_final_status() {
        let trace = Trace::new();
        let gate = Gate::new();
        let wire: &[u8] = b"HTTP/1.1 401 Unauthorized\r\n\r\n";
        let mut sniff = Sniff::new(wire, armed(&trace, &gate));

        let mut rest = Vec::new();
        sniff.read_to_end(&mut rest).await.unwrap();
        assert!(!trace.seen_100_continue());
        assert!(!gate.abandon());
    }

    #[tokio::test]
    async fn test_sniff_rearms_per_request() {
        let wire: &[u8] = b"HTTP/1.1 401 Unauthorized\r\n\r\nHTTP/1.1 100 Continue\r\n\r\n";
        let watch = Watch::new();
        let mut sniff = Sniff::new(wire, watch.clone());

        let first = Trace::new();
        watch.arm(Some(first.clone()), Gate::new());
        let mut head = [0u8; 29];
        sniff.read_exact(&mut head).await.unwrap();
        assert!(!first.seen_100_continue());

        // the second response only counts once the next request is armed
        let second = Trace::new();
        let gate = Gate::new();
        watch.arm(Some(second.clone()), gate.clone());
        let mut rest = Vec::new();
        sniff.read_to_end(&mut rest).await.unwrap();
        assert!(second.seen_100_continue());
        assert!(!first.seen_100_continue());
        assert!(gate.abandon());
    }

    #[tokio::test]
    async fn test_unarmed_watch_ignores_traffic() {
        let wire: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
        let mut sniff = Sniff::new(wire, Watch::new());
        let mut rest = Vec::new();
        sniff.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), wire.len());
    }

    #[tokio::test]
    async fn test_affinity_keeps_clean_connections() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (io, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::spawn(
                    hyper::server::conn::http1::Builder::new().serve_connection(
                        TokioIo::new(io),
                        hyper::service::service_fn(|_req| async {
                            Ok::<_, std::convert::Infallible>(Response::new(
                                http_body_util::Empty::<Bytes>::new(),
                            ))
                        }),
                    ),
                );
            }
        });

        let affinity = Affinity::default();
        for _ in 0..3 {
            let mut req = Request::get(format!("http://{}/", addr))
                .body(Body::empty())
                .unwrap();
            req.extensions_mut().insert(affinity.clone());
            let res = HttpTransport::new().round_trip(req).await.unwrap();
            drop(res);
            assert!(affinity.is_holding());
        }
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 1);

        // without a slot every exchange gets its own connection
        let req = Request::get(format!("http://{}/", addr))
            .body(Body::empty())
            .unwrap();
        drop(HttpTransport::new().round_trip(req).await.unwrap());
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejects_other_schemes() {
        let req = Request::builder()
            .uri("https://example.com/")
            .body(Body::empty())
            .unwrap();
        let err = HttpTransport::new().round_trip(req).await.err().unwrap();
        assert!(err.to_string().contains("unsupported URI scheme"));
    }
}

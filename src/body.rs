use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::combinators::BoxBody;
use pin_project_lite::pin_project;

use crate::error::BoxError;
use crate::Result;

/// A request body.
///
/// Bodies built from bytes (`Vec<u8>`, `String`, `Bytes`, ...) are reusable
/// and can be sent as often as a negotiation needs. Streaming bodies made with
/// [`Body::wrap`] can only be read once; pair them with a rewind function
/// ([`RequestBuilder::rewind`](crate::RequestBuilder::rewind)) or rely on
/// `Expect: 100-continue` to keep them from being consumed by a request the
/// server then rejects.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming(BoxBody<Bytes, BoxError>),
    Shared(SharedBody),
}

/// A function producing a fresh copy of a streaming body.
pub(crate) type Rewind = Arc<dyn Fn() -> std::io::Result<Body> + Send + Sync>;

impl Body {
    pub fn empty() -> Body {
        Body::reusable(Bytes::new())
    }

    /// Wraps any `http_body::Body` as a streaming, read-once body.
    pub fn wrap<B>(inner: B) -> Body
    where
        B: HttpBody + Send + Sync + 'static,
        B::Data: Into<Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Body {
            inner: Inner::Streaming(BoxBody::new(IntoBytesBody { inner })),
        }
    }

    pub(crate) fn reusable(chunk: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(chunk),
        }
    }

    /// Returns the bytes of a reusable body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn is_reusable(&self) -> bool {
        matches!(self.inner, Inner::Reusable(_))
    }

    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self.inner {
            Inner::Reusable(ref chunk) => Some(Body::reusable(chunk.clone())),
            _ => None,
        }
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        match self.inner {
            Inner::Reusable(ref bytes) => Some(bytes.len() as u64),
            Inner::Streaming(ref body) => body.size_hint().exact(),
            Inner::Shared(ref shared) => shared.hint.exact(),
        }
    }

    /// Moves the body into a slot the caller can take it back from, as long
    /// as nothing has started reading it.
    pub(crate) fn into_reclaimable(self) -> (Body, Reclaim) {
        let hint = self.size_hint();
        let slot = Arc::new(Mutex::new(Some(self)));
        let shared = SharedBody {
            slot: slot.clone(),
            current: None,
            hint,
        };
        (
            Body {
                inner: Inner::Shared(shared),
            },
            Reclaim { slot },
        )
    }
}

impl Default for Body {
    #[inline]
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(bytes: Bytes) -> Body {
        Body::reusable(bytes)
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(vec: Vec<u8>) -> Body {
        Body::reusable(vec.into())
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(s: &'static [u8]) -> Body {
        Body::reusable(Bytes::from_static(s))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(s: String) -> Body {
        Body::reusable(s.into())
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(s: &'static str) -> Body {
        s.as_bytes().into()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self.inner {
            Inner::Reusable(_) => "reusable",
            Inner::Streaming(_) => "streaming",
            Inner::Shared(_) => "shared",
        };
        f.debug_struct("Body")
            .field("kind", &kind)
            .field("content_length", &self.content_length())
            .finish()
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = crate::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        match self.inner {
            Inner::Reusable(ref mut bytes) => {
                let out = bytes.split_off(0);
                if out.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Frame::data(out))))
                }
            }
            Inner::Streaming(ref mut body) => Poll::Ready(
                futures_util::ready!(Pin::new(body).poll_frame(cx))
                    .map(|opt| opt.map_err(crate::error::body)),
            ),
            Inner::Shared(ref mut shared) => shared.poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            Inner::Reusable(ref bytes) => bytes.is_empty(),
            Inner::Streaming(ref body) => body.is_end_stream(),
            Inner::Shared(ref shared) => shared.hint.exact() == Some(0),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self.inner {
            Inner::Reusable(ref bytes) => SizeHint::with_exact(bytes.len() as u64),
            Inner::Streaming(ref body) => body.size_hint(),
            Inner::Shared(ref shared) => shared.hint.clone(),
        }
    }
}

pin_project! {
    // Converts frames and errors while keeping the exact size and end of
    // stream of the wrapped body, which decide the `Expect` header.
    struct IntoBytesBody<B> {
        #[pin]
        inner: B,
    }
}

impl<B> HttpBody for IntoBytesBody<B>
where
    B: HttpBody,
    B::Data: Into<Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        match futures_util::ready!(self.project().inner.poll_frame(cx)) {
            Some(Ok(frame)) => Poll::Ready(Some(Ok(frame.map_data(Into::into)))),
            Some(Err(err)) => Poll::Ready(Some(Err(err.into()))),
            None => Poll::Ready(None),
        }
    }

    #[inline]
    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    #[inline]
    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

// A body parked in a shared slot. The first poll moves it out of the slot;
// until then `Reclaim::take` can still get it back.
struct SharedBody {
    slot: Arc<Mutex<Option<Body>>>,
    current: Option<Box<Body>>,
    hint: SizeHint,
}

impl SharedBody {
    fn poll_frame(
        &mut self,
        cx: &mut Context,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, crate::Error>>> {
        if self.current.is_none() {
            let taken = self
                .slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match taken {
                Some(body) => self.current = Some(Box::new(body)),
                None => {
                    return Poll::Ready(Some(Err(crate::error::body(
                        "request body was reclaimed before it was sent",
                    ))))
                }
            }
        }

        match self.current {
            Some(ref mut body) => Pin::new(&mut **body).poll_frame(cx),
            None => Poll::Ready(None),
        }
    }
}

pub(crate) struct Reclaim {
    slot: Arc<Mutex<Option<Body>>>,
}

impl Reclaim {
    /// Returns the body if no one started reading it.
    pub(crate) fn take(&self) -> Option<Body> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Hands out the request body for each attempt of a negotiation.
///
/// A body is read at most once unless it is reusable, a rewind function was
/// given, or the previous attempt never started reading it.
pub(crate) struct Replay {
    body: Option<Body>,
    rewind: Option<Rewind>,
    reclaim: Option<Reclaim>,
}

impl Replay {
    pub(crate) fn new(body: Body, rewind: Option<Rewind>) -> Replay {
        Replay {
            body: Some(body),
            rewind,
            reclaim: None,
        }
    }

    pub(crate) fn is_replayable(&self) -> bool {
        self.rewind.is_some() || self.body.as_ref().map_or(false, Body::is_reusable)
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        self.body.as_ref().and_then(Body::content_length)
    }

    /// Produces the body for the next attempt. With `reclaimable`, a read-once
    /// body is handed out so that it can be taken back if the server answers
    /// before asking for it.
    pub(crate) fn next(&mut self, reclaimable: bool) -> Result<Body> {
        if let Some(reclaim) = self.reclaim.take() {
            if let Some(body) = reclaim.take() {
                log::trace!("reusing request body the server never read");
                return Ok(self.hand_out(body, reclaimable));
            }
        }

        if let Some(body) = self.body.take() {
            if let Some(copy) = body.try_clone() {
                self.body = Some(body);
                return Ok(copy);
            }
            return Ok(self.hand_out(body, reclaimable));
        }

        if let Some(ref rewind) = self.rewind {
            log::trace!("rewinding request body");
            return rewind().map_err(crate::error::body);
        }

        Err(crate::error::body_not_rewindable())
    }

    fn hand_out(&mut self, body: Body, reclaimable: bool) -> Body {
        if !reclaimable {
            return body;
        }
        let (shared, reclaim) = body.into_reclaimable();
        self.reclaim = Some(reclaim);
        shared
    }
}

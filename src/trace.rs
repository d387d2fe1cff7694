//! Observation of `Expect: 100-continue` exchanges.
//!
//! Attach a [`Trace`] to a request with
//! [`RequestBuilder::trace`](crate::RequestBuilder::trace) and keep a clone;
//! the transport marks it when the server answers with an interim
//! `100 Continue`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub struct Trace {
    inner: Arc<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    waited_100: AtomicBool,
    seen_100: AtomicBool,
}

impl Trace {
    pub fn new() -> Trace {
        Trace::default()
    }

    /// Whether a `100 Continue` interim response was received.
    pub fn seen_100_continue(&self) -> bool {
        self.inner.seen_100.load(Ordering::Acquire)
    }

    /// Whether a request body was held back waiting for `100 Continue`.
    pub fn waited_for_100_continue(&self) -> bool {
        self.inner.waited_100.load(Ordering::Acquire)
    }

    pub(crate) fn record_100_continue(&self) {
        if !self.inner.seen_100.swap(true, Ordering::AcqRel) {
            log::trace!("received 100 Continue");
        }
    }

    pub(crate) fn record_wait(&self) {
        self.inner.waited_100.store(true, Ordering::Release);
    }
}

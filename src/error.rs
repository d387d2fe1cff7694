use std::error::Error as StdError;
use std::fmt;

use url::Url;

use crate::status::Status;

/// A `Result` alias where the `Err` case is `http_negotiate::Error`.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while negotiating or sending a request.
///
/// Protocol-format problems, mechanism rejections and body-integrity failures
/// are distinguished through the `is_*` predicates. Transport errors are kept
/// untouched as the [`source`](StdError::source).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Request,
    Body,
    Protocol,
    Mechanism,
    BodyNotRewindable,
    MutualAuthFailed,
    ProviderNotFound,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    pub(crate) fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strips the related URL from this error, for example to keep it out of logs.
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns true if the error came from building a client or request.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error came from the underlying transport.
    pub fn is_request(&self) -> bool {
        matches!(self.inner.kind, Kind::Request)
    }

    /// Returns true if the error is related to a request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true for malformed headers, bad base64, a wrong scheme or a
    /// negotiation that did not converge.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the security context rejected a token or failed.
    pub fn is_mechanism(&self) -> bool {
        matches!(self.inner.kind, Kind::Mechanism)
    }

    /// Returns true if a body without a replay capability had to be sent twice.
    pub fn is_body_not_rewindable(&self) -> bool {
        matches!(self.inner.kind, Kind::BodyNotRewindable)
    }

    /// Returns true if mutual authentication was requested but the server's
    /// reply token was missing, malformed or rejected.
    pub fn is_mutual_auth_failed(&self) -> bool {
        matches!(self.inner.kind, Kind::MutualAuthFailed)
    }

    /// Returns true if a provider name was not found in the registry.
    pub fn is_provider_not_found(&self) -> bool {
        matches!(self.inner.kind, Kind::ProviderNotFound)
    }

    /// Returns the mechanism status behind this error, if there is one.
    pub fn mechanism_status(&self) -> Option<&Status> {
        let mut source = self.inner.source.as_deref().map(|e| e as &(dyn StdError + 'static));
        while let Some(err) = source {
            if let Some(status) = err.downcast_ref::<Status>() {
                return Some(status);
            }
            source = err.source();
        }
        None
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("http_negotiate::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Protocol => f.write_str("negotiate protocol error")?,
            Kind::Mechanism => f.write_str("security context error")?,
            Kind::BodyNotRewindable => {
                f.write_str("request body is not rewindable and cannot be sent again")?
            }
            Kind::MutualAuthFailed => f.write_str("mutual authentication failed")?,
            Kind::ProviderNotFound => f.write_str("provider not found")?,
        }

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({})", url)?;
        }

        if let Some(source) = &self.inner.source {
            write!(f, ": {}", source)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

// constructors

pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Builder, Some(e))
}

pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Request, Some(e))
}

pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Body, Some(e))
}

pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Protocol, Some(e))
}

pub(crate) fn mechanism(status: Status) -> Error {
    Error::new(Kind::Mechanism, Some(status))
}

pub(crate) fn body_not_rewindable() -> Error {
    Error::new(Kind::BodyNotRewindable, None::<Error>)
}

pub(crate) fn mutual_auth_failed<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::MutualAuthFailed, Some(e))
}

pub(crate) fn provider_not_found(name: &str) -> Error {
    Error::new(Kind::ProviderNotFound, Some(format!("no provider registered as {name:?}")))
}

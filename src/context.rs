//! The security-context seam.
//!
//! This crate does not implement a mechanism. A [`Provider`] (for example a
//! binding to a system GSS-API or SSPI library) hands out
//! [`SecurityContext`]s, and the client and server engines move their opaque
//! tokens through HTTP headers.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::flags::ContextFlags;
use crate::lifetime::Lifetime;
use crate::status::{FatalError, Status};

/// The result of one context step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Continuation {
    /// Token to send to the peer. May be empty.
    pub token: Vec<u8>,
    /// Whether the peer needs no further token from this side.
    pub done: bool,
}

impl Continuation {
    pub fn done(token: impl Into<Vec<u8>>) -> Continuation {
        Continuation {
            token: token.into(),
            done: true,
        }
    }

    pub fn more(token: impl Into<Vec<u8>>) -> Continuation {
        Continuation {
            token: token.into(),
            done: false,
        }
    }
}

/// The authenticated peer of an acceptor context.
///
/// The server middleware publishes this in the request extensions, see
/// [`initiator_name`](crate::server::initiator_name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InitiatorName {
    /// The principal name, e.g. `alice@EXAMPLE.ORG`.
    pub principal: String,
    /// The local account the principal maps to, when the mechanism knows it.
    pub local_name: Option<String>,
}

impl fmt::Display for InitiatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.principal)
    }
}

/// An in-progress or established security context.
///
/// A context is either an initiator or an acceptor; the step method of the
/// other role returns [`FatalError::Unavailable`] unless overridden.
///
/// Initiators report `done` as soon as the token they return is the last one
/// the acceptor needs. When mutual authentication was requested, the
/// acceptor's reply token is then passed to one more `initiate_step` call,
/// which fails with [`FatalError::BadMic`] (or similar) if the reply is not
/// authentic.
pub trait SecurityContext: Send {
    /// Runs one initiator step. `input` is empty on the first call.
    fn initiate_step(&mut self, target: &str, input: &[u8]) -> Result<Continuation, Status> {
        let _ = (target, input);
        Err(Status::fatal(FatalError::Unavailable).with_mech_error("not an initiator context"))
    }

    /// Runs one acceptor step with the initiator's token.
    fn accept_step(&mut self, input: &[u8]) -> Result<Continuation, Status> {
        let _ = input;
        Err(Status::fatal(FatalError::Unavailable).with_mech_error("not an acceptor context"))
    }

    /// The initiator's identity. Only valid on an established acceptor context.
    fn identity(&self) -> Result<InitiatorName, Status>;

    /// Flags negotiated so far.
    fn flags(&self) -> ContextFlags;

    fn lifetime(&self) -> Lifetime {
        Lifetime::Indefinite
    }

    /// Deletes the context. Calling it more than once must be harmless.
    fn release(&mut self) -> Result<(), Status>;
}

/// A mechanism implementation that creates security contexts.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Creates an initiator context requesting `flags`.
    fn initiator(&self, flags: ContextFlags) -> Result<Box<dyn SecurityContext>, Status>;

    /// Creates an acceptor context using the provider's default credentials.
    fn acceptor(&self) -> Result<Box<dyn SecurityContext>, Status>;
}

/// Owns a context for one handshake and releases it when dropped.
pub struct ContextGuard {
    ctx: Box<dyn SecurityContext>,
}

impl ContextGuard {
    pub fn new(ctx: Box<dyn SecurityContext>) -> ContextGuard {
        ContextGuard { ctx }
    }
}

impl Deref for ContextGuard {
    type Target = dyn SecurityContext;

    fn deref(&self) -> &Self::Target {
        &*self.ctx
    }
}

impl DerefMut for ContextGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.ctx
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Err(status) = self.ctx.release() {
            log::debug!("failed to release security context: {}", status);
        }
    }
}

impl fmt::Debug for ContextGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("flags", &self.ctx.flags())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::mock::MockProvider;
    use super::*;

    #[test]
    fn test_guard_releases_on_drop() {
        let provider = MockProvider::default();
        {
            let mut guard = ContextGuard::new(provider.initiator(ContextFlags::INTEG).unwrap());
            let step = guard.initiate_step("HTTP@example.com", &[]).unwrap();
            assert_eq!(step.token, b"hello:HTTP@example.com");
            assert!(step.done);
            guard.release().unwrap();
        }
        // an explicit release followed by drop still counts once
        assert_eq!(provider.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_role_is_unavailable() {
        struct InitOnly;
        impl SecurityContext for InitOnly {
            fn identity(&self) -> Result<InitiatorName, Status> {
                Err(Status::fatal(FatalError::NoContext))
            }
            fn flags(&self) -> ContextFlags {
                ContextFlags::empty()
            }
            fn release(&mut self) -> Result<(), Status> {
                Ok(())
            }
        }

        let err = InitOnly.accept_step(b"token").unwrap_err();
        assert_eq!(err.fatal_error(), Some(FatalError::Unavailable));
        assert_eq!(InitOnly.lifetime(), Lifetime::Indefinite);
    }
}

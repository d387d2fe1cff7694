//! A loopback mechanism: tokens are plain text, so tests can see and tamper
//! with every leg of a handshake.
//!
//! ```text
//! initiator                                acceptor
//!   [LOOPBACK-NEG:<target>]          ->
//!                                    <-    [LOOPBACK-CHAL]
//!   LOOPBACK-AP-REQ:<target>:<M|->   ->
//!                                    <-    LOOPBACK-AP-REP:<target>   (if M)
//! ```
//!
//! The bracketed legs are only used by [`Loopback::two_leg`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http_negotiate::{
    ContextFlags, Continuation, FatalError, InitiatorName, Lifetime, Provider, SecurityContext,
    Status,
};

const NEG: &str = "LOOPBACK-NEG:";
const CHAL: &str = "LOOPBACK-CHAL";
const AP_REQ: &str = "LOOPBACK-AP-REQ:";
const AP_REP: &str = "LOOPBACK-AP-REP:";

#[derive(Clone, Default)]
pub struct Loopback {
    two_leg: bool,
    expired: bool,
    created: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl Loopback {
    pub fn new() -> Loopback {
        Loopback::default()
    }

    /// Adds a negotiation leg before the AP-REQ.
    pub fn two_leg() -> Loopback {
        Loopback {
            two_leg: true,
            ..Loopback::default()
        }
    }

    /// Acceptor contexts report an expired lifetime once established.
    pub fn expired() -> Loopback {
        Loopback {
            expired: true,
            ..Loopback::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn into_provider(self) -> Arc<dyn Provider> {
        Arc::new(self)
    }
}

impl Provider for Loopback {
    fn name(&self) -> &str {
        "loopback"
    }

    fn initiator(&self, flags: ContextFlags) -> Result<Box<dyn SecurityContext>, Status> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackContext {
            role: Role::Initiator(InitiatorState::Start),
            two_leg: self.two_leg,
            expired: false,
            requested: flags,
            flags: flags - ContextFlags::MUTUAL,
            peer: None,
            released: self.released.clone(),
            live: true,
        }))
    }

    fn acceptor(&self) -> Result<Box<dyn SecurityContext>, Status> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackContext {
            role: Role::Acceptor { established: false },
            two_leg: self.two_leg,
            expired: self.expired,
            requested: ContextFlags::empty(),
            flags: ContextFlags::empty(),
            peer: None,
            released: self.released.clone(),
            live: true,
        }))
    }
}

#[derive(Clone, Copy)]
enum InitiatorState {
    Start,
    Negotiating,
    AwaitingReply,
    Complete,
}

enum Role {
    Initiator(InitiatorState),
    Acceptor { established: bool },
}

struct LoopbackContext {
    role: Role,
    two_leg: bool,
    expired: bool,
    requested: ContextFlags,
    flags: ContextFlags,
    peer: Option<String>,
    released: Arc<AtomicUsize>,
    live: bool,
}

fn defective(msg: &str) -> Status {
    Status::fatal(FatalError::DefectiveToken).with_mech_error(msg.to_string())
}

impl LoopbackContext {
    fn ap_req(&mut self, target: &str) -> Continuation {
        let mutual = self.requested.contains(ContextFlags::MUTUAL);
        let token = format!("{}{}:{}", AP_REQ, target, if mutual { "M" } else { "-" });
        self.role = Role::Initiator(if mutual {
            InitiatorState::AwaitingReply
        } else {
            InitiatorState::Complete
        });
        Continuation::done(token)
    }
}

impl SecurityContext for LoopbackContext {
    fn initiate_step(&mut self, target: &str, input: &[u8]) -> Result<Continuation, Status> {
        let state = match self.role {
            Role::Initiator(state) => state,
            Role::Acceptor { .. } => return Err(Status::fatal(FatalError::Unavailable)),
        };

        match state {
            InitiatorState::Start if self.two_leg => {
                self.role = Role::Initiator(InitiatorState::Negotiating);
                Ok(Continuation::more(format!("{}{}", NEG, target)))
            }
            InitiatorState::Start => Ok(self.ap_req(target)),
            InitiatorState::Negotiating => {
                if input != CHAL.as_bytes() {
                    return Err(defective("expected a negotiation challenge"));
                }
                Ok(self.ap_req(target))
            }
            InitiatorState::AwaitingReply => {
                let expected = format!("{}{}", AP_REP, target);
                if input != expected.as_bytes() {
                    return Err(Status::fatal(FatalError::BadMic)
                        .with_mech_error("reply does not match the request".to_string()));
                }
                self.flags |= ContextFlags::MUTUAL;
                self.role = Role::Initiator(InitiatorState::Complete);
                Ok(Continuation::done(Vec::new()))
            }
            InitiatorState::Complete => Err(Status::fatal(FatalError::NoContext)),
        }
    }

    fn accept_step(&mut self, input: &[u8]) -> Result<Continuation, Status> {
        if let Role::Initiator(_) = self.role {
            return Err(Status::fatal(FatalError::Unavailable));
        }
        let input = std::str::from_utf8(input).map_err(|_| defective("token is not text"))?;

        if self.two_leg && self.peer.is_none() {
            if let Some(target) = input.strip_prefix(NEG) {
                self.peer = Some(target.to_string());
                return Ok(Continuation::more(CHAL));
            }
            return Err(defective("expected a negotiation token"));
        }

        let rest = input
            .strip_prefix(AP_REQ)
            .ok_or_else(|| defective("expected an AP-REQ"))?;
        let (target, mutual) = rest
            .rsplit_once(':')
            .ok_or_else(|| defective("malformed AP-REQ"))?;

        self.role = Role::Acceptor { established: true };
        self.flags = ContextFlags::INTEG;
        if mutual == "M" {
            self.flags |= ContextFlags::MUTUAL;
            Ok(Continuation::done(format!("{}{}", AP_REP, target)))
        } else {
            Ok(Continuation::done(Vec::new()))
        }
    }

    fn identity(&self) -> Result<InitiatorName, Status> {
        match self.role {
            Role::Acceptor { established: true } => Ok(InitiatorName {
                principal: "alice@EXAMPLE.ORG".to_string(),
                local_name: Some("alice".to_string()),
            }),
            _ => Err(Status::fatal(FatalError::NoContext)),
        }
    }

    fn flags(&self) -> ContextFlags {
        self.flags
    }

    fn lifetime(&self) -> Lifetime {
        if self.expired {
            Lifetime::Expired
        } else {
            Lifetime::Indefinite
        }
    }

    fn release(&mut self) -> Result<(), Status> {
        if self.live {
            self.live = false;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

//! Mechanism status values.
//!
//! A failed security-context call reports a [`Status`]: at most one fatal
//! routine error, any number of informational (supplementary) codes, and
//! mechanism-specific detail. The codes match RFC 2744 § 3.9.1 so that
//! providers wrapping a C GSS-API library can translate major status words
//! with [`Status::from_major`].

use std::error::Error as StdError;
use std::fmt;

/// Fatal routine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalError {
    BadMech,
    BadName,
    BadNameType,
    BadBindings,
    BadStatus,
    /// A token had an invalid signature (also known as `BAD_SIG`).
    BadMic,
    NoCred,
    NoContext,
    DefectiveToken,
    DefectiveCredential,
    CredentialsExpired,
    ContextExpired,
    Failure,
    BadQop,
    Unauthorized,
    Unavailable,
    DuplicateElement,
    NameNotMn,
}

const FATAL_ERRORS: [FatalError; 18] = [
    FatalError::BadMech,
    FatalError::BadName,
    FatalError::BadNameType,
    FatalError::BadBindings,
    FatalError::BadStatus,
    FatalError::BadMic,
    FatalError::NoCred,
    FatalError::NoContext,
    FatalError::DefectiveToken,
    FatalError::DefectiveCredential,
    FatalError::CredentialsExpired,
    FatalError::ContextExpired,
    FatalError::Failure,
    FatalError::BadQop,
    FatalError::Unauthorized,
    FatalError::Unavailable,
    FatalError::DuplicateElement,
    FatalError::NameNotMn,
];

impl FatalError {
    /// The RFC 2744 routine error number (1 through 18).
    pub fn code(self) -> u32 {
        FATAL_ERRORS
            .iter()
            .position(|e| *e == self)
            .map(|idx| idx as u32 + 1)
            .unwrap_or(0)
    }

    /// Maps a routine error number back to the error. Zero means "complete"
    /// and has no fatal error.
    pub fn from_code(code: u32) -> Option<FatalError> {
        let idx = code.checked_sub(1)? as usize;
        FATAL_ERRORS.get(idx).copied()
    }

    pub fn message(self) -> &'static str {
        match self {
            FatalError::BadMech => "an unsupported mechanism was requested",
            FatalError::BadName => "an invalid name was supplied",
            FatalError::BadNameType => "a supplied name was of an unsupported type",
            FatalError::BadBindings => "incorrect channel bindings were supplied",
            FatalError::BadStatus => "an invalid status code was supplied",
            FatalError::BadMic => "a token had an invalid signature",
            FatalError::NoCred => {
                "no credentials were supplied, or the credentials were unavailable or inaccessible"
            }
            FatalError::NoContext => "no context has been established",
            FatalError::DefectiveToken => "invalid token was supplied",
            FatalError::DefectiveCredential => "invalid credential was supplied",
            FatalError::CredentialsExpired => "the referenced credentials have expired",
            FatalError::ContextExpired => "the context has expired",
            FatalError::Failure => {
                "unspecified failure, the mechanism detail may provide more information"
            }
            FatalError::BadQop => "the quality-of-protection requested could not be provided",
            FatalError::Unauthorized => "the operation is forbidden by local security policy",
            FatalError::Unavailable => "the operation or option is not available or supported",
            FatalError::DuplicateElement => "the requested credential element already exists",
            FatalError::NameNotMn => "the provided name was not a mechanism name",
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl StdError for FatalError {}

/// Supplementary, non-fatal status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Informational {
    ContinueNeeded,
    DuplicateToken,
    OldToken,
    UnseqToken,
    GapToken,
}

const INFORMATIONAL: [Informational; 5] = [
    Informational::ContinueNeeded,
    Informational::DuplicateToken,
    Informational::OldToken,
    Informational::UnseqToken,
    Informational::GapToken,
];

impl Informational {
    /// The supplementary-information bit for this code.
    pub fn bit(self) -> u32 {
        match self {
            Informational::ContinueNeeded => 1,
            Informational::DuplicateToken => 2,
            Informational::OldToken => 4,
            Informational::UnseqToken => 8,
            Informational::GapToken => 16,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Informational::ContinueNeeded => {
                "the routine must be called again to complete its function"
            }
            Informational::DuplicateToken => "the token was a duplicate of an earlier token",
            Informational::OldToken => "the token's validity period has expired",
            Informational::UnseqToken => "a later token has already been processed",
            Informational::GapToken => "an expected per-message token was not received",
        }
    }
}

impl fmt::Display for Informational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl StdError for Informational {}

/// One constituent of a [`Status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    Fatal(FatalError),
    Informational(Informational),
    Mechanism(String),
}

/// The outcome of a failed security-context call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    fatal: Option<FatalError>,
    info: Vec<Informational>,
    mech: Vec<String>,
}

impl Status {
    pub fn fatal(error: FatalError) -> Status {
        Status {
            fatal: Some(error),
            ..Status::default()
        }
    }

    /// A status that only carries informational codes.
    pub fn informational(info: Informational) -> Status {
        Status::default().with_info(info)
    }

    /// Adds an informational code; duplicates are ignored.
    pub fn with_info(mut self, info: Informational) -> Status {
        if !self.info.contains(&info) {
            self.info.push(info);
            self.info.sort_by_key(|i| i.bit());
        }
        self
    }

    /// Adds a mechanism-specific message (a "minor status").
    pub fn with_mech_error(mut self, msg: impl Into<String>) -> Status {
        self.mech.push(msg.into());
        self
    }

    /// Decodes an RFC 2744 major status word.
    ///
    /// Calling errors (bits 24 and up) are reported as [`FatalError::Failure`].
    pub fn from_major(major: u32) -> Status {
        let routine = (major >> 16) & 0xff;
        let calling = major >> 24;
        let mut status = Status {
            fatal: FatalError::from_code(routine),
            ..Status::default()
        };
        if status.fatal.is_none() && (calling != 0 || routine != 0) {
            status.fatal = Some(FatalError::Failure);
        }
        for info in INFORMATIONAL {
            if major & info.bit() != 0 {
                status = status.with_info(info);
            }
        }
        status
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        self.fatal
    }

    pub fn info(&self) -> &[Informational] {
        &self.info
    }

    pub fn mech_errors(&self) -> &[String] {
        &self.mech
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    /// Decomposes the status into its constituent causes, fatal first.
    pub fn causes(&self) -> Vec<Cause> {
        let mut causes = Vec::with_capacity(1 + self.info.len() + self.mech.len());
        if let Some(fatal) = self.fatal {
            causes.push(Cause::Fatal(fatal));
        }
        causes.extend(self.mech.iter().cloned().map(Cause::Mechanism));
        causes.extend(self.info.iter().copied().map(Cause::Informational));
        causes
    }
}

impl From<FatalError> for Status {
    fn from(error: FatalError) -> Status {
        Status::fatal(error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();

        if let Some(fatal) = self.fatal {
            // the generic failure text only points at the mechanism detail
            if !(fatal == FatalError::Failure && !self.mech.is_empty()) {
                parts.push(fatal.message().to_owned());
            }
        }

        if !self.mech.is_empty() {
            parts.push(self.mech.join("; "));
        }

        if !self.info.is_empty() {
            let info: Vec<&str> = self.info.iter().map(|i| i.message()).collect();
            parts.push(format!("Additionally: {}", info.join("; ")));
        }

        if parts.is_empty() {
            return f.write_str("complete");
        }

        f.write_str(&parts.join(". "))
    }
}

impl StdError for Status {}

use std::time::{Duration, SystemTime};

/// How long a security context (or credential) remains valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Lifetime {
    /// Already expired.
    Expired,
    /// Valid with no known expiry.
    #[default]
    Indefinite,
    /// Valid until the given time.
    ExpiresAt(SystemTime),
}

/// The RFC 2744 value meaning "indefinite".
const INDEFINITE_SECONDS: u32 = u32::MAX;

impl Lifetime {
    /// Converts a lifetime expressed in seconds from now, as a C GSS-API
    /// implementation reports it. Zero is expired; `u32::MAX` is indefinite.
    pub fn from_seconds(secs: u32) -> Lifetime {
        match secs {
            0 => Lifetime::Expired,
            INDEFINITE_SECONDS => Lifetime::Indefinite,
            secs => Lifetime::ExpiresAt(SystemTime::now() + Duration::from_secs(u64::from(secs))),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self {
            Lifetime::Expired => true,
            Lifetime::Indefinite => false,
            Lifetime::ExpiresAt(at) => *at <= SystemTime::now(),
        }
    }

    /// Time left before expiry; `None` when indefinite.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Lifetime::Expired => Some(Duration::ZERO),
            Lifetime::Indefinite => None,
            Lifetime::ExpiresAt(at) => Some(
                at.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_seconds() {
        assert_eq!(Lifetime::from_seconds(0), Lifetime::Expired);
        assert_eq!(Lifetime::from_seconds(u32::MAX), Lifetime::Indefinite);

        let lt = Lifetime::from_seconds(3600);
        assert!(!lt.is_expired());
        let left = lt.remaining().unwrap();
        assert!(left > Duration::from_secs(3500) && left <= Duration::from_secs(3600));
    }

    #[test]
    fn test_past_expiry_is_expired() {
        let past = SystemTime::now() - Duration::from_secs(10);
        let lt = Lifetime::ExpiresAt(past);
        assert!(lt.is_expired());
        assert_eq!(lt.remaining(), Some(Duration::ZERO));
        assert!(Lifetime::Expired.is_expired());
        assert_eq!(Lifetime::Indefinite.remaining(), None);
    }
}

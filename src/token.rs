//! The `Negotiate` header codec.
//!
//! `Authorization: Negotiate <base64>` carries initiator tokens and
//! `WWW-Authenticate: Negotiate [<base64>]` carries challenges and acceptor
//! replies (RFC 4559). A `WWW-Authenticate` header may hold several
//! challenges for different schemes, so responses go through the RFC 7235
//! challenge parser below.

use std::fmt;

use base64::Engine as _;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};

use crate::Result;

/// The authentication scheme name.
pub const SCHEME: &str = "Negotiate";

/// Encodes a token as an `Authorization` or `WWW-Authenticate` value.
///
/// An empty token gives the bare scheme, which is what a server sends to
/// start a new exchange.
pub fn encode(token: &[u8]) -> String {
    if token.is_empty() {
        return SCHEME.to_owned();
    }
    format!(
        "{} {}",
        SCHEME,
        base64::engine::general_purpose::STANDARD.encode(token)
    )
}

pub(crate) fn header_value(token: &[u8]) -> Result<HeaderValue> {
    HeaderValue::from_str(&encode(token)).map_err(crate::error::protocol)
}

/// Decodes a `Negotiate <base64>` header value.
///
/// The scheme is matched case-insensitively. Returns `None` for any other
/// scheme, a missing token or invalid base64.
pub fn decode(value: &str) -> Option<Vec<u8>> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case(SCHEME) {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    base64::engine::general_purpose::STANDARD.decode(token).ok()
}

pub(crate) fn decode_token68(token: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(crate::error::protocol)
}

/// A parsed `Negotiate` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzChallenge {
    pub scheme: String,
    /// `None` for a bare `Negotiate`, which asks for a fresh exchange.
    pub token: Option<Vec<u8>>,
}

impl AuthzChallenge {
    /// Parses a single `Negotiate [<base64>]` value.
    pub fn parse(value: &str) -> Result<AuthzChallenge> {
        let value = value.trim();
        let (scheme, rest) = match value.split_once(' ') {
            Some((scheme, rest)) => (scheme, rest.trim()),
            None => (value, ""),
        };
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(crate::error::protocol(format!(
                "expected {} scheme, got {:?}",
                SCHEME, scheme
            )));
        }
        let token = if rest.is_empty() {
            None
        } else {
            Some(decode_token68(rest)?)
        };
        Ok(AuthzChallenge {
            scheme: scheme.to_owned(),
            token,
        })
    }
}

impl fmt::Display for AuthzChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode(self.token.as_deref().unwrap_or_default()))
    }
}

impl TryFrom<&Challenge> for AuthzChallenge {
    type Error = crate::Error;

    fn try_from(challenge: &Challenge) -> Result<AuthzChallenge> {
        if !challenge.params.is_empty() {
            return Err(crate::error::protocol(format!(
                "{} challenge carries parameters instead of a token",
                challenge.scheme
            )));
        }
        let token = match challenge.token68 {
            Some(ref token) => Some(decode_token68(token)?),
            None => None,
        };
        Ok(AuthzChallenge {
            scheme: challenge.scheme.clone(),
            token,
        })
    }
}

/// One challenge from a `WWW-Authenticate` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub token68: Option<String>,
    pub params: Vec<(String, String)>,
}

impl Challenge {
    pub fn is_negotiate(&self) -> bool {
        self.scheme.eq_ignore_ascii_case(SCHEME)
    }

    /// Looks up a parameter by case-insensitive name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Parses every challenge in every `WWW-Authenticate` header, in order.
pub fn parse_challenges(headers: &HeaderMap) -> Result<Vec<Challenge>> {
    let mut challenges = Vec::new();
    for value in headers.get_all(WWW_AUTHENTICATE) {
        let value = value.to_str().map_err(crate::error::protocol)?;
        Parser::new(value).parse_into(&mut challenges)?;
    }
    Ok(challenges)
}

/// Finds the single `Negotiate` challenge of a response.
///
/// More than one `Negotiate` challenge is ambiguous and rejected.
pub fn find_negotiate(headers: &HeaderMap) -> Result<Option<Challenge>> {
    let mut found = None;
    for challenge in parse_challenges(headers)? {
        if !challenge.is_negotiate() {
            continue;
        }
        if found.is_some() {
            return Err(crate::error::protocol(
                "multiple Negotiate challenges in WWW-Authenticate",
            ));
        }
        found = Some(challenge);
    }
    Ok(found)
}

/// Splits the `Authorization` header into scheme and credentials.
pub fn parse_authorization(headers: &HeaderMap) -> Option<(&str, &str)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, credentials) = value.trim().split_once(' ')?;
    Some((scheme, credentials.trim()))
}

// RFC 7235 challenge grammar:
//
//   challenge = auth-scheme [ 1*SP ( token68 / #auth-param ) ]
//
// A word followed by `=` is either the padding of a token68 or the start of
// an auth-param; it is a token68 only when nothing but a list separator
// follows the `=` run.
struct Parser<'a> {
    s: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(s: &'a str) -> Parser<'a> {
        Parser {
            s: s.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.s.get(self.pos).copied()
    }

    fn at_end(&self) -> bool {
        self.pos >= self.s.len()
    }

    fn at_boundary(&self) -> bool {
        matches!(self.peek(), None | Some(b','))
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    fn skip_ws_and_commas(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t') | Some(b',')) {
            self.pos += 1;
        }
    }

    fn word(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, b' ' | b'\t' | b',' | b'=' | b'"') {
                break;
            }
            self.pos += 1;
        }
        // only ASCII delimiters are skipped, so the slice stays valid UTF-8
        std::str::from_utf8(&self.s[start..self.pos]).unwrap_or_default()
    }

    fn quoted(&mut self) -> Result<String> {
        // opening quote
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(malformed("unterminated quoted string")),
                Some(b'"') => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let c = self.peek().ok_or_else(|| malformed("dangling escape"))?;
                    out.push(c);
                    self.pos += 1;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(out).map_err(crate::error::protocol)
    }

    fn value(&mut self) -> Result<String> {
        if self.peek() == Some(b'"') {
            return self.quoted();
        }
        let value = self.word();
        if value.is_empty() {
            return Err(malformed("missing parameter value"));
        }
        Ok(value.to_owned())
    }

    fn parse_into(mut self, out: &mut Vec<Challenge>) -> Result<()> {
        loop {
            self.skip_ws_and_commas();
            if self.at_end() {
                return Ok(());
            }

            let scheme = self.word();
            if scheme.is_empty() {
                return Err(malformed("expected an auth-scheme"));
            }
            let mut challenge = Challenge {
                scheme: scheme.to_owned(),
                ..Challenge::default()
            };

            self.skip_ws();
            if !self.at_boundary() {
                self.parse_credentials(&mut challenge)?;
            }
            out.push(challenge);
        }
    }

    fn parse_credentials(&mut self, challenge: &mut Challenge) -> Result<()> {
        let word = self.word();
        if word.is_empty() {
            return Err(malformed("expected a token68 or auth-param"));
        }

        self.skip_ws();
        let mut padding = 0;
        while self.peek() == Some(b'=') {
            padding += 1;
            self.pos += 1;
        }
        self.skip_ws();

        if self.at_boundary() {
            let mut token68 = word.to_owned();
            token68.extend(std::iter::repeat('=').take(padding));
            challenge.token68 = Some(token68);
            return Ok(());
        }
        if padding != 1 {
            return Err(malformed("unexpected data after token68"));
        }

        let value = self.value()?;
        challenge.params.push((word.to_owned(), value));

        // further params, until a word that is not followed by `=`, which
        // starts the next challenge
        loop {
            let mark = self.pos;
            self.skip_ws();
            if self.at_end() {
                return Ok(());
            }
            if self.peek() != Some(b',') {
                return Err(malformed("expected ',' between auth-params"));
            }
            self.skip_ws_and_commas();
            let name = self.word();
            self.skip_ws();
            if name.is_empty() || self.peek() != Some(b'=') {
                self.pos = mark;
                return Ok(());
            }
            self.pos += 1;
            self.skip_ws();
            let value = self.value()?;
            challenge.params.push((name.to_owned(), value));
        }
    }
}

fn malformed(msg: &str) -> crate::Error {
    crate::error::protocol(format!("malformed WWW-Authenticate header: {}", msg))
}

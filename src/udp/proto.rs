//! Rendezvous wire format.
//!
//! One UDP packet carries one line, `"<ACTION>: <ARG>"`, split on the first `": "`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

pub const ALREADY_REGISTERED: &str = "ALREADY REGISTERED";
pub const NOT_REGISTERED: &str = "NOT REGISTERED";
pub const NOT_MONITORING: &str = "NOT MONITORING";
pub const ADDRESS_MISMATCH: &str = "ADDRESS MISMATCH";
pub const BAD_REQUEST: &str = "BAD REQUEST";

const SEPARATOR: &str = ": ";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("message is not utf-8")]
    Utf8,
    #[error("missing \": \" separator")]
    MissingSeparator,
    #[error("empty argument")]
    EmptyArgument,
    #[error("unknown action {0}")]
    UnknownAction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Register,
    Unregister,
    Ping,
    Punch,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Register => "REGISTER",
            Action::Unregister => "UNREGISTER",
            Action::Ping => "PING",
            Action::Punch => "PUNCH",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTER" => Ok(Action::Register),
            "UNREGISTER" => Ok(Action::Unregister),
            "PING" => Ok(Action::Ping),
            "PUNCH" => Ok(Action::Punch),
            _ => Err(ParseError::UnknownAction(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub action: Action,
    pub name: String,
}

impl Request {
    pub fn new<A: AsRef<str>>(action: Action, name: A) -> Self {
        Self {
            action,
            name: name.as_ref().to_string(),
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        std::str::from_utf8(buf)
            .map_err(|_| ParseError::Utf8)?
            .parse()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.action, SEPARATOR, self.name)
    }
}

impl FromStr for Request {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (action, name) = split_line(s)?;
        Ok(Self {
            action: action.parse()?,
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success(String),
    Fail(String),
    Pong(String),
}

impl Response {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        std::str::from_utf8(buf)
            .map_err(|_| ParseError::Utf8)?
            .parse()
    }

    /// Whether this can be the server's answer to `req`.
    ///
    /// FAIL carries no name, so it answers any request.
    pub fn answers(&self, req: &Request) -> bool {
        match (req.action, self) {
            (_, Response::Fail(_)) => true,
            (Action::Ping, Response::Pong(name)) => *name == req.name,
            (Action::Register | Action::Unregister, Response::Success(name)) => *name == req.name,
            (Action::Punch, Response::Success(addr)) => addr.parse::<SocketAddr>().is_ok(),
            _ => false,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Success(v) => write!(f, "SUCCESS{}{}", SEPARATOR, v),
            Response::Fail(v) => write!(f, "FAIL{}{}", SEPARATOR, v),
            Response::Pong(v) => write!(f, "PONG{}{}", SEPARATOR, v),
        }
    }
}

impl FromStr for Response {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = split_line(s)?;
        let value = value.to_string();
        match kind {
            "SUCCESS" => Ok(Response::Success(value)),
            "FAIL" => Ok(Response::Fail(value)),
            "PONG" => Ok(Response::Pong(value)),
            _ => Err(ParseError::UnknownAction(kind.to_string())),
        }
    }
}

fn split_line(s: &str) -> Result<(&str, &str), ParseError> {
    let s = s.trim_end_matches(['\r', '\n']);
    let (head, tail) = s
        .split_once(SEPARATOR)
        .ok_or(ParseError::MissingSeparator)?;

    if tail.is_empty() {
        return Err(ParseError::EmptyArgument);
    }

    Ok((head, tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        assert_eq!(
            Request::parse(b"REGISTER: alice").unwrap(),
            Request::new(Action::Register, "alice")
        );
        assert_eq!(
            Request::parse(b"PUNCH: bob\n").unwrap(),
            Request::new(Action::Punch, "bob")
        );
        // only the first separator splits
        assert_eq!(
            Request::parse(b"PING: a: b").unwrap(),
            Request::new(Action::Ping, "a: b")
        );
    }

    #[test]
    fn test_parse_bad_request() {
        assert_eq!(
            Request::parse(b"REGISTER alice"),
            Err(ParseError::MissingSeparator)
        );
        assert_eq!(Request::parse(b"PUNCH: "), Err(ParseError::EmptyArgument));
        assert_eq!(
            Request::parse(b"HELLO: x"),
            Err(ParseError::UnknownAction("HELLO".into()))
        );
        assert_eq!(
            Request::parse(b"register: x"),
            Err(ParseError::UnknownAction("register".into()))
        );
        assert_eq!(Request::parse(&[0xff, 0xfe]), Err(ParseError::Utf8));
    }

    #[test]
    fn test_response_format() {
        assert_eq!(Response::Success("alice".into()).to_string(), "SUCCESS: alice");
        assert_eq!(
            Response::Fail(NOT_REGISTERED.into()).to_string(),
            "FAIL: NOT REGISTERED"
        );
        assert_eq!(
            Response::parse(b"SUCCESS: 1.2.3.4:5678").unwrap(),
            Response::Success("1.2.3.4:5678".into())
        );
        assert_eq!(
            Response::parse(b"PONG: dave").unwrap(),
            Response::Pong("dave".into())
        );
    }

    #[test]
    fn test_response_answers_request() {
        let register = Request::new(Action::Register, "srv");
        let ping = Request::new(Action::Ping, "srv");
        let punch = Request::new(Action::Punch, "srv");

        assert!(Response::Success("srv".into()).answers(&register));
        assert!(Response::Fail(ALREADY_REGISTERED.into()).answers(&register));
        // a late PONG is not a registration answer
        assert!(!Response::Pong("srv".into()).answers(&register));
        assert!(!Response::Success("other".into()).answers(&register));

        assert!(Response::Pong("srv".into()).answers(&ping));
        assert!(!Response::Pong("other".into()).answers(&ping));
        assert!(!Response::Success("srv".into()).answers(&ping));

        assert!(Response::Success("127.0.0.1:5555".into()).answers(&punch));
        assert!(!Response::Success("srv".into()).answers(&punch));
        assert!(!Response::Pong("srv".into()).answers(&punch));
    }
}

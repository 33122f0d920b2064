//! NNTP status line parsing (RFC 3977)

use crate::error::{Error, Result};

/// Connection greeting, posting allowed
pub const GREETING_POSTING_OK: u16 = 200;
/// Connection greeting, posting prohibited
pub const GREETING_NO_POSTING: u16 = 201;
/// QUIT acknowledged
pub const CLOSING: u16 = 205;
/// HEAD follows
pub const HEAD_FOLLOWS: u16 = 221;
/// BODY follows
pub const BODY_FOLLOWS: u16 = 222;
/// Article exists (STAT)
pub const ARTICLE_EXISTS: u16 = 223;
/// AUTHINFO accepted
pub const AUTH_ACCEPTED: u16 = 281;
/// AUTHINFO password required
pub const PASSWORD_REQUIRED: u16 = 381;
/// No such article
pub const NO_SUCH_ARTICLE: u16 = 430;
/// AUTHINFO rejected
pub const AUTH_REJECTED: u16 = 481;
/// AUTHINFO out of sequence
pub const AUTH_OUT_OF_SEQUENCE: u16 = 482;

/// One parsed NNTP status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Three-digit status code
    pub code: u16,
    /// The complete line, code included, CRLF stripped
    pub line: String,
}

impl Response {
    /// Parse a status line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let code = line
            .get(..3)
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| Error::UnexpectedResponse {
                expected: 0,
                code: 0,
                line: line.to_string(),
            })?;
        Ok(Self {
            code,
            line: line.to_string(),
        })
    }

    /// Whether this is a provider-imposed concurrency rejection.
    ///
    /// Providers signal it inconsistently: a 400-class code with "too many"
    /// wording, or 502 reused for connection limits.
    pub fn is_connection_limit(&self) -> bool {
        let lowered = self.line.to_ascii_lowercase();
        (self.code == 400 || self.code == 502)
            && (lowered.contains("too many") || lowered.contains("limit"))
    }

    /// Error out unless this response carries the expected code.
    pub fn expect(self, expected: u16) -> Result<Self> {
        if self.code == expected {
            Ok(self)
        } else {
            Err(Error::UnexpectedResponse {
                expected,
                code: self.code,
                line: self.line,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_greeting() {
        let response = Response::parse("200 news.example.com ready\r\n").unwrap();
        assert_eq!(response.code, GREETING_POSTING_OK);
        assert_eq!(response.line, "200 news.example.com ready");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Response::parse("not a status line").is_err());
        assert!(Response::parse("").is_err());
        assert!(Response::parse("99").is_err());
    }

    #[test]
    fn test_expect() {
        let response = Response::parse("430 no such article").unwrap();
        assert_eq!(response.clone().expect(NO_SUCH_ARTICLE).unwrap().code, 430);
        assert!(response.expect(BODY_FOLLOWS).is_err());
    }

    #[test]
    fn test_connection_limit_detection() {
        assert!(
            Response::parse("502 too many connections for your account")
                .unwrap()
                .is_connection_limit()
        );
        assert!(
            Response::parse("400 connection limit reached")
                .unwrap()
                .is_connection_limit()
        );
        assert!(
            !Response::parse("502 access denied")
                .unwrap()
                .is_connection_limit()
        );
        assert!(
            !Response::parse("430 no such article")
                .unwrap()
                .is_connection_limit()
        );
    }
}

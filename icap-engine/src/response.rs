//! ICAP status codes and pre-rendered status lines.
//!
//! Services answer an exchange with a [`StatusCode`]; the bytes actually
//! written to the socket are assembled by the session from the constants in
//! [`crate::parser::wire`] and from the service's response buffer.

use std::fmt;
use std::str::FromStr;

/// ICAP status codes produced by this server (RFC 3507).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Continue100,
    Ok200,
    NoContent204,
    BadRequest400,
    InternalServerError500,
    ServiceTimeout504,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Continue100 => 100,
            StatusCode::Ok200 => 200,
            StatusCode::NoContent204 => 204,
            StatusCode::BadRequest400 => 400,
            StatusCode::InternalServerError500 => 500,
            StatusCode::ServiceTimeout504 => 504,
        }
    }

    /// Reason phrase as written on the status line.
    pub fn reason(self) -> &'static str {
        match self {
            StatusCode::Continue100 => "Continue",
            StatusCode::Ok200 => "OK",
            StatusCode::NoContent204 => "No Content",
            StatusCode::BadRequest400 => "Bad Request",
            StatusCode::InternalServerError500 => "Server Error",
            StatusCode::ServiceTimeout504 => "Service timeout",
        }
    }

    /// `ICAP/1.0 <code> <reason>\r\n`
    pub fn status_line(self) -> String {
        format!(
            "{} {} {}\r\n",
            crate::ICAP_VERSION,
            self.as_u16(),
            self.reason()
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Ok200 | StatusCode::NoContent204)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = &'static str;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Ok(match v {
            100 => StatusCode::Continue100,
            200 => StatusCode::Ok200,
            204 => StatusCode::NoContent204,
            400 => StatusCode::BadRequest400,
            500 => StatusCode::InternalServerError500,
            504 => StatusCode::ServiceTimeout504,
            _ => return Err("Invalid ICAP status code"),
        })
    }
}

impl FromStr for StatusCode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code: u16 = s.trim().parse().map_err(|_| "Invalid ICAP status code")?;
        StatusCode::try_from(code)
    }
}

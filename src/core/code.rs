//! Response codes and their classification into [`CoapError`].

use std::fmt;

use super::constants::{CLASS_CLIENT_ERROR, CLASS_SERVER_ERROR, CLASS_SUCCESS};
use super::error::CoapError;

/// A response code in `class.detail` form (e.g. `2.05 Content`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode {
    class: u8,
    detail: u8,
}

impl ResponseCode {
    /// 2.01 Created.
    pub const CREATED: Self = Self::new(CLASS_SUCCESS, 1);
    /// 2.02 Deleted.
    pub const DELETED: Self = Self::new(CLASS_SUCCESS, 2);
    /// 2.03 Valid.
    pub const VALID: Self = Self::new(CLASS_SUCCESS, 3);
    /// 2.04 Changed.
    pub const CHANGED: Self = Self::new(CLASS_SUCCESS, 4);
    /// 2.05 Content.
    pub const CONTENT: Self = Self::new(CLASS_SUCCESS, 5);
    /// 4.00 Bad Request.
    pub const BAD_REQUEST: Self = Self::new(CLASS_CLIENT_ERROR, 0);
    /// 4.01 Unauthorized.
    pub const UNAUTHORIZED: Self = Self::new(CLASS_CLIENT_ERROR, 1);
    /// 4.03 Forbidden.
    pub const FORBIDDEN: Self = Self::new(CLASS_CLIENT_ERROR, 3);
    /// 4.04 Not Found.
    pub const NOT_FOUND: Self = Self::new(CLASS_CLIENT_ERROR, 4);
    /// 4.05 Method Not Allowed.
    pub const METHOD_NOT_ALLOWED: Self = Self::new(CLASS_CLIENT_ERROR, 5);
    /// 5.00 Internal Server Error.
    pub const INTERNAL_SERVER_ERROR: Self = Self::new(CLASS_SERVER_ERROR, 0);
    /// 5.03 Service Unavailable.
    pub const SERVICE_UNAVAILABLE: Self = Self::new(CLASS_SERVER_ERROR, 3);

    /// Build a code from its class and detail.
    pub const fn new(class: u8, detail: u8) -> Self {
        Self { class, detail }
    }

    /// Decode the single-byte wire form (`ccc ddddd`).
    pub const fn from_byte(byte: u8) -> Self {
        Self::new(byte >> 5, byte & 0x1f)
    }

    /// Encode to the single-byte wire form.
    pub const fn to_byte(self) -> u8 {
        (self.class << 5) | (self.detail & 0x1f)
    }

    /// Code class (the digit before the dot).
    pub const fn class(self) -> u8 {
        self.class
    }

    /// Code detail (the digits after the dot).
    pub const fn detail(self) -> u8 {
        self.detail
    }

    /// Whether this is a 2.xx code.
    pub const fn is_success(self) -> bool {
        self.class == CLASS_SUCCESS
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class, self.detail)
    }
}

/// Map a response code to success or a protocol error.
///
/// Total over all codes: anything not explicitly known is
/// [`CoapError::UnknownStatus`].
pub fn classify(code: ResponseCode) -> Result<(), CoapError> {
    match code {
        ResponseCode::CONTENT
        | ResponseCode::CHANGED
        | ResponseCode::CREATED
        | ResponseCode::DELETED
        | ResponseCode::VALID => Ok(()),
        ResponseCode::METHOD_NOT_ALLOWED => Err(CoapError::MethodNotAllowed),
        ResponseCode::NOT_FOUND => Err(CoapError::UriNotFound),
        ResponseCode::BAD_REQUEST => Err(CoapError::BadRequest),
        ResponseCode::UNAUTHORIZED => Err(CoapError::Unauthorized),
        _ => Err(CoapError::UnknownStatus),
    }
}

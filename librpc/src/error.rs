/*
 * This file is part of librpc.
 *
 * librpc is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The error kinds used across the frame layer, the multiplexer and the
//! IDL, plus the `rpc/error` wire payload shape.

use std::cell::RefCell;
use std::fmt;

pub type RpcResult<T> = Result<T, RpcError>;

/// The nine error kinds named in the design. These travel over the wire
/// as `rpc/error.args = {code, message}` with `code` being the kind's
/// discriminant, and are also used locally (e.g. by the event worker,
/// which logs and drops them rather than propagating them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum RpcErrorKind {
    InvalidArgument = 1,
    NotFound = 2,
    Unsupported = 3,
    ResourceExhausted = 4,
    Timeout = 5,
    Aborted = 6,
    Disconnected = 7,
    TypeError = 8,
    Internal = 9,
}

impl RpcErrorKind {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::InvalidArgument,
            2 => Self::NotFound,
            3 => Self::Unsupported,
            4 => Self::ResourceExhausted,
            5 => Self::Timeout,
            6 => Self::Aborted,
            7 => Self::Disconnected,
            8 => Self::TypeError,
            _ => Self::Internal,
        }
    }
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Unsupported => "Unsupported",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::Timeout => "Timeout",
            Self::Aborted => "Aborted",
            Self::Disconnected => "Disconnected",
            Self::TypeError => "TypeError",
            Self::Internal => "Internal",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        let e = Self {
            kind,
            message: message.into(),
        };
        LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(e.clone()));
        e
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::NotFound, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Unsupported, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::ResourceExhausted, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Timeout, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Aborted, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Disconnected, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::TypeError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Internal, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RpcError {}

thread_local! {
    static LAST_ERROR: RefCell<Option<RpcError>> = const { RefCell::new(None) };
}

/// Retrieves the last error constructed on this thread. Intended for the
/// blocking call surface (`CallHandle::wait`), which cannot itself return
/// a rich error type to FFI-adjacent callers.
pub fn last_error() -> Option<RpcError> {
    LAST_ERROR.with(|cell| cell.borrow().clone())
}

/*
 * Copyright (C) 2025 The Arbor Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;
use std::io;

use nix::errno::Errno;

/// Error classes surfaced across the daemon boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidValue,
    InvalidState,
    InvalidProperty,
    InvalidData,
    ContainerAlreadyExists,
    ContainerDoesNotExist,
    Permission,
    NotSupported,
    Busy,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidValue => "InvalidValue",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::InvalidProperty => "InvalidProperty",
            ErrorKind::InvalidData => "InvalidData",
            ErrorKind::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorKind::ContainerDoesNotExist => "ContainerDoesNotExist",
            ErrorKind::Permission => "Permission",
            ErrorKind::NotSupported => "NotSupported",
            ErrorKind::Busy => "Busy",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

/// Daemon error carrying a kind, an optional errno and a human context.
#[derive(Debug, Clone)]
pub struct ArborError {
    kind: ErrorKind,
    errno: Option<Errno>,
    context: String,
}

impl ArborError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            context: context.into(),
        }
    }

    pub fn with_errno(kind: ErrorKind, errno: Errno, context: impl Into<String>) -> Self {
        Self {
            kind,
            errno: Some(errno),
            context: context.into(),
        }
    }

    pub fn invalid_value(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidValue, context)
    }

    pub fn invalid_state(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, context)
    }

    pub fn invalid_property(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidProperty, context)
    }

    pub fn invalid_data(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, context)
    }

    pub fn already_exists(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContainerAlreadyExists, context)
    }

    pub fn no_container(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::ContainerDoesNotExist, context)
    }

    pub fn permission(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, context)
    }

    pub fn not_supported(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, context)
    }

    pub fn busy(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, context)
    }

    pub fn unknown(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, context)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> Option<Errno> {
        self.errno
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Wraps the error with an outer context, keeping the kind and errno.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        Self {
            kind: self.kind,
            errno: self.errno,
            context: format!("{}: {}", context.into(), self.context),
        }
    }
}

impl fmt::Display for ArborError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(errno) => write!(f, "{}:({}) {}", self.kind.as_str(), errno, self.context),
            None => write!(f, "{}: {}", self.kind.as_str(), self.context),
        }
    }
}

impl Error for ArborError {}

impl From<io::Error> for ArborError {
    fn from(err: io::Error) -> Self {
        let errno = err.raw_os_error().map(Errno::from_raw);
        Self {
            kind: ErrorKind::Unknown,
            errno,
            context: err.to_string(),
        }
    }
}

impl From<Errno> for ArborError {
    fn from(errno: Errno) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            errno: Some(errno),
            context: errno.desc().to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ArborError>;

/// Attaches a context prefix to any error converging into ArborError.
pub fn with_context<T, E: Into<ArborError>>(
    result: std::result::Result<T, E>,
    context: impl Into<String>,
) -> Result<T> {
    result.map_err(|err| err.into().wrap(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_kind_and_context() {
        let err = ArborError::invalid_value("memory_limit is not a number");
        let msg = format!("{err}");
        assert!(msg.contains("InvalidValue"));
        assert!(msg.contains("memory_limit"));
    }

    #[test]
    fn errno_is_preserved_through_wrap() {
        let err = ArborError::with_errno(ErrorKind::Busy, Errno::EBUSY, "cgroup not empty");
        let err = err.wrap("remove freezer");
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert_eq!(err.errno(), Some(Errno::EBUSY));
        assert!(err.context().starts_with("remove freezer"));
    }

    #[test]
    fn io_error_maps_to_unknown_with_errno() {
        let err: ArborError = io::Error::from_raw_os_error(libc::ENOENT).into();
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(err.errno(), Some(Errno::ENOENT));
    }
}

use std::error::Error as StdError;
use std::fmt;

/// The different classes of errors the daemon can produce.
///
/// Every kind has a stable wire code; success is represented on the wire as
/// code zero and in the API as an `Ok` result, so it has no kind here.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// An internal failure, usually carrying a captured errno.
    Unknown,

    /// The request verb is not recognized.
    InvalidMethod,

    /// A container with this name already exists.
    ContainerAlreadyExists,

    /// No container with this name exists.
    ContainerDoesNotExist,

    /// The named property slot does not exist or cannot be used here.
    InvalidProperty,

    /// The named data slot does not exist or cannot be used here.
    InvalidData,

    /// A supplied value failed validation.
    InvalidValue,

    /// The operation is not legal in the container's current state.
    InvalidState,

    /// The operation is not supported on this kernel or configuration.
    NotSupported,

    /// A finite resource (ids, memory guarantees, NAT addresses) ran out.
    ResourceNotAvailable,

    /// The caller is not allowed to do this.
    Permission,

    /// A volume with this path already exists.
    VolumeAlreadyExists,

    /// No volume with this path exists.
    VolumeNotFound,

    /// Not enough disk space.
    NoSpace,

    /// The entity is busy (e.g. a layer still referenced by a volume).
    Busy,

    /// The volume exists but has not finished building.
    VolumeNotReady,

    /// The command string cannot be expanded into an argv.
    InvalidCommand,

    /// A layer with this name already exists.
    LayerAlreadyExists,

    /// No layer with this name exists.
    LayerNotFound,

    /// Reserved wire code for "no message".
    NoMessage,

    /// The request was accepted and queued for asynchronous completion.
    Queued,
}

impl ErrorKind {
    /// Stable code used in responses. Zero is success and never produced
    /// by an `Error`.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::Unknown => 1,
            ErrorKind::InvalidMethod => 2,
            ErrorKind::ContainerAlreadyExists => 3,
            ErrorKind::ContainerDoesNotExist => 4,
            ErrorKind::InvalidProperty => 5,
            ErrorKind::InvalidData => 6,
            ErrorKind::InvalidValue => 7,
            ErrorKind::InvalidState => 8,
            ErrorKind::NotSupported => 9,
            ErrorKind::ResourceNotAvailable => 10,
            ErrorKind::Permission => 11,
            ErrorKind::VolumeAlreadyExists => 12,
            ErrorKind::VolumeNotFound => 13,
            ErrorKind::NoSpace => 14,
            ErrorKind::Busy => 15,
            ErrorKind::VolumeNotReady => 16,
            ErrorKind::InvalidCommand => 17,
            ErrorKind::LayerAlreadyExists => 18,
            ErrorKind::LayerNotFound => 19,
            ErrorKind::NoMessage => 20,
            ErrorKind::Queued => 21,
        }
    }

    pub fn from_code(code: u32) -> Option<ErrorKind> {
        let kind = match code {
            1 => ErrorKind::Unknown,
            2 => ErrorKind::InvalidMethod,
            3 => ErrorKind::ContainerAlreadyExists,
            4 => ErrorKind::ContainerDoesNotExist,
            5 => ErrorKind::InvalidProperty,
            6 => ErrorKind::InvalidData,
            7 => ErrorKind::InvalidValue,
            8 => ErrorKind::InvalidState,
            9 => ErrorKind::NotSupported,
            10 => ErrorKind::ResourceNotAvailable,
            11 => ErrorKind::Permission,
            12 => ErrorKind::VolumeAlreadyExists,
            13 => ErrorKind::VolumeNotFound,
            14 => ErrorKind::NoSpace,
            15 => ErrorKind::Busy,
            16 => ErrorKind::VolumeNotReady,
            17 => ErrorKind::InvalidCommand,
            18 => ErrorKind::LayerAlreadyExists,
            19 => ErrorKind::LayerNotFound,
            20 => ErrorKind::NoMessage,
            21 => ErrorKind::Queued,
            _ => return None,
        };
        Some(kind)
    }
}

/// A kind-tagged error with an optional captured errno and a free-form text.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    errno: i32,
    text: String,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.errno != 0 {
            write!(
                f,
                "{:?}: {} ({})",
                self.kind,
                self.text,
                nix::errno::Errno::from_i32(self.errno).desc()
            )
        } else {
            write!(f, "{:?}: {}", self.kind, self.text)
        }
    }
}

impl StdError for Error {}

impl Error {
    pub fn new<T: Into<String>>(kind: ErrorKind, text: T) -> Self {
        Self {
            kind,
            errno: 0,
            text: text.into(),
        }
    }

    /// Capture the calling thread's errno along with the error.
    pub fn os<T: Into<String>>(text: T) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            errno: nix::errno::errno(),
            text: text.into(),
        }
    }

    pub fn with_errno<T: Into<String>>(kind: ErrorKind, errno: i32, text: T) -> Self {
        Self {
            kind,
            errno,
            text: text.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Prefix the text with more context, keeping kind and errno.
    pub fn context<T: AsRef<str>>(self, what: T) -> Self {
        Self {
            kind: self.kind,
            errno: self.errno,
            text: format!("{}: {}", what.as_ref(), self.text),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            errno: e.raw_os_error().unwrap_or(0),
            text: e.to_string(),
        }
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            errno: e.as_errno().map(|e| e as i32).unwrap_or(0),
            text: e.to_string(),
        }
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for code in 1..=21 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert!(ErrorKind::from_code(0).is_none());
        assert!(ErrorKind::from_code(22).is_none());
    }

    #[test]
    fn context_keeps_kind_and_errno() {
        let e = Error::with_errno(ErrorKind::InvalidState, libc::ESRCH, "no task");
        let e = e.context("start");
        assert_eq!(e.kind(), ErrorKind::InvalidState);
        assert_eq!(e.errno(), libc::ESRCH);
        assert_eq!(e.text(), "start: no task");
    }
}

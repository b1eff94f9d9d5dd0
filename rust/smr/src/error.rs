use std::fmt;
use std::io;

/// Outcome of a data-path operation that did not succeed.
///
/// `WouldBlock` and `CqFull` are the retry-by-repolling outcomes: the
/// caller stops early and tries again on the next progress call. Everything
/// else is a real fault, either reported through a completion or logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmrError {
    /// A try-lock failed, a pool is exhausted, or credit ran out.
    WouldBlock,
    /// The destination completion queue has no room.
    CqFull,
    /// Fewer bytes fit than the operation declared.
    Truncated,
    /// A transfer moved the wrong number of bytes.
    Io,
    /// A memory-registration check rejected a target range.
    Access,
    /// Unknown operation kind in a command.
    InvalidOp(u8),
    /// Unknown transfer-method tag in a command.
    InvalidSrc(u8),
    /// Malformed arguments or command fields.
    InvalidArg,
    /// An OS call failed with this errno.
    Os(i32),
    /// No peer bound at this id.
    NoPeer(u32),
    /// The completion queue refused an entry for a reason other than space.
    Cq,
}

impl SmrError {
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, SmrError::WouldBlock | SmrError::CqFull)
    }

    /// Positive status code carried in a response slot.
    ///
    /// Never returns `EBUSY`, which marks an unpublished response.
    pub fn errno(&self) -> i32 {
        match self {
            SmrError::WouldBlock | SmrError::CqFull => libc::EAGAIN,
            SmrError::Truncated => libc::EMSGSIZE,
            SmrError::Io | SmrError::Cq => libc::EIO,
            SmrError::Access => libc::EACCES,
            SmrError::InvalidOp(_) | SmrError::InvalidSrc(_) | SmrError::InvalidArg => {
                libc::EINVAL
            }
            SmrError::NoPeer(_) => libc::ENOENT,
            SmrError::Os(e) if *e == libc::EBUSY || *e <= 0 => libc::EIO,
            SmrError::Os(e) => *e,
        }
    }

    /// Decode a published response status.
    pub fn from_status(status: i32) -> Result<(), SmrError> {
        match status {
            0 => Ok(()),
            libc::EIO => Err(SmrError::Io),
            libc::EACCES => Err(SmrError::Access),
            libc::EMSGSIZE => Err(SmrError::Truncated),
            libc::EINVAL => Err(SmrError::InvalidArg),
            libc::EAGAIN => Err(SmrError::WouldBlock),
            e => Err(SmrError::Os(e.abs())),
        }
    }

    pub(crate) fn from_io(e: &io::Error) -> SmrError {
        match e.raw_os_error() {
            Some(code) => SmrError::Os(code),
            None => SmrError::Io,
        }
    }
}

impl fmt::Display for SmrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmrError::WouldBlock => write!(f, "resource busy, retry on next progress"),
            SmrError::CqFull => write!(f, "completion queue full"),
            SmrError::Truncated => write!(f, "message truncated"),
            SmrError::Io => write!(f, "incomplete transfer"),
            SmrError::Access => write!(f, "memory registration check failed"),
            SmrError::InvalidOp(op) => write!(f, "unknown operation kind {op}"),
            SmrError::InvalidSrc(src) => write!(f, "unknown transfer method {src}"),
            SmrError::InvalidArg => write!(f, "invalid argument"),
            SmrError::Os(code) => write!(f, "{}", io::Error::from_raw_os_error(*code)),
            SmrError::NoPeer(id) => write!(f, "no peer at id {id}"),
            SmrError::Cq => write!(f, "completion queue rejected entry"),
        }
    }
}

impl std::error::Error for SmrError {}

/// Failure creating or attaching a region.
#[derive(Debug)]
pub enum RegionError {
    Io(io::Error),
    /// The mapped bytes do not hold a region this build understands.
    BadHeader(&'static str),
    Config(&'static str),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::Io(e) => write!(f, "region I/O error: {e}"),
            RegionError::BadHeader(msg) => write!(f, "bad region header: {msg}"),
            RegionError::Config(msg) => write!(f, "invalid region config: {msg}"),
        }
    }
}

impl std::error::Error for RegionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegionError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RegionError {
    fn from(e: io::Error) -> Self {
        RegionError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip_for_transfer_faults() {
        for err in [SmrError::Io, SmrError::Access, SmrError::Truncated] {
            assert_eq!(SmrError::from_status(err.errno()), Err(err));
        }
        assert_eq!(SmrError::from_status(0), Ok(()));
    }

    #[test]
    fn errno_never_reports_busy() {
        assert_ne!(SmrError::Os(libc::EBUSY).errno(), libc::EBUSY);
        assert_eq!(SmrError::Os(libc::EFAULT).errno(), libc::EFAULT);
    }

    #[test]
    fn transient_classification() {
        assert!(SmrError::WouldBlock.is_transient());
        assert!(SmrError::CqFull.is_transient());
        assert!(!SmrError::InvalidOp(9).is_transient());
        assert!(!SmrError::Io.is_transient());
    }
}

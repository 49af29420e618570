use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

/// Source location captured when an [`AllocError`] is built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Broad classification of an [`AllocError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No object is available right now. The caller may retry later.
    Exhausted,
    /// A structural invariant did not hold; this is a caller bug.
    Fault,
    /// The allocator was configured or torn down incorrectly.
    Config,
}

/// Errors reported by every allocator in this crate.
///
/// Allocators never panic or abort on the caller's behalf; each failure is
/// returned from the call that hit it.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("no free object left"))]
    Exhausted {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap refused an allocation of {size} bytes"))]
    Heap {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap fallback is suppressed, cannot allocate {size} bytes"))]
    Suppressed {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{addr:#x} is not an outstanding object"))]
    Fault {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("object handle belongs to another pool"))]
    ForeignHandle {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{count} objects are still outstanding"))]
    Outstanding {
        count: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("requested size overflows"))]
    Overflow {
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Exhausted { .. } | Self::Heap { .. } | Self::Suppressed { .. } => {
                ErrorKind::Exhausted
            }
            Self::Fault { .. } | Self::ForeignHandle { .. } => ErrorKind::Fault,
            Self::InvalidConfig { .. } | Self::Outstanding { .. } | Self::Overflow { .. } => {
                ErrorKind::Config
            }
        }
    }

    /// Returns the `errno` value a C caller would expect for this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self.kind() {
            ErrorKind::Exhausted => libc::ENOMEM,
            ErrorKind::Fault => libc::EFAULT,
            ErrorKind::Config => libc::EINVAL,
        }
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::Exhausted { location }
            | Self::Heap { location, .. }
            | Self::Suppressed { location, .. }
            | Self::Fault { location, .. }
            | Self::ForeignHandle { location }
            | Self::InvalidConfig { location, .. }
            | Self::Outstanding { location, .. }
            | Self::Overflow { location } => *location,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use snafu::IntoError as _;

    use super::*;

    #[test]
    fn test_kind_and_errno() {
        let exhausted = ExhaustedSnafu.build();
        assert_eq!(exhausted.kind(), ErrorKind::Exhausted);
        assert_eq!(exhausted.errno(), libc::ENOMEM);

        let suppressed = SuppressedSnafu { size: 12_usize }.build();
        assert_eq!(suppressed.kind(), ErrorKind::Exhausted);

        let fault = FaultSnafu { addr: 0x1000_usize }.build();
        assert_eq!(fault.kind(), ErrorKind::Fault);
        assert_eq!(fault.errno(), libc::EFAULT);

        let outstanding = OutstandingSnafu { count: 3_usize }.build();
        assert_eq!(outstanding.kind(), ErrorKind::Config);
        assert_eq!(outstanding.errno(), libc::EINVAL);
    }

    #[test]
    fn test_display() {
        let err = FaultSnafu { addr: 0xbeef_usize }.build();
        assert_eq!(err.to_string(), "0xbeef is not an outstanding object");

        let err = InvalidConfigSnafu { reason: "zero object size" }.build();
        assert_eq!(err.to_string(), "invalid configuration: zero object size");
    }

    #[test]
    fn test_location_points_at_caller() {
        let err = ExhaustedSnafu.into_error(snafu::NoneError);
        assert!(err.location().file().ends_with("error.rs"));
        assert!(err.location().line() > 0);
    }
}

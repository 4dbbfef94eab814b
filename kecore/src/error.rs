//! Error codes of the hypervisor.

/// A failure of a hypervisor service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// An argument violates the contract of the callee.
    InvalidArgument,
    /// No memory left.
    OutOfMemory,
    /// The resource is in use.
    Busy,
    /// No such object.
    NotFound,
    /// The caller may not do this.
    PermissionDenied,
    /// A memory access failed.
    Fault,
    /// The platform cannot do this.
    Unsupported,
    /// The object exists already.
    AlreadyExists,
    /// A value is out of the permitted range.
    OutOfRange,
}

impl HvError {
    /// The negative errno reported across the hypercall boundary.
    pub const fn code(self) -> i64 {
        match self {
            HvError::PermissionDenied => -1,
            HvError::NotFound => -2,
            HvError::OutOfMemory => -12,
            HvError::Fault => -14,
            HvError::Busy => -16,
            HvError::AlreadyExists => -17,
            HvError::Unsupported => -19,
            HvError::InvalidArgument => -22,
            HvError::OutOfRange => -34,
        }
    }
}

impl core::fmt::Display for HvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// Result of a hypervisor service.
pub type HvResult<T = ()> = Result<T, HvError>;

/// Return early with an [`HvError`], logging the location at debug level.
///
/// ```ignore
/// if !pa.is_aligned(PAGE_SIZE) {
///     hv_result_err!(InvalidArgument, "unaligned {:?}", pa);
/// }
/// ```
#[macro_export]
macro_rules! hv_result_err {
    ($kind:ident) => {{
        log::debug!("{}:{}: {:?}", file!(), line!(), $crate::error::HvError::$kind);
        return Err($crate::error::HvError::$kind.into());
    }};
    ($kind:ident, $($arg:tt)+) => {{
        log::debug!(
            "{}:{}: {:?}: {}",
            file!(),
            line!(),
            $crate::error::HvError::$kind,
            format_args!($($arg)+)
        );
        return Err($crate::error::HvError::$kind.into());
    }};
}

//! Kernel error types
//!
//! Two layers: [`KernelError`] is the internal, structured error used between
//! kernel components, and [`Status`] is the flat code surfaced to user mode
//! through the service facade. Rejected requests travel through these types;
//! invariant violations go through [`crate::bugcheck`] instead.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical or virtual memory exhausted
    OutOfMemory { requested: usize, available: usize },
    /// Address outside the range an operation accepts
    InvalidAddress { addr: u64 },
    /// Argument rejected before any state was touched
    InvalidArgument { name: &'static str },
    /// Object was not in the state the operation requires
    WrongState { expected: &'static str },
    /// Named object or id lookup failed
    NotFound,
    /// A fixed-capacity structure is full
    Exhausted { resource: &'static str },
    /// Caller privilege below what the operation requires
    PermissionDenied,
    /// Firmware handed us something unusable
    FirmwareFault { table: &'static str },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(f, "out of memory: requested {requested}, available {available}"),
            Self::InvalidAddress { addr } => write!(f, "invalid address {addr:#x}"),
            Self::InvalidArgument { name } => write!(f, "invalid argument: {name}"),
            Self::WrongState { expected } => write!(f, "wrong state: expected {expected}"),
            Self::NotFound => write!(f, "not found"),
            Self::Exhausted { resource } => write!(f, "{resource} exhausted"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::FirmwareFault { table } => write!(f, "firmware fault in {table}"),
        }
    }
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Status code returned to user mode in a register.
///
/// Zero is success; everything else names the rejection. The numeric values
/// are ABI and must not be reordered.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    Failed = 1,
    Denied = 2,
    BadHandle = 3,
    BadBuffer = 4,
    OutOfRange = 5,
    NotSupported = 6,
    NoResource = 7,
}

impl Status {
    /// Raw register value.
    pub const fn as_u64(self) -> u64 {
        self as u64
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

impl From<KernelError> for Status {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } | KernelError::Exhausted { .. } => Status::NoResource,
            KernelError::InvalidAddress { .. } => Status::BadBuffer,
            KernelError::InvalidArgument { .. } | KernelError::WrongState { .. } => Status::Failed,
            KernelError::NotFound => Status::BadHandle,
            KernelError::PermissionDenied => Status::Denied,
            KernelError::FirmwareFault { .. } => Status::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_abi_values_are_stable() {
        assert_eq!(Status::Success.as_u64(), 0);
        assert_eq!(Status::BadHandle.as_u64(), 3);
        assert_eq!(Status::NoResource.as_u64(), 7);
    }

    #[test]
    fn kernel_error_maps_to_status() {
        let err = KernelError::OutOfMemory {
            requested: 4,
            available: 0,
        };
        assert_eq!(Status::from(err), Status::NoResource);
        assert_eq!(Status::from(KernelError::PermissionDenied), Status::Denied);
        assert_eq!(Status::from(KernelError::NotFound), Status::BadHandle);
    }
}

//! Status codes shared across the verification and loading pipeline.

/// Failure taxonomy for the whole gate.
///
/// `Unsupported` and `InvalidParameter` are structural verdicts about the
/// image; `SecurityViolation` and `AccessDenied` are trust verdicts;
/// `NotFound` means no store had a record (callers continue the search
/// chain); `OutOfResources` covers allocation and hash-primitive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Malformed or unloadable image layout
    Unsupported,
    /// A header-derived region falls outside the buffer
    InvalidParameter,
    /// Allocation or hash-primitive failure
    OutOfResources,
    /// Denied, unverifiable, or revoked by generation
    SecurityViolation,
    /// Signature present but rejected
    AccessDenied,
    /// No store has a record of the digest or certificate
    NotFound,
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            Status::Unsupported => "unsupported image",
            Status::InvalidParameter => "invalid parameter",
            Status::OutOfResources => "out of resources",
            Status::SecurityViolation => "security violation",
            Status::AccessDenied => "access denied",
            Status::NotFound => "not found",
        };
        f.write_str(msg)
    }
}

/// Pipeline result type.
pub type Result<T> = core::result::Result<T, Status>;

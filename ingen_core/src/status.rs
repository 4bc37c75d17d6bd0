//! Client-facing status codes.

/// Outcome of a client request. Discriminant values are part of the wire
/// protocol and must remain stable.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    #[error("success")]
    Success = 0,
    #[error("failure")]
    Failure = 1,
    #[error("object not found")]
    NotFound = 2,
    #[error("object already exists")]
    Exists = 3,
    #[error("parent not found")]
    ParentNotFound = 4,
    #[error("endpoints have different parents")]
    ParentDiffers = 5,
    #[error("type mismatch")]
    TypeMismatch = 6,
    #[error("bad URI")]
    BadUri = 7,
    #[error("bad request")]
    BadRequest = 8,
    #[error("bad object type")]
    BadObjectType = 9,
    #[error("bad value")]
    BadValue = 10,
    #[error("bad value type")]
    BadValueType = 11,
    #[error("invalid polyphony")]
    InvalidPoly = 12,
    #[error("compilation failed")]
    CompilationFailed = 13,
    #[error("creation failed")]
    CreationFailed = 14,
    #[error("object not deletable")]
    NotDeletable = 15,
    #[error("prototype not found")]
    PrototypeNotFound = 16,
    #[error("allocation failed")]
    AllocationFailed = 17,
    #[error("internal error")]
    InternalError = 18,
}

impl Status {
    pub fn is_error(self) -> bool {
        self != Status::Success
    }
}

/// Result alias for event pre-processing: the error side is the status
/// reported back to the client.
pub type Result<T> = core::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_values() {
        assert_eq!(Status::Success as u8, 0);
        assert_eq!(Status::InvalidPoly as u8, 12);
        assert_eq!(Status::InternalError as u8, 18);
        assert!(!Status::Success.is_error());
        assert!(Status::NotFound.is_error());
    }
}

use thiserror::Error;

/// Errors surfaced by the schema file / segment / page / cache stack.
///
/// `Overflow` is an internal signal between [`crate::segment::Segment`] and
/// [`crate::schema_file::SchemaFile`]: the latter catches it and grows the
/// segment (transplant or chain) per spec, so it should never reach a caller
/// of [`crate::engine::Engine`].
#[derive(Debug, Error)]
pub enum PmtError {
    #[error("duplicate key")]
    Duplicate,

    #[error("key not found")]
    NotFound,

    #[error("segment has no room for this operation")]
    Overflow,

    #[error("record exceeds the maximum segment size")]
    Colossal,

    #[error("corrupt on-disk structure: {detail}")]
    Corrupt { detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PmtError>;

impl PmtError {
    pub fn corrupt<S: Into<String>>(detail: S) -> Self {
        PmtError::Corrupt {
            detail: detail.into(),
        }
    }
}

//! Error types for the event model and wire layer

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Validation and encoding error taxonomy.
///
/// The `INVALID_FORMAT`/`INVALID_ID`/... names in the error messages are the
/// wire-visible prefixes clients match on; keep them stable.
#[derive(Debug, Error)]
pub enum Error {
    #[error("INVALID_FORMAT: {0}")]
    InvalidFormat(String),

    #[error("INVALID_ID: recomputed {computed} != supplied {supplied}")]
    InvalidId { computed: String, supplied: String },

    #[error("INVALID_SIG: signature does not verify under the supplied pubkey")]
    InvalidSig,

    #[error("UNSUPPORTED_KIND: {0} is not in the allow-list")]
    UnsupportedKind(u32),

    #[error("CLOCK_SKEW: created_at {created_at} exceeds the future tolerance of {max_future}s")]
    ClockSkew { created_at: i64, max_future: i64 },

    #[error("canonical encoding failed: {0}")]
    Canonicalization(#[from] serde_json::Error),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

impl Error {
    /// The short machine-readable tag used as the OK-frame message prefix.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidFormat(_) => "INVALID_FORMAT",
            Error::InvalidId { .. } => "INVALID_ID",
            Error::InvalidSig => "INVALID_SIG",
            Error::UnsupportedKind(_) => "UNSUPPORTED_KIND",
            Error::ClockSkew { .. } => "CLOCK_SKEW",
            Error::Canonicalization(_) => "INVALID_FORMAT",
            Error::InvalidPublicKey(_) => "INVALID_FORMAT",
        }
    }
}

//! The error taxonomy shared by the synchronous parsers and the async session.

use thiserror::Error;

/// Errors produced while resolving objects from a partially loaded document.
///
/// `Unavailable` is a control-flow signal rather than a true failure: the
/// async entry points catch it, fetch the missing range and re-run the
/// synchronous call from scratch. Everything else is a genuine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The bytes in `begin..end` have not been received yet.
    #[error("bytes {begin}..{end} have not been received yet")]
    Unavailable {
        /// Start of the missing range.
        begin: usize,
        /// End of the missing range (exclusive).
        end: usize,
    },
    /// All pending requests were aborted.
    #[error("request was aborted: {0}")]
    Aborted(String),
    /// The network layer failed terminally.
    #[error("transport failed: {0}")]
    Transport(String),
    /// The cross-reference entry for one object is unusable. Resolution of
    /// that object fails; the document stays usable.
    #[error("unusable xref entry for object {num} {generation}")]
    Entry {
        /// The object number of the failed entry.
        num: u32,
        /// The generation number of the failed entry.
        generation: u16,
    },
    /// No usable trailer was found, even after recovery. Fatal for the
    /// whole document.
    #[error("no usable trailer was found")]
    NoTrailer,
    /// A localized structural violation with a sane recovery path at the
    /// call site.
    #[error("{0}")]
    Format(&'static str),
}

impl Error {
    /// Whether this is the missing-data signal.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// The crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

//! Crate-wide error type for the Archon control/acquisition core.
//!
//! Mirrors the error-kind contract spec'd for the controller: every command
//! and every exposure-pipeline phase resolves to one of `NO_ERROR`, `ERROR`,
//! `BUSY`, or `TIMEOUT` as seen from the outside, while internally carrying
//! a detailed [`ArchonError`] so callers (and logs) get the real cause.

use thiserror::Error;

/// Convenience alias for results using [`ArchonError`].
pub type Result<T> = std::result::Result<T, ArchonError>;

/// Coarse classification of a command/phase outcome, as exposed to external
/// callers (the command port, the async broadcast channel).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Completed without error.
    NoError,
    /// Completed with an error.
    Error,
    /// Rejected because the controller link or a ring slot was already busy.
    Busy,
    /// Did not complete within the allotted time.
    Timeout,
}

impl ArchonError {
    /// Coarse [`ErrorKind`] for this error, used by the command port and the
    /// async error broadcast.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchonError::Busy => ErrorKind::Busy,
            ArchonError::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::Error,
        }
    }
}

/// Errors produced by the transport, ACF database, exposure sequencer, ring,
/// and FITS writer.
#[derive(Error, Debug)]
pub enum ArchonError {
    /// The single-socket command mutex rejected a reentrant call.
    #[error("Archon link busy")]
    Busy,

    /// A command or FETCH block did not complete before its deadline.
    #[error("timed out waiting for {what} ({elapsed_ms} ms)")]
    Timeout {
        /// What we were waiting for (e.g. "FRAME reply", "FETCH block 4").
        what: String,
        /// How long we waited, in milliseconds.
        elapsed_ms: u64,
    },

    /// Underlying socket I/O failure.
    #[error("Archon transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The reply's leading `<HH` did not match the sent msgref.
    #[error("command/reply mismatch: sent msgref {sent:02X}, reply prefix {got:?}")]
    ReplyMismatch {
        /// msgref of the command we sent.
        sent: u8,
        /// The three bytes actually read back.
        got: [u8; 3],
    },

    /// Archon replied with a leading `?`.
    #[error("controller reported an error for `{command}`: {detail}")]
    ControllerError {
        /// The command that was sent.
        command: String,
        /// Detail recovered via FETCHLOG, if any.
        detail: String,
    },

    /// ACF/cfg text failed to parse.
    #[error("ACF parse error at line {line}: {message}")]
    AcfParse {
        /// 1-based line number in the ACF file.
        line: usize,
        /// Description of the malformed syntax.
        message: String,
    },

    /// A `[MODE_*]` section name repeated a name already seen in this file.
    #[error("duplicate mode section `{0}` in ACF")]
    DuplicateMode(String),

    /// `set_camera_mode` was asked for a mode the ACF never defined.
    #[error("unknown camera mode `{0}`")]
    UnknownMode(String),

    /// A camera mode other than RAW never set RAWENABLE.
    #[error("mode `{0}` is missing RAWENABLE and is not RAW")]
    MissingRawEnable(String),

    /// Attempted to write into a ring slot that the reader had not yet
    /// released (§5, "Ring slots").
    #[error("ring overflow: slot {0} was still locked")]
    RingOverflow(usize),

    /// FETCH returned more or fewer blocks than `bufblocks` predicted.
    #[error("FETCH block count overrun: expected {expected}, got {got}")]
    FetchBlockOverrun {
        /// Blocks computed from `image_memory * num_detect / 1024`.
        expected: u32,
        /// Blocks actually read before failure or excess data.
        got: u32,
    },

    /// `bitpix`/datatype combination the deinterlacer or FITS writer cannot
    /// handle.
    #[error("unsupported datatype/bitpix combination: bitpix={bitpix}")]
    UnsupportedDatatype {
        /// The offending bitpix value.
        bitpix: i32,
    },

    /// `image_data_bytes` computed to zero — a malformed mode geometry.
    #[error("image_data_bytes computed to zero for mode `{0}`")]
    ZeroImageSize(String),

    /// The exposure was aborted; this is not itself an error but callers
    /// that expected a normal completion should treat it as one.
    #[error("exposure aborted")]
    Aborted,

    /// FITS I/O failure (file creation, HDU, key, or pixel write).
    #[error("FITS error: {0}")]
    Fits(String),

    /// A required operation is unavailable because the library was built
    /// without `storage_fits` enabled (mirrors `FeatureNotEnabled` in the
    /// host crate this pattern is drawn from).
    #[error("feature `{0}` is not enabled; rebuild with --features {0}")]
    FeatureNotEnabled(String),

    /// Catch-all for conditions that don't warrant a dedicated variant yet.
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "storage_fits")]
impl From<fitsio::errors::Error> for ArchonError {
    fn from(e: fitsio::errors::Error) -> Self {
        ArchonError::Fits(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_busy_kind() {
        assert_eq!(ArchonError::Busy.kind(), ErrorKind::Busy);
    }

    #[test]
    fn timeout_maps_to_timeout_kind() {
        let e = ArchonError::Timeout {
            what: "FRAME reply".into(),
            elapsed_ms: 1000,
        };
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn parse_error_maps_to_generic_error_kind() {
        let e = ArchonError::AcfParse {
            line: 3,
            message: "bad token".into(),
        };
        assert_eq!(e.kind(), ErrorKind::Error);
    }
}

//! # onerng
//!
//! Rust SDK for the OneRNG open hardware entropy generator.
//!
//! The device enumerates as a USB CDC-ACM modem and speaks a line-oriented
//! ASCII command protocol. This crate drives that protocol, streams random
//! data with timeout tolerance, and validates the signed firmware image the
//! device can dump.
//!
//! ## Quick Start
//!
//! ```no_run
//! use onerng::{CancelToken, NoiseMode, OneRng};
//!
//! let token = CancelToken::new();
//! let mut rng = OneRng::new("/dev/ttyACM0");
//!
//! let version = rng.version(&token)?;
//! println!("hardware version {version}");
//!
//! let mut buf = Vec::new();
//! rng.read(&token, &mut buf, Some(32), NoiseMode::DEFAULT)?;
//! println!("{}", hex::encode(&buf));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Firmware verification
//!
//! ```no_run
//! use onerng::{CancelToken, OneRng, PgpKeyring};
//!
//! # let armored_key = "";
//! let keyring = PgpKeyring::from_armored(armored_key)?;
//! let mut rng = OneRng::new("/dev/ttyACM0");
//! let verified = rng.verify_firmware(&CancelToken::new(), &keyring)?;
//! println!("firmware v{} signed by {}", verified.version, verified.signer.name);
//! # Ok::<(), onerng::OneRngError>(())
//! ```

pub mod cancel;
pub mod copy;
pub mod crypto;
pub mod device;
pub mod firmware;
pub mod protocol;
pub mod reader;
pub mod serial;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use cancel::CancelToken;
pub use copy::{copy_with_deadline, CopyError};
pub use crypto::{PgpKeyring, SignatureVerifier, Whitener};
pub use device::OneRng;
pub use firmware::{parse_image, verify_image};
pub use serial::{DeadlineRead, Device, SerialDevice};
pub use types::*;

/// Result type for onerng operations.
pub type Result<T> = std::result::Result<T, OneRngError>;

/// Errors returned by the onerng SDK.
#[derive(Debug, thiserror::Error)]
pub enum OneRngError {
    /// The device path could not be opened.
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a command to the device failed.
    #[error("Errored on command {command:?}: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other read/write failure on the device handle.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The chunk streamer hit end of stream part-way through a chunk.
    #[error("unexpected short read - wanted {wanted}b, read {got}b")]
    ShortRead { wanted: usize, got: usize },

    /// A response line could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// The version reply did not carry an integer.
    #[error("Unparseable version reply: {0:?}")]
    BadVersion(String),

    /// Protocol-level error (unexpected response, stream ended early).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The read-deadline budget of a bulk copy was exhausted.
    #[error("i/o timeout")]
    Timeout,

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The firmware magic marker never appeared in the stream.
    #[error("bad image: magic not found")]
    MagicNotFound,

    /// The stream ended inside the container header.
    #[error("bad image: truncated header")]
    TruncatedHeader,

    /// The payload was shorter than the header's length field.
    #[error("bad image: wrong length (expected {expected}b, got {got}b)")]
    WrongLength { expected: usize, got: usize },

    /// Signature offsets fall outside the payload.
    #[error("bad image: {0}")]
    BadTrailer(String),

    /// The armored public key block could not be parsed.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// The image is well formed but its signature does not check out.
    #[error("failed to verify firmware signature: {0}")]
    VerificationFailed(String),
}

impl OneRngError {
    /// Whether this error means the firmware container itself is corrupt.
    pub fn is_malformed_image(&self) -> bool {
        matches!(
            self,
            Self::MagicNotFound
                | Self::TruncatedHeader
                | Self::WrongLength { .. }
                | Self::BadTrailer(_)
        )
    }

    /// Whether this error is the result of cancellation or an expired deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

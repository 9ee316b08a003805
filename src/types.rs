use chrono::{DateTime, Utc};

use crate::OneRngError;

/// Noise-generation configuration: three independent toggles.
///
/// The wire token is the integer formed by the toggles
/// (`disable_whitener` = 1, `enable_rf` = 2, `disable_avalanche` = 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct NoiseMode {
    /// Disable the on-board CRC16 generator. No effect if both noise sources are off.
    pub disable_whitener: bool,
    /// Enable noise generation from RF.
    pub enable_rf: bool,
    /// Disable noise generation from the avalanche diode.
    pub disable_avalanche: bool,
}

impl NoiseMode {
    /// Avalanche enabled, RF disabled, whitener enabled.
    pub const DEFAULT: Self = Self {
        disable_whitener: false,
        enable_rf: false,
        disable_avalanche: false,
    };

    /// Every noise source off. Required for image extraction.
    pub const SILENT: Self = Self {
        disable_whitener: false,
        enable_rf: false,
        disable_avalanche: true,
    };

    /// Numeric command value, 0..=7.
    pub const fn bits(self) -> u8 {
        (self.disable_whitener as u8)
            | (self.enable_rf as u8) << 1
            | (self.disable_avalanche as u8) << 2
    }
}

impl TryFrom<u8> for NoiseMode {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        if v > 7 {
            return Err(v);
        }
        Ok(Self {
            disable_whitener: v & 1 != 0,
            enable_rf: v & 2 != 0,
            disable_avalanche: v & 4 != 0,
        })
    }
}

/// A firmware container split into its signed region and detached signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Container format version from the header.
    pub version: u16,
    /// The bytes covered by the signature.
    pub signed: Vec<u8>,
    /// The detached OpenPGP signature.
    pub signature: Vec<u8>,
}

/// Who signed a verified image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerIdentity {
    /// Primary user ID of the signing key.
    pub name: String,
    /// Creation time of the user ID's self-signature, when present.
    pub created: Option<DateTime<Utc>>,
    /// Upper-case hex fingerprint of the primary key.
    pub fingerprint: String,
}

/// Result of a successful firmware verification.
#[derive(Debug, Clone)]
pub struct VerifiedFirmware {
    pub version: u16,
    pub signer: SignerIdentity,
}

/// Record of a fire-and-forget cleanup exchange.
///
/// Cleanup failures are logged, never returned, so the primary error of an
/// operation is preserved. The session keeps the latest report.
#[derive(Debug)]
pub struct CleanupReport {
    /// Commands the cleanup attempted, in order.
    pub commands: Vec<String>,
    /// The failure swallowed during cleanup, if any.
    pub error: Option<OneRngError>,
}

impl CleanupReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

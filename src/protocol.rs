//! OneRNG wire protocol: command strings, reply matchers, constants.
//!
//! Pure functions over strings and bytes; the session in `device` does the I/O.

use crate::types::NoiseMode;
use crate::OneRngError;

// --- Commands ---
/// Print firmware version (as "Version n").
pub const CMD_VERSION: &str = "cmdv\n";
/// Flush the entropy pool.
pub const CMD_FLUSH: &str = "cmdw\n";
/// Extract the signed firmware image.
pub const CMD_IMAGE: &str = "cmdX\n";
/// Print the hardware ID.
pub const CMD_ID: &str = "cmdI\n";
/// Start the task.
pub const CMD_RUN: &str = "cmdO\n";
/// Stop/pause the task.
pub const CMD_PAUSE: &str = "cmdo\n";

// --- Replies ---
pub const VERSION_PREFIX: &str = "Version ";
pub const ID_MARKER: &str = "___";

/// Chunk size used while dumping the firmware image.
pub const IMAGE_CHUNK_SIZE: usize = 4;
/// Chunk size of the readiness probe.
pub const PROBE_CHUNK_SIZE: usize = 1;
/// The image is complete once more than this many consecutive zero bytes arrive.
pub const IMAGE_ZERO_RUN: usize = 200;
/// Readiness probes attempted by `init` before giving up quietly.
pub const INIT_ATTEMPTS: usize = 200;
/// Key length for the AES-128 whitener.
pub const WHITENER_KEY_LEN: usize = 16;
/// Bytes discarded before a CLI read to flush stale pool contents.
pub const WASTE_BYTES: u64 = 10 * 1024;

/// Build the command selecting a noise mode, e.g. `"cmd4\n"`.
pub fn noise_command(mode: NoiseMode) -> String {
    format!("cmd{}\n", mode.bits())
}

/// Whether a scanned line is the version reply.
pub fn is_version_line(line: &str) -> bool {
    line.starts_with(VERSION_PREFIX)
}

/// Whether a scanned line is the hardware ID reply.
pub fn is_id_line(line: &str) -> bool {
    line.starts_with(ID_MARKER)
}

/// Parse the integer following `"Version "`.
pub fn parse_version(line: &str) -> Result<u32, OneRngError> {
    let n = line.replacen(VERSION_PREFIX, "", 1);
    n.trim()
        .parse()
        .map_err(|_| OneRngError::BadVersion(line.to_string()))
}

/// Tracks the run of trailing zero bytes that ends an image dump.
#[derive(Debug, Default)]
pub struct ZeroRun {
    zeros: usize,
}

impl ZeroRun {
    /// Feed bytes; returns `true` once the terminator has been seen.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        for &b in bytes {
            if b == 0 {
                self.zeros += 1;
            } else {
                self.zeros = 0;
            }
            if self.zeros > IMAGE_ZERO_RUN {
                return true;
            }
        }
        false
    }
}

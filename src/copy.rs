//! Bounded copy from a deadline-capable source that tolerates idle timeouts.

use std::io::{self, Write};
use std::time::Duration;

use log::debug;

use crate::cancel::CancelToken;
use crate::serial::DeadlineRead;
use crate::OneRngError;

/// Deadline re-armed before every read.
pub const READ_DEADLINE: Duration = Duration::from_millis(500);

/// Idle timeouts tolerated per copy (10 x 500ms, about 5s of silence).
pub const ALLOWED_TIMEOUTS: usize = 10;

const BUF_SIZE: usize = 8 * 1024;

/// A copy that stopped early, with the bytes it delivered before failing.
#[derive(Debug, thiserror::Error)]
#[error("{source} (after {written} bytes)")]
pub struct CopyError {
    pub written: u64,
    #[source]
    pub source: OneRngError,
}

impl From<OneRngError> for CopyError {
    fn from(source: OneRngError) -> Self {
        Self { written: 0, source }
    }
}

impl From<CopyError> for OneRngError {
    fn from(e: CopyError) -> Self {
        e.source
    }
}

/// Copy `limit` bytes (or until end of stream when `None`) from `src` to `dst`.
///
/// Each read is bounded by [`READ_DEADLINE`]. The first
/// [`ALLOWED_TIMEOUTS`] expirations count as empty reads; the next one is
/// returned as [`OneRngError::Timeout`]. Cancellation is checked before every
/// read. A bounded copy that hits end of stream early fails with
/// `UnexpectedEof`.
pub fn copy_with_deadline<R, W>(
    token: &CancelToken,
    dst: &mut W,
    src: &mut R,
    limit: Option<u64>,
) -> Result<u64, CopyError>
where
    R: DeadlineRead + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut written = 0u64;
    let mut allowed_timeouts = ALLOWED_TIMEOUTS;
    let fail = |written, source| CopyError { written, source };

    loop {
        let want = match limit {
            Some(n) if written >= n => return Ok(written),
            Some(n) => (n - written).min(BUF_SIZE as u64) as usize,
            None => BUF_SIZE,
        };

        src.set_read_deadline(READ_DEADLINE)
            .map_err(|e| fail(written, e.into()))?;
        token.check().map_err(|e| fail(written, e))?;

        match src.read(&mut buf[..want]) {
            Ok(0) => {
                return match limit {
                    None => Ok(written),
                    Some(_) => Err(fail(
                        written,
                        io::Error::from(io::ErrorKind::UnexpectedEof).into(),
                    )),
                };
            }
            Ok(n) => {
                dst.write_all(&buf[..n]).map_err(|e| fail(written, e.into()))?;
                written += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if allowed_timeouts == 0 {
                    return Err(fail(written, OneRngError::Timeout));
                }
                allowed_timeouts -= 1;
                debug!("read deadline passed, {allowed_timeouts} timeouts left");
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(fail(written, e.into())),
        }
    }
}

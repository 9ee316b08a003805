//! High-level OneRNG device session.

use std::io::Write;
use std::time::Duration;

use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::copy::{copy_with_deadline, CopyError};
use crate::crypto::{SignatureVerifier, Whitener};
use crate::firmware::verify_image;
use crate::protocol::*;
use crate::reader::Reader;
use crate::serial::{serial_opener, Device, Opener, DEFAULT_BAUD_RATE};
use crate::types::*;
use crate::{OneRngError, Result};

/// Pause between silencing the device and requesting the image.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Wait budget of a single readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// A session with one OneRNG device.
///
/// The handle is opened lazily and every public operation closes it before
/// returning, on success, error and cancellation alike. Operations are meant
/// to run one at a time.
///
/// ```no_run
/// use onerng::{CancelToken, OneRng};
///
/// let mut rng = OneRng::new("/dev/ttyACM0");
/// let id = rng.identify(&CancelToken::new())?;
/// println!("hardware id {id}");
/// # Ok::<(), onerng::OneRngError>(())
/// ```
pub struct OneRng {
    path: String,
    baud_rate: u32,
    opener: Opener,
    settle_delay: Duration,
    probe_timeout: Duration,
    device: Option<Box<dyn Device>>,
    last_cleanup: Option<CleanupReport>,
}

impl OneRng {
    /// A session for the device at `path`, opened through the serial port.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            opener: serial_opener(),
            settle_delay: SETTLE_DELAY,
            probe_timeout: PROBE_TIMEOUT,
            device: None,
            last_cleanup: None,
        }
    }

    /// Replace the function used to open the device.
    pub fn with_opener(mut self, opener: Opener) -> Self {
        self.opener = opener;
        self
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Override [`SETTLE_DELAY`].
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Override [`PROBE_TIMEOUT`].
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// The outcome of the most recent best-effort cleanup.
    pub fn last_cleanup(&self) -> Option<&CleanupReport> {
        self.last_cleanup.as_ref()
    }

    /// Open the device if it is not already open.
    pub fn open(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = (self.opener)(&self.path, self.baud_rate).map_err(|source| {
            OneRngError::Open {
                path: self.path.clone(),
                source,
            }
        })?;
        debug!("opened {}", self.path);
        self.device = Some(device);
        Ok(())
    }

    /// Close the device if it is open. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut device) = self.device.take() {
            debug!("closing {}", self.path);
            device.flush()?;
        }
        Ok(())
    }

    /// Write `commands` in order.
    ///
    /// Cancellation is checked before each write; once `token` has fired the
    /// remaining commands are skipped and `Ok(())` is returned. Commands
    /// already written stay written.
    pub fn send(&mut self, token: &CancelToken, commands: &[&str]) -> Result<()> {
        let device = self.handle()?;
        for &command in commands {
            if token.is_cancelled() {
                debug!("cancelled, skipping {command:?}");
                return Ok(());
            }
            debug!("-> {command:?}");
            device
                .write_all(command.as_bytes())
                .and_then(|()| device.flush())
                .map_err(|source| OneRngError::Command {
                    command: command.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Query the hardware version.
    pub fn version(&mut self, token: &CancelToken) -> Result<u32> {
        self.with_session(|s| {
            s.send(token, &[CMD_PAUSE])?;
            let mut lines = Reader::scan_lines(s.reader_handle()?, token);
            s.send(token, &[&noise_command(NoiseMode::SILENT), CMD_VERSION, CMD_RUN])?;
            let line = wait_for_line(&mut lines, token, is_version_line, "version")?;
            lines.stop();
            s.send(token, &[CMD_PAUSE])?;
            parse_version(&line)
        })
    }

    /// Query the hardware ID, returned as the raw `___...___` line.
    pub fn identify(&mut self, token: &CancelToken) -> Result<String> {
        self.with_session(|s| {
            let mut lines = Reader::scan_lines(s.reader_handle()?, token);
            s.send(token, &[&noise_command(NoiseMode::SILENT), CMD_ID, CMD_RUN])?;
            let line = wait_for_line(&mut lines, token, is_id_line, "hardware id")?;
            lines.stop();
            s.send(token, &[CMD_PAUSE])?;
            Ok(line)
        })
    }

    /// Flush the entropy pool. No reply is expected.
    pub fn flush(&mut self, token: &CancelToken) -> Result<()> {
        self.with_session(|s| s.send(token, &[CMD_FLUSH]))
    }

    /// Dump the signed firmware image.
    ///
    /// The dump ends after a long run of zero bytes, which is included in
    /// the returned buffer.
    pub fn image(&mut self, token: &CancelToken) -> Result<Vec<u8>> {
        self.with_session(|s| {
            let silent = noise_command(NoiseMode::SILENT);
            s.send(token, &[CMD_PAUSE, &silent])?;
            token.sleep(s.settle_delay)?;

            let mut chunks = Reader::stream_chunks(s.reader_handle()?, IMAGE_CHUNK_SIZE, token);
            s.send(token, &[&silent, CMD_IMAGE, CMD_RUN])?;

            let mut image = Vec::new();
            let mut terminator = ZeroRun::default();
            loop {
                match chunks.next(token)? {
                    Some(chunk) => {
                        image.extend_from_slice(&chunk);
                        if terminator.feed(&chunk) {
                            break;
                        }
                    }
                    None => {
                        return Err(OneRngError::Protocol(format!(
                            "device stream ended after {} image bytes",
                            image.len()
                        )))
                    }
                }
            }
            chunks.stop();

            s.send(token, &[CMD_PAUSE])?;
            debug!("extracted {} image bytes", image.len());
            Ok(image)
        })
    }

    /// Wait for the device to start producing data.
    ///
    /// Probes up to [`INIT_ATTEMPTS`] times. Running out of attempts is not
    /// an error: the device may still come up.
    pub fn init(&mut self, token: &CancelToken) -> Result<()> {
        for attempt in 0..INIT_ATTEMPTS {
            if self.probe(token)? > 0 {
                debug!("initialized after {attempt} probes");
                return Ok(());
            }
        }
        debug!("no data after {INIT_ATTEMPTS} probes, continuing anyway");
        Ok(())
    }

    /// Copy `limit` bytes (unbounded when `None`) of noise generated in
    /// `mode` to `out`.
    ///
    /// The pause command is always sent afterwards as best-effort cleanup.
    pub fn read<W: Write + ?Sized>(
        &mut self,
        token: &CancelToken,
        out: &mut W,
        limit: Option<u64>,
        mode: NoiseMode,
    ) -> std::result::Result<u64, CopyError> {
        self.with_session(|s| {
            let result = match s.send(token, &[&noise_command(mode), CMD_RUN]) {
                Ok(()) => s
                    .handle()
                    .map_err(CopyError::from)
                    .and_then(|device| copy_with_deadline(token, out, device, limit)),
                Err(e) => Err(e.into()),
            };
            s.cleanup(&[CMD_PAUSE]);
            result
        })
    }

    /// Wrap `out` in an AES-128 whitener keyed with 16 bytes from the device.
    pub fn aes_whitener<W: Write>(&mut self, token: &CancelToken, out: W) -> Result<Whitener<W>> {
        let key = self.key(token)?;
        Whitener::new(&key, out)
    }

    /// Initialize, dump the firmware image and check its signature.
    pub fn verify_firmware<V>(
        &mut self,
        token: &CancelToken,
        verifier: &V,
    ) -> Result<VerifiedFirmware>
    where
        V: SignatureVerifier + ?Sized,
    {
        self.init(token)?;
        let image = self.image(token)?;
        info!("verifying {} byte firmware dump", image.len());
        verify_image(&mut image.as_slice(), verifier)
    }

    fn key(&mut self, token: &CancelToken) -> Result<[u8; WHITENER_KEY_LEN]> {
        self.with_session(|s| {
            s.send(token, &[&noise_command(NoiseMode::DEFAULT), CMD_RUN])?;
            let mut key = Vec::with_capacity(WHITENER_KEY_LEN);
            let copied = s.handle().and_then(|device| {
                copy_with_deadline(token, &mut key, device, Some(WHITENER_KEY_LEN as u64))
                    .map_err(OneRngError::from)
            });
            s.cleanup(&[CMD_PAUSE]);
            copied?;
            key.try_into()
                .map_err(|k: Vec<u8>| {
                    OneRngError::Protocol(format!("short key: {} bytes", k.len()))
                })
        })
    }

    /// Try once to read a byte; returns how many arrived within the probe budget.
    fn probe(&mut self, token: &CancelToken) -> Result<usize> {
        self.with_session(|s| {
            let budget = token.child_with_timeout(s.probe_timeout);
            let mut chunks = Reader::stream_chunks(s.reader_handle()?, PROBE_CHUNK_SIZE, token);
            s.send(token, &[&noise_command(NoiseMode::DEFAULT), CMD_RUN])?;

            let received = match chunks.next(&budget) {
                Ok(Some(chunk)) => Ok(chunk.len()),
                Ok(None) => Ok(0),
                Err(e) if e.is_cancellation() && token.check().is_ok() => Ok(0),
                Err(e) => Err(e),
            };
            chunks.stop();

            s.cleanup(&[CMD_PAUSE, &noise_command(NoiseMode::SILENT), CMD_FLUSH]);
            received
        })
    }

    /// Open, run `op`, and close on every exit path.
    fn with_session<T, E, F>(&mut self, op: F) -> std::result::Result<T, E>
    where
        E: From<OneRngError>,
        F: FnOnce(&mut Self) -> std::result::Result<T, E>,
    {
        self.open()?;
        let result = op(self);
        if let Err(e) = self.close() {
            warn!("closing {} failed: {e}", self.path);
        }
        result
    }

    /// Send `commands` regardless of cancellation, recording instead of
    /// returning any failure.
    fn cleanup(&mut self, commands: &[&str]) {
        let result = self.send(&CancelToken::new(), commands);
        if let Err(e) = &result {
            warn!("cleanup {commands:?} failed: {e}");
        }
        self.last_cleanup = Some(CleanupReport {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            error: result.err(),
        });
    }

    fn handle(&mut self) -> Result<&mut Box<dyn Device>> {
        self.open()?;
        self.device
            .as_mut()
            .ok_or_else(|| OneRngError::Protocol("device not open".into()))
    }

    fn reader_handle(&mut self) -> Result<Box<dyn Device>> {
        Ok(self.handle()?.try_clone()?)
    }
}

fn wait_for_line(
    lines: &mut Reader<String>,
    token: &CancelToken,
    matches: fn(&str) -> bool,
    what: &str,
) -> Result<String> {
    while let Some(line) = lines.next(token)? {
        if matches(&line) {
            return Ok(line);
        }
    }
    Err(OneRngError::Protocol(format!(
        "device stream ended before {what} reply"
    )))
}

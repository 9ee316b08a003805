//! Concurrent response readers.
//!
//! A [`Reader`] owns a thread that decodes the device byte stream into items
//! (lines or fixed-size chunks) and hands them over a bounded channel. The
//! thread checks its cancellation token before every blocking read and every
//! handoff; dropping the `Reader` cancels it, closes the channel and joins
//! the thread, so no reader outlives the exchange that started it.

use std::io::{self, BufRead, BufReader, Read};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;

use log::trace;

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::serial::Device;
use crate::{OneRngError, Result};

/// Lines longer than this are a decode error.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Handle to a running reader thread producing items of type `T`.
pub struct Reader<T> {
    rx: Option<Receiver<Result<T>>>,
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Reader<String> {
    /// Start a thread delivering the device output line by line.
    ///
    /// Lines are split on `\n` with a trailing `\r` removed. A final
    /// unterminated line is still delivered.
    pub fn scan_lines(device: Box<dyn Device>, parent: &CancelToken) -> Self {
        Self::spawn(parent, "scanner", move |token, tx| scan(device, &token, &tx))
    }
}

impl Reader<Vec<u8>> {
    /// Start a thread delivering the device output in `chunk_size` groups.
    ///
    /// End of stream on a chunk boundary ends the sequence; end of stream
    /// inside a chunk fails with [`OneRngError::ShortRead`].
    pub fn stream_chunks(device: Box<dyn Device>, chunk_size: usize, parent: &CancelToken) -> Self {
        Self::spawn(parent, "streamer", move |token, tx| {
            stream(device, chunk_size, &token, &tx)
        })
    }
}

impl<T: Send + 'static> Reader<T> {
    fn spawn<F>(parent: &CancelToken, name: &'static str, body: F) -> Self
    where
        F: FnOnce(CancelToken, SyncSender<Result<T>>) + Send + 'static,
    {
        let token = parent.child();
        let (tx, rx) = mpsc::sync_channel(1);
        let thread_token = token.clone();
        let handle = std::thread::spawn(move || {
            trace!("{name} started");
            body(thread_token, tx);
            trace!("{name} stopped");
        });
        Self {
            rx: Some(rx),
            token,
            handle: Some(handle),
        }
    }
}

impl<T> Reader<T> {
    /// Wait for the next item.
    ///
    /// Returns `Ok(None)` once the reader reached end of stream, the
    /// reader's error if it failed, or the reason `token` fired.
    pub fn next(&mut self, token: &CancelToken) -> Result<Option<T>> {
        let Some(rx) = self.rx.as_ref() else {
            return Ok(None);
        };
        loop {
            token.check()?;
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(item) => return item.map(Some),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }

    /// Cancel the reader and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        // Unblocks a pending handoff.
        self.rx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn scan(device: Box<dyn Device>, token: &CancelToken, tx: &SyncSender<Result<String>>) {
    let mut reader = BufReader::new(device);
    let mut line = Vec::new();
    loop {
        if token.is_cancelled() {
            return;
        }
        // At most one byte past the limit is buffered before failing.
        let room = (MAX_LINE_LEN + 1).saturating_sub(line.len()) as u64;
        match (&mut reader).take(room).read_until(b'\n', &mut line) {
            Ok(0) => {
                if !line.is_empty() {
                    deliver_line(&mut line, token, tx);
                }
                return;
            }
            Ok(_) if line.last() == Some(&b'\n') => {
                if !deliver_line(&mut line, token, tx) {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) if is_retryable(&e) => {}
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                return;
            }
        }
        if line.len() > MAX_LINE_LEN {
            let _ = tx.send(Err(OneRngError::Decode(format!(
                "line exceeds {MAX_LINE_LEN} bytes"
            ))));
            return;
        }
    }
}

/// Hand over a completed line. Bytes that are not UTF-8 (stray noise in the
/// tty buffer) are replaced rather than rejected. Returns `false` when the
/// reader should exit.
fn deliver_line(line: &mut Vec<u8>, token: &CancelToken, tx: &SyncSender<Result<String>>) -> bool {
    let mut raw = std::mem::take(line);
    if raw.last() == Some(&b'\n') {
        raw.pop();
    }
    if raw.last() == Some(&b'\r') {
        raw.pop();
    }
    let item = String::from_utf8_lossy(&raw).into_owned();
    !token.is_cancelled() && tx.send(Ok(item)).is_ok()
}

fn stream(
    mut device: Box<dyn Device>,
    chunk_size: usize,
    token: &CancelToken,
    tx: &SyncSender<Result<Vec<u8>>>,
) {
    loop {
        let mut chunk = vec![0u8; chunk_size];
        let mut filled = 0;
        while filled < chunk_size {
            if token.is_cancelled() {
                return;
            }
            match device.read(&mut chunk[filled..]) {
                Ok(0) if filled == 0 => return,
                Ok(0) => {
                    let _ = tx.send(Err(OneRngError::ShortRead {
                        wanted: chunk_size,
                        got: filled,
                    }));
                    return;
                }
                Ok(n) => filled += n,
                Err(e) if is_retryable(&e) => {}
                Err(e) => {
                    let _ = tx.send(Err(e.into()));
                    return;
                }
            }
        }
        if token.is_cancelled() || tx.send(Ok(chunk)).is_err() {
            return;
        }
    }
}

//! Scripted in-memory device for testing sessions without hardware.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::serial::{DeadlineRead, Device, Opener};

/// One scripted outcome of a device read.
pub enum Step {
    Data(Vec<u8>),
    Timeout,
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct State {
    input: VecDeque<Step>,
    written: Vec<u8>,
    writes: usize,
    live_handles: usize,
    opens: usize,
    deadlines: Vec<Duration>,
    /// When the script runs dry, time out instead of reporting end of stream.
    idle: bool,
    fail_command: Option<String>,
    cancel_after: Option<(usize, CancelToken)>,
}

/// A handle onto shared scripted state. Clones count as live handles.
pub struct MockDevice {
    state: Arc<Mutex<State>>,
}

impl MockDevice {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        state.lock().unwrap().live_handles = 1;
        Self { state }
    }

    /// A device that answers reads with `data` and then reports end of stream.
    pub fn with_input(data: impl Into<Vec<u8>>) -> Self {
        let dev = Self::new();
        dev.push(Step::Data(data.into()));
        dev
    }

    pub fn push(&self, step: Step) {
        self.state.lock().unwrap().input.push_back(step);
    }

    pub fn set_idle(&self, idle: bool) {
        self.state.lock().unwrap().idle = idle;
    }

    /// Make writes of exactly `command` fail.
    pub fn fail_command(&self, command: &str) {
        self.state.lock().unwrap().fail_command = Some(command.to_string());
    }

    /// Cancel `token` once `writes` writes have completed.
    pub fn cancel_after_writes(&self, writes: usize, token: CancelToken) {
        self.state.lock().unwrap().cancel_after = Some((writes, token));
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().unwrap().written).into_owned()
    }

    pub fn deadlines(&self) -> Vec<Duration> {
        self.state.lock().unwrap().deadlines.clone()
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// Live handles other than this one.
    pub fn open_handles(&self) -> usize {
        self.state.lock().unwrap().live_handles - 1
    }

    pub fn opener(&self) -> Opener {
        let state = self.state.clone();
        Arc::new(move |_path, _baud| {
            let mut s = state.lock().unwrap();
            s.opens += 1;
            s.live_handles += 1;
            Ok(Box::new(MockDevice {
                state: state.clone(),
            }) as Box<dyn Device>)
        })
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        if let Ok(mut s) = self.state.lock() {
            s.live_handles -= 1;
        }
    }
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut s = self.state.lock().unwrap();
        match s.input.pop_front() {
            Some(Step::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    s.input.push_front(Step::Data(rest));
                }
                Ok(n)
            }
            Some(Step::Timeout) => Err(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")),
            Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
            None if s.idle => {
                drop(s);
                std::thread::sleep(Duration::from_millis(2));
                Err(io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"))
            }
            None => Ok(0),
        }
    }
}

impl Write for MockDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut s = self.state.lock().unwrap();
        if s.fail_command.as_deref().is_some_and(|c| c.as_bytes() == buf) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "scripted write failure"));
        }
        s.written.extend_from_slice(buf);
        s.writes += 1;
        if let Some((after, token)) = &s.cancel_after {
            if s.writes >= *after {
                token.cancel();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DeadlineRead for MockDevice {
    fn set_read_deadline(&mut self, timeout: Duration) -> io::Result<()> {
        self.state.lock().unwrap().deadlines.push(timeout);
        Ok(())
    }
}

impl Device for MockDevice {
    fn try_clone(&self) -> io::Result<Box<dyn Device>> {
        self.state.lock().unwrap().live_handles += 1;
        Ok(Box::new(MockDevice {
            state: self.state.clone(),
        }))
    }
}

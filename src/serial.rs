//! Byte-duplex device handle abstraction and its `serialport` implementation.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Default timeout of a freshly opened handle. Readers wake this often to
/// check for cancellation.
pub const READ_POLL: Duration = Duration::from_millis(100);

/// Line speed requested when opening the port. CDC-ACM ignores it.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A byte source whose blocking reads can be bounded by a deadline.
///
/// A read that outlives the deadline fails with
/// [`io::ErrorKind::TimedOut`].
pub trait DeadlineRead: Read {
    /// Bound subsequent reads by `timeout`.
    fn set_read_deadline(&mut self, timeout: Duration) -> io::Result<()>;
}

impl<T: DeadlineRead + ?Sized> DeadlineRead for Box<T> {
    fn set_read_deadline(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).set_read_deadline(timeout)
    }
}

/// An open connection to a OneRNG.
///
/// Clones share the underlying connection; they let a reader thread consume
/// responses while the session writes commands.
pub trait Device: DeadlineRead + Write + Send {
    /// Obtain a second handle onto the same connection.
    fn try_clone(&self) -> io::Result<Box<dyn Device>>;
}

/// Opens a device by path.
pub type Opener = Arc<dyn Fn(&str, u32) -> io::Result<Box<dyn Device>> + Send + Sync>;

/// The default [`Opener`]: a serial port via the `serialport` crate.
pub fn serial_opener() -> Opener {
    Arc::new(|path, baud_rate| {
        let dev = SerialDevice::open(path, baud_rate)?;
        Ok(Box::new(dev) as Box<dyn Device>)
    })
}

/// Serial transport over the OS serial line.
pub struct SerialDevice {
    port: Box<dyn SerialPort>,
}

impl SerialDevice {
    /// Open a serial connection to the given port.
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_POLL)
            .open()
            .map_err(io::Error::from)?;
        Ok(Self { port })
    }
}

impl Read for SerialDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl DeadlineRead for SerialDevice {
    fn set_read_deadline(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::from)
    }
}

impl Device for SerialDevice {
    fn try_clone(&self) -> io::Result<Box<dyn Device>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialDevice { port }))
    }
}

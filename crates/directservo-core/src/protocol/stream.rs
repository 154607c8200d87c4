//! Bus transports
//!
//! The connection writes frames through one handle of a transport while the
//! response router reads through a clone of it.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Duplex byte stream a servo bus runs on
pub trait CommunicationChannel: Read + Write + Send {
    /// Bound how long a single read may block
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Drop bytes received but not yet read
    fn discard_input(&mut self) -> io::Result<()>;

    /// Drop bytes written but not yet transmitted
    fn discard_output(&mut self) -> io::Result<()>;

    /// Second handle on the same transport, used by the reader thread
    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>>;

    /// Discard both directions, reporting the first failure
    fn discard_all(&mut self) -> io::Result<()> {
        let input = self.discard_input();
        let output = self.discard_output();
        input.and(output)
    }
}

/// A serial port as a bus transport
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an opened and configured port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }

    /// OS name of the underlying port, if it has one
    pub fn port_name(&self) -> Option<String> {
        self.port.name()
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn discard_output(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Output)
            .map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        let reader = self.port.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialChannel::new(reader)))
    }
}

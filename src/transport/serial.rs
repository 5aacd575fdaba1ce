//! # USB Serial Transport
//!
//! This module talks to the K6 over its CH340 USB-serial bridge.
//!
//! ## Port Setup (Linux)
//!
//! The engraver shows up as `/dev/ttyUSB0` (sometimes `/dev/ttyACM0`).
//! The user needs read/write access to the device node:
//!
//! ```bash
//! $ sudo usermod -aG dialout $USER
//! ```
//!
//! ## TTY Configuration
//!
//! The device is opened in raw mode so binary frames pass unmodified:
//!
//! - **No input processing**: IGNBRK, BRKINT, PARMRK, ISTRIP, etc. cleared
//! - **No output processing**: OPOST cleared
//! - **8N1**: CS8, no parity, one stop bit
//! - **No flow control**: XON/XOFF and RTS/CTS off
//! - **Non-blocking reads**: VMIN = VTIME = 0; timeouts come from `poll(2)`
//!
//! ## Timeouts
//!
//! Writes and reads are bounded by `poll(2)`. A hung-up device (POLLHUP)
//! surfaces as [`TransportError::Disconnected`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::error::TransportError;
use crate::transport::Transport;

/// Upper bound for flushing one frame to the kernel
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// # Serial Transport
///
/// ## Example
///
/// ```no_run
/// use std::time::Duration;
/// use wainlux::transport::{SerialTransport, Transport};
/// use wainlux::protocol::commands::ControlCommand;
///
/// let mut transport = SerialTransport::new(115_200);
/// transport.open("/dev/ttyUSB0")?;
/// transport.write(&ControlCommand::Status.encode()?)?;
/// let ack = transport.read_ack(Duration::from_secs(1))?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SerialTransport {
    file: Option<File>,
    baud: u32,
    port: Option<String>,
}

impl SerialTransport {
    pub fn new(baud: u32) -> Self {
        Self {
            file: None,
            baud,
            port: None,
        }
    }

    /// Path of the open port, if any.
    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    fn file(&mut self) -> Result<&mut File, TransportError> {
        self.file.as_mut().ok_or(TransportError::Closed)
    }
}

impl Transport for SerialTransport {
    /// ## Errors
    ///
    /// Returns an error if:
    /// - The device doesn't exist
    /// - Permission denied (may need the dialout group)
    /// - TTY configuration fails
    fn open(&mut self, port: &str) -> Result<(), TransportError> {
        self.close();

        let file = open_nonblocking(port).map_err(|e| TransportError::Open {
            port: port.to_string(),
            reason: e.to_string(),
        })?;

        configure_tty_raw(&file, self.baud).map_err(|reason| TransportError::Open {
            port: port.to_string(),
            reason,
        })?;

        log::info!("Opened {} at {} baud", port, self.baud);
        self.file = Some(file);
        self.port = Some(port.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let deadline = Instant::now() + WRITE_TIMEOUT;
        let file = self.file()?;
        let mut written = 0;

        while written < bytes.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Write(format!(
                    "timed out after {written} of {} bytes",
                    bytes.len()
                )));
            }
            wait_ready(file, Readiness::Write, remaining)?;
            match file.write(&bytes[written..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Write(e.to_string())),
            }
        }

        file.flush()
            .map_err(|e| TransportError::Write(format!("Flush failed: {}", e)))?;
        log::trace!(target: "wainlux::wire", "tx {:02x?}", bytes);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let file = self.file()?;
        if !wait_ready(file, Readiness::Read, timeout)? {
            return Ok(0);
        }
        match file.read(buf) {
            Ok(n) => {
                if n > 0 {
                    log::trace!(target: "wainlux::wire", "rx {:02x?}", &buf[..n]);
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(TransportError::Read(e.to_string())),
        }
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        let file = self.file()?;
        flush_input(file).map_err(TransportError::Read)
    }

    fn close(&mut self) {
        if let Some(port) = self.port.take() {
            log::debug!("Closing {}", port);
        }
        self.file = None;
    }
}

#[derive(Debug, Clone, Copy)]
enum Readiness {
    Read,
    Write,
}

#[cfg(unix)]
fn open_nonblocking(port: &str) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(port)
}

#[cfg(not(unix))]
fn open_nonblocking(port: &str) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(port)
}

/// Block until the descriptor is ready or the timeout expires.
/// Returns `Ok(false)` on timeout.
#[cfg(unix)]
fn wait_ready(file: &File, what: Readiness, timeout: Duration) -> Result<bool, TransportError> {
    use std::os::unix::io::AsRawFd;

    let events = match what {
        Readiness::Read => libc::POLLIN,
        Readiness::Write => libc::POLLOUT,
    };
    let mut pfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

    let result = unsafe { libc::poll(&mut pfd, 1, millis) };
    if result < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(TransportError::Io(err));
    }
    if result == 0 {
        return Ok(false);
    }
    if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
        && pfd.revents & events == 0
    {
        return Err(TransportError::Disconnected);
    }
    Ok(true)
}

#[cfg(not(unix))]
fn wait_ready(_file: &File, _what: Readiness, _timeout: Duration) -> Result<bool, TransportError> {
    Ok(true)
}

#[cfg(unix)]
fn flush_input(file: &File) -> Result<(), String> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::tcflush(file.as_raw_fd(), libc::TCIFLUSH) };
    if result != 0 {
        return Err(format!("tcflush failed: {}", io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn flush_input(_file: &File) -> Result<(), String> {
    Ok(())
}

/// Map a numeric baud rate to the termios speed constant.
#[cfg(unix)]
fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        _ => return None,
    })
}

/// Configure a file descriptor for raw 8N1 serial at `baud`.
///
/// ## What Gets Disabled
///
/// - **Input flags**: IGNBRK, BRKINT, PARMRK, ISTRIP, INLCR, IGNCR, ICRNL, IXON, IXOFF, IXANY
/// - **Output flags**: OPOST
/// - **Local flags**: ECHO, ECHONL, ICANON, ISIG, IEXTEN
/// - **Control flags**: CSIZE, PARENB, CSTOPB, CRTSCTS (then CS8 | CLOCAL | CREAD)
///
/// IXON/IXOFF must be off: 0x11 and 0x13 appear in raster payloads.
#[cfg(unix)]
fn configure_tty_raw(file: &File, baud: u32) -> Result<(), String> {
    use std::mem::MaybeUninit;
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    let speed = baud_constant(baud).ok_or_else(|| format!("unsupported baud rate {baud}"))?;

    let mut termios = MaybeUninit::uninit();
    let result = unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) };
    if result != 0 {
        return Err(format!("tcgetattr failed: {}", io::Error::last_os_error()));
    }
    let mut termios = unsafe { termios.assume_init() };

    termios.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL
        | libc::IXON
        | libc::IXOFF
        | libc::IXANY);

    termios.c_oflag &= !libc::OPOST;

    termios.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);

    termios.c_cflag &= !(libc::CSIZE | libc::PARENB | libc::CSTOPB | libc::CRTSCTS);
    termios.c_cflag |= libc::CS8 | libc::CLOCAL | libc::CREAD;

    termios.c_cc[libc::VMIN] = 0;
    termios.c_cc[libc::VTIME] = 0;

    let result = unsafe { libc::cfsetspeed(&mut termios, speed) };
    if result != 0 {
        return Err(format!("cfsetspeed failed: {}", io::Error::last_os_error()));
    }

    let result = unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) };
    if result != 0 {
        return Err(format!("tcsetattr failed: {}", io::Error::last_os_error()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn configure_tty_raw(_file: &File, _baud: u32) -> Result<(), String> {
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        let transport = SerialTransport::new(115_200);
        assert!(!transport.is_open());
        assert_eq!(transport.port(), None);
    }

    #[test]
    fn test_write_on_closed_port_fails() {
        let mut transport = SerialTransport::new(115_200);
        assert!(matches!(
            transport.write(&[0x09]),
            Err(TransportError::Closed)
        ));
        let mut buf = [0u8; 1];
        assert!(matches!(
            transport.read(&mut buf, Duration::ZERO),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_open_missing_device() {
        let mut transport = SerialTransport::new(115_200);
        let err = transport.open("/dev/does-not-exist-wainlux").unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }));
        assert!(!transport.is_open());
    }

    #[cfg(unix)]
    #[test]
    fn test_baud_constants() {
        assert_eq!(baud_constant(115_200), Some(libc::B115200));
        assert_eq!(baud_constant(12_345), None);
    }

    // Note: Most transport tests require actual hardware.
    // Integration tests should be run manually with a connected engraver.
}

//! Linux SocketCAN backend.
//!
//! The `socketcan` crate opens and binds the raw socket and installs the
//! acceptance filters. Frames themselves are moved as whole 16-byte
//! `can_frame` records so that a partial read is observable and can be
//! rejected instead of being silently padded.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use socketcan::{CanFilter, CanSocket, Socket, SocketOptions};
use tracing::debug;

use crate::bus::{Bus, BusError, Channel, Filter};
use crate::frame::{Frame, CAN_MTU};

/// A CAN interface such as `can0`, opened through raw SocketCAN sockets.
#[derive(Debug, Clone)]
pub struct SocketCanBus {
    interface: String,
}

impl SocketCanBus {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
        }
    }
}

impl Bus for SocketCanBus {
    type Channel = SocketCanChannel;

    fn open(&self, filters: &[Filter]) -> Result<Self::Channel, BusError> {
        let socket = CanSocket::open(&self.interface).map_err(|source| BusError::Open {
            interface: self.interface.clone(),
            source,
        })?;

        let filters: Vec<CanFilter> = filters
            .iter()
            .map(|filter| CanFilter::new(filter.id, filter.mask))
            .collect();

        socket
            .set_filters(filters.as_slice())
            .map_err(BusError::FilterUnsupported)?;

        debug!(interface = %self.interface, filters = filters.len(), "CAN socket opened");

        Ok(SocketCanChannel {
            socket: Some(socket),
        })
    }

    fn interface(&self) -> &str {
        &self.interface
    }
}

pub struct SocketCanChannel {
    socket: Option<CanSocket>,
}

impl SocketCanChannel {
    fn fd(&self) -> Result<RawFd, BusError> {
        self.socket
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(BusError::Closed)
    }
}

impl Channel for SocketCanChannel {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError> {
        let fd = self.fd()?;

        if !wait_readable(fd, timeout).map_err(BusError::Read)? {
            return Ok(None);
        }

        let mut buffer = [0u8; CAN_MTU];

        // SAFETY: `buffer` is valid for writes of `buffer.len()` bytes and `fd`
        // stays open while `self.socket` is borrowed.
        let read = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };

        frame_from_read(io_result(read), &buffer)
    }

    fn send(&mut self, frame: &Frame) -> Result<(), BusError> {
        let fd = self.fd()?;
        let bytes = frame.as_bytes();

        // SAFETY: `bytes` is valid for reads of `bytes.len()` bytes.
        let written = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };

        check_write(io_result(written))
    }

    fn close(&mut self) {
        // Dropping the socket closes the descriptor
        self.socket.take();
    }
}

fn io_result(count: libc::ssize_t) -> io::Result<usize> {
    usize::try_from(count).map_err(|_| io::Error::last_os_error())
}

/// Maps the outcome of reading into `buffer`. Would-block and interrupted
/// reads count as "nothing yet", anything shorter than a whole `can_frame` is
/// a short frame.
fn frame_from_read(read: io::Result<usize>, buffer: &[u8]) -> Result<Option<Frame>, BusError> {
    match read {
        Ok(count) => Ok(Some(Frame::from_bytes(&buffer[..count.min(buffer.len())])?)),
        Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(None)
        }
        Err(err) => Err(BusError::Read(err)),
    }
}

fn check_write(written: io::Result<usize>) -> Result<(), BusError> {
    match written {
        Ok(CAN_MTU) => Ok(()),
        Ok(count) => Err(BusError::Write(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("wrote {count} of {CAN_MTU} bytes"),
        ))),
        Err(err) => Err(BusError::Write(err)),
    }
}

fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `pollfd` points to exactly one initialised entry.
    let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };

    match ready {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => {
            let err = io::Error::last_os_error();

            if err.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

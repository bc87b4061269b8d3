//! Serial line transport.

use std::{
    fs::OpenOptions,
    os::{fd::OwnedFd, unix::fs::OpenOptionsExt},
    path::Path,
};

use nix::{
    libc,
    sys::termios::{self, BaudRate, ControlFlags, SetArg},
};
use tracing::info;

use crate::TransportError;

/// Maps a numeric line speed to its termios constant.
pub fn baud_rate(baud: u32) -> Result<BaudRate, TransportError> {
    let rate = match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        1000000 => BaudRate::B1000000,
        2000000 => BaudRate::B2000000,
        3000000 => BaudRate::B3000000,
        4000000 => BaudRate::B4000000,
        other => return Err(TransportError::UnsupportedBaudRate(other)),
    };

    Ok(rate)
}

/// Opens a tty in raw mode at the given speed. The returned descriptor is non-blocking and is
/// used for both directions of a framed client.
pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<OwnedFd, TransportError> {
    let path = path.as_ref();
    let rate = baud_rate(baud)?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| TransportError::Open { path: path.display().to_string(), source })?;

    let mut tio = termios::tcgetattr(&file)?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, rate)?;
    tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    termios::tcsetattr(&file, SetArg::TCSANOW, &tio)?;

    info!(path = %path.display(), baud, "serial: opened");

    Ok(file.into())
}

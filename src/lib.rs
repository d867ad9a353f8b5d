//! STM32 factory USART bootloader client.
//!
//! Based on AN3155. The bootloader lives in system memory and reprograms
//! application flash over a plain serial link; this crate implements the
//! command protocol on top of a narrow [`Transport`] contract, with concrete
//! transports for native serial ports (`serial` feature) and FTDI D2XX
//! bridges (`ftdi` feature), an Intel-HEX firmware image loader, and the
//! erase/write/verify orchestration used by the bundled flashing utility
//! (`util` feature).

#[macro_use]
extern crate log;

pub mod flash;
pub mod image;
pub mod programmer;
pub mod protocol;

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(feature = "ftdi")]
pub mod ftdi;

#[cfg(test)]
pub(crate) mod mock;

pub use crate::programmer::Programmer;
pub use crate::protocol::{
    Command, ErasePages, ExtendedEraseSelector, SupportedCommands,
    VersionAndReadProtectionStatus,
};

/// Byte-oriented duplex channel to the device.
///
/// Everything is blocking and half-duplex; deadlines belong to the
/// implementation, and a transport timeout surfaces unmodified as
/// [`Error::Transport`]. The control lines are driven by the flashing
/// orchestration for target reset sequencing, never by the protocol engine
/// itself.
pub trait Transport<E> {
    /// Open the channel. Opening an already open channel is a no-op.
    fn open(&mut self) -> Result<(), E>;

    /// Close the channel and release the underlying device.
    fn close(&mut self) -> Result<(), E>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Discard any pending input and output.
    fn clear_buffers(&mut self) -> Result<(), E>;

    /// Send all of `data`, or fail.
    fn send(&mut self, data: &[u8]) -> Result<(), E>;

    /// Block until `buf` is filled exactly, or fail.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), E>;

    /// Drive the RTS line.
    fn set_rts(&mut self, level: bool) -> Result<(), E>;

    /// Drive the DTR line.
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Errors raised by the protocol engine.
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E> {
    /// Transport failure, reported unmodified.
    #[error("transport error: {0:?}")]
    Transport(E),

    /// The connection has not been opened yet.
    #[error("connection is not opened yet")]
    NotOpen,

    /// A command other than open/init/close was issued before the handshake.
    #[error("device is not initialized yet")]
    NotInitialized,

    /// The device answered NACK outside of the tolerated handshake case.
    #[error("NACK was received")]
    Nack,

    /// The device answered something that is neither ACK nor NACK.
    #[error("invalid answer was received: 0x{0:02x}")]
    UnexpectedAnswer(u8),

    /// An argument was rejected before any bytes were sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Wire support for this command is intentionally absent.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    /// The handshake kept failing; carries the final attempt's error.
    #[error("failed to initialize after {attempts} attempts: {last:?}")]
    InitFailed {
        attempts: usize,
        last: Box<Error<E>>,
    },

    /// Closing the transport failed.
    #[error("failed to close the connection: {0:?}")]
    CloseFailed(E),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

/// Engine configuration, passed at construction.
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Total attempts for the init handshake before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5"))]
    pub init_retries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { init_retries: 5 }
    }
}

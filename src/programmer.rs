//! The bootloader protocol engine.

use core::marker::PhantomData;

use crate::protocol::{
    self, Command, ErasePages, ExtendedEraseSelector, SupportedCommands,
    VersionAndReadProtectionStatus,
};
use crate::{Error, Options, Transport};

/// Result of waiting for a single acknowledgement byte.
///
/// Any byte other than ACK/NACK is an error at the wait itself; whether a
/// NACK is tolerated is decided per call site.
#[derive(Copy, Clone, Debug, PartialEq)]
enum Ack {
    Ack,
    Nack,
}

/// Protocol engine for one bootloader session.
///
/// Strictly half-duplex: every method is a blocking round-trip, and `&mut
/// self` serialises access. Commands other than [`open`](Programmer::open),
/// [`init`](Programmer::init) and [`close`](Programmer::close) require an
/// open, initialised connection and fail without sending a byte otherwise.
pub struct Programmer<T, E> {
    transport: T,
    options: Options,
    initialized: bool,
    _err: PhantomData<E>,
}

impl<T, E> Programmer<T, E>
where
    T: Transport<E>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance over `transport`.
    pub fn new(transport: T, options: Options) -> Self {
        Self {
            transport,
            options,
            initialized: false,
            _err: PhantomData,
        }
    }

    /// Access the underlying transport, e.g. for reset sequencing.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the programmer and hand the transport back.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Whether the init handshake has completed on this connection.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Open the underlying transport. No-op when already open.
    pub fn open(&mut self) -> Result<(), Error<E>> {
        if !self.transport.is_open() {
            self.transport.open()?;
        }
        Ok(())
    }

    /// Close the underlying transport, ending the session.
    ///
    /// Pending buffers are cleared best-effort first; an actual close
    /// failure is reported as [`Error::CloseFailed`].
    pub fn close(&mut self) -> Result<(), Error<E>> {
        self.initialized = false;
        if self.transport.is_open() {
            let _ = self.transport.clear_buffers();
            self.transport.close().map_err(Error::CloseFailed)?;
        }
        Ok(())
    }

    /// Synchronise with the bootloader.
    ///
    /// Sends the init byte and waits for an acknowledgement. A NACK is a
    /// tolerated answer here (the device may already be synchronised) and
    /// counts as success. Anything else is retried up to the configured
    /// number of attempts; this is the only command that retries. The final
    /// failure wraps the last underlying error.
    pub fn init(&mut self) -> Result<(), Error<E>> {
        if !self.transport.is_open() {
            return Err(Error::NotOpen);
        }

        let attempts = self.options.init_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_init() {
                Ok(()) => {
                    self.initialized = true;
                    return Ok(());
                }
                Err(e) if attempt >= attempts => {
                    error!("init failed after {} attempts", attempts);
                    return Err(Error::InitFailed {
                        attempts,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    debug!("init attempt {}/{} failed: {}", attempt, attempts, e);
                }
            }
        }
    }

    fn try_init(&mut self) -> Result<(), Error<E>> {
        self.send_frame(&[protocol::INIT])?;
        match self.read_ack()? {
            Ack::Ack => Ok(()),
            Ack::Nack => {
                // The device NACKs the init byte when it is already
                // synchronised; that answer stands in for an ACK.
                debug!("NACK on init, device already synchronised");
                Ok(())
            }
        }
    }

    /// Fetch the bootloader version and the commands it supports.
    pub fn get(&mut self) -> Result<SupportedCommands, Error<E>> {
        self.check_ready()?;
        self.command(Command::Get)?;

        // Length byte, then the version byte plus that many opcodes.
        let n = self.receive_byte()? as usize;
        let mut data = vec![0u8; n + 1];
        self.transport.receive(&mut data)?;
        self.wait_ack()?;

        Ok(SupportedCommands {
            version: data[0],
            commands: data[1..].to_vec(),
        })
    }

    /// Fetch the bootloader version and the two option bytes.
    pub fn get_version(&mut self) -> Result<VersionAndReadProtectionStatus, Error<E>> {
        self.check_ready()?;
        self.command(Command::GetVersionReadStatus)?;

        let mut data = [0u8; 3];
        self.transport.receive(&mut data)?;
        self.wait_ack()?;

        Ok(VersionAndReadProtectionStatus {
            version: data[0],
            option_byte1: data[1],
            option_byte2: data[2],
        })
    }

    /// Fetch the product id.
    pub fn get_id(&mut self) -> Result<u16, Error<E>> {
        self.check_ready()?;
        self.command(Command::GetId)?;

        let n = self.receive_byte()? as usize;
        let mut data = vec![0u8; n + 1];
        self.transport.receive(&mut data)?;
        self.wait_ack()?;

        if data.len() < 2 {
            return Err(Error::UnexpectedAnswer(n as u8));
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    /// Read `size` bytes of memory starting at `address`, 1 to 256 at a time.
    pub fn read_memory(&mut self, address: u32, size: usize) -> Result<Vec<u8>, Error<E>> {
        self.check_ready()?;
        if size < 1 || size > protocol::MAX_CHUNK {
            return Err(Error::InvalidArgument("read size must be 1 to 256"));
        }

        self.command(Command::ReadMemory)?;
        self.send_address(address)?;

        // Standalone length byte with its complement checksum.
        let len = (size - 1) as u8;
        self.send_frame(&[len, protocol::length_checksum(len)])?;
        self.wait_ack()?;

        // Raw data, no trailing ACK.
        let mut data = vec![0u8; size];
        self.transport.receive(&mut data)?;
        Ok(data)
    }

    /// Write `data` to memory starting at `address`.
    ///
    /// The caller keeps `data` to 1..=256 bytes; the wire format has a single
    /// length byte and this layer does not enforce the bound.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        self.check_ready()?;

        self.command(Command::WriteMemory)?;
        self.send_address(address)?;

        let mut frame = Vec::with_capacity(data.len() + 2);
        frame.push((data.len() as u8).wrapping_sub(1));
        frame.extend_from_slice(data);
        frame.push(protocol::checksum(&frame));
        self.send_frame(&frame)?;
        self.wait_ack()
    }

    /// Start executing firmware at `address`.
    ///
    /// The device may stop responding once it jumps; nothing further is
    /// awaited after the address is acknowledged.
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.check_ready()?;
        self.command(Command::Go)?;
        self.send_address(address)
    }

    /// Erase flash with the legacy erase command.
    pub fn erase_memory(&mut self, pages: ErasePages) -> Result<(), Error<E>> {
        self.check_ready()?;
        if let ErasePages::Page(0xFF) = pages {
            return Err(Error::InvalidArgument("page index must be 0 to 254"));
        }

        self.command(Command::Erase)?;
        match pages {
            ErasePages::Global => self.send_frame(&protocol::GLOBAL_ERASE)?,
            ErasePages::Page(index) => {
                let frame = [0x00, index, protocol::checksum(&[0x00, index])];
                self.send_frame(&frame)?;
            }
        }
        self.wait_ack()
    }

    /// Erase flash with the extended (two-byte addressing) erase command.
    pub fn extended_erase_memory(
        &mut self,
        selector: ExtendedEraseSelector,
    ) -> Result<(), Error<E>> {
        self.check_ready()?;

        let code = match selector {
            ExtendedEraseSelector::Mass => protocol::MASS_ERASE,
            ExtendedEraseSelector::Bank1 => protocol::BANK1_ERASE,
            ExtendedEraseSelector::Bank2 => protocol::BANK2_ERASE,
            ExtendedEraseSelector::Pages(0) => {
                return Err(Error::InvalidArgument("page count must not be zero"));
            }
            ExtendedEraseSelector::Pages(count) if count >= 0xFFF0 => {
                return Err(Error::InvalidArgument("page counts 0xFFF0 and up are reserved"));
            }
            // Page counts go on the wire as count - 1.
            ExtendedEraseSelector::Pages(count) => count - 1,
        };

        self.command(Command::ExtendedErase)?;
        let bytes = code.to_be_bytes();
        let frame = [bytes[0], bytes[1], protocol::checksum(&bytes)];
        self.send_frame(&frame)?;
        self.wait_ack()
    }

    /// Write protection is not supported by this client.
    pub fn write_protect(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented("WriteProtect"))
    }

    /// Write unprotection is not supported by this client.
    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented("WriteUnprotect"))
    }

    /// Readout protection is not supported by this client.
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented("ReadoutProtect"))
    }

    /// Readout unprotection is not supported by this client.
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        Err(Error::NotImplemented("ReadoutUnprotect"))
    }

    /// Gate for every command other than open/init/close.
    fn check_ready(&self) -> Result<(), Error<E>> {
        if !self.transport.is_open() {
            return Err(Error::NotOpen);
        }
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    /// Write one frame as a single contiguous send.
    ///
    /// Pending input and output are discarded first so a stale byte can never
    /// be misread as the answer to this frame.
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error<E>> {
        self.transport.clear_buffers()?;
        self.transport.send(frame)?;
        Ok(())
    }

    fn receive_byte(&mut self) -> Result<u8, Error<E>> {
        let mut byte = [0u8; 1];
        self.transport.receive(&mut byte)?;
        Ok(byte[0])
    }

    fn read_ack(&mut self) -> Result<Ack, Error<E>> {
        match self.receive_byte()? {
            protocol::ACK => Ok(Ack::Ack),
            protocol::NACK => Ok(Ack::Nack),
            other => {
                debug!("unexpected answer 0x{:02x}", other);
                Err(Error::UnexpectedAnswer(other))
            }
        }
    }

    /// Wait for an ACK; a NACK is a hard error everywhere but init.
    fn wait_ack(&mut self) -> Result<(), Error<E>> {
        match self.read_ack()? {
            Ack::Ack => Ok(()),
            Ack::Nack => Err(Error::Nack),
        }
    }

    /// Send a command opcode/complement pair and wait for the ACK.
    fn command(&mut self, command: Command) -> Result<(), Error<E>> {
        debug!("sending command {:?}", command);
        self.send_frame(&command.frame())?;
        self.wait_ack()
    }

    fn send_address(&mut self, address: u32) -> Result<(), Error<E>> {
        self.send_frame(&protocol::address_frame(address))?;
        self.wait_ack()
    }
}

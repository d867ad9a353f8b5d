//! Wire-level definitions for the USART bootloader protocol.
//!
//! Commands go on the wire as an opcode followed by its bitwise complement,
//! which the device checks before answering. Payload frames carry an XOR
//! checksum chosen so that XORing every byte of the frame yields 0x00, with
//! one exception: the standalone length byte of ReadMemory is followed by its
//! bitwise complement instead (combined XOR 0xFF). See [`length_checksum`].

/// Byte sent to synchronise with the bootloader after reset.
///
/// Sent on its own, without a complement byte.
pub const INIT: u8 = 0x7F;

/// Positive acknowledgement.
pub const ACK: u8 = 0x79;

/// Negative acknowledgement.
pub const NACK: u8 = 0x1F;

/// Maximum number of bytes a single read or write command transfers.
pub const MAX_CHUNK: usize = 256;

/// Two-byte request selecting the legacy global erase.
pub const GLOBAL_ERASE: [u8; 2] = [0xFF, 0x00];

/// Extended erase special code: erase the whole flash array.
pub const MASS_ERASE: u16 = 0xFFFF;

/// Extended erase special code: erase bank 1.
pub const BANK1_ERASE: u16 = 0xFFFE;

/// Extended erase special code: erase bank 2.
pub const BANK2_ERASE: u16 = 0xFFFD;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Fetch the bootloader version and the commands it allows
    Get = 0x00,

    /// Gets the bootloader version and the read protection status of the flash memory
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal flash memory or in the SRAM
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or flash memory starting from an address specified by the application
    WriteMemory = 0x31,

    /// Erases from one to all the flash memory pages
    Erase = 0x43,

    /// Erases flash memory pages using two byte addressing mode (v3.0 USART bootloader versions and above)
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors
    WriteProtect = 0x63,

    /// Disables the write protection for all flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection
    ReadoutUnprotect = 0x92,
}

impl Command {
    /// Wire opcode.
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Bitwise complement of the opcode, the device-side integrity pre-check.
    pub fn complement(self) -> u8 {
        !(self as u8)
    }

    /// Opcode/complement pair as sent on the wire.
    pub fn frame(self) -> [u8; 2] {
        [self.opcode(), self.complement()]
    }

    /// Decode an opcode byte, e.g. from a `Get` answer.
    pub fn from_opcode(opcode: u8) -> Option<Command> {
        match opcode {
            0x00 => Some(Command::Get),
            0x01 => Some(Command::GetVersionReadStatus),
            0x02 => Some(Command::GetId),
            0x11 => Some(Command::ReadMemory),
            0x21 => Some(Command::Go),
            0x31 => Some(Command::WriteMemory),
            0x43 => Some(Command::Erase),
            0x44 => Some(Command::ExtendedErase),
            0x63 => Some(Command::WriteProtect),
            0x73 => Some(Command::WriteUnprotect),
            0x82 => Some(Command::ReadoutProtect),
            0x92 => Some(Command::ReadoutUnprotect),
            _ => None,
        }
    }
}

/// XOR checksum over `data`.
///
/// Appending the checksum makes the XOR of the whole frame 0x00.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0x00, |acc, b| acc ^ b)
}

/// Checksum for the standalone length byte of ReadMemory.
///
/// This one field wants the bitwise complement rather than the XOR form;
/// sending `checksum(&[len])` gets the request NACKed.
pub fn length_checksum(len: u8) -> u8 {
    !len
}

/// Big-endian address frame: four address bytes followed by their checksum.
pub fn address_frame(address: u32) -> [u8; 5] {
    let [a, b, c, d] = address.to_be_bytes();
    [a, b, c, d, checksum(&[a, b, c, d])]
}

/// Bootloader version and the command set it advertises, answered by `Get`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupportedCommands {
    /// Version byte, major/minor packed as nibbles.
    pub version: u8,
    /// Opcodes of the supported commands, in the order the device lists them.
    pub commands: Vec<u8>,
}

impl SupportedCommands {
    pub fn major(&self) -> u8 {
        (self.version >> 4) & 0x0F
    }

    pub fn minor(&self) -> u8 {
        self.version & 0x0F
    }

    /// Whether the device advertises `command`.
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.opcode())
    }
}

/// Answer of `GetVersionReadStatus`: version byte plus the two option bytes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionAndReadProtectionStatus {
    /// Version byte, major/minor packed as nibbles.
    pub version: u8,
    pub option_byte1: u8,
    pub option_byte2: u8,
}

impl VersionAndReadProtectionStatus {
    pub fn major(&self) -> u8 {
        (self.version >> 4) & 0x0F
    }

    pub fn minor(&self) -> u8 {
        self.version & 0x0F
    }
}

/// Target of the legacy erase command.
///
/// One page per call; the wire format could carry a page list, but this
/// client never sends one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErasePages {
    /// A single page, index 0 to 254.
    Page(u8),
    /// Every page (wire sentinel 0xFF 0x00).
    Global,
}

/// Target of the extended (two-byte addressing) erase command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtendedEraseSelector {
    /// Erase the whole flash array (0xFFFF).
    Mass,
    /// Erase bank 1 (0xFFFE).
    Bank1,
    /// Erase bank 2 (0xFFFD).
    Bank2,
    /// Erase the first `n` pages.
    Pages(u16),
}

impl ExtendedEraseSelector {
    /// Map a raw 16-bit selector to its meaning.
    pub fn from_code(code: u16) -> ExtendedEraseSelector {
        match code {
            MASS_ERASE => ExtendedEraseSelector::Mass,
            BANK1_ERASE => ExtendedEraseSelector::Bank1,
            BANK2_ERASE => ExtendedEraseSelector::Bank2,
            count => ExtendedEraseSelector::Pages(count),
        }
    }
}

//! FTDI D2XX transport.
//!
//! Talks to adapters built on FTDI bridge chips through the vendor D2XX
//! interface instead of the OS serial stack, and adds the FT232R's CBUS
//! auxiliary pins: their roles live in the chip's EEPROM configuration
//! store, and pins configured as I/O can be bit-banged, e.g. to drive the
//! target's BOOT0 and reset without the modem lines.

use std::time::Duration;

use libftd2xx::{
    BitMode, BitsPerWord, Cbus232r, DeviceTypeError, Ft232r, FtStatus, FtdiCommon, FtdiEeprom,
    Parity, StopBits, TimeoutError,
};

use crate::Transport;

/// Errors from the D2XX transport.
#[derive(Debug, thiserror::Error)]
pub enum FtdiError {
    /// Status reported by the D2XX layer.
    #[error("D2XX error: {0:?}")]
    Status(FtStatus),

    /// The adapter at the requested serial number is the wrong model.
    #[error("device type error: {0:?}")]
    Device(DeviceTypeError),

    /// A read or write ran out of time before moving every byte; carries
    /// the requested and actual counts.
    #[error("D2XX transfer incomplete: {0:?}")]
    Timeout(TimeoutError),

    /// The device has not been opened yet.
    #[error("FTDI device is not open")]
    NotOpen,

    /// CBUS operations need the pin roles configured first.
    #[error("CBUS pins are not configured yet")]
    CbusNotConfigured,
}

impl From<FtStatus> for FtdiError {
    fn from(status: FtStatus) -> Self {
        Self::Status(status)
    }
}

impl From<DeviceTypeError> for FtdiError {
    fn from(e: DeviceTypeError) -> Self {
        Self::Device(e)
    }
}

impl From<TimeoutError> for FtdiError {
    fn from(e: TimeoutError) -> Self {
        Self::Timeout(e)
    }
}

/// Line settings applied when the device opens.
#[derive(Clone, Debug, PartialEq)]
pub struct FtdiSettings {
    pub baud_rate: u32,
    /// Read/write deadline.
    pub timeout: Duration,
    /// USB latency timer; low values keep single-byte answers snappy.
    pub latency: Duration,
}

impl Default for FtdiSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            timeout: Duration::from_millis(250),
            latency: Duration::from_millis(16),
        }
    }
}

/// Roles for the four CBUS pins, kept in the EEPROM configuration store.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CbusConfig {
    pub cbus0: Cbus232r,
    pub cbus1: Cbus232r,
    pub cbus2: Cbus232r,
    pub cbus3: Cbus232r,
}

impl Default for CbusConfig {
    /// Factory-style roles: activity LEDs, TX enable, power indication.
    fn default() -> Self {
        Self {
            cbus0: Cbus232r::TxLed,
            cbus1: Cbus232r::RxLed,
            cbus2: Cbus232r::TxdEn,
            cbus3: Cbus232r::PwrOn,
        }
    }
}

/// Levels for the CBUS pins that are in I/O mode.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CbusBits {
    pub cbus0: bool,
    pub cbus1: bool,
    pub cbus2: bool,
    pub cbus3: bool,
}

/// Transport over an FT232R, addressed by its serial number.
pub struct FtdiTransport {
    serial_number: String,
    settings: FtdiSettings,
    device: Option<Ft232r>,
    /// Pin roles, remembered once written so the bit-bang mask can be built
    /// without re-reading the EEPROM.
    cbus: Option<CbusConfig>,
}

impl FtdiTransport {
    /// Transport for the adapter with the given serial number.
    pub fn new(serial_number: impl Into<String>) -> FtdiTransport {
        FtdiTransport {
            serial_number: serial_number.into(),
            settings: FtdiSettings::default(),
            device: None,
            cbus: None,
        }
    }

    /// Replace the line settings applied at open.
    pub fn settings(mut self, settings: FtdiSettings) -> FtdiTransport {
        self.settings = settings;
        self
    }

    fn device_mut(&mut self) -> Result<&mut Ft232r, FtdiError> {
        self.device.as_mut().ok_or(FtdiError::NotOpen)
    }

    /// Write the CBUS pin roles into the EEPROM configuration store.
    ///
    /// The EEPROM is only reprogrammed when the stored roles differ from the
    /// requested ones.
    pub fn set_cbus_config(&mut self, config: CbusConfig) -> Result<(), FtdiError> {
        let device = self.device.as_mut().ok_or(FtdiError::NotOpen)?;

        let (mut eeprom, strings) = device.eeprom_read()?;
        if eeprom.cbus0() != config.cbus0
            || eeprom.cbus1() != config.cbus1
            || eeprom.cbus2() != config.cbus2
            || eeprom.cbus3() != config.cbus3
        {
            info!("reprogramming CBUS roles in EEPROM");
            eeprom.set_cbus0(config.cbus0);
            eeprom.set_cbus1(config.cbus1);
            eeprom.set_cbus2(config.cbus2);
            eeprom.set_cbus3(config.cbus3);
            device.eeprom_program(eeprom, strings)?;
        }

        self.cbus = Some(config);
        Ok(())
    }

    /// Drive the CBUS pins that are configured as I/O.
    ///
    /// The bit-bang mask only enables pins whose stored role is `IoMode`;
    /// the rest keep their configured function.
    pub fn set_cbus_bits(&mut self, bits: CbusBits) -> Result<(), FtdiError> {
        let config = self.cbus.ok_or(FtdiError::CbusNotConfigured)?;
        let device = self.device.as_mut().ok_or(FtdiError::NotOpen)?;

        // Upper nibble selects outputs, lower nibble the levels.
        let mut mask: u8 = 0;
        if config.cbus0 == Cbus232r::IoMode {
            mask |= 0x10;
            if bits.cbus0 {
                mask |= 0x01;
            }
        }
        if config.cbus1 == Cbus232r::IoMode {
            mask |= 0x20;
            if bits.cbus1 {
                mask |= 0x02;
            }
        }
        if config.cbus2 == Cbus232r::IoMode {
            mask |= 0x40;
            if bits.cbus2 {
                mask |= 0x04;
            }
        }
        if config.cbus3 == Cbus232r::IoMode {
            mask |= 0x80;
            if bits.cbus3 {
                mask |= 0x08;
            }
        }

        device.set_bit_mode(mask, BitMode::CbusBitbang)?;
        Ok(())
    }

    /// Read back the CBUS pin levels.
    pub fn cbus_bits(&mut self) -> Result<CbusBits, FtdiError> {
        if self.cbus.is_none() {
            return Err(FtdiError::CbusNotConfigured);
        }
        let device = self.device.as_mut().ok_or(FtdiError::NotOpen)?;

        let levels = device.bit_mode()?;
        Ok(CbusBits {
            cbus0: levels & 0x01 != 0,
            cbus1: levels & 0x02 != 0,
            cbus2: levels & 0x04 != 0,
            cbus3: levels & 0x08 != 0,
        })
    }
}

impl Transport<FtdiError> for FtdiTransport {
    fn open(&mut self) -> Result<(), FtdiError> {
        if self.device.is_some() {
            return Ok(());
        }

        let mut device = Ft232r::with_serial_number(&self.serial_number)?;
        device.set_baud_rate(self.settings.baud_rate)?;
        device.set_data_characteristics(BitsPerWord::Bits8, StopBits::Bits1, Parity::Even)?;
        device.set_flow_control_none()?;
        device.set_timeouts(self.settings.timeout, self.settings.timeout)?;
        device.set_latency_timer(self.settings.latency)?;

        info!(
            "opened FTDI device {} at {} baud",
            self.serial_number, self.settings.baud_rate
        );
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> Result<(), FtdiError> {
        if let Some(mut device) = self.device.take() {
            // Drop whatever is left in the chip before handing it back.
            let _ = device.purge_all();
            device.close()?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn clear_buffers(&mut self) -> Result<(), FtdiError> {
        self.device_mut()?.purge_all()?;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), FtdiError> {
        self.device_mut()?.write_all(data)?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), FtdiError> {
        self.device_mut()?.read_all(buf)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), FtdiError> {
        let device = self.device_mut()?;
        if level {
            device.set_rts()?;
        } else {
            device.clr_rts()?;
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), FtdiError> {
        let device = self.device_mut()?;
        if level {
            device.set_dtr()?;
        } else {
            device.clr_dtr()?;
        }
        Ok(())
    }
}

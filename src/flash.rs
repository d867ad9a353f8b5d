//! Erase/write/verify orchestration on top of the protocol engine.
//!
//! The engine performs one blocking command at a time; this module sequences
//! those commands over a whole firmware image in fixed-size blocks, drives
//! the target reset lines around the session, reports progress through a
//! callback and owns the retry-on-verify policy. The engine itself never
//! re-issues a command beyond its init handshake.

use std::thread;
use std::time::Duration;

use crate::image::FirmwareImage;
use crate::protocol::{ErasePages, ExtendedEraseSelector, MAX_CHUNK};
use crate::{Error, Programmer, Transport};

/// Default application base address in flash.
pub const BASE_ADDRESS: u32 = 0x0800_0000;

/// Default size of one erasable flash page.
pub const DEFAULT_PAGE_SIZE: usize = 1024;

/// Attempts per block before a verify mismatch becomes fatal.
pub const DEFAULT_VERIFY_RETRIES: usize = 5;

/// How long the reset line is held, and how long the bootloader gets to come
/// up afterwards.
const RESET_HOLD: Duration = Duration::from_millis(100);
const RESET_SETTLE: Duration = Duration::from_millis(100);

/// Orchestration settings.
#[derive(Clone, Debug, PartialEq)]
pub struct FlashOptions {
    /// Address the image is written to.
    pub base_address: u32,
    /// Size of one erasable page.
    pub page_size: usize,
    /// Bytes per read/write block, 1 to 256.
    pub block_size: usize,
    /// Attempts per block when verifying.
    pub verify_retries: usize,
    /// Erase the whole array instead of the image's pages.
    pub mass_erase: bool,
    /// Use the extended erase command (two-byte page addressing).
    pub extended_erase: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            base_address: BASE_ADDRESS,
            page_size: DEFAULT_PAGE_SIZE,
            block_size: MAX_CHUNK,
            verify_retries: DEFAULT_VERIFY_RETRIES,
            mass_erase: false,
            extended_erase: false,
        }
    }
}

/// Phase reported to the progress callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Erase,
    Write,
    Verify,
}

/// Orchestration failures.
#[derive(Debug, thiserror::Error)]
pub enum FlashError<E: core::fmt::Debug> {
    #[error(transparent)]
    Bootloader(#[from] Error<E>),

    #[error("verify kept failing at address 0x{address:08x}")]
    VerifyFailed { address: u32 },

    #[error("image needs {required} pages but the erase command addresses at most {available}")]
    TooManyPages { required: usize, available: usize },

    #[error("block size must be 1 to 256, got {0}")]
    BadBlockSize(usize),

    #[error("page size must not be zero")]
    BadPageSize,
}

/// Pulse the control lines to put the target into its bootloader.
///
/// DTR/RTS are wired to reset and BOOT0 on the usual adapters: both lines
/// are asserted, held, then released, and the target gets a moment to start
/// the bootloader before the init byte goes out.
pub fn reset_into_bootloader<T, E>(transport: &mut T) -> Result<(), E>
where
    T: Transport<E>,
{
    debug!("resetting target into bootloader");

    transport.set_dtr(true)?;
    transport.set_rts(true)?;
    thread::sleep(RESET_HOLD);

    transport.set_dtr(false)?;
    transport.set_rts(false)?;
    thread::sleep(RESET_SETTLE);

    Ok(())
}

/// Erase enough flash to hold `length` bytes.
pub fn erase<T, E, F>(
    programmer: &mut Programmer<T, E>,
    length: usize,
    options: &FlashOptions,
    progress: &mut F,
) -> Result<(), FlashError<E>>
where
    T: Transport<E>,
    E: core::fmt::Debug,
    F: FnMut(Phase, usize, usize),
{
    if options.mass_erase {
        info!("erasing the whole flash array");
        progress(Phase::Erase, 0, 1);
        if options.extended_erase {
            programmer.extended_erase_memory(ExtendedEraseSelector::Mass)?;
        } else {
            programmer.erase_memory(ErasePages::Global)?;
        }
        progress(Phase::Erase, 1, 1);
        return Ok(());
    }

    if options.page_size == 0 {
        return Err(FlashError::BadPageSize);
    }
    let pages = (length + options.page_size - 1) / options.page_size;

    if options.extended_erase {
        if pages >= 0xFFF0 {
            return Err(FlashError::TooManyPages {
                required: pages,
                available: 0xFFEF,
            });
        }
        info!("erasing {} pages of {} bytes", pages, options.page_size);
        progress(Phase::Erase, 0, 1);
        programmer.extended_erase_memory(ExtendedEraseSelector::Pages(pages as u16))?;
        progress(Phase::Erase, 1, 1);
        return Ok(());
    }

    if pages > 255 {
        return Err(FlashError::TooManyPages {
            required: pages,
            available: 255,
        });
    }

    info!("erasing {} pages of {} bytes", pages, options.page_size);
    progress(Phase::Erase, 0, pages);
    for page in 0..pages {
        programmer.erase_memory(ErasePages::Page(page as u8))?;
        progress(Phase::Erase, page + 1, pages);
    }
    Ok(())
}

/// Write the image in blocks.
pub fn write<T, E, F>(
    programmer: &mut Programmer<T, E>,
    image: &FirmwareImage,
    options: &FlashOptions,
    progress: &mut F,
) -> Result<(), FlashError<E>>
where
    T: Transport<E>,
    E: core::fmt::Debug,
    F: FnMut(Phase, usize, usize),
{
    if options.block_size < 1 || options.block_size > MAX_CHUNK {
        return Err(FlashError::BadBlockSize(options.block_size));
    }

    let total = image.data.len();
    info!(
        "writing {} bytes at 0x{:08x}",
        total, options.base_address
    );

    progress(Phase::Write, 0, total);
    for (index, block) in image.data.chunks(options.block_size).enumerate() {
        let offset = index * options.block_size;
        let address = options.base_address + offset as u32;
        debug!("writing {} bytes at 0x{:08x}", block.len(), address);
        programmer.write_memory(address, block)?;
        progress(Phase::Write, offset + block.len(), total);
    }
    Ok(())
}

/// Read the image back and compare it, block by block.
///
/// Each block gets a few attempts, so a glitched read does not abort a
/// multi-minute flashing run; a block that never matches is fatal.
pub fn verify<T, E, F>(
    programmer: &mut Programmer<T, E>,
    image: &FirmwareImage,
    options: &FlashOptions,
    progress: &mut F,
) -> Result<(), FlashError<E>>
where
    T: Transport<E>,
    E: core::fmt::Debug,
    F: FnMut(Phase, usize, usize),
{
    if options.block_size < 1 || options.block_size > MAX_CHUNK {
        return Err(FlashError::BadBlockSize(options.block_size));
    }

    let total = image.data.len();
    let attempts = options.verify_retries.max(1);

    progress(Phase::Verify, 0, total);
    for (index, block) in image.data.chunks(options.block_size).enumerate() {
        let offset = index * options.block_size;
        let address = options.base_address + offset as u32;

        let mut matched = false;
        for attempt in 1..=attempts {
            match programmer.read_memory(address, block.len()) {
                Ok(read) if read == block => {
                    matched = true;
                    break;
                }
                Ok(_) => debug!(
                    "verify mismatch at 0x{:08x} (attempt {}/{})",
                    address, attempt, attempts
                ),
                Err(e) => debug!(
                    "verify read failed at 0x{:08x} (attempt {}/{}): {}",
                    address, attempt, attempts, e
                ),
            }
        }
        if !matched {
            return Err(FlashError::VerifyFailed { address });
        }
        progress(Phase::Verify, offset + block.len(), total);
    }
    Ok(())
}

/// Erase, write and verify `image` in one pass.
pub fn flash<T, E, F>(
    programmer: &mut Programmer<T, E>,
    image: &FirmwareImage,
    options: &FlashOptions,
    mut progress: F,
) -> Result<(), FlashError<E>>
where
    T: Transport<E>,
    E: core::fmt::Debug,
    F: FnMut(Phase, usize, usize),
{
    erase(programmer, image.data.len(), options, &mut progress)?;
    write(programmer, image, options, &mut progress)?;
    verify(programmer, image, options, &mut progress)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ready_programmer;
    use crate::protocol::ACK;

    fn small_image() -> FirmwareImage {
        FirmwareImage {
            start: 0,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        }
    }

    #[test]
    fn flash_runs_erase_write_verify_end_to_end() {
        // One page erase, one write block, one verify read returning the
        // image bytes.
        let mut responses = vec![
            ACK, ACK, // erase command + page frame
            ACK, ACK, ACK, // write command + address + payload
            ACK, ACK, ACK, // read command + address + length
        ];
        responses.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let mut programmer = ready_programmer(&responses);
        let mut phases = Vec::new();

        flash(
            &mut programmer,
            &small_image(),
            &FlashOptions::default(),
            |phase, done, total| phases.push((phase, done, total)),
        )
        .unwrap();

        assert_eq!(
            programmer.transport_mut().sent,
            vec![
                0x43, 0xBC, // erase command
                0x00, 0x00, 0x00, // page 0
                0x31, 0xCE, // write command
                0x08, 0x00, 0x00, 0x00, 0x08, // address frame
                0x03, 0xDE, 0xAD, 0xBE, 0xEF, 0x21, // count, data, checksum
                0x11, 0xEE, // read command
                0x08, 0x00, 0x00, 0x00, 0x08, // address frame
                0x03, 0xFC, // length with complement checksum
            ]
        );

        assert_eq!(
            phases,
            vec![
                (Phase::Erase, 0, 1),
                (Phase::Erase, 1, 1),
                (Phase::Write, 0, 4),
                (Phase::Write, 4, 4),
                (Phase::Verify, 0, 4),
                (Phase::Verify, 4, 4),
            ]
        );
    }

    #[test]
    fn erase_covers_every_page_the_image_touches() {
        // 2.5 KiB at 1 KiB pages: three page erases.
        let responses = vec![ACK, ACK, ACK, ACK, ACK, ACK];
        let mut programmer = ready_programmer(&responses);

        erase(
            &mut programmer,
            2560,
            &FlashOptions::default(),
            &mut |_, _, _| {},
        )
        .unwrap();

        assert_eq!(
            programmer.transport_mut().sent,
            vec![
                0x43, 0xBC, 0x00, 0x00, 0x00, // page 0
                0x43, 0xBC, 0x00, 0x01, 0x01, // page 1
                0x43, 0xBC, 0x00, 0x02, 0x02, // page 2
            ]
        );
    }

    #[test]
    fn erase_rejects_images_beyond_the_legacy_page_range() {
        let mut programmer = ready_programmer(&[]);
        match erase(
            &mut programmer,
            256 * 1024 + 1,
            &FlashOptions::default(),
            &mut |_, _, _| {},
        ) {
            Err(FlashError::TooManyPages { required, available }) => {
                assert_eq!(required, 257);
                assert_eq!(available, 255);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(programmer.transport_mut().sent.is_empty());
    }

    #[test]
    fn mass_erase_uses_the_global_code() {
        let mut programmer = ready_programmer(&[ACK, ACK]);
        let options = FlashOptions {
            mass_erase: true,
            ..FlashOptions::default()
        };
        erase(&mut programmer, 1024, &options, &mut |_, _, _| {}).unwrap();
        assert_eq!(
            programmer.transport_mut().sent,
            vec![0x43, 0xBC, 0xFF, 0x00]
        );
    }

    #[test]
    fn extended_erase_sends_one_page_count_frame() {
        let mut programmer = ready_programmer(&[ACK, ACK]);
        let options = FlashOptions {
            extended_erase: true,
            ..FlashOptions::default()
        };
        erase(&mut programmer, 3 * 1024, &options, &mut |_, _, _| {}).unwrap();
        assert_eq!(
            programmer.transport_mut().sent,
            vec![0x44, 0xBB, 0x00, 0x02, 0x02]
        );
    }

    #[test]
    fn verify_retries_mismatching_blocks_then_gives_up() {
        // Two attempts, both returning wrong bytes.
        let responses = vec![
            ACK, ACK, ACK, 0x00, 0x00, 0x00, 0x00, // attempt 1
            ACK, ACK, ACK, 0x00, 0x00, 0x00, 0x00, // attempt 2
        ];
        let mut programmer = ready_programmer(&responses);
        let options = FlashOptions {
            verify_retries: 2,
            ..FlashOptions::default()
        };

        match verify(&mut programmer, &small_image(), &options, &mut |_, _, _| {}) {
            Err(FlashError::VerifyFailed { address }) => {
                assert_eq!(address, BASE_ADDRESS);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // No answer bytes left over: both attempts really happened.
        assert!(programmer.transport_mut().responses.is_empty());
    }

    #[test]
    fn verify_recovers_when_a_retry_matches() {
        let mut responses = vec![ACK, ACK, ACK, 0x00, 0x00, 0x00, 0x00];
        responses.extend_from_slice(&[ACK, ACK, ACK, 0xDE, 0xAD, 0xBE, 0xEF]);
        let mut programmer = ready_programmer(&responses);

        verify(
            &mut programmer,
            &small_image(),
            &FlashOptions::default(),
            &mut |_, _, _| {},
        )
        .unwrap();
    }

    #[test]
    fn block_size_is_bounded() {
        let mut programmer = ready_programmer(&[]);
        let options = FlashOptions {
            block_size: 257,
            ..FlashOptions::default()
        };
        match write(&mut programmer, &small_image(), &options, &mut |_, _, _| {}) {
            Err(FlashError::BadBlockSize(257)) => (),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(programmer.transport_mut().sent.is_empty());
    }
}

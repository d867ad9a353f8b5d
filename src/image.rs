//! Firmware image loading.
//!
//! Intel-HEX text images are flattened into one contiguous byte buffer
//! spanning `[start, end)`, gaps filled with a configurable byte; anything
//! not ending in `.hex` is read verbatim as a raw binary at offset zero and
//! placed by the caller.

use std::fs;
use std::path::Path;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_SEGMENT_BASE: u8 = 0x02;
const RECORD_START_SEGMENT: u8 = 0x03;
const RECORD_LINEAR_BASE: u8 = 0x04;
const RECORD_START_LINEAR: u8 = 0x05;

/// Refuse to flatten images spanning more than this.
const MAX_SPAN: usize = 32 * 1024 * 1024;

/// Image loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("failed to read image file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: &'static str },

    #[error("line {line}: record checksum is 0x{carried:02x}, expected 0x{expected:02x}")]
    Checksum {
        line: usize,
        carried: u8,
        expected: u8,
    },

    #[error("image contains no data")]
    Empty,

    #[error("image spans {span} bytes, refusing to flatten")]
    SpanTooLarge { span: usize },
}

/// A firmware image flattened to one contiguous buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Lowest address covered by `data`. Zero for raw binaries.
    pub start: u32,
    /// Image bytes, gaps already filled.
    pub data: Vec<u8>,
}

impl FirmwareImage {
    /// One past the highest covered address.
    pub fn end(&self) -> u32 {
        self.start + self.data.len() as u32
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Load `path`, parsing `.hex` files as Intel HEX and anything else as a
    /// raw binary at offset zero.
    pub fn load<P: AsRef<Path>>(path: P, fill: u8) -> Result<FirmwareImage, ImageError> {
        let path = path.as_ref();
        let is_hex = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("hex"));

        if is_hex {
            let text = fs::read_to_string(path)?;
            FirmwareImage::parse_hex(&text, fill)
        } else {
            let data = fs::read(path)?;
            if data.is_empty() {
                return Err(ImageError::Empty);
            }
            Ok(FirmwareImage { start: 0, data })
        }
    }

    /// Parse Intel-HEX text into a flat image.
    ///
    /// Data records are placed at their absolute addresses (segment and
    /// linear base records are honoured), the covered range is flattened and
    /// holes take the `fill` byte. Start-address records are skipped; the
    /// entry point is the caller's business.
    pub fn parse_hex(text: &str, fill: u8) -> Result<FirmwareImage, ImageError> {
        let mut base: u32 = 0;
        let mut records: Vec<(u32, Vec<u8>)> = Vec::new();
        let mut bounds: Option<(u32, u32)> = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }

            // Layout: count, offset hi, offset lo, type, data..., checksum.
            let bytes = decode_record(trimmed, line)?;
            let count = bytes[0] as usize;
            if bytes.len() != count + 5 {
                return Err(ImageError::Syntax {
                    line,
                    reason: "byte count does not match the record length",
                });
            }
            let offset = u16::from_be_bytes([bytes[1], bytes[2]]) as u32;
            let record_type = bytes[3];
            let data = &bytes[4..4 + count];

            match record_type {
                RECORD_DATA => {
                    if count == 0 {
                        continue;
                    }
                    let address = base.checked_add(offset).ok_or(ImageError::Syntax {
                        line,
                        reason: "data record address overflows 32 bits",
                    })?;
                    let end = address.checked_add(count as u32).ok_or(ImageError::Syntax {
                        line,
                        reason: "data record address overflows 32 bits",
                    })?;

                    bounds = Some(match bounds {
                        None => (address, end),
                        Some((lo, hi)) => (lo.min(address), hi.max(end)),
                    });
                    records.push((address, data.to_vec()));
                }
                RECORD_EOF => break,
                RECORD_SEGMENT_BASE => {
                    if count != 2 {
                        return Err(ImageError::Syntax {
                            line,
                            reason: "segment base record must carry 2 bytes",
                        });
                    }
                    base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 4;
                }
                RECORD_LINEAR_BASE => {
                    if count != 2 {
                        return Err(ImageError::Syntax {
                            line,
                            reason: "linear base record must carry 2 bytes",
                        });
                    }
                    base = (u16::from_be_bytes([data[0], data[1]]) as u32) << 16;
                }
                RECORD_START_SEGMENT | RECORD_START_LINEAR => (),
                _ => {
                    return Err(ImageError::Syntax {
                        line,
                        reason: "record type must be 00 to 05",
                    });
                }
            }
        }

        let (start, end) = bounds.ok_or(ImageError::Empty)?;
        let span = (end - start) as usize;
        if span > MAX_SPAN {
            return Err(ImageError::SpanTooLarge { span });
        }

        let mut flat = vec![fill; span];
        for (address, data) in records {
            let offset = (address - start) as usize;
            flat[offset..offset + data.len()].copy_from_slice(&data);
        }

        debug!(
            "parsed image: 0x{:08x} to 0x{:08x}, {} bytes",
            start, end, span
        );
        Ok(FirmwareImage { start, data: flat })
    }
}

/// Split one record line into raw bytes, verifying frame and checksum.
fn decode_record(line: &str, line_no: usize) -> Result<Vec<u8>, ImageError> {
    if !line.starts_with(':') {
        return Err(ImageError::Syntax {
            line: line_no,
            reason: "record must start with ':'",
        });
    }

    let hex = &line[1..];
    if !hex.is_ascii() {
        return Err(ImageError::Syntax {
            line: line_no,
            reason: "record contains non-hexadecimal characters",
        });
    }
    if hex.len() < 10 || hex.len() % 2 != 0 {
        return Err(ImageError::Syntax {
            line: line_no,
            reason: "record is too short",
        });
    }

    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in 0..hex.len() / 2 {
        let value = u8::from_str_radix(&hex[pair * 2..pair * 2 + 2], 16).map_err(|_| {
            ImageError::Syntax {
                line: line_no,
                reason: "record contains non-hexadecimal characters",
            }
        })?;
        bytes.push(value);
    }

    // Two's-complement checksum: every byte of the record sums to zero.
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        let carried = bytes[bytes.len() - 1];
        return Err(ImageError::Checksum {
            line: line_no,
            carried,
            expected: carried.wrapping_sub(sum),
        });
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_data_record() {
        let image = FirmwareImage::parse_hex(":04000000DEADBEEFC4\n:00000001FF\n", 0xFF).unwrap();
        assert_eq!(image.start, 0);
        assert_eq!(image.data, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(image.end(), 4);
    }

    #[test]
    fn fills_gaps_between_records() {
        let text = ":020000000102FB\n:020004000304F3\n:00000001FF\n";
        let image = FirmwareImage::parse_hex(text, 0xFF).unwrap();
        assert_eq!(image.start, 0);
        assert_eq!(image.data, vec![0x01, 0x02, 0xFF, 0xFF, 0x03, 0x04]);

        let zeroed = FirmwareImage::parse_hex(text, 0x00).unwrap();
        assert_eq!(zeroed.data, vec![0x01, 0x02, 0x00, 0x00, 0x03, 0x04]);
    }

    #[test]
    fn honours_the_linear_base_record() {
        let text = ":020000040800F2\n:020000000102FB\n:00000001FF\n";
        let image = FirmwareImage::parse_hex(text, 0xFF).unwrap();
        assert_eq!(image.start, 0x0800_0000);
        assert_eq!(image.data, vec![0x01, 0x02]);
    }

    #[test]
    fn honours_the_segment_base_record() {
        let text = ":020000021000EC\n:020000000102FB\n:00000001FF\n";
        let image = FirmwareImage::parse_hex(text, 0xFF).unwrap();
        assert_eq!(image.start, 0x0001_0000);
    }

    #[test]
    fn rejects_a_checksum_mismatch() {
        match FirmwareImage::parse_hex(":04000000DEADBEEFC5\n", 0xFF) {
            Err(ImageError::Checksum {
                line,
                carried,
                expected,
            }) => {
                assert_eq!(line, 1);
                assert_eq!(carried, 0xC5);
                assert_eq!(expected, 0xC4);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_malformed_records() {
        for text in &[
            "04000000DEADBEEFC4",  // missing start mark
            ":0400",               // too short
            ":04000000DEADBEEFC",  // odd digit count
            ":04000000DEADBXEFC4", // non-hex digit
            ":0400000601020304EC", // unknown record type (checksum valid)
        ] {
            match FirmwareImage::parse_hex(text, 0xFF) {
                Err(ImageError::Syntax { line: 1, .. }) => (),
                other => panic!("unexpected result for {:?}: {:?}", text, other),
            }
        }
    }

    #[test]
    fn an_image_without_data_is_empty() {
        match FirmwareImage::parse_hex(":00000001FF\n", 0xFF) {
            Err(ImageError::Empty) => (),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn records_after_eof_are_ignored() {
        let text = ":020000000102FB\n:00000001FF\n:020004000304F3\n";
        let image = FirmwareImage::parse_hex(text, 0xFF).unwrap();
        assert_eq!(image.data, vec![0x01, 0x02]);
    }
}

//! Program image layout.
//!
//! An executable image starts with a fixed header, followed by the data
//! section and then the text (code) section:
//!
//! ```text
//! offset 0:            version_string[8]   first byte == GLOBAL_PROG_ID
//!         8:           size: u64           total image size in bytes
//!        16:           start_address: u64  entry offset into text
//!        24:           data_offset: u64
//!        32:           text_offset: u64
//!        40:           data bytes, then text bytes
//! ```

/// First byte of every valid program image.
pub const GLOBAL_PROG_ID: u8 = 0x53;

/// Address of the first data byte once an image is loaded. Addresses below
/// this are never mapped, so null dereferences fault. The compiler bakes
/// data addresses into immediates under this contract.
pub const DATA_BASE: u64 = 64;

/// Size of the serialized header in bytes.
pub const HEADER_SIZE: usize = 40;

/// The fixed-size header at the front of a program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    pub version_string: [u8; 8],
    pub size: u64,
    pub start_address: u64,
    pub data_offset: u64,
    pub text_offset: u64,
}

impl ProgramHeader {
    pub fn new(start_address: u64, data_size: u64, text_size: u64) -> Self {
        let data_offset = HEADER_SIZE as u64;
        let text_offset = data_offset + data_size;
        ProgramHeader {
            version_string: *b"SCATHA\0\0",
            size: text_offset + text_size,
            start_address,
            data_offset,
            text_offset,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version_string);
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.start_address.to_le_bytes());
        out.extend_from_slice(&self.data_offset.to_le_bytes());
        out.extend_from_slice(&self.text_offset.to_le_bytes());
    }

    pub fn read_from(bytes: &[u8]) -> Result<Self, ProgramError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProgramError::Truncated);
        }
        let mut version_string = [0; 8];
        version_string.copy_from_slice(&bytes[0..8]);
        let read_u64 = |off: usize| {
            let mut buf = [0; 8];
            buf.copy_from_slice(&bytes[off..off + 8]);
            u64::from_le_bytes(buf)
        };
        Ok(ProgramHeader {
            version_string,
            size: read_u64(8),
            start_address: read_u64(16),
            data_offset: read_u64(24),
            text_offset: read_u64(32),
        })
    }
}

/// A validated, borrowed view of a program image, split into its sections.
#[derive(Debug, Clone, Copy)]
pub struct ProgramView<'a> {
    pub data: &'a [u8],
    pub text: &'a [u8],
    pub start_address: u64,
}

impl<'a> ProgramView<'a> {
    /// Validate the version byte and split the binary into data and text.
    pub fn new(program: &'a [u8]) -> Result<Self, ProgramError> {
        let header = ProgramHeader::read_from(program)?;
        if header.version_string[0] != GLOBAL_PROG_ID {
            return Err(ProgramError::BadVersion(header.version_string[0]));
        }
        let size = header.size as usize;
        let data_offset = header.data_offset as usize;
        let text_offset = header.text_offset as usize;
        if data_offset > text_offset || text_offset > size || size > program.len() {
            return Err(ProgramError::Truncated);
        }
        Ok(ProgramView {
            data: &program[data_offset..text_offset],
            text: &program[text_offset..size],
            start_address: header.start_address,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    /// The image is smaller than its header claims.
    Truncated,
    /// The first version byte does not match [`GLOBAL_PROG_ID`].
    BadVersion(u8),
}

impl std::fmt::Display for ProgramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramError::Truncated => write!(f, "truncated program image"),
            ProgramError::BadVersion(b) => {
                write!(f, "invalid program version byte 0x{:02X}", b)
            }
        }
    }
}

impl std::error::Error for ProgramError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_image(data: &[u8], text: &[u8], start: u64) -> Vec<u8> {
        let header = ProgramHeader::new(start, data.len() as u64, text.len() as u64);
        let mut image = Vec::new();
        header.write_to(&mut image);
        image.extend_from_slice(data);
        image.extend_from_slice(text);
        image
    }

    #[test]
    fn test_roundtrip() {
        let image = make_image(&[1, 2, 3], &[0xAA, 0xBB], 1);
        let view = ProgramView::new(&image).unwrap();
        assert_eq!(view.data, &[1, 2, 3]);
        assert_eq!(view.text, &[0xAA, 0xBB]);
        assert_eq!(view.start_address, 1);
    }

    #[test]
    fn test_bad_version_byte() {
        let mut image = make_image(&[], &[0x00], 0);
        image[0] = b'X';
        assert_eq!(
            ProgramView::new(&image),
            Err(ProgramError::BadVersion(b'X'))
        );
    }

    #[test]
    fn test_truncated_image() {
        let image = make_image(&[1, 2, 3, 4], &[], 0);
        assert!(matches!(
            ProgramView::new(&image[..10]),
            Err(ProgramError::Truncated)
        ));
    }
}

impl PartialEq for ProgramView<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
            && self.text == other.text
            && self.start_address == other.start_address
    }
}

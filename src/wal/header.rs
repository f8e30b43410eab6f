use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// "SILW" in ASCII.
const WAL_MAGIC: u32 = 0x5349_4C57;
pub const WAL_FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 16;

/// Fixed 16-byte segment header: magic, format version, 8 reserved bytes.
/// Written once when a segment is created; readers refuse unknown versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
}

impl Header {
    pub fn new() -> Self {
        Self {
            version: WAL_FORMAT_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut cursor = &mut buf[..];
            cursor.write_u32::<BigEndian>(WAL_MAGIC).unwrap();
            cursor.write_u32::<BigEndian>(self.version).unwrap();
        }
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut cursor = &buf[..];
        let magic = cursor.read_u32::<BigEndian>()?;
        if magic != WAL_MAGIC {
            return Err(Error::Corruption(format!(
                "bad WAL magic: {:#010x}",
                magic
            )));
        }
        let version = cursor.read_u32::<BigEndian>()?;
        if version != WAL_FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported WAL format version: {}",
                version
            )));
        }
        Ok(Self { version })
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let header = Header::new();
        let decoded = Header::decode(&header.encode()).expect("decode failed");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Header::new().encode();
        buf[0] = 0xFF;
        assert!(matches!(
            Header::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_unknown_version() {
        let mut buf = Header::new().encode();
        buf[7] = 0xFF;
        assert!(matches!(
            Header::decode(&buf),
            Err(Error::Corruption(_))
        ));
    }
}

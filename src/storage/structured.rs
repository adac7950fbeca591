//! Structured, checksummed file I/O.
//!
//! Every file the index persists is written through [`StructWriter`]: a
//! header (magic + version), a little-endian body, and a footer holding a
//! footer magic and the CRC32 of everything before the checksum. Readers
//! load the whole file, verify the footer with [`read_checked`] and parse the
//! body with [`StructReader`]. A truncated or bit-flipped file is reported as
//! [`TesseraError::Corrupt`], never silently parsed.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, TesseraError};
use crate::storage::{Storage, StorageOutput, read_file};
use crate::util::varint;

/// Magic number that opens every footer.
pub const FOOTER_MAGIC: u32 = 0xC028_93E8;

/// Footer length: footer magic + checksum.
pub const FOOTER_LENGTH: usize = 8;

/// A structured file writer for binary data.
#[derive(Debug)]
pub struct StructWriter {
    output: Box<dyn StorageOutput>,
    hasher: crc32fast::Hasher,
    position: u64,
}

impl StructWriter {
    /// Wrap an output.
    pub fn new(output: Box<dyn StorageOutput>) -> Self {
        StructWriter {
            output,
            hasher: crc32fast::Hasher::new(),
            position: 0,
        }
    }

    /// Create `name` in `storage` and wrap it.
    pub fn create(storage: &dyn Storage, name: &str) -> Result<Self> {
        Ok(Self::new(storage.create_output(name)?))
    }

    /// Write a file header.
    pub fn write_header(&mut self, magic: u32, version: u32) -> Result<()> {
        self.write_u32(magic)?;
        self.write_u32(version)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.output.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u32::<LittleEndian>(value)?;
        self.write_raw(&buf)
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u64::<LittleEndian>(value)?;
        self.write_raw(&buf)
    }

    /// Write an i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        let mut buf = Vec::with_capacity(8);
        buf.write_i64::<LittleEndian>(value)?;
        self.write_raw(&buf)
    }

    /// Write a variable-length encoded integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let bytes = varint::encode_u64(value);
        self.write_raw(&bytes)
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write a length-prefixed byte slice.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write the footer and close the output. Returns the checksum.
    pub fn close(mut self) -> Result<u32> {
        self.write_u32(FOOTER_MAGIC)?;
        let checksum = self.hasher.clone().finalize();
        self.output.write_u32::<LittleEndian>(checksum)?;
        self.output.close()?;
        Ok(checksum)
    }
}

/// Read `name` fully and verify its footer. Returns the bytes before the
/// footer.
pub fn read_checked(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut bytes = read_file(storage, name)?;
    let body_len = verify_footer(&bytes, name)?;
    bytes.truncate(body_len);
    Ok(bytes)
}

/// Verify the footer of an in-memory file image; returns the body length.
pub fn verify_footer(bytes: &[u8], name: &str) -> Result<usize> {
    if bytes.len() < FOOTER_LENGTH {
        return Err(TesseraError::corrupt(format!(
            "{name}: truncated file ({} bytes)",
            bytes.len()
        )));
    }
    let crc_start = bytes.len() - 4;
    let magic_start = crc_start - 4;

    let mut magic = &bytes[magic_start..crc_start];
    if magic.read_u32::<LittleEndian>()? != FOOTER_MAGIC {
        return Err(TesseraError::corrupt(format!("{name}: missing footer")));
    }

    let mut stored = &bytes[crc_start..];
    let expected = stored.read_u32::<LittleEndian>()?;
    let actual = crc32fast::hash(&bytes[..crc_start]);
    if expected != actual {
        return Err(TesseraError::corrupt(format!(
            "{name}: checksum mismatch (expected {expected:#010x}, actual {actual:#010x})"
        )));
    }
    Ok(magic_start)
}

/// A structured reader over a verified body.
#[derive(Debug)]
pub struct StructReader<R: Read> {
    reader: R,
    name: String,
}

impl<'a> StructReader<&'a [u8]> {
    /// Read from an in-memory body.
    pub fn from_slice(bytes: &'a [u8], name: &str) -> Self {
        StructReader {
            reader: bytes,
            name: name.to_string(),
        }
    }

    /// Whether the body is exhausted.
    pub fn is_eof(&self) -> bool {
        self.reader.is_empty()
    }
}

impl<R: Read> StructReader<R> {
    fn eof(&self, e: std::io::Error) -> TesseraError {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TesseraError::corrupt(format!("{}: unexpected end of file", self.name))
        } else {
            TesseraError::Io(e)
        }
    }

    /// Read and validate a file header. Returns the version.
    pub fn read_header(&mut self, magic: u32, min_version: u32, max_version: u32) -> Result<u32> {
        let actual = self.read_u32()?;
        if actual != magic {
            return Err(TesseraError::corrupt(format!(
                "{}: bad magic {actual:#010x}, expected {magic:#010x}",
                self.name
            )));
        }
        let version = self.read_u32()?;
        if version < min_version || version > max_version {
            return Err(TesseraError::corrupt(format!(
                "{}: unsupported version {version}",
                self.name
            )));
        }
        Ok(version)
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.reader.read_u8().map_err(|e| self.eof(e))
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        self.reader
            .read_u32::<LittleEndian>()
            .map_err(|e| self.eof(e))
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        self.reader
            .read_u64::<LittleEndian>()
            .map_err(|e| self.eof(e))
    }

    /// Read an i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        self.reader
            .read_i64::<LittleEndian>()
            .map_err(|e| self.eof(e))
    }

    /// Read a variable-length encoded integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        varint::read_u64(&mut self.reader).map_err(|e| match e {
            TesseraError::Io(io) => self.eof(io),
            other => other,
        })
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| TesseraError::corrupt(format!("{}: invalid UTF-8: {e}", self.name)))
    }

    /// Read a length-prefixed byte vector.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_varint()? as usize;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).map_err(|e| self.eof(e))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, write_file};

    #[test]
    fn test_struct_writer_reader() {
        let storage = MemoryStorage::new();

        let mut writer = StructWriter::create(&storage, "test.bin").unwrap();
        writer.write_header(0x5445_5354, 1).unwrap();
        writer.write_u8(42).unwrap();
        writer.write_u64(123_456_789).unwrap();
        writer.write_i64(-5).unwrap();
        writer.write_varint(300).unwrap();
        writer.write_string("Hello, World!").unwrap();
        writer.write_bytes(&[1, 2, 3]).unwrap();
        writer.close().unwrap();

        let body = read_checked(&storage, "test.bin").unwrap();
        let mut reader = StructReader::from_slice(&body, "test.bin");
        assert_eq!(reader.read_header(0x5445_5354, 1, 1).unwrap(), 1);
        assert_eq!(reader.read_u8().unwrap(), 42);
        assert_eq!(reader.read_u64().unwrap(), 123_456_789);
        assert_eq!(reader.read_i64().unwrap(), -5);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert_eq!(reader.read_string().unwrap(), "Hello, World!");
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        assert!(reader.is_eof());
    }

    #[test]
    fn test_corruption_is_detected() {
        let storage = MemoryStorage::new();
        let mut writer = StructWriter::create(&storage, "f").unwrap();
        writer.write_string("payload").unwrap();
        writer.close().unwrap();

        let mut bytes = read_file(&storage, "f").unwrap();
        bytes[2] ^= 0xff;
        write_file(&storage, "f", &bytes).unwrap();
        assert!(matches!(
            read_checked(&storage, "f"),
            Err(TesseraError::Corrupt(_))
        ));

        write_file(&storage, "g", &bytes[..5]).unwrap();
        assert!(matches!(
            read_checked(&storage, "g"),
            Err(TesseraError::Corrupt(_))
        ));
    }

    #[test]
    fn test_truncated_body_reports_corrupt() {
        let body = [5u8, b'a', b'b'];
        let mut reader = StructReader::from_slice(&body, "short");
        assert!(matches!(reader.read_string(), Err(TesseraError::Corrupt(_))));
    }

    #[test]
    fn test_bad_header() {
        let storage = MemoryStorage::new();
        let mut writer = StructWriter::create(&storage, "h").unwrap();
        writer.write_header(1, 7).unwrap();
        writer.close().unwrap();

        let body = read_checked(&storage, "h").unwrap();
        let mut reader = StructReader::from_slice(&body, "h");
        assert!(reader.read_header(2, 1, 7).is_err());
    }
}

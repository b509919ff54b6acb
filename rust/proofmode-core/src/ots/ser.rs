//! Binary serialization contexts used by the OpenTimestamps formats.
//!
//! Integers are unsigned LEB128 ("varuint"): seven data bits per byte, the
//! high bit set on every byte except the last. Byte strings are a varuint
//! length followed by the raw bytes.

use super::errors::DeserializeError;
use std::io::{self, Read, Write};

pub struct Serializer<W: Write> {
    writer: W,
}

impl<W: Write> Serializer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn write_byte(&mut self, b: u8) -> io::Result<()> {
        self.writer.write_all(&[b])
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)
    }

    pub fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_byte(if value { 0xff } else { 0x00 })
    }

    pub fn write_varuint(&mut self, mut value: u64) -> io::Result<()> {
        if value == 0 {
            return self.write_byte(0x00);
        }
        while value != 0 {
            let mut b = (value & 0x7f) as u8;
            if value > 0x7f {
                b |= 0x80;
            }
            self.write_byte(b)?;
            value >>= 7;
        }
        Ok(())
    }

    pub fn write_varbytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_varuint(bytes.len() as u64)?;
        self.write_bytes(bytes)
    }
}

pub struct Deserializer<R: Read> {
    reader: R,
}

impl<R: Read> Deserializer<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    pub fn read_byte(&mut self) -> Result<u8, DeserializeError> {
        let mut b = [0u8; 1];
        self.reader.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, DeserializeError> {
        let mut buf = vec![0u8; n];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DeserializeError> {
        let mut buf = [0u8; N];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_bool(&mut self) -> Result<bool, DeserializeError> {
        match self.read_byte()? {
            0xff => Ok(true),
            0x00 => Ok(false),
            other => Err(DeserializeError::InvalidBool(other)),
        }
    }

    pub fn read_varuint(&mut self) -> Result<u64, DeserializeError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.read_byte()?;
            let chunk = (b & 0x7f) as u64;
            if shift >= 64 || (shift > 0 && chunk >> (64 - shift) != 0) {
                return Err(DeserializeError::VarintOverflow);
            }
            value |= chunk << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_varbytes(&mut self, max_len: usize) -> Result<Vec<u8>, DeserializeError> {
        self.read_varbytes_min(0, max_len)
    }

    pub fn read_varbytes_min(
        &mut self,
        min_len: usize,
        max_len: usize,
    ) -> Result<Vec<u8>, DeserializeError> {
        let len = self.read_varuint()?;
        if len > max_len as u64 || len < min_len as u64 {
            return Err(DeserializeError::LengthOutOfRange {
                len,
                min: min_len,
                max: max_len,
            });
        }
        self.read_bytes(len as usize)
    }

    pub fn assert_magic(&mut self, expected: &[u8]) -> Result<(), DeserializeError> {
        let actual = self.read_bytes(expected.len()).map_err(|e| match e {
            DeserializeError::UnexpectedEof => DeserializeError::BadMagic,
            other => other,
        })?;
        if actual != expected {
            return Err(DeserializeError::BadMagic);
        }
        Ok(())
    }

    pub fn assert_eof(&mut self) -> Result<(), DeserializeError> {
        let mut b = [0u8; 1];
        loop {
            match self.reader.read(&mut b) {
                Ok(0) => return Ok(()),
                Ok(_) => return Err(DeserializeError::TrailingGarbage),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl<'a> Deserializer<&'a [u8]> {
    pub fn from_slice(data: &'a [u8]) -> Self {
        Self::new(data)
    }
}

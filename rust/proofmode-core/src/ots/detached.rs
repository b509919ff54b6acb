use super::errors::{DeserializeError, TimestampError};
use super::op::Op;
use super::ser::{Deserializer, Serializer};
use super::timestamp::Timestamp;
use std::io::{Read, Write};

pub const HEADER_MAGIC: &[u8; 31] =
    b"\x00OpenTimestamps\x00\x00Proof\x00\xbf\x89\xe2\xe8\x84\xe8\x92\x94";
pub const MAJOR_VERSION: u64 = 1;

/// A `.ots` file: the timestamp of a file digest plus the hash op that
/// produced the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedTimestampFile {
    file_hash_op: Op,
    timestamp: Timestamp,
}

impl DetachedTimestampFile {
    pub fn new(file_hash_op: Op, timestamp: Timestamp) -> Result<Self, TimestampError> {
        match file_hash_op.digest_len() {
            Some(len) if len == timestamp.msg().len() => Ok(Self {
                file_hash_op,
                timestamp,
            }),
            _ => Err(TimestampError::MsgMismatch),
        }
    }

    pub fn from_sha256(timestamp: Timestamp) -> Result<Self, TimestampError> {
        Self::new(Op::Sha256, timestamp)
    }

    pub fn file_hash_op(&self) -> &Op {
        &self.file_hash_op
    }

    pub fn file_digest(&self) -> &[u8] {
        self.timestamp.msg()
    }

    pub fn timestamp(&self) -> &Timestamp {
        &self.timestamp
    }

    pub fn timestamp_mut(&mut self) -> &mut Timestamp {
        &mut self.timestamp
    }

    pub fn into_timestamp(self) -> Timestamp {
        self.timestamp
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), TimestampError> {
        let mut ser = Serializer::new(writer);
        ser.write_bytes(HEADER_MAGIC)?;
        ser.write_varuint(MAJOR_VERSION)?;
        self.file_hash_op.serialize(&mut ser)?;
        ser.write_bytes(self.timestamp.msg())?;
        self.timestamp.serialize(&mut ser)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TimestampError> {
        let mut out = Vec::new();
        self.write_to(&mut out)?;
        Ok(out)
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, DeserializeError> {
        let mut de = Deserializer::new(reader);
        de.assert_magic(HEADER_MAGIC)?;

        let major = de.read_varuint()?;
        if major != MAJOR_VERSION {
            return Err(DeserializeError::BadMajorVersion(major));
        }

        let tag = de.read_byte()?;
        let file_hash_op = Op::hash_op_from_tag(tag).ok_or(DeserializeError::UnknownHashOp(tag))?;
        let digest_len = file_hash_op
            .digest_len()
            .ok_or(DeserializeError::UnknownHashOp(tag))?;
        let digest = de.read_bytes(digest_len)?;

        let timestamp = Timestamp::deserialize(&mut de, digest)?;
        de.assert_eof()?;

        Ok(Self {
            file_hash_op,
            timestamp,
        })
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DeserializeError> {
        Self::read_from(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ots::attestation::Attestation;

    fn sample() -> DetachedTimestampFile {
        let mut stamp = Timestamp::new(vec![0x11u8; 32]);
        stamp
            .add_op(Op::Append(vec![0xaa; 16]))
            .unwrap()
            .add_op(Op::Sha256)
            .unwrap()
            .add_attestation(Attestation::Pending {
                uri: "https://alice.btc.calendar.opentimestamps.org".into(),
            });
        DetachedTimestampFile::from_sha256(stamp).unwrap()
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().to_bytes().unwrap();
        assert_eq!(&bytes[..31], HEADER_MAGIC);
        assert_eq!(bytes[31], 0x01);
        assert_eq!(bytes[32], 0x08);
        assert_eq!(&bytes[33..65], &[0x11u8; 32]);
    }

    #[test]
    fn test_roundtrip() {
        let file = sample();
        let bytes = file.to_bytes().unwrap();
        let parsed = DetachedTimestampFile::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, file);
        assert_eq!(parsed.file_digest(), &[0x11u8; 32]);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[1] = b'X';
        assert!(matches!(
            DetachedTimestampFile::from_bytes(&bytes),
            Err(DeserializeError::BadMagic)
        ));
    }

    #[test]
    fn test_bad_version_and_hash_op() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[31] = 0x02;
        assert!(matches!(
            DetachedTimestampFile::from_bytes(&bytes),
            Err(DeserializeError::BadMajorVersion(2))
        ));

        let mut bytes = sample().to_bytes().unwrap();
        bytes[32] = 0xf0;
        assert!(matches!(
            DetachedTimestampFile::from_bytes(&bytes),
            Err(DeserializeError::UnknownHashOp(0xf0))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes.extend_from_slice(b"junk");
        assert!(matches!(
            DetachedTimestampFile::from_bytes(&bytes),
            Err(DeserializeError::TrailingGarbage)
        ));
    }

    #[test]
    fn test_digest_length_must_match_hash_op() {
        let stamp = Timestamp::new(vec![0u8; 20]);
        assert!(DetachedTimestampFile::from_sha256(stamp.clone()).is_err());
        assert!(DetachedTimestampFile::new(Op::Ripemd160, stamp).is_ok());
    }
}

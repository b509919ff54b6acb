use super::errors::{DeserializeError, OpError};
use super::ser::{Deserializer, Serializer};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read, Write};

pub const MAX_MSG_LENGTH: usize = 4096;
pub const MAX_RESULT_LENGTH: usize = 4096;
const MAX_HEXLIFY_MSG_LENGTH: usize = MAX_RESULT_LENGTH / 2;

pub const TAG_RIPEMD160: u8 = 0x03;
pub const TAG_SHA256: u8 = 0x08;
pub const TAG_KECCAK256: u8 = 0x67;
pub const TAG_APPEND: u8 = 0xf0;
pub const TAG_PREPEND: u8 = 0xf1;
pub const TAG_REVERSE: u8 = 0xf2;
pub const TAG_HEXLIFY: u8 = 0xf3;

/// An edge of a timestamp tree: a pure function from one message to the next.
///
/// Equality, hashing and ordering all follow the serialized `tag || arg`
/// bytes, so two ops that would serialize identically are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Op {
    Ripemd160,
    Sha256,
    Keccak256,
    Append(Vec<u8>),
    Prepend(Vec<u8>),
    Reverse,
    Hexlify,
}

impl Op {
    pub fn tag(&self) -> u8 {
        match self {
            Op::Ripemd160 => TAG_RIPEMD160,
            Op::Sha256 => TAG_SHA256,
            Op::Keccak256 => TAG_KECCAK256,
            Op::Append(_) => TAG_APPEND,
            Op::Prepend(_) => TAG_PREPEND,
            Op::Reverse => TAG_REVERSE,
            Op::Hexlify => TAG_HEXLIFY,
        }
    }

    pub fn arg(&self) -> &[u8] {
        match self {
            Op::Append(arg) | Op::Prepend(arg) => arg,
            _ => &[],
        }
    }

    pub fn is_hash(&self) -> bool {
        matches!(self, Op::Ripemd160 | Op::Sha256 | Op::Keccak256)
    }

    /// Digest length produced by a hash op.
    pub fn digest_len(&self) -> Option<usize> {
        match self {
            Op::Ripemd160 => Some(20),
            Op::Sha256 | Op::Keccak256 => Some(32),
            _ => None,
        }
    }

    pub fn hash_op_from_tag(tag: u8) -> Option<Op> {
        match tag {
            TAG_RIPEMD160 => Some(Op::Ripemd160),
            TAG_SHA256 => Some(Op::Sha256),
            TAG_KECCAK256 => Some(Op::Keccak256),
            _ => None,
        }
    }

    pub fn apply(&self, msg: &[u8]) -> Result<Vec<u8>, OpError> {
        let limit = match self {
            Op::Hexlify => MAX_HEXLIFY_MSG_LENGTH,
            _ => MAX_MSG_LENGTH,
        };
        if msg.len() > limit {
            return Err(OpError::MsgTooLong(msg.len()));
        }

        let result = match self {
            Op::Ripemd160 => Ripemd160::digest(msg).to_vec(),
            Op::Sha256 => Sha256::digest(msg).to_vec(),
            Op::Keccak256 => Keccak256::digest(msg).to_vec(),
            Op::Append(arg) => {
                if arg.is_empty() {
                    return Err(OpError::EmptyArgument);
                }
                let mut out = Vec::with_capacity(msg.len() + arg.len());
                out.extend_from_slice(msg);
                out.extend_from_slice(arg);
                out
            }
            Op::Prepend(arg) => {
                if arg.is_empty() {
                    return Err(OpError::EmptyArgument);
                }
                let mut out = Vec::with_capacity(msg.len() + arg.len());
                out.extend_from_slice(arg);
                out.extend_from_slice(msg);
                out
            }
            Op::Reverse => msg.iter().rev().copied().collect(),
            Op::Hexlify => hex::encode(msg).into_bytes(),
        };

        if result.len() > MAX_RESULT_LENGTH {
            return Err(OpError::ResultTooLong(result.len()));
        }
        Ok(result)
    }

    pub fn serialize<W: Write>(&self, ser: &mut Serializer<W>) -> io::Result<()> {
        ser.write_byte(self.tag())?;
        match self {
            Op::Append(arg) | Op::Prepend(arg) => ser.write_varbytes(arg),
            _ => Ok(()),
        }
    }

    pub fn deserialize_with_tag<R: Read>(
        de: &mut Deserializer<R>,
        tag: u8,
    ) -> Result<Op, DeserializeError> {
        let op = match tag {
            TAG_RIPEMD160 => Op::Ripemd160,
            TAG_SHA256 => Op::Sha256,
            TAG_KECCAK256 => Op::Keccak256,
            TAG_APPEND => Op::Append(de.read_varbytes_min(1, MAX_RESULT_LENGTH)?),
            TAG_PREPEND => Op::Prepend(de.read_varbytes_min(1, MAX_RESULT_LENGTH)?),
            TAG_REVERSE => Op::Reverse,
            TAG_HEXLIFY => Op::Hexlify,
            other => return Err(DeserializeError::UnknownOp(other)),
        };
        Ok(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Ripemd160 => "ripemd160",
            Op::Sha256 => "sha256",
            Op::Keccak256 => "keccak256",
            Op::Append(_) => "append",
            Op::Prepend(_) => "prepend",
            Op::Reverse => "reverse",
            Op::Hexlify => "hexlify",
        }
    }
}

impl Ord for Op {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag()
            .cmp(&other.tag())
            .then_with(|| self.arg().cmp(other.arg()))
    }
}

impl PartialOrd for Op {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Append(arg) | Op::Prepend(arg) => write!(f, "{} {}", self.name(), hex::encode(arg)),
            _ => f.write_str(self.name()),
        }
    }
}

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("op: message of {0} bytes exceeds the input limit")]
    MsgTooLong(usize),
    #[error("op: result of {0} bytes exceeds the output limit")]
    ResultTooLong(usize),
    #[error("op: binary operation needs a non-empty argument")]
    EmptyArgument,
}

#[derive(Debug, Error)]
pub enum DeserializeError {
    #[error("ots: unexpected end of data")]
    UnexpectedEof,
    #[error("ots: bad magic bytes")]
    BadMagic,
    #[error("ots: trailing bytes after end of structure")]
    TrailingGarbage,
    #[error("ots: varuint does not fit in 64 bits")]
    VarintOverflow,
    #[error("ots: length {len} outside allowed range {min}..={max}")]
    LengthOutOfRange { len: u64, min: usize, max: usize },
    #[error("ots: invalid bool byte {0:#04x}")]
    InvalidBool(u8),
    #[error("ots: unknown operation tag {0:#04x}")]
    UnknownOp(u8),
    #[error("ots: unknown file hash operation tag {0:#04x}")]
    UnknownHashOp(u8),
    #[error("ots: unsupported major version {0}")]
    BadMajorVersion(u64),
    #[error("ots: timestamp nesting exceeds recursion limit")]
    RecursionLimit,
    #[error("ots: invalid calendar uri {0:?}")]
    InvalidUri(String),
    #[error("ots: {0}")]
    Op(#[from] OpError),
    #[error("ots: io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for DeserializeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            DeserializeError::UnexpectedEof
        } else {
            DeserializeError::Io(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("timestamp: cannot merge timestamps for different messages")]
    MsgMismatch,
    #[error("timestamp: an empty timestamp cannot be serialized")]
    EmptyTimestamp,
    #[error("timestamp: no attestations reachable")]
    NoAttestations,
    #[error("timestamp: merkle tree needs at least one digest")]
    EmptyMerkleInput,
    #[error("timestamp: {0}")]
    Op(#[from] OpError),
    #[error("timestamp: io error: {0}")]
    Io(#[from] std::io::Error),
}

use super::errors::DeserializeError;
use super::ser::{Deserializer, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read, Write};

pub const TAG_SIZE: usize = 8;
pub const MAX_PAYLOAD_SIZE: usize = 8192;
pub const MAX_URI_LENGTH: usize = 1000;

pub const PENDING_TAG: [u8; TAG_SIZE] = [0x83, 0xdf, 0xe3, 0x0d, 0x2e, 0xf9, 0x0c, 0x8e];
pub const BITCOIN_TAG: [u8; TAG_SIZE] = [0x05, 0x88, 0x96, 0x0d, 0x73, 0xd7, 0x19, 0x01];
pub const LITECOIN_TAG: [u8; TAG_SIZE] = [0x06, 0x86, 0x9a, 0x0d, 0x73, 0xd7, 0x1b, 0x45];
pub const ETHEREUM_TAG: [u8; TAG_SIZE] = [0x30, 0xfe, 0x80, 0x87, 0xb5, 0xc7, 0xea, 0xd7];

const ALLOWED_URI_CHARS: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._/:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Bitcoin,
    Litecoin,
    Ethereum,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Bitcoin => f.write_str("Bitcoin"),
            Chain::Litecoin => f.write_str("Litecoin"),
            Chain::Ethereum => f.write_str("Ethereum"),
        }
    }
}

/// A claim that the message at this node existed at some point in time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attestation {
    Pending { uri: String },
    BitcoinBlockHeader { height: u64 },
    LitecoinBlockHeader { height: u64 },
    EthereumBlockHeader { height: u64 },
    Unknown { tag: [u8; TAG_SIZE], payload: Vec<u8> },
}

impl Attestation {
    pub fn tag(&self) -> [u8; TAG_SIZE] {
        match self {
            Attestation::Pending { .. } => PENDING_TAG,
            Attestation::BitcoinBlockHeader { .. } => BITCOIN_TAG,
            Attestation::LitecoinBlockHeader { .. } => LITECOIN_TAG,
            Attestation::EthereumBlockHeader { .. } => ETHEREUM_TAG,
            Attestation::Unknown { tag, .. } => *tag,
        }
    }

    /// Chain and block height for block header attestations.
    pub fn block(&self) -> Option<(Chain, u64)> {
        match self {
            Attestation::BitcoinBlockHeader { height } => Some((Chain::Bitcoin, *height)),
            Attestation::LitecoinBlockHeader { height } => Some((Chain::Litecoin, *height)),
            Attestation::EthereumBlockHeader { height } => Some((Chain::Ethereum, *height)),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Attestation::Pending { .. })
    }

    pub fn payload(&self) -> Vec<u8> {
        let mut ser = Serializer::new(Vec::new());
        match self {
            Attestation::Pending { uri } => ser.write_varbytes(uri.as_bytes()),
            Attestation::BitcoinBlockHeader { height }
            | Attestation::LitecoinBlockHeader { height }
            | Attestation::EthereumBlockHeader { height } => ser.write_varuint(*height),
            Attestation::Unknown { payload, .. } => ser.write_bytes(payload),
        }
        .expect("writes to Vec are infallible");
        ser.into_inner()
    }

    pub fn serialize<W: Write>(&self, ser: &mut Serializer<W>) -> io::Result<()> {
        ser.write_bytes(&self.tag())?;
        ser.write_varbytes(&self.payload())
    }

    pub fn deserialize<R: Read>(de: &mut Deserializer<R>) -> Result<Self, DeserializeError> {
        let tag: [u8; TAG_SIZE] = de.read_fixed()?;
        let payload = de.read_varbytes(MAX_PAYLOAD_SIZE)?;
        let mut inner = Deserializer::from_slice(&payload);

        let attestation = match tag {
            PENDING_TAG => {
                let raw = inner.read_varbytes(MAX_URI_LENGTH)?;
                Attestation::Pending {
                    uri: validate_uri(raw)?,
                }
            }
            BITCOIN_TAG => Attestation::BitcoinBlockHeader {
                height: inner.read_varuint()?,
            },
            LITECOIN_TAG => Attestation::LitecoinBlockHeader {
                height: inner.read_varuint()?,
            },
            ETHEREUM_TAG => Attestation::EthereumBlockHeader {
                height: inner.read_varuint()?,
            },
            _ => return Ok(Attestation::Unknown { tag, payload }),
        };
        inner.assert_eof()?;
        Ok(attestation)
    }
}

fn validate_uri(raw: Vec<u8>) -> Result<String, DeserializeError> {
    if let Some(bad) = raw.iter().find(|b| !ALLOWED_URI_CHARS.contains(b)) {
        return Err(DeserializeError::InvalidUri(format!(
            "{} (byte {:#04x})",
            String::from_utf8_lossy(&raw),
            bad
        )));
    }
    // All allowed characters are ASCII.
    String::from_utf8(raw).map_err(|e| DeserializeError::InvalidUri(e.to_string()))
}

impl Ord for Attestation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag()
            .cmp(&other.tag())
            .then_with(|| match (self, other) {
                (
                    Attestation::BitcoinBlockHeader { height: a },
                    Attestation::BitcoinBlockHeader { height: b },
                )
                | (
                    Attestation::LitecoinBlockHeader { height: a },
                    Attestation::LitecoinBlockHeader { height: b },
                )
                | (
                    Attestation::EthereumBlockHeader { height: a },
                    Attestation::EthereumBlockHeader { height: b },
                ) => a.cmp(b),
                _ => self.payload().cmp(&other.payload()),
            })
    }
}

impl PartialOrd for Attestation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attestation::Pending { uri } => write!(f, "PendingAttestation('{}')", uri),
            Attestation::BitcoinBlockHeader { height } => {
                write!(f, "BitcoinBlockHeaderAttestation({})", height)
            }
            Attestation::LitecoinBlockHeader { height } => {
                write!(f, "LitecoinBlockHeaderAttestation({})", height)
            }
            Attestation::EthereumBlockHeader { height } => {
                write!(f, "EthereumBlockHeaderAttestation({})", height)
            }
            Attestation::Unknown { tag, payload } => write!(
                f,
                "UnknownAttestation({}, {})",
                hex::encode(tag),
                hex::encode(payload)
            ),
        }
    }
}

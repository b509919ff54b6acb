//! OpenTimestamps: the proof tree, its binary format, calendar submission
//! and blockchain verification.

pub mod attestation;
pub mod calendar;
pub mod chain;
pub mod detached;
mod errors;
pub mod merkle;
pub mod op;
pub mod ser;
pub mod stamp;
pub mod timestamp;

pub use attestation::{Attestation, Chain};
pub use calendar::{Calendar, CalendarError, RemoteCalendar, UrlWhitelist};
pub use chain::{
    verify_timestamp, BlockHeaderSource, ChainError, ChainVerifier, TimestampVerification,
    TrustLevel, VerifiedAttestation,
};
pub use detached::DetachedTimestampFile;
pub use errors::{DeserializeError, OpError, TimestampError};
pub use merkle::{make_merkle_tree, MerkleTree};
pub use op::Op;
pub use stamp::{upgrade_timestamp, RemoteResolver, StampError, Stamper, UpgradeReport};
pub use timestamp::Timestamp;

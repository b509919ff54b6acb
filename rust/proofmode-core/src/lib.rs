pub mod anchors;
pub mod bundle;
pub mod config;
pub mod hashing;
pub mod orchestrator;
pub mod ots;
pub mod record;
pub mod signing;

// Re-export common types
pub use crate::anchors::{NotarizationProvider, NotarizeError, OtsNotarizer, ProviderRegistry};
pub use crate::bundle::{
    discover_digest, verify_bundle, BundleError, BundleFailure, BundleVerification, ProofWriter,
};
pub use crate::config::ProofModeConfig;
pub use crate::orchestrator::{GeneratedProof, ProofModeOrchestrator, StampedFile};
pub use crate::record::{MetadataSource, ProofRecord, ProofRecordBuilder, StaticMetadata};
pub use crate::signing::{DetachedSignature, FileKeystore, Keystore, KeystoreError, SigningError};

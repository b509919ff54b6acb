//! Proof bundles: one directory per media digest holding the signed proof
//! records, the media signature, the signer's public key and any
//! notarizations.

mod verifier;
mod writer;

pub use verifier::{discover_digest, verify_bundle, BundleFailure, BundleVerification, OtsCheck};
pub use writer::{ProofOutcome, ProofWriter};

use crate::signing::{KeystoreError, SigningError};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub const PUBLIC_KEY_NAME: &str = "pubkey.asc";
pub const CSV_SUFFIX: &str = ".proof.csv";
pub const JSON_SUFFIX: &str = ".proof.json";
pub const SIGNATURE_SUFFIX: &str = ".asc";
pub const OTS_EXTENSION: &str = "ots";

pub fn media_signature_name(hash: &str) -> String {
    format!("{hash}{SIGNATURE_SUFFIX}")
}

pub fn csv_name(hash: &str) -> String {
    format!("{hash}{CSV_SUFFIX}")
}

pub fn csv_signature_name(hash: &str) -> String {
    format!("{hash}{CSV_SUFFIX}{SIGNATURE_SUFFIX}")
}

pub fn json_name(hash: &str) -> String {
    format!("{hash}{JSON_SUFFIX}")
}

pub fn json_signature_name(hash: &str) -> String {
    format!("{hash}{JSON_SUFFIX}{SIGNATURE_SUFFIX}")
}

pub fn notarization_name(hash: &str, extension: &str) -> String {
    format!("{hash}.{extension}")
}

/// The files a bundle is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    MediaSignature,
    ProofRecordCsv,
    ProofRecordCsvSignature,
    ProofRecordJson,
    ProofRecordJsonSignature,
    PublicKey,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryKind::MediaSignature => "media signature",
            EntryKind::ProofRecordCsv => "proof record (csv)",
            EntryKind::ProofRecordCsvSignature => "proof record signature (csv)",
            EntryKind::ProofRecordJson => "proof record (json)",
            EntryKind::ProofRecordJsonSignature => "proof record signature (json)",
            EntryKind::PublicKey => "public key",
        };
        f.write_str(name)
    }
}

/// The write step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStep {
    AppendCsv,
    AppendJson,
    SignCsv,
    SignJson,
    SignMedia,
    WritePublicKey,
}

impl fmt::Display for BundleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BundleStep::AppendCsv => "append csv record",
            BundleStep::AppendJson => "append json record",
            BundleStep::SignCsv => "sign csv record",
            BundleStep::SignJson => "sign json record",
            BundleStep::SignMedia => "sign media",
            BundleStep::WritePublicKey => "write public key",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("proof incomplete at step '{step}': {source}")]
    Incomplete {
        step: BundleStep,
        #[source]
        source: Box<BundleError>,
    },
    #[error("record encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error("no proof record found in {0}")]
    NoProofRecord(PathBuf),
    #[error("invalid notarization extension '{0}'")]
    InvalidExtension(String),
}

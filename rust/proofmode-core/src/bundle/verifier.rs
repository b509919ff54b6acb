use super::{
    csv_name, csv_signature_name, json_name, json_signature_name, media_signature_name,
    BundleError, EntryKind, CSV_SUFFIX, OTS_EXTENSION, PUBLIC_KEY_NAME, SIGNATURE_SUFFIX,
};
use crate::hashing::{parse_digest, sha256_reader, Digest32};
use crate::ots::DetachedTimestampFile;
use crate::signing::{fingerprint, keystore::parse_public_key, verify, DetachedSignature};
use pgp::SignedPublicKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Why a bundle did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "entry", rename_all = "snake_case")]
pub enum BundleFailure {
    MissingEntry(EntryKind),
    MalformedEntry(EntryKind),
    RecordSignatureCsvInvalid,
    RecordSignatureJsonInvalid,
    MediaSignatureInvalid,
    DigestMismatch,
}

impl fmt::Display for BundleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleFailure::MissingEntry(kind) => write!(f, "missing {kind}"),
            BundleFailure::MalformedEntry(kind) => write!(f, "malformed {kind}"),
            BundleFailure::RecordSignatureCsvInvalid => {
                f.write_str("proof record signature (csv) does not verify")
            }
            BundleFailure::RecordSignatureJsonInvalid => {
                f.write_str("proof record signature (json) does not verify")
            }
            BundleFailure::MediaSignatureInvalid => f.write_str("media signature does not verify"),
            BundleFailure::DigestMismatch => f.write_str("media digest does not match the bundle"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OtsCheck {
    pub path: PathBuf,
    /// False when the file could not be parsed either.
    pub digest_matches: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleVerification {
    pub digest: String,
    pub verified: bool,
    pub failure: Option<BundleFailure>,
    pub signer_fingerprint: Option<String>,
    /// Extensions of the `<hash>.<ext>` notarization files, sorted.
    pub notarizations: Vec<String>,
    pub ots: Vec<OtsCheck>,
}

impl BundleVerification {
    fn new(digest: &str) -> Self {
        Self {
            digest: digest.to_string(),
            verified: false,
            failure: None,
            signer_fingerprint: None,
            notarizations: Vec::new(),
            ots: Vec::new(),
        }
    }

    fn fail(mut self, failure: BundleFailure) -> Self {
        log::warn!("Bundle {} failed verification: {failure}", self.digest);
        self.failure = Some(failure);
        self
    }
}

/// Finds the bundle digest from the `<hash>.proof.csv` entry in `dir`.
pub fn discover_digest(dir: &Path) -> Result<String, BundleError> {
    let mut found = None;
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(hash) = name.strip_suffix(CSV_SUFFIX) {
            if parse_digest(hash).is_some() {
                found = Some(hash.to_ascii_lowercase());
                break;
            }
        }
    }
    found.ok_or_else(|| BundleError::NoProofRecord(dir.to_path_buf()))
}

/// Checks the bundle in `dir` against the media at `media`.
///
/// Verification failures are reported in the result. `Err` is reserved for
/// I/O trouble outside the bundle, such as an unreadable media file.
pub fn verify_bundle(
    dir: &Path,
    digest_hex: &str,
    media: &Path,
) -> Result<BundleVerification, BundleError> {
    let hash = digest_hex.to_ascii_lowercase();
    let mut result = BundleVerification::new(&hash);
    let Some(digest) = parse_digest(&hash) else {
        return Ok(result.fail(BundleFailure::DigestMismatch));
    };

    if dir.is_dir() {
        let (notarizations, ots) = scan_notarizations(dir, &hash, &digest)?;
        result.notarizations = notarizations;
        result.ots = ots;
    }

    let media_sig_path = dir.join(media_signature_name(&hash));
    let csv_path = dir.join(csv_name(&hash));
    let csv_sig_path = dir.join(csv_signature_name(&hash));
    let pubkey_path = dir.join(PUBLIC_KEY_NAME);
    for (path, kind) in [
        (&media_sig_path, EntryKind::MediaSignature),
        (&csv_path, EntryKind::ProofRecordCsv),
        (&csv_sig_path, EntryKind::ProofRecordCsvSignature),
        (&pubkey_path, EntryKind::PublicKey),
    ] {
        if !path.is_file() {
            return Ok(result.fail(BundleFailure::MissingEntry(kind)));
        }
    }

    let Some(public_key) = fs::read_to_string(&pubkey_path)
        .ok()
        .and_then(|armored| parse_public_key(&armored).ok())
    else {
        return Ok(result.fail(BundleFailure::MalformedEntry(EntryKind::PublicKey)));
    };
    if let Ok(fp) = fingerprint(&public_key) {
        result.signer_fingerprint = Some(hex::encode(fp));
    }

    match check_signature(&csv_path, &csv_sig_path, &public_key)? {
        Check::Valid => {}
        Check::Invalid => return Ok(result.fail(BundleFailure::RecordSignatureCsvInvalid)),
        Check::Malformed => {
            return Ok(result.fail(BundleFailure::MalformedEntry(
                EntryKind::ProofRecordCsvSignature,
            )))
        }
    }

    let json_path = dir.join(json_name(&hash));
    if json_path.is_file() {
        let json_sig_path = dir.join(json_signature_name(&hash));
        if !json_sig_path.is_file() {
            return Ok(result.fail(BundleFailure::MissingEntry(
                EntryKind::ProofRecordJsonSignature,
            )));
        }
        match check_signature(&json_path, &json_sig_path, &public_key)? {
            Check::Valid => {}
            Check::Invalid => return Ok(result.fail(BundleFailure::RecordSignatureJsonInvalid)),
            Check::Malformed => {
                return Ok(result.fail(BundleFailure::MalformedEntry(
                    EntryKind::ProofRecordJsonSignature,
                )))
            }
        }
    }

    // One pass over the media feeds both the signature check and the digest.
    let Some(media_sig) = read_signature(&media_sig_path)? else {
        return Ok(result.fail(BundleFailure::MalformedEntry(EntryKind::MediaSignature)));
    };
    let mut hasher = Sha256::new();
    let tee = TeeReader {
        inner: File::open(media)?,
        hasher: &mut hasher,
    };
    let media_ok = verify(tee, &media_sig, &public_key)?;
    let media_digest: Digest32 = hasher.finalize().into();

    if !media_ok {
        return Ok(result.fail(BundleFailure::MediaSignatureInvalid));
    }
    if media_digest != digest {
        return Ok(result.fail(BundleFailure::DigestMismatch));
    }

    log::info!("Bundle {hash} verified");
    result.verified = true;
    Ok(result)
}

enum Check {
    Valid,
    Invalid,
    Malformed,
}

fn read_signature(path: &Path) -> Result<Option<DetachedSignature>, BundleError> {
    let bytes = fs::read(path)?;
    Ok(DetachedSignature::from_any(&bytes).ok())
}

fn check_signature(
    content: &Path,
    signature: &Path,
    public_key: &SignedPublicKey,
) -> Result<Check, BundleError> {
    let Some(signature) = read_signature(signature)? else {
        return Ok(Check::Malformed);
    };
    let file = File::open(content)?;
    Ok(if verify(file, &signature, public_key)? {
        Check::Valid
    } else {
        Check::Invalid
    })
}

fn scan_notarizations(
    dir: &Path,
    hash: &str,
    digest: &Digest32,
) -> Result<(Vec<String>, Vec<OtsCheck>), BundleError> {
    let prefix = format!("{hash}.");
    let mut extensions = Vec::new();
    let mut ots = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(ext) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        if ext.contains('.') || ext == SIGNATURE_SUFFIX.trim_start_matches('.') {
            continue;
        }
        if ext == OTS_EXTENSION {
            let path = entry.path();
            let digest_matches = fs::read(&path)
                .ok()
                .and_then(|bytes| DetachedTimestampFile::from_bytes(&bytes).ok())
                .is_some_and(|file| file.file_digest() == digest.as_slice());
            if !digest_matches {
                log::warn!("{} does not timestamp this bundle", path.display());
            }
            ots.push(OtsCheck {
                path,
                digest_matches,
            });
        }
        extensions.push(ext.to_string());
    }

    extensions.sort();
    Ok((extensions, ots))
}

struct TeeReader<'a, R> {
    inner: R,
    hasher: &'a mut Sha256,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

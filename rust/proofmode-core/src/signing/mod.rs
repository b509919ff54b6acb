//! OpenPGP detached signatures over arbitrary byte streams.
//!
//! A signature is a v4 "binary document" signature packet (RSA over
//! SHA-256) with a hashed creation time and the issuer key id, stored in the
//! `-----BEGIN PGP SIGNATURE-----` armor so that any OpenPGP verifier can
//! check a bundle against `pubkey.asc`.

pub mod keystore;

use chrono::{DateTime, SubsecRound, Utc};
use pgp::crypto::hash::HashAlgorithm;
use pgp::packet::{SignatureConfig, SignatureType, SignatureVersion, Subpacket, SubpacketData};
use pgp::ser::Serialize;
use pgp::types::{PublicKeyTrait, SecretKeyTrait};
use pgp::{ArmorOptions, Deserializable, SignedPublicKey, SignedSecretKey, StandaloneSignature};
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use thiserror::Error;

pub use keystore::{FileKeystore, Keystore, KeystoreError};

pub type Fingerprint = [u8; 32];

const ACCEPTED_HASHES: [HashAlgorithm; 3] = [
    HashAlgorithm::SHA2_256,
    HashAlgorithm::SHA2_384,
    HashAlgorithm::SHA2_512,
];

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("unsupported signature version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported hash algorithm {0}")]
    UnsupportedHash(u8),
    #[error("OpenPGP error: {0}")]
    Pgp(String),
}

impl From<pgp::errors::Error> for SigningError {
    fn from(e: pgp::errors::Error) -> Self {
        SigningError::Pgp(e.to_string())
    }
}

fn malformed(e: pgp::errors::Error) -> SigningError {
    SigningError::Malformed(e.to_string())
}

/// SHA-256 of the serialized primary public-key packet.
pub fn fingerprint(key: &SignedPublicKey) -> Result<Fingerprint, SigningError> {
    let packet = key.primary_key.to_bytes()?;
    Ok(Sha256::digest(packet).into())
}

#[derive(Debug, Clone)]
pub struct DetachedSignature(StandaloneSignature);

impl DetachedSignature {
    fn checked(signature: StandaloneSignature) -> Result<Self, SigningError> {
        let config = &signature.signature.config;
        if config.version() != SignatureVersion::V4 {
            return Err(SigningError::UnsupportedVersion(u8::from(config.version())));
        }
        if !ACCEPTED_HASHES.contains(&config.hash_alg) {
            return Err(SigningError::UnsupportedHash(u8::from(config.hash_alg)));
        }
        Ok(Self(signature))
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.0.signature.created().copied()
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.0.signature.config.hash_alg
    }

    /// The binary signature packet.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SigningError> {
        Ok(self.0.to_bytes()?)
    }

    pub fn to_armored(&self) -> Result<String, SigningError> {
        Ok(self.0.to_armored_string(ArmorOptions::default())?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, SigningError> {
        Self::checked(StandaloneSignature::from_bytes(data).map_err(malformed)?)
    }

    pub fn from_armored(text: &str) -> Result<Self, SigningError> {
        let (signature, _headers) = StandaloneSignature::from_string(text).map_err(malformed)?;
        Self::checked(signature)
    }

    /// Accepts either the armored or the binary form.
    pub fn from_any(data: &[u8]) -> Result<Self, SigningError> {
        let start = data
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(data.len());
        let trimmed = &data[start..];
        if trimmed.starts_with(b"-----BEGIN") {
            let text = std::str::from_utf8(trimmed)
                .map_err(|e| SigningError::Malformed(format!("armor is not UTF-8: {e}")))?;
            Self::from_armored(text)
        } else {
            Self::from_bytes(data)
        }
    }
}

/// Keeps the first read error of the wrapped stream, so that a failing
/// source is reported as I/O and not as a bad signature.
struct ReadGuard<R> {
    inner: R,
    error: Option<io::Error>,
}

impl<R> ReadGuard<R> {
    fn new(inner: R) -> Self {
        Self { inner, error: None }
    }
}

impl<R: Read> Read for ReadGuard<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| {
            let forwarded = io::Error::new(e.kind(), e.to_string());
            self.error.get_or_insert(e);
            forwarded
        })
    }
}

pub fn sign<R: Read>(
    key: &SignedSecretKey,
    passphrase: &str,
    content: R,
) -> Result<DetachedSignature, SigningError> {
    sign_at(key, passphrase, content, Utc::now())
}

/// Signs with a fixed creation time (whole seconds).
pub fn sign_at<R: Read>(
    key: &SignedSecretKey,
    passphrase: &str,
    content: R,
    created: DateTime<Utc>,
) -> Result<DetachedSignature, SigningError> {
    sign_with_hash(key, passphrase, content, created, HashAlgorithm::SHA2_256)
}

fn sign_with_hash<R: Read>(
    key: &SignedSecretKey,
    passphrase: &str,
    content: R,
    created: DateTime<Utc>,
    hash: HashAlgorithm,
) -> Result<DetachedSignature, SigningError> {
    let mut config = SignatureConfig::v4(SignatureType::Binary, key.algorithm(), hash);
    config.hashed_subpackets = vec![Subpacket::regular(SubpacketData::SignatureCreationTime(
        created.trunc_subsecs(0),
    ))];
    config.unhashed_subpackets = vec![Subpacket::regular(SubpacketData::Issuer(key.key_id()))];

    let mut guard = ReadGuard::new(content);
    let signed = config.sign(key, || passphrase.to_string(), &mut guard);
    if let Some(e) = guard.error {
        return Err(SigningError::Io(e));
    }
    Ok(DetachedSignature(StandaloneSignature::new(signed?)))
}

/// `Ok(false)` when the signature is well formed but does not match the
/// content or the key. The content is always read to the end.
pub fn verify<R: Read>(
    content: R,
    signature: &DetachedSignature,
    public_key: &SignedPublicKey,
) -> Result<bool, SigningError> {
    let mut guard = ReadGuard::new(content);
    let valid = signature.0.signature.verify(public_key, &mut guard).is_ok();
    if let Some(e) = guard.error.take() {
        return Err(SigningError::Io(e));
    }
    io::copy(&mut guard.inner, &mut io::sink())?;
    Ok(valid)
}

/// Parses `signature` (armored or binary) and verifies it.
pub fn verify_detached<R: Read>(
    content: R,
    signature: &[u8],
    public_key: &SignedPublicKey,
) -> Result<bool, SigningError> {
    let signature = DetachedSignature::from_any(signature)?;
    verify(content, &signature, public_key)
}


#[cfg(test)]
mod tests {
    use super::test_keys::PASSPHRASE;
    use super::*;
    use std::io::Cursor;

    const CONTENT: &[u8] = b"a photo of the protest, 2024-05-01";

    #[test]
    fn test_sign_and_verify() {
        let (key, _) = test_keys::pair();
        let sig = sign(key, PASSPHRASE, Cursor::new(CONTENT)).unwrap();
        assert_eq!(sig.hash_algorithm(), HashAlgorithm::SHA2_256);
        assert!(verify(Cursor::new(CONTENT), &sig, &test_keys::public(key)).unwrap());
    }

    #[test]
    fn test_single_byte_tamper_detected() {
        let (key, _) = test_keys::pair();
        let public = test_keys::public(key);
        let sig = sign(key, PASSPHRASE, Cursor::new(CONTENT)).unwrap();
        for i in [0, CONTENT.len() / 2, CONTENT.len() - 1] {
            let mut tampered = CONTENT.to_vec();
            tampered[i] ^= 0x01;
            assert!(!verify(Cursor::new(&tampered), &sig, &public).unwrap());
        }
        // a truncated stream is not the signed content either
        assert!(!verify(Cursor::new(&CONTENT[..10]), &sig, &public).unwrap());
    }

    #[test]
    fn test_wrong_key() {
        let (key, other) = test_keys::pair();
        let sig = sign(key, PASSPHRASE, Cursor::new(CONTENT)).unwrap();
        assert!(!verify(Cursor::new(CONTENT), &sig, &test_keys::public(other)).unwrap());
    }

    #[test]
    fn test_creation_time_is_kept() {
        let (key, _) = test_keys::pair();
        let created = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let sig = sign_at(key, PASSPHRASE, Cursor::new(CONTENT), created).unwrap();
        assert_eq!(sig.created_at(), Some(created));

        let parsed = DetachedSignature::from_bytes(&sig.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.created_at(), Some(created));
    }

    #[test]
    fn test_armored_and_binary_forms() {
        let (key, _) = test_keys::pair();
        let sig = sign(key, PASSPHRASE, Cursor::new(CONTENT)).unwrap();
        let binary = sig.to_bytes().unwrap();
        let armored = sig.to_armored().unwrap();
        assert!(armored.starts_with("-----BEGIN PGP SIGNATURE-----"));
        assert!(armored.trim_end().ends_with("-----END PGP SIGNATURE-----"));

        let from_armor = DetachedSignature::from_armored(&armored).unwrap();
        assert_eq!(from_armor.to_bytes().unwrap(), binary);
        let from_any = DetachedSignature::from_any(armored.as_bytes()).unwrap();
        assert_eq!(from_any.to_bytes().unwrap(), binary);
        let from_binary = DetachedSignature::from_any(&binary).unwrap();
        assert_eq!(from_binary.to_bytes().unwrap(), binary);

        let public = test_keys::public(key);
        assert!(verify_detached(Cursor::new(CONTENT), armored.as_bytes(), &public).unwrap());
        assert!(verify_detached(Cursor::new(CONTENT), &binary, &public).unwrap());
    }

    #[test]
    fn test_malformed_signatures() {
        let (key, _) = test_keys::pair();
        let binary = sign(key, PASSPHRASE, Cursor::new(CONTENT))
            .unwrap()
            .to_bytes()
            .unwrap();

        assert!(matches!(
            DetachedSignature::from_bytes(&binary[..binary.len() / 2]),
            Err(SigningError::Malformed(_))
        ));
        assert!(matches!(
            DetachedSignature::from_any(b"not a signature"),
            Err(SigningError::Malformed(_))
        ));
        assert!(matches!(
            verify_detached(
                Cursor::new(CONTENT),
                b"-----BEGIN PGP SIGNATURE-----\n",
                &test_keys::public(key)
            ),
            Err(SigningError::Malformed(_))
        ));
    }

    #[test]
    fn test_weak_hash_rejected() {
        let (key, _) = test_keys::pair();
        let sha1 = sign_with_hash(
            key,
            PASSPHRASE,
            Cursor::new(CONTENT),
            Utc::now(),
            HashAlgorithm::SHA1,
        )
        .unwrap();
        assert!(matches!(
            DetachedSignature::from_bytes(&sha1.to_bytes().unwrap()),
            Err(SigningError::UnsupportedHash(2))
        ));
    }

    #[test]
    fn test_read_errors_propagate() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "gone"))
            }
        }
        let (key, _) = test_keys::pair();
        assert!(matches!(
            sign(key, PASSPHRASE, Broken),
            Err(SigningError::Io(_))
        ));

        let sig = sign(key, PASSPHRASE, Cursor::new(CONTENT)).unwrap();
        assert!(matches!(
            verify(Broken, &sig, &test_keys::public(key)),
            Err(SigningError::Io(_))
        ));
    }
}

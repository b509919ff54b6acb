//! Passphrase-protected OpenPGP keypair on disk.
//!
//! Layout of the key directory:
//! * `secret.asc` - armored OpenPGP secret key, S2K-protected by the passphrase
//! * `pubkey.asc` - armored OpenPGP public key
//! * `identity`   - the `ProofMode <user@host>` identity line

use super::{fingerprint, DetachedSignature, Fingerprint, SigningError};
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::types::{CompressionAlgorithm, SecretKeyTrait};
use pgp::{
    ArmorOptions, Deserializable, KeyType, SecretKeyParamsBuilder, SignedPublicKey,
    SignedSecretKey,
};
use smallvec::smallvec;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use zeroize::Zeroizing;

pub const SECRET_KEY_FILE: &str = "secret.asc";
pub const PUBLIC_KEY_FILE: &str = "pubkey.asc";
pub const IDENTITY_FILE: &str = "identity";
pub const DEFAULT_KEY_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum KeystoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wrong passphrase for the secret key")]
    BadPassphrase,
    #[error("key encoding error: {0}")]
    KeyEncoding(String),
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("keystore already initialized at {0}")]
    AlreadyInitialized(PathBuf),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

fn encoding(e: impl std::fmt::Display) -> KeystoreError {
    KeystoreError::KeyEncoding(e.to_string())
}

fn generation(e: impl std::fmt::Display) -> KeystoreError {
    KeystoreError::KeyGeneration(e.to_string())
}

/// Holder of the signing key. Only the public half ever leaves it.
pub trait Keystore: Send + Sync {
    fn identity(&self) -> &str;
    fn fingerprint(&self) -> Fingerprint;
    fn public_key(&self) -> &SignedPublicKey;
    fn public_key_armored(&self) -> &str;
    fn sign(&self, content: &mut dyn Read) -> Result<DetachedSignature, KeystoreError>;

    fn verify(
        &self,
        content: &mut dyn Read,
        signature: &DetachedSignature,
    ) -> Result<bool, KeystoreError> {
        Ok(super::verify(content, signature, self.public_key())?)
    }
}

/// Parses an armored public key and checks its self-signatures.
pub fn parse_public_key(armored: &str) -> Result<SignedPublicKey, KeystoreError> {
    let (key, _headers) = SignedPublicKey::from_string(armored).map_err(encoding)?;
    key.verify().map_err(encoding)?;
    Ok(key)
}

/// A new RSA sign/certify key with `identity` as primary user id, its
/// secret material protected by `passphrase`.
pub fn generate_key(
    bits: usize,
    identity: &str,
    passphrase: &str,
) -> Result<SignedSecretKey, KeystoreError> {
    let bits = u32::try_from(bits)
        .map_err(|_| KeystoreError::KeyGeneration(format!("unsupported key size {bits}")))?;
    let params = SecretKeyParamsBuilder::default()
        .key_type(KeyType::Rsa(bits))
        .can_certify(true)
        .can_sign(true)
        .primary_user_id(identity.to_string())
        .passphrase(Some(passphrase.to_string()))
        .preferred_symmetric_algorithms(smallvec![SymmetricKeyAlgorithm::AES256])
        .preferred_hash_algorithms(smallvec![HashAlgorithm::SHA2_256])
        .preferred_compression_algorithms(smallvec![CompressionAlgorithm::ZLIB])
        .build()
        .map_err(generation)?;

    let mut rng = rand::thread_rng();
    let secret = params.generate(&mut rng).map_err(generation)?;
    secret
        .sign(&mut rng, || passphrase.to_string())
        .map_err(generation)
}

/// The public half of `secret`, certified by it.
pub fn public_key_of(
    secret: &SignedSecretKey,
    passphrase: &str,
) -> Result<SignedPublicKey, KeystoreError> {
    let mut rng = rand::thread_rng();
    secret
        .public_key()
        .sign(&mut rng, secret, || passphrase.to_string())
        .map_err(encoding)
}

fn check_passphrase(secret: &SignedSecretKey, passphrase: &str) -> Result<(), KeystoreError> {
    secret
        .unlock(|| passphrase.to_string(), |_| Ok(()))
        .map_err(|_| KeystoreError::BadPassphrase)
}

pub struct FileKeystore {
    dir: PathBuf,
    identity: String,
    secret_key: Mutex<SignedSecretKey>,
    passphrase: Zeroizing<String>,
    public_key: SignedPublicKey,
    public_armored: String,
    fingerprint: Fingerprint,
}

impl FileKeystore {
    /// Loads the keypair in `dir`, or generates and stores a new one.
    pub fn open_or_create(
        dir: &Path,
        passphrase: &str,
        bits: usize,
        identity: &str,
    ) -> Result<Self, KeystoreError> {
        if dir.join(SECRET_KEY_FILE).exists() {
            return Self::open(dir, passphrase);
        }
        Self::create(dir, passphrase, bits, identity)
    }

    pub fn create(
        dir: &Path,
        passphrase: &str,
        bits: usize,
        identity: &str,
    ) -> Result<Self, KeystoreError> {
        if dir.join(SECRET_KEY_FILE).exists() {
            return Err(KeystoreError::AlreadyInitialized(dir.to_path_buf()));
        }
        log::info!("Generating {bits}-bit signing key for {identity}");
        let key = generate_key(bits, identity, passphrase)?;
        Self::import(dir, passphrase, identity, key)
    }

    pub fn open(dir: &Path, passphrase: &str) -> Result<Self, KeystoreError> {
        let armored = Zeroizing::new(fs::read_to_string(dir.join(SECRET_KEY_FILE))?);
        let (secret_key, _headers) = SignedSecretKey::from_string(&armored).map_err(encoding)?;
        let identity = fs::read_to_string(dir.join(IDENTITY_FILE))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        let keystore = Self::from_parts(dir, identity, secret_key, passphrase)?;
        if !dir.join(PUBLIC_KEY_FILE).exists() {
            fs::write(dir.join(PUBLIC_KEY_FILE), &keystore.public_armored)?;
        }
        log::debug!(
            "Opened keystore {} ({})",
            dir.display(),
            hex::encode(&keystore.fingerprint[..8])
        );
        Ok(keystore)
    }

    /// Stores an existing secret key, protected by `passphrase`, in `dir`.
    pub fn import(
        dir: &Path,
        passphrase: &str,
        identity: &str,
        secret_key: SignedSecretKey,
    ) -> Result<Self, KeystoreError> {
        fs::create_dir_all(dir)?;
        let armored = Zeroizing::new(
            secret_key
                .to_armored_string(ArmorOptions::default())
                .map_err(encoding)?,
        );
        let keystore = Self::from_parts(dir, identity.to_string(), secret_key, passphrase)?;

        let secret_path = dir.join(SECRET_KEY_FILE);
        fs::write(&secret_path, armored.as_bytes())?;
        restrict_permissions(&secret_path)?;
        fs::write(dir.join(PUBLIC_KEY_FILE), &keystore.public_armored)?;
        fs::write(dir.join(IDENTITY_FILE), format!("{identity}\n"))?;
        Ok(keystore)
    }

    fn from_parts(
        dir: &Path,
        identity: String,
        secret_key: SignedSecretKey,
        passphrase: &str,
    ) -> Result<Self, KeystoreError> {
        check_passphrase(&secret_key, passphrase)?;
        let public_key = public_key_of(&secret_key, passphrase)?;
        let public_armored = public_key
            .to_armored_string(ArmorOptions::default())
            .map_err(encoding)?;
        let fingerprint = fingerprint(&public_key)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            identity,
            secret_key: Mutex::new(secret_key),
            passphrase: Zeroizing::new(passphrase.to_string()),
            public_key,
            public_armored,
            fingerprint,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Keystore for FileKeystore {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    fn public_key(&self) -> &SignedPublicKey {
        &self.public_key
    }

    fn public_key_armored(&self) -> &str {
        &self.public_armored
    }

    fn sign(&self, content: &mut dyn Read) -> Result<DetachedSignature, KeystoreError> {
        // The key is never mutated, so a poisoned lock is still usable.
        let key = self
            .secret_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(super::sign(&key, &self.passphrase, content)?)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

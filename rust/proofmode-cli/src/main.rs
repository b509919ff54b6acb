use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use proofmode_core::config::{default_data_dir, ProofModeConfig};
use proofmode_core::hashing::sha256_file;
use proofmode_core::orchestrator::stamp_files;
use proofmode_core::ots::{
    upgrade_timestamp, verify_timestamp, ChainVerifier, DetachedTimestampFile, RemoteResolver,
    Stamper,
};
use proofmode_core::signing::keystore::SECRET_KEY_FILE;
use proofmode_core::{
    discover_digest, verify_bundle, FileKeystore, Keystore, ProofModeOrchestrator,
    ProviderRegistry,
};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zeroize::Zeroizing;

const PASSPHRASE_ENV: &str = "PROOFMODE_PASSPHRASE";

#[derive(Parser)]
#[command(author, version, about = "Signed, timestamped proofs for media files", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, config and signing key
    Init {
        /// RSA key size
        #[arg(long)]
        bits: Option<usize>,
        /// Identity line, e.g. "Jane <jane@example.org>"
        #[arg(long)]
        identity: Option<String>,
    },
    /// Generate a signed proof bundle for a media file
    Generate {
        file: PathBuf,
        /// Free-text notes stored in the proof record
        #[arg(short, long)]
        notes: Option<String>,
        /// Skip OpenTimestamps and other notarizations
        #[arg(long)]
        no_notarize: bool,
    },
    /// Verify a proof bundle against its media file
    Verify {
        file: PathBuf,
        /// Bundle directory (default: <data dir>/proofs/<sha256 of file>)
        #[arg(short, long)]
        bundle: Option<PathBuf>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Timestamp files on the OpenTimestamps calendars, writing <file>.ots
    Stamp {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Ask calendars to complete pending attestations in .ots files
    Upgrade {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Check an .ots file against the blockchain
    VerifyOts {
        ots: PathBuf,
        /// The timestamped file (default: the .ots path without extension)
        #[arg(short, long)]
        target: Option<PathBuf>,
    },
    /// Show the contents of an .ots file
    Info { ots: PathBuf },
}

fn load_config() -> Result<ProofModeConfig> {
    let dir = default_data_dir();
    ProofModeConfig::load_or_default(&dir)
}

/// Passphrase from the environment, otherwise one line of stdin.
fn passphrase() -> Result<Zeroizing<String>> {
    if let Ok(pass) = std::env::var(PASSPHRASE_ENV) {
        return Ok(Zeroizing::new(pass));
    }
    eprint!("Passphrase: ");
    io::stderr().flush()?;
    let mut line = Zeroizing::new(String::new());
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read passphrase")?;
    let trimmed = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    if trimmed.is_empty() {
        bail!("Empty passphrase (set {PASSPHRASE_ENV} for non-interactive use)");
    }
    Ok(trimmed)
}

/// Opened once per command and handed to the orchestrator.
fn open_keystore(config: &ProofModeConfig) -> Result<Arc<FileKeystore>> {
    let dir = config.keys_dir();
    if !dir.join(SECRET_KEY_FILE).exists() {
        bail!("No signing key found. Run 'proofmode init' first.");
    }
    let pass = passphrase()?;
    let keystore = FileKeystore::open(&dir, &pass).context("Failed to open keystore")?;
    Ok(Arc::new(keystore))
}

fn ots_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".ots");
    PathBuf::from(name)
}

fn read_ots(path: &Path) -> Result<DetachedTimestampFile> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    DetachedTimestampFile::from_bytes(&bytes)
        .with_context(|| format!("{} is not a valid timestamp file", path.display()))
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_init(bits: Option<usize>, identity: Option<String>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(bits) = bits {
        config.keys.bits = bits;
    }
    if let Some(identity) = identity {
        config.keys.identity = identity;
    }
    fs::create_dir_all(config.proofs_dir())
        .with_context(|| format!("Failed to create {}", config.proofs_dir().display()))?;
    config.persist()?;

    let existing = config.keys_dir().join(SECRET_KEY_FILE).exists();
    if !existing {
        println!("Generating {}-bit signing key...", config.keys.bits);
    }
    let pass = passphrase()?;
    let keystore = FileKeystore::open_or_create(
        &config.keys_dir(),
        &pass,
        config.keys.bits,
        &config.keys.identity,
    )
    .context("Failed to set up keystore")?;

    println!();
    if existing {
        println!("ProofMode already initialized.");
    } else {
        println!("ProofMode initialized successfully.");
    }
    println!("  Data dir:    {}", config.data_dir.display());
    println!("  Identity:    {}", keystore.identity());
    println!("  Fingerprint: {}", hex::encode(keystore.fingerprint()));
    Ok(())
}

async fn cmd_generate(file: &Path, notes: Option<String>, no_notarize: bool) -> Result<()> {
    let config = load_config()?;
    let keystore = open_keystore(&config)?;
    let mut orchestrator = ProofModeOrchestrator::from_config(config, keystore)
        .context("Invalid calendar configuration")?;
    if no_notarize {
        orchestrator = orchestrator.with_registry(ProviderRegistry::new());
    }

    let proof = orchestrator
        .generate_proof(file, notes.as_deref())
        .await
        .with_context(|| format!("Failed to generate proof for {}", file.display()))?;

    println!("Proof generated for {}", file.display());
    println!("  SHA-256: {}", hex::encode(proof.digest));
    println!("  Bundle:  {}", proof.outcome.bundle_dir.display());
    if !proof.outcome.media_signed {
        println!("  Media signature already present, kept as is");
    }
    for path in &proof.notarizations {
        println!("  Notarized: {}", path.display());
    }
    for failure in &proof.notarization_errors {
        println!("  Notarization by {} failed: {}", failure.provider, failure.error);
    }
    Ok(())
}

fn cmd_verify(file: &Path, bundle: Option<PathBuf>, json: bool) -> Result<()> {
    let bundle = match bundle {
        Some(dir) => dir,
        None => {
            let digest = sha256_file(file)
                .with_context(|| format!("Failed to hash {}", file.display()))?;
            load_config()?.proofs_dir().join(hex::encode(digest))
        }
    };
    let digest = discover_digest(&bundle)
        .with_context(|| format!("No proof bundle at {}", bundle.display()))?;
    let result = verify_bundle(&bundle, &digest, file)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Bundle:  {}", bundle.display());
        println!("SHA-256: {}", result.digest);
        if let Some(fp) = &result.signer_fingerprint {
            println!("Signer:  {fp}");
        }
        for ext in &result.notarizations {
            println!("Notarization: .{ext}");
        }
        for ots in &result.ots {
            let state = if ots.digest_matches { "matches" } else { "DOES NOT MATCH" };
            println!("Timestamp {}: {state}", ots.path.display());
        }
        match &result.failure {
            None => println!("VERIFIED"),
            Some(failure) => println!("FAILED: {failure}"),
        }
    }

    if !result.verified {
        return Err(anyhow!("proof bundle did not verify"));
    }
    Ok(())
}

async fn cmd_stamp(files: &[PathBuf]) -> Result<()> {
    let config = load_config()?;
    let stamper = Stamper::from_config(&config.calendars)
        .context("Invalid calendar configuration")?;

    let stamped = stamp_files(&stamper, files).await?;
    for file in stamped {
        let path = ots_path(&file.path);
        fs::write(&path, &file.ots)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("{} -> {}", file.path.display(), path.display());
    }
    Ok(())
}

async fn cmd_upgrade(files: &[PathBuf]) -> Result<()> {
    let config = load_config()?;
    let whitelist = config.calendars.url_whitelist();

    for path in files {
        let mut ots = read_ots(path)?;
        let report = upgrade_timestamp(ots.timestamp_mut(), &whitelist, &RemoteResolver).await;
        if report.changed() {
            let bytes = ots.to_bytes()?;
            fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{}: upgraded", path.display());
        } else {
            println!(
                "{}: {} pending, {} skipped, {} failed",
                path.display(),
                report.pending,
                report.skipped,
                report.failed
            );
        }
    }
    Ok(())
}

async fn cmd_verify_ots(ots_file: &Path, target: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let ots = read_ots(ots_file)?;

    let target = target.unwrap_or_else(|| ots_file.with_extension(""));
    if target.exists() {
        let digest = sha256_file(&target)
            .with_context(|| format!("Failed to hash {}", target.display()))?;
        if ots.file_digest() != digest.as_slice() {
            bail!("{} does not match the timestamped digest", target.display());
        }
    } else {
        log::warn!("{} not found, checking the timestamp only", target.display());
    }

    let verifier = ChainVerifier::from_config(&config.chain)?;
    let result = verify_timestamp(ots.timestamp(), &verifier).await?;

    for pending in &result.pending {
        println!("Pending at {pending}");
    }
    for bad in &result.unverifiable {
        println!("Unverifiable {}: {}", bad.attestation, bad.reason);
    }
    match result.earliest() {
        Some(v) => {
            println!(
                "Success! {} block {} attests existence as of {} ({:?} via {})",
                v.chain,
                v.height,
                v.time.to_rfc3339(),
                v.trust,
                v.source
            );
            Ok(())
        }
        None => Err(anyhow!("timestamp not yet anchored in a blockchain")),
    }
}

fn cmd_info(ots_file: &Path) -> Result<()> {
    let ots = read_ots(ots_file)?;
    println!("File sha256 hash: {}", hex::encode(ots.file_digest()));
    println!("Timestamp:");
    print!("{}", ots.timestamp().pretty());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Init { bits, identity } => cmd_init(bits, identity)?,
        Commands::Generate {
            file,
            notes,
            no_notarize,
        } => cmd_generate(&file, notes, no_notarize).await?,
        Commands::Verify { file, bundle, json } => cmd_verify(&file, bundle, json)?,
        Commands::Stamp { files } => cmd_stamp(&files).await?,
        Commands::Upgrade { files } => cmd_upgrade(&files).await?,
        Commands::VerifyOts { ots, target } => cmd_verify_ots(&ots, target).await?,
        Commands::Info { ots } => cmd_info(&ots)?,
    }

    Ok(())
}

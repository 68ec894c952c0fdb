//! keyiv CLI - Operator tool for the machine-shared key/IV cache.
//!
//! Covers the manual escape hatches: exporting a key/IV to move it to another
//! machine, importing one, and encrypting or decrypting files and strings
//! with cached keys.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use keyiv_cache::{CacheConfig, CacheMode, CacheService, CipherStrength};

#[derive(Parser)]
#[command(name = "keyiv")]
#[command(about = "keyiv - Machine-shared key/IV cache")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the key/IV for a password, creating it if needed.
    Export {
        /// Key size in bits: 128, 192 or 256.
        #[arg(short, long, default_value_t = 256)]
        key_size: u32,
    },

    /// Install a key/IV exported on another machine.
    Import {
        /// Key size in bits: 128, 192 or 256.
        #[arg(short, long, default_value_t = 256)]
        key_size: u32,

        /// Exported text in the form "<base64 key>|<base64 iv>".
        #[arg(short, long)]
        text: String,
    },

    /// Encrypt a file.
    EncryptFile {
        /// Source file.
        #[arg(short, long)]
        source: PathBuf,

        /// Destination file.
        #[arg(short, long)]
        dest: PathBuf,

        /// Strength: "none", "aes128" or "aes256".
        #[arg(long, default_value = "aes256")]
        strength: String,
    },

    /// Decrypt a file.
    DecryptFile {
        /// Source file.
        #[arg(short, long)]
        source: PathBuf,

        /// Destination file.
        #[arg(short, long)]
        dest: PathBuf,

        /// Strength: "none", "aes128" or "aes256".
        #[arg(long, default_value = "aes256")]
        strength: String,
    },

    /// Encrypt a string to base64.
    EncryptString {
        /// Text to encrypt.
        text: String,

        /// Strength: "none", "aes128" or "aes256".
        #[arg(long, default_value = "aes256")]
        strength: String,
    },

    /// Decrypt a base64 string.
    DecryptString {
        /// Encrypted text.
        text: String,

        /// Strength: "none", "aes128" or "aes256".
        #[arg(long, default_value = "aes256")]
        strength: String,
    },

    /// Show which cache is in use.
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;
    let service = CacheService::start(config)
        .await
        .context("Failed to open key/IV cache")?;

    match cli.command {
        Commands::Export { key_size } => cmd_export(&service, key_size).await?,

        Commands::Import { key_size, text } => cmd_import(&service, key_size, &text).await?,

        Commands::EncryptFile {
            source,
            dest,
            strength,
        } => cmd_encrypt_file(&service, &source, &dest, &strength).await?,

        Commands::DecryptFile {
            source,
            dest,
            strength,
        } => cmd_decrypt_file(&service, &source, &dest, &strength).await?,

        Commands::EncryptString { text, strength } => {
            cmd_encrypt_string(&service, &text, &strength).await?
        }

        Commands::DecryptString { text, strength } => {
            cmd_decrypt_string(&service, &text, &strength).await?
        }

        Commands::Info => cmd_info(&service),
    }

    service
        .flush(service.config().readiness_timeout())
        .await
        .context("Failed to save key/IV cache")?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<CacheConfig> {
    match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(CacheConfig::default()),
    }
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password))
}

fn parse_strength(strength: &str) -> Result<CipherStrength> {
    strength
        .parse()
        .context("Invalid strength. Use: none, aes128, or aes256")
}

/// Print the exported key/IV.
async fn cmd_export(service: &CacheService, key_size: u32) -> Result<()> {
    let password = prompt_password("Password: ")?;
    let text = service
        .cache()
        .export(&password, key_size)
        .await
        .context("Failed to export key/IV")?;

    println!("{}", text);
    Ok(())
}

/// Install an exported key/IV.
async fn cmd_import(service: &CacheService, key_size: u32, text: &str) -> Result<()> {
    let password = prompt_password("Password: ")?;
    service
        .cache()
        .import(&password, key_size, text)
        .await
        .context("Failed to import key/IV")?;

    println!("Key/IV imported into {}", service.cache().path().display());
    Ok(())
}

async fn cmd_encrypt_file(service: &CacheService, source: &Path, dest: &Path, strength: &str) -> Result<()> {
    let strength = parse_strength(strength)?;
    let password = prompt_password("Password: ")?;
    info!("Encrypting {} to {}", source.display(), dest.display());

    let total = service
        .cipher()
        .encrypt_file(source, dest, &password, strength)
        .await
        .context("Failed to encrypt file")?;

    println!("Encrypted {} bytes to {}", total, dest.display());
    Ok(())
}

async fn cmd_decrypt_file(service: &CacheService, source: &Path, dest: &Path, strength: &str) -> Result<()> {
    let strength = parse_strength(strength)?;
    let password = prompt_password("Password: ")?;
    info!("Decrypting {} to {}", source.display(), dest.display());

    let total = service
        .cipher()
        .decrypt_file(source, dest, &password, strength)
        .await
        .context("Failed to decrypt file")?;

    println!("Decrypted {} bytes to {}", total, dest.display());
    Ok(())
}

async fn cmd_encrypt_string(service: &CacheService, text: &str, strength: &str) -> Result<()> {
    let strength = parse_strength(strength)?;
    let password = prompt_password("Password: ")?;

    let encrypted = service
        .cipher()
        .encrypt_string(text, &password, strength)
        .await
        .context("Failed to encrypt string")?;

    println!("{}", encrypted);
    Ok(())
}

async fn cmd_decrypt_string(service: &CacheService, text: &str, strength: &str) -> Result<()> {
    let strength = parse_strength(strength)?;
    let password = prompt_password("Password: ")?;

    let decrypted = service
        .cipher()
        .decrypt_string(text, &password, strength)
        .await
        .context("Failed to decrypt string")?;

    println!("{}", decrypted);
    Ok(())
}

fn cmd_info(service: &CacheService) {
    let mode = match service.mode() {
        CacheMode::Shared => "shared",
        CacheMode::UserFallback => "per-user fallback",
    };

    println!("Key/IV cache:");
    println!("  Mode: {}", mode);
    println!("  Active file: {}", service.cache().path().display());
    println!("  Shared file: {}", service.shared_cache().path().display());
    println!("  Entries: {}", service.cache().len());
    println!("  Reload on change: {}", service.config().reload_on_change);
}

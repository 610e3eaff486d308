//! Command-line interface definition.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Client-side settlement broker for the compute marketplace.
#[derive(Parser, Debug)]
#[command(name = "compute-broker")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML).
    #[arg(long, short, env = "COMPUTE_BROKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Root directory for persisted broker state.
    #[arg(long, env = "COMPUTE_BROKER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log level (overrides the configuration file).
    #[arg(long, env = "COMPUTE_BROKER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Broker commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the effective configuration as TOML.
    Config {
        /// Write the configuration to this file instead of stdout.
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Allocate the next request nonce for a user from the persisted counter.
    Nonce {
        /// User address (0x-prefixed hex).
        #[arg(long)]
        user: String,
    },
    /// Verify and decrypt a fine-tuning deliverable offline.
    Decrypt {
        /// Encrypted deliverable.
        #[arg(long)]
        input: PathBuf,
        /// Destination of the decrypted model.
        #[arg(long)]
        output: PathBuf,
        /// Hex-encoded 32-byte AES-256 session key.
        #[arg(long, env = "COMPUTE_BROKER_SESSION_KEY")]
        session_key: String,
        /// Provider signer address the tag-chain signature must recover to.
        #[arg(long)]
        signer: String,
        /// Ciphertext bytes per chunk.
        #[arg(long, default_value_t = compute_broker::deliverable::CHUNK_LEN)]
        chunk_len: usize,
    },
}

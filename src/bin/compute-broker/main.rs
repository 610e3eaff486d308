//! compute-broker CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use compute_broker::deliverable::{decrypt_file, format::KEY_SIZE};
use compute_broker::{Address, BrokerConfig, BrokerContext, NonceAllocator};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cli.log_level.as_deref().unwrap_or(&config.log_level))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    info!("compute-broker v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Config { write } => {
            config.validate()?;
            if let Some(path) = write {
                config.to_file(&path)?;
                info!("Wrote configuration to {}", path.display());
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Command::Nonce { user } => {
            let user: Address = user.parse()?;
            let context = BrokerContext::init(config).await?;
            let nonces = NonceAllocator::new(
                context.persistent_cache().clone(),
                user,
                context.config().nonce.clone(),
            );
            println!("{}", nonces.next_nonce().await?);
        }
        Command::Decrypt {
            input,
            output,
            session_key,
            signer,
            chunk_len,
        } => {
            let signer: Address = signer.parse()?;
            let key = parse_session_key(&session_key)?;
            decrypt_file(&input, &output, &key, signer, chunk_len).await?;
            info!("Decrypted {} to {}", input.display(), output.display());
        }
    }

    Ok(())
}

/// Load the configuration file, if any, and apply CLI overrides.
fn build_config(cli: &Cli) -> color_eyre::Result<BrokerConfig> {
    let mut config = match &cli.config {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir.clone_from(dir);
    }
    if let Some(level) = &cli.log_level {
        config.log_level.clone_from(level);
    }
    Ok(config)
}

fn parse_session_key(key: &str) -> color_eyre::Result<[u8; KEY_SIZE]> {
    let bytes = hex::decode(key.trim().trim_start_matches("0x"))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        color_eyre::eyre::eyre!(
            "Invalid session key length: expected {KEY_SIZE} bytes, got {}",
            bytes.len()
        )
    })
}

//! proofgate - offline verification of signed run manifests and proof packs.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;

/// proofgate - verify manifests and proof packs
#[derive(Parser, Debug)]
#[command(name = "proofgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify one run manifest's Ed25519 signature
    VerifyManifest {
        /// Hex public key file
        #[arg(long)]
        public_key: PathBuf,

        /// Signed manifest JSON
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Re-verify every signature, artifact digest, and the pack digest
    VerifyPack {
        /// Pack directory
        dir: PathBuf,

        /// Key id the shipped public key must have (ed25519:<16 hex>)
        #[arg(long)]
        key_id: String,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate an Ed25519 manifest signing key pair
    Keygen {
        /// Output directory
        #[arg(long)]
        out: PathBuf,

        /// File stem for `<name>.key` and `<name>.pub`
        #[arg(long, default_value = "manifest_signing")]
        name: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    // Exit codes: 0=valid, 1=invalid or verification exception, 2=usage.
    let exit_code = match cli.command {
        Commands::VerifyManifest {
            public_key,
            manifest,
        } => commands::verify::verify_manifest(&public_key, &manifest),
        Commands::VerifyPack { dir, key_id, json } => {
            commands::verify::verify_pack(&dir, &key_id, json)
        },
        Commands::Keygen { out, name } => commands::keygen::run(&out, &name),
    };
    std::process::exit(i32::from(exit_code));
}

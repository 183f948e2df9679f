//! `proofgate keygen`.

use std::path::Path;

use anyhow::anyhow;
use proofgate_core::crypto::{ManifestSigner, write_key_pair};
use tracing::info;

use super::{Failure, exit_codes};

/// Writes a fresh signing key pair into `out`.
pub fn run(out: &Path, name: &str) -> u8 {
    if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
        return Failure::Usage(anyhow!("invalid key name: {name:?}")).report();
    }
    let signer = ManifestSigner::generate();
    match write_key_pair(&signer, out, name) {
        Ok((secret, public)) => {
            info!(key_id = %signer.key_id(), "key pair written");
            println!("key id: {}", signer.key_id());
            println!("signing key: {}", secret.display());
            println!("public key: {}", public.display());
            exit_codes::SUCCESS
        },
        Err(e) => Failure::Invalid(anyhow!(e)).report(),
    }
}

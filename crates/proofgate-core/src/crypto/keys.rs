//! Key files: hex text, one key per file.

use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use super::{CryptoError, ManifestSigner, ManifestVerifier};

/// Upper bound on a key file; anything larger is not a key.
const MAX_KEY_FILE_BYTES: u64 = 256;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CryptoError + '_ {
    move |source| CryptoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_bounded(path: &Path) -> Result<String, CryptoError> {
    let meta = fs::metadata(path).map_err(io_err(path))?;
    if meta.len() > MAX_KEY_FILE_BYTES {
        return Err(CryptoError::InvalidKey {
            reason: format!(
                "{} is {} bytes, larger than any key file",
                path.display(),
                meta.len()
            ),
        });
    }
    fs::read_to_string(path).map_err(io_err(path))
}

/// Reads a hex public key file.
///
/// # Errors
///
/// Returns [`CryptoError::Io`] if the file cannot be read and
/// [`CryptoError::InvalidKey`] if it does not hold a valid key.
pub fn read_public_key_file(path: &Path) -> Result<ManifestVerifier, CryptoError> {
    ManifestVerifier::from_hex(&read_bounded(path)?)
}

/// Reads a hex signing-key seed file.
///
/// # Errors
///
/// Returns [`CryptoError::Io`] if the file cannot be read and
/// [`CryptoError::InvalidKey`] if it does not hold a 32-byte seed.
pub fn read_signing_key_file(path: &Path) -> Result<ManifestSigner, CryptoError> {
    let text = read_bounded(path)?;
    let bytes = hex::decode(text.trim()).map_err(|e| CryptoError::InvalidKey {
        reason: format!("signing key is not hex: {e}"),
    })?;
    let seed: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| CryptoError::InvalidKey {
        reason: format!("signing key must be 32 bytes, got {}", v.len()),
    })?;
    Ok(ManifestSigner::from_seed(&seed))
}

/// Writes `<dir>/<name>.key` (mode 0600 on unix) and `<dir>/<name>.pub`.
/// Refuses to overwrite an existing signing key.
///
/// # Errors
///
/// Returns [`CryptoError::Io`] on any filesystem failure, including an
/// existing key file.
pub fn write_key_pair(
    signer: &ManifestSigner,
    dir: &Path,
    name: &str,
) -> Result<(PathBuf, PathBuf), CryptoError> {
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let secret_path = dir.join(format!("{name}.key"));
    let public_path = dir.join(format!("{name}.pub"));

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(&secret_path).map_err(io_err(&secret_path))?;
    writeln!(file, "{}", signer.seed_hex()).map_err(io_err(&secret_path))?;
    file.sync_all().map_err(io_err(&secret_path))?;

    fs::write(
        &public_path,
        format!("{}\n", signer.verifier().public_key_hex()),
    )
    .map_err(io_err(&public_path))?;

    Ok((secret_path, public_path))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn written_pair_reads_back() {
        let dir = TempDir::new().unwrap();
        let signer = ManifestSigner::generate();
        let (secret, public) = write_key_pair(&signer, dir.path(), "manifest").unwrap();

        let reread = read_signing_key_file(&secret).unwrap();
        assert_eq!(reread.key_id(), signer.key_id());
        let verifier = read_public_key_file(&public).unwrap();
        assert_eq!(verifier.key_id(), signer.key_id());
    }

    #[test]
    fn refuses_to_overwrite_signing_key() {
        let dir = TempDir::new().unwrap();
        let signer = ManifestSigner::generate();
        write_key_pair(&signer, dir.path(), "manifest").unwrap();
        assert!(matches!(
            write_key_pair(&signer, dir.path(), "manifest"),
            Err(CryptoError::Io { .. })
        ));
    }

    #[test]
    fn oversized_key_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.pub");
        fs::write(&path, "a".repeat(1024)).unwrap();
        assert!(matches!(
            read_public_key_file(&path),
            Err(CryptoError::InvalidKey { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn signing_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let (secret, _) = write_key_pair(&ManifestSigner::generate(), dir.path(), "k").unwrap();
        let mode = fs::metadata(secret).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}

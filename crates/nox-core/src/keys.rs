//! Host SSH identity injected into every guest.

use crate::error::{CoreError, Result};
use ssh_key::private::Ed25519Keypair;
use ssh_key::{LineEnding, PrivateKey};
use std::path::{Path, PathBuf};

/// File name of the private key under the ssh directory.
pub const KEY_FILE: &str = "id_ed25519";

/// The host's Ed25519 key pair, generated once and reused.
#[derive(Debug, Clone)]
pub struct HostKey {
    private_path: PathBuf,
    public: String,
}

impl HostKey {
    /// Load the key pair from `dir`, generating it on first use.
    pub fn load_or_generate(dir: &Path) -> Result<Self> {
        let private_path = dir.join(KEY_FILE);
        let public_path = dir.join(format!("{KEY_FILE}.pub"));

        if private_path.exists() {
            let public = match std::fs::read_to_string(&public_path) {
                Ok(s) => s.trim().to_string(),
                Err(_) => {
                    // Recover the public half from the private key.
                    let pem = std::fs::read_to_string(&private_path)?;
                    let key = PrivateKey::from_openssh(&pem).map_err(key_err)?;
                    let public = key.public_key().to_openssh().map_err(key_err)?;
                    std::fs::write(&public_path, format!("{public}\n"))?;
                    public
                }
            };
            return Ok(Self {
                private_path,
                public,
            });
        }

        std::fs::create_dir_all(dir)?;
        let seed: [u8; 32] = rand::random();
        let keypair = Ed25519Keypair::from_seed(&seed);
        let mut private_key = PrivateKey::from(keypair);
        private_key.set_comment("nox");
        let private_pem = private_key.to_openssh(LineEnding::LF).map_err(key_err)?;
        let public = private_key.public_key().to_openssh().map_err(key_err)?;

        write_private(&private_path, private_pem.as_bytes())?;
        std::fs::write(&public_path, format!("{public}\n"))?;
        tracing::info!(path = %private_path.display(), "Generated host SSH key");

        Ok(Self {
            private_path,
            public,
        })
    }

    /// OpenSSH-formatted public key.
    pub fn public_openssh(&self) -> &str {
        &self.public
    }

    /// Path to the private key, for `ssh -i`.
    pub fn private_path(&self) -> &Path {
        &self.private_path
    }
}

fn key_err(e: ssh_key::Error) -> CoreError {
    CoreError::Config(format!("SSH key error: {e}"))
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = HostKey::load_or_generate(dir.path()).unwrap();
        assert!(first.public_openssh().starts_with("ssh-ed25519 "));
        assert!(first.private_path().exists());

        let second = HostKey::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.public_openssh(), second.public_openssh());
    }

    #[test]
    fn test_public_recovered_from_private() {
        let dir = tempfile::tempdir().unwrap();
        let first = HostKey::load_or_generate(dir.path()).unwrap();
        std::fs::remove_file(dir.path().join("id_ed25519.pub")).unwrap();
        let again = HostKey::load_or_generate(dir.path()).unwrap();
        assert_eq!(first.public_openssh(), again.public_openssh());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let key = HostKey::load_or_generate(dir.path()).unwrap();
        let mode = std::fs::metadata(key.private_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

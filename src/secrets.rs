//! Secret provisioning for the wrapped server's authentication surfaces
//!
//! The wrapped server expects three opaque secrets: the web UI password, the
//! pre-authentication token trusted by the gateway, and the settings
//! encryption key. Operators may supply any of them via the secrets file;
//! everything else is generated once and persisted.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};

/// Default location of the secrets file inside the add-on data volume
pub const SECRETS_FILE_DEFAULT: &str = "/data/secrets.json";
/// Environment variable overriding the secrets file location
pub const SECRETS_FILE_ENV: &str = "SECRETS_FILE";

/// Fields shorter than this are treated as unset and regenerated
const MIN_SECRET_LEN: usize = 10;
/// Raw entropy per generated secret, before encoding
const SECRET_BYTES: usize = 32;

/// The three secrets handed to the wrapped server at spawn time.
///
/// JSON field names are contractual: the secrets file is shared with the
/// operator and must keep its shape across releases.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(rename = "webservicePassword", default)]
    pub webservice_password: String,
    #[serde(rename = "webservicePreAuthTokens", default)]
    pub webservice_pre_auth_tokens: String,
    #[serde(rename = "settingsEncryptionKey", default)]
    pub settings_encryption_key: String,
}

impl Secrets {
    /// Load the bundle from `path`, generating any missing or too-short
    /// field. The file is rewritten only when something was generated, so
    /// operator-supplied values are never overwritten with equally-valid
    /// regenerated ones.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        let mut secrets = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("could not decode secrets file {}", path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Secrets::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("could not open secrets file {}", path.display()))
            }
        };

        if secrets.fill_missing()? {
            secrets
                .persist(path)
                .with_context(|| format!("could not write secrets file {}", path.display()))?;
        } else {
            debug!(path = %path.display(), "secrets already complete, leaving file untouched");
        }

        Ok(secrets)
    }

    /// Replace every field below the strength threshold with a fresh random
    /// value. Returns whether anything changed.
    fn fill_missing(&mut self) -> Result<bool> {
        let mut modified = false;
        if self.webservice_password.len() < MIN_SECRET_LEN {
            self.webservice_password =
                generate_secret().context("could not generate webservicePassword")?;
            modified = true;
        }
        if self.webservice_pre_auth_tokens.len() < MIN_SECRET_LEN {
            self.webservice_pre_auth_tokens =
                generate_secret().context("could not generate webservicePreAuthTokens")?;
            modified = true;
        }
        if self.settings_encryption_key.len() < MIN_SECRET_LEN {
            self.settings_encryption_key =
                generate_secret().context("could not generate settingsEncryptionKey")?;
            modified = true;
        }
        Ok(modified)
    }

    /// Write the whole bundle in one encode, owner-readable only.
    fn persist(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;

        // Write to a sibling temp file and rename over the target, so a
        // crash mid-write never leaves a truncated secrets file behind.
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, path)?;

        info!(path = %path.display(), "generated secrets persisted");
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Generate a URL-safe random token.
///
/// 32 bytes from the OS RNG, encoded without padding: 43 characters, far
/// above the threshold that marks a field as already set. Fails only if the
/// OS randomness source is unavailable.
pub fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("OS randomness source unavailable")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_secret_length_and_alphabet() {
        let secret = generate_secret().unwrap();
        assert_eq!(secret.len(), 43);
        assert!(secret.len() >= MIN_SECRET_LEN);
        assert!(secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_generate_secret_is_not_repeating() {
        let a = generate_secret().unwrap();
        let b = generate_secret().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_missing_file_generates_all_fields() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("secrets.json");

        let secrets = Secrets::load_or_generate(&path).unwrap();

        assert!(secrets.webservice_password.len() >= MIN_SECRET_LEN);
        assert!(secrets.webservice_pre_auth_tokens.len() >= MIN_SECRET_LEN);
        assert!(secrets.settings_encryption_key.len() >= MIN_SECRET_LEN);
        assert!(path.exists());

        // The persisted file must round-trip to the same values
        let reloaded: Secrets =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded.webservice_password, secrets.webservice_password);
        assert_eq!(
            reloaded.webservice_pre_auth_tokens,
            secrets.webservice_pre_auth_tokens
        );
        assert_eq!(
            reloaded.settings_encryption_key,
            secrets.settings_encryption_key
        );
    }

    #[test]
    fn test_complete_file_is_not_rewritten() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("secrets.json");

        let content = r#"{
  "webservicePassword": "operator-password",
  "webservicePreAuthTokens": "operator-token",
  "settingsEncryptionKey": "operator-key-value"
}"#;
        std::fs::write(&path, content).unwrap();

        let secrets = Secrets::load_or_generate(&path).unwrap();

        assert_eq!(secrets.webservice_password, "operator-password");
        assert_eq!(secrets.webservice_pre_auth_tokens, "operator-token");
        assert_eq!(secrets.settings_encryption_key, "operator-key-value");

        // Byte-for-byte untouched: no gratuitous rewrite
        let after = std::fs::read(&path).unwrap();
        assert_eq!(after, content.as_bytes());
    }

    #[test]
    fn test_short_field_is_regenerated_and_persisted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("secrets.json");

        std::fs::write(
            &path,
            r#"{
  "webservicePassword": "short",
  "webservicePreAuthTokens": "operator-token",
  "settingsEncryptionKey": "operator-key-value"
}"#,
        )
        .unwrap();

        let secrets = Secrets::load_or_generate(&path).unwrap();

        assert_ne!(secrets.webservice_password, "short");
        assert!(secrets.webservice_password.len() >= MIN_SECRET_LEN);
        // Untouched fields keep their operator-supplied values
        assert_eq!(secrets.webservice_pre_auth_tokens, "operator-token");
        assert_eq!(secrets.settings_encryption_key, "operator-key-value");

        let reloaded: Secrets =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(reloaded.webservice_password, secrets.webservice_password);
    }

    #[test]
    fn test_parent_directory_is_created() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dir").join("secrets.json");

        Secrets::load_or_generate(&path).unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_secrets_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("secrets.json");

        Secrets::load_or_generate(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("secrets.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = Secrets::load_or_generate(&path).unwrap_err();
        assert!(err.to_string().contains("could not decode secrets file"));
    }
}

//! Password lookup in the OS keyring.
//!
//! Credential records may leave `DB_PASSWORD`/`SSH_PASSWORD` empty and keep
//! the secret in the platform keyring instead.

use crate::error::{CourierError, Result};
use keyring::Entry;
use tracing::{debug, warn};

const SERVICE_NAME: &str = "db-courier";

/// Access to secrets stored under the `db-courier` keyring service.
#[derive(Debug, Clone)]
pub struct SecretStorage {
    service: String,
}

impl Default for SecretStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStorage {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Stores a secret in the keyring.
    pub fn store(&self, key: &str, secret: &str) -> Result<()> {
        let entry = Entry::new(&self.service, key)
            .map_err(|e| CourierError::config(format!("Failed to create keyring entry: {e}")))?;

        entry
            .set_password(secret)
            .map_err(|e| CourierError::config(format!("Failed to store secret: {e}")))?;

        Ok(())
    }

    /// Retrieves a secret from the keyring.
    ///
    /// A missing entry or an unavailable keyring both yield `None`; the
    /// caller decides whether an absent password is an error.
    pub fn retrieve(&self, key: &str) -> Option<String> {
        let entry = match Entry::new(&self.service, key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Keyring unavailable: {e}");
                return None;
            }
        };

        match entry.get_password() {
            Ok(secret) => {
                debug!("Loaded secret '{key}' from keyring");
                Some(secret)
            }
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!("Failed to retrieve secret '{key}' from keyring: {e}");
                None
            }
        }
    }

    /// Deletes a secret from the keyring.
    pub fn delete(&self, key: &str) -> Result<()> {
        let entry = Entry::new(&self.service, key)
            .map_err(|e| CourierError::config(format!("Failed to access keyring: {e}")))?;

        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(CourierError::config(format!(
                "Failed to delete secret from keyring: {e}"
            ))),
        }
    }

    /// Keyring key for a database password.
    pub fn database_password_key(user: &str, host: &str) -> String {
        format!("db:{user}@{host}")
    }

    /// Keyring key for an SSH password.
    pub fn ssh_password_key(user: &str, host: &str) -> String {
        format!("ssh:{user}@{host}")
    }

    /// Masks a secret for display, showing only the last 4 characters.
    pub fn mask_secret(secret: &str) -> String {
        let chars: Vec<char> = secret.chars().collect();
        if chars.len() <= 4 {
            "*".repeat(chars.len())
        } else {
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", "*".repeat(4), tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret_short() {
        assert_eq!(SecretStorage::mask_secret("abc"), "***");
    }

    #[test]
    fn test_mask_secret_long() {
        assert_eq!(SecretStorage::mask_secret("hunter2-and-more"), "****...more");
    }

    #[test]
    fn test_key_names() {
        assert_eq!(
            SecretStorage::database_password_key("analyst", "db.internal"),
            "db:analyst@db.internal"
        );
        assert_eq!(
            SecretStorage::ssh_password_key("ec2-user", "bastion"),
            "ssh:ec2-user@bastion"
        );
    }
}

//! Archive key material kept in host settings.
//!
//! Every installation has a random 32-byte key, created on first use. An
//! operator may set a passphrase instead; new archives are then sealed with
//! it. Restores use the same lookup, so the passphrase in force at restore
//! time must be the one the archive was sealed with.

use crate::envelope::KeySource;
use crate::store::SettingsRepository;
use crate::utils::{EngineError, Result};

pub const INSTALLATION_KEY: &str = "installation_key";
pub const ENCRYPTION_PASSPHRASE: &str = "encryption_passphrase";

/// The installation key, generated and stored when absent.
pub fn installation_key<S: SettingsRepository + ?Sized>(settings: &S) -> Result<KeySource> {
    if let Some(stored) = settings.get_setting(INSTALLATION_KEY)? {
        return KeySource::installation_key_from_hex(&stored)
            .map_err(|e| EngineError::Config(format!("stored installation key is unusable: {e}")));
    }
    let key = KeySource::generate_installation_key();
    settings.set_setting(INSTALLATION_KEY, &hex::encode(key))?;
    tracing::info!("Generated installation key");
    Ok(KeySource::InstallationKey(key))
}

/// Key used to seal and open archives.
pub fn archive_key<S: SettingsRepository + ?Sized>(settings: &S) -> Result<KeySource> {
    match settings.get_setting(ENCRYPTION_PASSPHRASE)? {
        Some(passphrase) if !passphrase.is_empty() => Ok(KeySource::Password(passphrase)),
        _ => installation_key(settings),
    }
}

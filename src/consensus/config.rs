use std::fs;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::crypto::{Keypair, Pubkey};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read or write {file}: {message}")]
    Io { file: String, message: String },

    #[error("malformed config file {file}: {message}")]
    Malformed { file: String, message: String },
}

/// JSON file import/export for bootstrap material (committees, keys,
/// parameters).
pub trait Export: Serialize + DeserializeOwned {
    fn read(path: &str) -> Result<Self, ConfigError> {
        let data = fs::read(path).map_err(|e| ConfigError::Io {
            file: path.to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_slice(&data).map_err(|e| ConfigError::Malformed {
            file: path.to_string(),
            message: e.to_string(),
        })
    }

    fn write(&self, path: &str) -> Result<(), ConfigError> {
        let data = serde_json::to_vec_pretty(self).map_err(|e| ConfigError::Malformed {
            file: path.to_string(),
            message: e.to_string(),
        })?;
        fs::write(path, data).map_err(|e| ConfigError::Io {
            file: path.to_string(),
            message: e.to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Parameters {
    /// How long a replica waits in a round before giving up (ms).
    pub timeout_delay: u64,
    /// How long before unresolved sync requests are re-broadcast (ms).
    pub sync_retry_delay: u64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            timeout_delay: 5_000,
            sync_retry_delay: 10_000,
        }
    }
}

impl Export for Parameters {}
impl Export for super::committee::Committee {}

/// An authority's identity material as persisted on disk.
#[derive(Serialize, Deserialize)]
pub struct Secret {
    pub name: Pubkey,
    /// base58-encoded signing key.
    pub secret: String,
}

impl Secret {
    pub fn new() -> Self {
        let keypair = Keypair::new_pair();
        Secret {
            name: keypair.pubkey(),
            secret: bs58::encode(keypair.secret_bytes()).into_string(),
        }
    }

    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        let bytes = bs58::decode(&self.secret)
            .into_vec()
            .map_err(|e| ConfigError::Malformed {
                file: "<secret>".to_string(),
                message: e.to_string(),
            })?;
        let secret: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::Malformed {
            file: "<secret>".to_string(),
            message: "signing key must be 32 bytes".to_string(),
        })?;
        let keypair = Keypair::from_secret(&secret);
        if keypair.pubkey() != self.name {
            return Err(ConfigError::Malformed {
                file: "<secret>".to_string(),
                message: "signing key does not match the declared identity".to_string(),
            });
        }
        Ok(keypair)
    }
}

impl Default for Secret {
    fn default() -> Self {
        Self::new()
    }
}

impl Export for Secret {}

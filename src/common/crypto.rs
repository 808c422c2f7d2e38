use std::fmt;

use ed25519_dalek::{
    ed25519::{self, signature::Signer},
    SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as ShaDigest, Sha512};

pub const DIGEST_SIZE: usize = 32;

/// 32-byte content address (Sha512 truncated).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form, enough to tell blocks apart in logs.
        let full = bs58::encode(&self.0).into_string();
        write!(f, "{}", &full[..8.min(full.len())])
    }
}

pub trait Hashable {
    fn digest(&self) -> Digest;
}

/// Finalize a Sha512 hasher into a truncated 32-byte digest.
pub fn digest_from_hasher(hasher: Sha512) -> Digest {
    let result = hasher.finalize();
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&result[..DIGEST_SIZE]);
    Digest(digest)
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Pubkey {
    pub key: [u8; 32],
}

impl AsRef<[u8]> for Pubkey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl From<&[u8; 32]> for Pubkey {
    fn from(bytes: &[u8; 32]) -> Self {
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes[..32]);
        Pubkey { key }
    }
}

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.key).into_string())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = bs58::encode(&self.key).into_string();
        write!(f, "{}", &full[..8.min(full.len())])
    }
}

// Identities appear as JSON map keys in committee files, so they serialize
// as base58 strings rather than byte arrays.
impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&bs58::encode(&self.key).into_string())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = bs58::decode(&s)
            .into_vec()
            .map_err(|e| de::Error::custom(format!("base58 decode: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("public key must be 32 bytes"))?;
        Ok(Pubkey { key })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Signature {
    pub signer: Pubkey,
    pub sig: ed25519::Signature,
}

#[derive(Clone)]
pub struct Keypair {
    pubkey: Pubkey,
    dalek_signer: SigningKey,
}

impl Keypair {
    pub fn new_pair() -> Self {
        let mut csprng = OsRng;
        let dalek_signer = SigningKey::generate(&mut csprng);
        let pubkey = Pubkey::from(&dalek_signer.verifying_key().to_bytes());

        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        let dalek_signer = SigningKey::from_bytes(secret);
        let pubkey = Pubkey::from(&dalek_signer.verifying_key().to_bytes());

        Keypair {
            pubkey,
            dalek_signer,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.dalek_signer.to_bytes()
    }

    pub fn sign(&self, digest: &Digest) -> Signature {
        let sig = self.dalek_signer.sign(digest.as_ref());

        Signature {
            signer: self.pubkey,
            sig,
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.pubkey
    }
}

impl Signature {
    pub fn verify(&self, digest: &Digest) -> bool {
        let Ok(dalek_pubkey) = VerifyingKey::from_bytes(&self.signer.key) else {
            return false;
        };
        dalek_pubkey
            .verify_strict(digest.as_ref(), &self.sig)
            .is_ok()
    }

    /// Placeholder signature carried by genesis structures; verifies nothing.
    pub fn unsigned() -> Self {
        Signature {
            signer: Pubkey::default(),
            sig: ed25519::Signature::from_bytes(&[0u8; 64]),
        }
    }
}

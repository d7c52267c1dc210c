//! Key material handling: codec, generation, and address derivation
//!
//! A wallet's key material travels as hex-encoded JSON (the "exported" form)
//! so it can live inside a CRD field and a Secret value. The cryptographic
//! operations sit behind the [`KeyEngine`] trait; the controller only ever
//! sees descriptors and address strings.

use crate::crd::WalletSpec;
use crate::error::{OperatorError, Result};
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Supported signature schemes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Bls,
    Secp256k1,
}

impl KeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Bls => "bls",
            KeyType::Secp256k1 => "secp256k1",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bls" => Ok(KeyType::Bls),
            "secp256k1" => Ok(KeyType::Secp256k1),
            other => Err(OperatorError::UnsupportedKeyType(other.to_string())),
        }
    }
}

/// Key material descriptor: scheme tag plus raw private key bytes.
///
/// Only the encoded form is ever persisted; in-memory copies are zeroized on
/// drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyInfo {
    #[zeroize(skip)]
    pub key_type: KeyType,
    #[serde(with = "hex::serde")]
    pub private_key: Vec<u8>,
}

impl fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInfo")
            .field("key_type", &self.key_type)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Encode a descriptor into its transport form: hex over canonical JSON.
pub fn encode_key_info(info: &KeyInfo) -> Result<String> {
    let bytes = serde_json::to_vec(info)?;
    Ok(hex::encode(bytes))
}

/// Decode the transport form back into a descriptor. Exact inverse of
/// [`encode_key_info`].
pub fn decode_key_info(exported: &str) -> Result<KeyInfo> {
    let bytes = hex::decode(exported)
        .map_err(|e| OperatorError::MalformedKeyData(format!("invalid hex: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| OperatorError::MalformedKeyData(format!("invalid descriptor: {e}")))
}

/// Cryptographic capability used by the provisioner: keypair generation and
/// public key / address derivation.
pub trait KeyEngine: Send + Sync {
    /// Generate a fresh keypair, returning the descriptor and its address.
    fn generate(&self, key_type: KeyType) -> Result<(KeyInfo, String)>;

    /// Derive the public key for existing private key bytes.
    fn derive_public_key(&self, key_type: KeyType, private_key: &[u8]) -> Result<Vec<u8>>;

    /// Derive the public address string for a public key.
    fn derive_address(&self, key_type: KeyType, public_key: &[u8]) -> Result<String>;
}

/// In-process [`KeyEngine`] backed by k256 and blst.
///
/// secp256k1 addresses follow the EVM convention: the last 20 bytes of
/// Keccak-256 over the uncompressed public key (0x04 prefix dropped). BLS
/// addresses embed the 48-byte compressed public key directly.
pub struct LocalKeyEngine;

impl LocalKeyEngine {
    /// 32 bytes from the OS CSPRNG.
    fn entropy() -> Result<[u8; 32]> {
        use rand::TryRngCore;
        let mut buf = [0u8; 32];
        rand::rngs::OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| OperatorError::KeyDerivation(format!("OS CSPRNG failed: {e}")))?;
        Ok(buf)
    }
}

impl KeyEngine for LocalKeyEngine {
    fn generate(&self, key_type: KeyType) -> Result<(KeyInfo, String)> {
        let private_key = match key_type {
            KeyType::Secp256k1 => {
                let sk = SigningKey::from_bytes((&Self::entropy()?).into())
                    .map_err(|e| OperatorError::KeyDerivation(e.to_string()))?;
                sk.to_bytes().to_vec()
            }
            KeyType::Bls => {
                let sk = blst::min_pk::SecretKey::key_gen(&Self::entropy()?, &[])
                    .map_err(|e| OperatorError::KeyDerivation(format!("bls keygen: {e:?}")))?;
                sk.to_bytes().to_vec()
            }
        };
        let public_key = self.derive_public_key(key_type, &private_key)?;
        let address = self.derive_address(key_type, &public_key)?;
        Ok((KeyInfo { key_type, private_key }, address))
    }

    fn derive_public_key(&self, key_type: KeyType, private_key: &[u8]) -> Result<Vec<u8>> {
        match key_type {
            KeyType::Secp256k1 => {
                let sk = SigningKey::from_slice(private_key)
                    .map_err(|e| OperatorError::KeyDerivation(e.to_string()))?;
                // 65 bytes: 0x04 || x || y
                Ok(sk.verifying_key().to_encoded_point(false).as_bytes().to_vec())
            }
            KeyType::Bls => {
                let sk = blst::min_pk::SecretKey::from_bytes(private_key)
                    .map_err(|e| OperatorError::KeyDerivation(format!("bls secret key: {e:?}")))?;
                Ok(sk.sk_to_pk().compress().to_vec())
            }
        }
    }

    fn derive_address(&self, key_type: KeyType, public_key: &[u8]) -> Result<String> {
        match key_type {
            KeyType::Secp256k1 => {
                if public_key.len() != 65 {
                    return Err(OperatorError::KeyDerivation(format!(
                        "expected 65-byte uncompressed secp256k1 public key, got {}",
                        public_key.len()
                    )));
                }
                let hash = Keccak256::digest(&public_key[1..]);
                Ok(format!("0x{}", hex::encode(&hash[12..])))
            }
            KeyType::Bls => {
                if public_key.len() != 48 {
                    return Err(OperatorError::KeyDerivation(format!(
                        "expected 48-byte compressed bls public key, got {}",
                        public_key.len()
                    )));
                }
                Ok(format!("0x{}", hex::encode(public_key)))
            }
        }
    }
}

/// Fill out the wallet's key material in place.
///
/// Externally supplied exported material is authoritative and never
/// regenerated; only a missing address is back-filled. Returns whether the
/// spec changed so the caller knows to persist it.
pub fn ensure_key_material(spec: &mut WalletSpec, keys: &dyn KeyEngine) -> Result<bool> {
    if spec.exported.is_empty() {
        // Resolve the key type before touching any field so an unsupported
        // scheme leaves the resource untouched.
        let key_type = if spec.key_type.is_empty() {
            KeyType::Bls
        } else {
            spec.key_type.parse()?
        };
        let (info, address) = keys.generate(key_type)?;
        let exported = encode_key_info(&info)?;
        spec.key_type = key_type.to_string();
        spec.address = address;
        spec.exported = exported;
        return Ok(true);
    }

    if spec.address.is_empty() {
        // The descriptor's own type wins over spec.keyType: a defaulted or
        // stale spec field must not change how an imported key is derived.
        let info = decode_key_info(&spec.exported)?;
        let public_key = keys.derive_public_key(info.key_type, &info.private_key)?;
        spec.address = keys.derive_address(info.key_type, &public_key)?;
        return Ok(true);
    }

    Ok(false)
}

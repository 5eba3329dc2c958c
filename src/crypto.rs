//! Cryptographic primitives for CairnChain

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use sha2::{Digest, Sha256};

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

pub const ADDRESS_SIZE: usize = 20;
pub const SIGNATURE_SIZE: usize = COMPACT_SIGNATURE_SIZE;

/// Ledger address: the first 20 bytes of sha256(compressed public key).
pub type Address = [u8; ADDRESS_SIZE];

pub fn address_from_public_key(public_key: &PublicKey) -> Address {
    let pubkey_bytes: [u8; PUBLIC_KEY_SIZE] = public_key.serialize();
    let digest = Sha256::digest(pubkey_bytes);
    let mut address = [0u8; ADDRESS_SIZE];
    address.copy_from_slice(&digest[..ADDRESS_SIZE]);
    address
}

pub fn address_to_hex(addr: &Address) -> String {
    hex::encode(addr)
}

pub fn address_from_hex(hex_str: &str) -> Result<Address, ChainError> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| ChainError::CryptoError(format!("Invalid hex address: {}", e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ChainError::CryptoError(format!("Address must be {} bytes, got {}", ADDRESS_SIZE, b.len()))
    })
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;
        Ok(Self::from_secret_key(secret_key))
    }

    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key)
    }

    /// Sign a 32-byte digest; returns the compact signature and its recovery id.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> ([u8; SIGNATURE_SIZE], u8) {
        let message = Message::from_digest(*digest);
        let signature = SECP256K1_CONTEXT.sign_ecdsa_recoverable(&message, &self.secret_key);
        let (recovery_id, bytes) = signature.serialize_compact();
        (bytes, recovery_id.to_i32() as u8)
    }
}

/// Recover the signer of `digest` and check the signature against it.
/// Returns the signer's address.
pub fn recover_signer(
    digest: &[u8; 32],
    signature_bytes: &[u8],
    recovery_param: u8,
) -> Result<Address, ChainError> {
    let recovery_id = RecoveryId::from_i32(recovery_param as i32)
        .map_err(|e| ChainError::CryptoError(format!("Invalid recovery id: {}", e)))?;
    let signature = RecoverableSignature::from_compact(signature_bytes, recovery_id)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;
    let message = Message::from_digest(*digest);

    let public_key = SECP256K1_CONTEXT
        .recover_ecdsa(&message, &signature)
        .map_err(|_| ChainError::CryptoError("Public key recovery failed".to_string()))?;
    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature.to_standard(), &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))?;

    Ok(address_from_public_key(&public_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_generation() {
        let keypair = KeyPair::generate();
        let address = keypair.address();
        assert_eq!(address.len(), ADDRESS_SIZE);
        assert_eq!(address_to_hex(&address).len(), 40);
        assert_eq!(address_from_hex(&address_to_hex(&address)).unwrap(), address);
    }

    #[test]
    fn test_sign_and_recover() {
        let keypair = KeyPair::generate();
        let digest: [u8; 32] = Sha256::digest(b"Hello, CairnChain!").into();

        let (signature, recovery_param) = keypair.sign_digest(&digest);
        assert!(recovery_param <= 3);
        let signer = recover_signer(&digest, &signature, recovery_param).unwrap();
        assert_eq!(signer, keypair.address());
    }

    #[test]
    fn test_tampered_digest_recovers_someone_else() {
        let keypair = KeyPair::generate();
        let digest: [u8; 32] = Sha256::digest(b"Original message").into();
        let tampered: [u8; 32] = Sha256::digest(b"Tampered message").into();

        let (signature, recovery_param) = keypair.sign_digest(&digest);
        match recover_signer(&tampered, &signature, recovery_param) {
            Ok(signer) => assert_ne!(signer, keypair.address()),
            Err(e) => assert!(e.to_string().starts_with("Cryptographic error")),
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let keypair = KeyPair::generate();
        let digest = [1u8; 32];
        let (signature, recovery_param) = keypair.sign_digest(&digest);

        assert!(recover_signer(&digest, &signature[1..], recovery_param).is_err());
        assert!(recover_signer(&digest, &signature, 4).is_err());
        assert!(address_from_hex("abcd").is_err());
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result.unwrap_err().to_string().contains("Secret key must be"));
    }
}

use crate::Error;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sign_message::MessageSignature;
use bitcoin::{PrivateKey, PublicKey, VarInt};

/// Identifies a wire message in the seen caches and in relay inventories.
pub type MessageHash = sha256d::Hash;

const MESSAGE_MAGIC: &str = "DarkCoin Signed Message:\n";

/// Compact recoverable signatures over magic-prefixed text messages.
pub struct MessageSigner;

impl MessageSigner {
    /// SHA256D(varstr(magic) + varstr(message))
    pub fn message_hash(message: &str) -> sha256d::Hash {
        let mut engine = sha256d::Hash::engine();
        for part in [MESSAGE_MAGIC, message] {
            VarInt(part.len() as u64)
                .consensus_encode(&mut engine)
                .expect("engines don't error");
            engine.input(part.as_bytes());
        }
        sha256d::Hash::from_engine(engine)
    }

    pub fn sign_message(message: &str, key: &PrivateKey) -> Result<Vec<u8>, Error> {
        let secp = Secp256k1::signing_only();
        let msg = Message::from_slice(Self::message_hash(message).as_byte_array())?;
        let signature = secp.sign_ecdsa_recoverable(&msg, &key.inner);
        Ok(MessageSignature::new(signature, key.compressed)
            .serialize()
            .to_vec())
    }

    /// Recovers the signing key from `signature` and compares its key id with
    /// the one of `pubkey`.
    pub fn verify_message(pubkey: &PublicKey, signature: &[u8], message: &str) -> Result<(), String> {
        let signature = MessageSignature::from_slice(signature).map_err(|e| e.to_string())?;
        let recovered = signature
            .recover_pubkey(&Secp256k1::verification_only(), Self::message_hash(message))
            .map_err(|e| e.to_string())?;

        if recovered.pubkey_hash() != pubkey.pubkey_hash() {
            return Err(format!(
                "keys don't match: pubkey={}, pubkeyFromSig={}, message={}",
                pubkey.pubkey_hash(),
                recovered.pubkey_hash(),
                message
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::private_key;

    #[test]
    fn signature_round_trip() {
        let key = private_key(1);
        let secp = Secp256k1::new();
        let sig = MessageSigner::sign_message("hello", &key).unwrap();

        assert_eq!(sig.len(), 65);
        MessageSigner::verify_message(&key.public_key(&secp), &sig, "hello").unwrap();
    }

    #[test]
    fn should_reject_other_key_or_message() {
        let key = private_key(1);
        let other = private_key(2);
        let secp = Secp256k1::new();
        let sig = MessageSigner::sign_message("hello", &key).unwrap();

        assert!(MessageSigner::verify_message(&other.public_key(&secp), &sig, "hello").is_err());
        assert!(MessageSigner::verify_message(&key.public_key(&secp), &sig, "hellO").is_err());
    }

    #[test]
    fn should_reject_malformed_signature() {
        let secp = Secp256k1::new();
        let pubkey = private_key(1).public_key(&secp);
        assert!(MessageSigner::verify_message(&pubkey, &[], "hello").is_err());
        assert!(MessageSigner::verify_message(&pubkey, &[0u8; 65], "hello").is_err());
    }

    #[test]
    fn message_hash_is_magic_prefixed() {
        let plain = sha256d::Hash::hash(b"hello");
        assert_ne!(MessageSigner::message_hash("hello"), plain);
        assert_eq!(
            MessageSigner::message_hash("hello"),
            MessageSigner::message_hash("hello")
        );
    }
}

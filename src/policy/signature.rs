//! Policy signatures: EIP-191 personal messages over the canonical policy JSON.

use crate::types::Policy;
use anyhow::{anyhow, Context, Result};
use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

/// Bytes the user signs: the policy serialized with an empty signature.
///
/// `progress` is server-managed and left out, so marking a policy done does
/// not invalidate the owner's signature.
pub fn signing_payload(policy: &Policy) -> Result<Vec<u8>> {
    let mut unsigned = policy.clone();
    unsigned.signature.clear();
    unsigned.progress.clear();
    serde_json::to_vec(&unsigned).context("Failed to serialize policy for signing")
}

/// Keccak-256 of the EIP-191 prefixed message.
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Check `policy.signature` (`r || s [|| v]`, hex) against `policy.public_key_ecdsa`.
pub fn verify_policy_signature(policy: &Policy) -> Result<()> {
    let key_bytes = hex::decode(policy.public_key_ecdsa.trim_start_matches("0x"))
        .context("Public key is not hex")?;
    let key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|_| anyhow!("Public key is not a valid secp256k1 point"))?;

    let sig_bytes = hex::decode(policy.signature.trim_start_matches("0x"))
        .context("Signature is not hex")?;
    if sig_bytes.len() != 64 && sig_bytes.len() != 65 {
        return Err(anyhow!("Signature must be 64 or 65 bytes, got {}", sig_bytes.len()));
    }
    let signature = Signature::from_slice(&sig_bytes[..64])
        .map_err(|_| anyhow!("Malformed signature"))?;
    let signature = signature.normalize_s().unwrap_or(signature);

    let hash = personal_message_hash(&signing_payload(policy)?);
    key.verify_prehash(&hash, &signature)
        .map_err(|_| anyhow!("Signature does not match policy public key"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::state::policies::tests::sample_policy;
    use k256::ecdsa::SigningKey;

    /// Sign `policy` in place the way a wallet would.
    pub(crate) fn sign(policy: &mut Policy, key: &SigningKey) {
        policy.public_key_ecdsa = hex::encode(key.verifying_key().to_encoded_point(true).as_bytes());
        let hash = personal_message_hash(&signing_payload(policy).unwrap());
        let (signature, recovery_id) = key.sign_prehash_recoverable(&hash).unwrap();
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(recovery_id.to_byte() + 27);
        policy.signature = format!("0x{}", hex::encode(bytes));
    }

    pub(crate) fn test_key() -> SigningKey {
        SigningKey::from_bytes([7u8; 32].as_slice().into()).unwrap()
    }

    #[test]
    fn signed_policy_verifies() {
        let mut policy = sample_policy("p-1");
        sign(&mut policy, &test_key());
        verify_policy_signature(&policy).unwrap();
    }

    #[test]
    fn payload_ignores_signature_and_progress() {
        let mut a = sample_policy("p-1");
        let b = a.clone();
        a.signature = "0xdeadbeef".into();
        a.progress = "DONE".into();
        assert_eq!(signing_payload(&a).unwrap(), signing_payload(&b).unwrap());
    }

    #[test]
    fn tampered_policy_fails() {
        let mut policy = sample_policy("p-1");
        sign(&mut policy, &test_key());
        policy.policy["schedule"]["frequency"] = "hourly".into();
        assert!(verify_policy_signature(&policy).is_err());
    }

    #[test]
    fn other_key_fails() {
        let mut policy = sample_policy("p-1");
        sign(&mut policy, &test_key());
        let other = SigningKey::from_bytes([9u8; 32].as_slice().into()).unwrap();
        policy.public_key_ecdsa =
            hex::encode(other.verifying_key().to_encoded_point(false).as_bytes());
        assert!(verify_policy_signature(&policy).is_err());
    }

    #[test]
    fn malformed_inputs_fail() {
        let mut policy = sample_policy("p-1");
        sign(&mut policy, &test_key());
        let mut short = policy.clone();
        short.signature = "0x1234".into();
        assert!(verify_policy_signature(&short).is_err());

        let mut bad_key = policy.clone();
        bad_key.public_key_ecdsa = "zz".into();
        assert!(verify_policy_signature(&bad_key).is_err());
    }

    #[test]
    fn prefix_matches_eip191() {
        let expected = Keccak256::digest(b"\x19Ethereum Signed Message:\n5hello");
        assert_eq!(personal_message_hash(b"hello").as_slice(), expected.as_slice());
    }
}

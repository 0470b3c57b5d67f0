//! Signature verification for feed records.
//!
//! Verification is a pure function of its inputs. Malformed keys and
//! signatures are rejections, never errors.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::record::{SIGNATURE_LEN, signable_bytes};
use super::FEED_KEY_LEN;

/// Result of checking a record signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Rejected(RejectReason),
}

/// Why a record failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Key has the wrong length or is not a curve point
    InvalidPublicKey,
    /// Signature has the wrong length
    MalformedSignature,
    /// Signature does not cover the claimed sequence and payload
    SignatureMismatch,
}

impl Verification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Verification::Verified)
    }
}

/// Checks `signature` over the v1 encoding of `sequence` and `payload`.
pub fn verify_record(
    public_key: &[u8],
    sequence: u64,
    payload: &[u8],
    signature: &[u8],
) -> Verification {
    let Ok(key_bytes) = <[u8; FEED_KEY_LEN]>::try_from(public_key) else {
        return Verification::Rejected(RejectReason::InvalidPublicKey);
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return Verification::Rejected(RejectReason::InvalidPublicKey);
    };
    let Ok(signature_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return Verification::Rejected(RejectReason::MalformedSignature);
    };

    let signature = Signature::from_bytes(&signature_bytes);
    match verifying_key.verify(&signable_bytes(sequence, payload), &signature) {
        Ok(()) => Verification::Verified,
        Err(_) => Verification::Rejected(RejectReason::SignatureMismatch),
    }
}

//! EventSub message signatures.
//!
//! Twitch signs `message_id || timestamp || body` with HMAC-SHA256 using the
//! secret supplied at subscription time and sends it as `sha256=<hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature must start with 'sha256='")]
    MissingPrefix,
    #[error("signature is not valid hex")]
    InvalidHex,
    #[error("failed to initialize signature verifier")]
    InvalidKey,
    #[error("signature mismatch")]
    Mismatch,
}

/// Checks `provided` against the expected signature in constant time.
pub fn verify_signature(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), SignatureError> {
    let hex_part = provided
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::MissingPrefix)?;
    let provided_bytes = hex::decode(hex_part).map_err(|_| SignatureError::InvalidHex)?;

    let mac = signed_mac(secret, message_id, timestamp, body)?;
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Produces the `sha256=<hex>` header value for a message.
#[cfg(test)]
pub fn compute_signature(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String, SignatureError> {
    let mac = signed_mac(secret, message_id, timestamp, body)?;
    Ok(format!(
        "{SIGNATURE_PREFIX}{}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

fn signed_mac(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<Hmac<Sha256>, SignatureError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef";
    const MESSAGE_ID: &str = "m1";
    const TIMESTAMP: &str = "2024-01-01T00:00:00.123Z";
    const BODY: &[u8] = br#"{"event":{"id":"evt-1"}}"#;

    fn flip(bytes: &[u8], index: usize) -> Vec<u8> {
        let mut copy = bytes.to_vec();
        copy[index] ^= 0x01;
        copy
    }

    #[test]
    fn accepts_matching_signature() {
        let signature = compute_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY).unwrap();
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert_eq!(
            verify_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY, &signature),
            Ok(())
        );
    }

    #[test]
    fn any_body_byte_mutation_invalidates() {
        let signature = compute_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY).unwrap();
        for index in 0..BODY.len() {
            let mutated = flip(BODY, index);
            assert_eq!(
                verify_signature(SECRET, MESSAGE_ID, TIMESTAMP, &mutated, &signature),
                Err(SignatureError::Mismatch),
                "body byte {index}"
            );
        }
    }

    #[test]
    fn message_id_and_timestamp_mutations_invalidate() {
        let signature = compute_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY).unwrap();
        for index in 0..MESSAGE_ID.len() {
            let mutated = String::from_utf8(flip(MESSAGE_ID.as_bytes(), index)).unwrap();
            assert!(verify_signature(SECRET, &mutated, TIMESTAMP, BODY, &signature).is_err());
        }
        for index in 0..TIMESTAMP.len() {
            let mutated = String::from_utf8(flip(TIMESTAMP.as_bytes(), index)).unwrap();
            assert!(verify_signature(SECRET, MESSAGE_ID, &mutated, BODY, &signature).is_err());
        }
    }

    #[test]
    fn rejects_malformed_values() {
        assert_eq!(
            verify_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY, "deadbeef"),
            Err(SignatureError::MissingPrefix)
        );
        assert_eq!(
            verify_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY, "sha256=zz"),
            Err(SignatureError::InvalidHex)
        );
        assert_eq!(
            verify_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY, "sha256=deadbeef"),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY, ""),
            Err(SignatureError::MissingPrefix)
        );
    }

    #[test]
    fn different_secret_does_not_verify() {
        let signature = compute_signature(b"another-secret", MESSAGE_ID, TIMESTAMP, BODY).unwrap();
        assert_eq!(
            verify_signature(SECRET, MESSAGE_ID, TIMESTAMP, BODY, &signature),
            Err(SignatureError::Mismatch)
        );
    }
}

//! Visitor credentials: a lightweight anti-bot gate.
//!
//! A credential is `{timestamp}.{hex hmac-sha256(timestamp)}` signed with a
//! key generated at startup, so every credential becomes invalid when the
//! process restarts. It proves the client fetched `/visitor` from this
//! server, nothing more.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential is malformed")]
    Malformed,
    #[error("credential signature does not match")]
    BadSignature,
}

pub struct VisitorGate {
    /// Keyed MAC, cloned for every signature
    keyed: HmacSha256,
}

impl VisitorGate {
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::with_secret(secret)
    }

    pub fn with_secret(secret: [u8; 32]) -> Self {
        let keyed = HmacSha256::new_from_slice(&secret).expect("HMAC takes keys of any length");
        Self { keyed }
    }

    fn mac(&self) -> HmacSha256 {
        self.keyed.clone()
    }

    /// Credential stamped with the current wall clock
    pub fn issue(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.issue_at(now)
    }

    pub fn issue_at(&self, timestamp: u64) -> String {
        let stamp = timestamp.to_string();
        let mut mac = self.mac();
        mac.update(stamp.as_bytes());
        format!("{}.{}", stamp, hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a credential, comparing signatures in constant time.
    pub fn verify(&self, credential: &str) -> Result<(), CredentialError> {
        let (stamp, signature) = credential
            .split_once('.')
            .ok_or(CredentialError::Malformed)?;
        if stamp.is_empty() || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CredentialError::Malformed);
        }
        let signature = hex::decode(signature).map_err(|_| CredentialError::Malformed)?;
        let mut mac = self.mac();
        mac.update(stamp.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| CredentialError::BadSignature)
    }
}

impl Default for VisitorGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_credential_verifies() {
        let gate = VisitorGate::new();
        let credential = gate.issue();
        assert_eq!(gate.verify(&credential), Ok(()));
    }

    #[test]
    fn credential_has_timestamp_and_hex_signature() {
        let gate = VisitorGate::with_secret([7; 32]);
        let credential = gate.issue_at(1_700_000_000_000);
        let (stamp, sig) = credential.split_once('.').unwrap();
        assert_eq!(stamp, "1700000000000");
        assert_eq!(sig.len(), 64);
        assert!(sig.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn other_process_credentials_are_rejected() {
        let a = VisitorGate::with_secret([1; 32]);
        let b = VisitorGate::with_secret([2; 32]);
        assert_eq!(
            b.verify(&a.issue_at(12345)),
            Err(CredentialError::BadSignature)
        );
    }

    #[test]
    fn tampered_timestamp_is_rejected() {
        let gate = VisitorGate::with_secret([3; 32]);
        let credential = gate.issue_at(100);
        let forged = credential.replacen("100", "101", 1);
        assert_eq!(gate.verify(&forged), Err(CredentialError::BadSignature));
    }

    #[test]
    fn malformed_credentials() {
        let gate = VisitorGate::with_secret([4; 32]);
        for bad in ["", "nodot", ".abcd", "12.zz", "abc.00", "12."] {
            let err = gate.verify(bad).unwrap_err();
            assert!(
                matches!(err, CredentialError::Malformed | CredentialError::BadSignature),
                "{:?} -> {:?}",
                bad,
                err
            );
        }
        assert_eq!(gate.verify("nodot"), Err(CredentialError::Malformed));
        assert_eq!(gate.verify("12.zz"), Err(CredentialError::Malformed));
    }
}

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use pbkdf2::pbkdf2_hmac;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const SALT_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const KDF_ROUNDS: u32 = 100_000;

const KEY_LEN: usize = 32;
const VERIFY_DOMAIN: &[u8] = b"tgvault/password-check/v1";
const VERIFY_SALT_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed")]
    Encryption,
    #[error("authentication failed: wrong password or tampered data")]
    Authentication,
    #[error("malformed password check: {0}")]
    MalformedCheck(String),
}

/// Password-based AEAD. A new salt and nonce are drawn for every call, so the
/// key is re-derived for every blob.
#[derive(Clone)]
pub struct Cipher {
    password: Vec<u8>,
    rounds: u32,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(password: &str) -> Self {
        Self::with_rounds(password, KDF_ROUNDS)
    }

    pub fn with_rounds(password: &str, rounds: u32) -> Self {
        Self {
            password: password.as_bytes().to_vec(),
            rounds: rounds.max(1),
        }
    }

    /// Returns `salt ‖ nonce ‖ ciphertext ‖ tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Encryption)?;

        let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(CipherError::Authentication);
        }
        let (salt, rest) = data.split_at(SALT_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let key = self.derive_key(salt);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Authentication)
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.password, salt, self.rounds, &mut key);
        key
    }
}

/// Builds the stored password check: `pbkdf2$<rounds>$<salt hex>$<hash hex>`.
/// The salt is bound to a fixed domain label, so the check never equals a key
/// used for data.
pub fn password_check(password: &str) -> String {
    password_check_with_rounds(password, KDF_ROUNDS)
}

pub fn password_check_with_rounds(password: &str, rounds: u32) -> String {
    let mut salt = [0u8; VERIFY_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let hash = check_hash(password, &salt, rounds.max(1));
    format!(
        "pbkdf2${}${}${}",
        rounds.max(1),
        hex::encode(salt),
        hex::encode(hash)
    )
}

pub fn verify_password(password: &str, check: &str) -> Result<bool, CipherError> {
    let malformed = || CipherError::MalformedCheck(check.to_string());
    let mut parts = check.split('$');
    if parts.next() != Some("pbkdf2") {
        return Err(malformed());
    }
    let rounds: u32 = parts
        .next()
        .and_then(|r| r.parse().ok())
        .ok_or_else(malformed)?;
    let salt = parts
        .next()
        .and_then(|s| hex::decode(s).ok())
        .ok_or_else(malformed)?;
    let expected = parts
        .next()
        .and_then(|h| hex::decode(h).ok())
        .ok_or_else(malformed)?;
    if parts.next().is_some() || expected.len() != KEY_LEN {
        return Err(malformed());
    }
    let actual = check_hash(password, &salt, rounds);
    Ok(actual.as_slice().ct_eq(&expected).into())
}

fn check_hash(password: &str, salt: &[u8], rounds: u32) -> [u8; KEY_LEN] {
    let mut domain_salt = Vec::with_capacity(VERIFY_DOMAIN.len() + salt.len());
    domain_salt.extend_from_slice(VERIFY_DOMAIN);
    domain_salt.extend_from_slice(salt);
    let mut out = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &domain_salt, rounds, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_len(plaintext_len: usize) -> usize {
        SALT_LEN + NONCE_LEN + plaintext_len + TAG_LEN
    }

    fn cipher(password: &str) -> Cipher {
        Cipher::with_rounds(password, 1_000)
    }

    #[test]
    fn encrypts_and_decrypts_payloads() {
        let c = cipher("correct horse");
        for payload in [&b""[..], &b"x"[..], &[7u8; 4096][..]] {
            let sealed = c.encrypt(payload).unwrap();
            assert_eq!(sealed.len(), sealed_len(payload.len()));
            assert_eq!(c.decrypt(&sealed).unwrap(), payload);
        }
    }

    #[test]
    fn wrong_password_fails_authentication() {
        let sealed = cipher("one").encrypt(b"secret").unwrap();
        assert_eq!(
            cipher("two").decrypt(&sealed),
            Err(CipherError::Authentication)
        );
    }

    #[test]
    fn tampering_is_detected() {
        let c = cipher("pw");
        let mut sealed = c.encrypt(b"secret payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(c.decrypt(&sealed), Err(CipherError::Authentication));
        assert_eq!(c.decrypt(&sealed[..20]), Err(CipherError::Authentication));
    }

    #[test]
    fn same_input_never_repeats_ciphertext() {
        let c = cipher("pw");
        let a = c.encrypt(b"same").unwrap();
        let b = c.encrypt(b"same").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..SALT_LEN], b[..SALT_LEN]);
    }

    #[test]
    fn password_check_verifies_only_the_right_password() {
        let check = password_check_with_rounds("hunter2", 1_000);
        assert!(check.starts_with("pbkdf2$1000$"));
        assert!(verify_password("hunter2", &check).unwrap());
        assert!(!verify_password("hunter3", &check).unwrap());
        assert!(!check.contains("hunter2"));
    }

    #[test]
    fn check_differing_only_in_the_last_hash_byte_fails() {
        let check = password_check_with_rounds("hunter2", 1_000);
        let (prefix, hash) = check.rsplit_once('$').unwrap();
        let mut bytes = hex::decode(hash).unwrap();
        *bytes.last_mut().unwrap() ^= 0x01;
        let forged = format!("{prefix}${}", hex::encode(bytes));
        assert!(!verify_password("hunter2", &forged).unwrap());
    }

    #[test]
    fn malformed_check_is_rejected() {
        assert!(matches!(
            verify_password("pw", "sha1$xx"),
            Err(CipherError::MalformedCheck(_))
        ));
        assert!(matches!(
            verify_password("pw", "pbkdf2$10$zz$00"),
            Err(CipherError::MalformedCheck(_))
        ));
    }
}

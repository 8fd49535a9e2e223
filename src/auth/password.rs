//! Password hashing with PBKDF2-HMAC-SHA256
//!
//! Stored format: `pbkdf2-sha256$<iterations>$<salt hex>$<hash hex>`.
//! Verification always uses the parameters embedded in the stored string, so
//! changing the configured iteration count only affects new hashes.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct PasswordHasher {
    iterations: u32,
}

impl PasswordHasher {
    pub fn new(iterations: u32) -> Self {
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn hash(&self, password: &str) -> String {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let hash = derive(password, &salt, self.iterations);
        format!(
            "{}${}${}${}",
            SCHEME,
            self.iterations,
            hex::encode(salt),
            hex::encode(hash)
        )
    }

    /// False for a wrong password and for any stored value that does not parse
    pub fn verify(&self, password: &str, stored: &str) -> bool {
        let mut parts = stored.split('$');
        let (Some(scheme), Some(iterations), Some(salt), Some(expected), None) =
            (parts.next(), parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        if scheme != SCHEME {
            return false;
        }

        let (Ok(iterations), Ok(salt), Ok(expected)) = (
            iterations.parse::<u32>(),
            hex::decode(salt),
            hex::decode(expected),
        ) else {
            return false;
        };
        if iterations == 0 || expected.len() != HASH_LEN {
            return false;
        }

        constant_time_eq(&derive(password, &salt, iterations), &expected)
    }
}

fn derive(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_correct_password_only() {
        let hasher = PasswordHasher::new(1000);
        let stored = hasher.hash("hunter2");

        assert!(stored.starts_with("pbkdf2-sha256$1000$"));
        assert!(hasher.verify("hunter2", &stored));
        assert!(!hasher.verify("hunter3", &stored));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let hasher = PasswordHasher::new(1000);
        assert_ne!(hasher.hash("same"), hasher.hash("same"));
    }

    #[test]
    fn verifies_with_stored_iteration_count() {
        let old = PasswordHasher::new(500).hash("pw");
        assert!(PasswordHasher::new(2000).verify("pw", &old));
    }

    #[test]
    fn rejects_malformed_stored_values() {
        let hasher = PasswordHasher::new(1000);
        for stored in [
            "",
            "plaintext",
            "bcrypt$10$aa$bb",
            "pbkdf2-sha256$abc$00$00",
            "pbkdf2-sha256$1000$zz$00",
            "pbkdf2-sha256$1000$00$00",
            "pbkdf2-sha256$0$00$0000000000000000000000000000000000000000000000000000000000000000",
        ] {
            assert!(!hasher.verify("pw", stored), "accepted {:?}", stored);
        }
    }
}

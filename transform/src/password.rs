//! Deterministic password hashing. Every backend derives its salt from the
//! original column value (when `use_salt` is set) so two independent
//! evaluations of the same row produce byte-identical output — required
//! for replaying a capture stream into the same replica without the hash
//! drifting on every replay.
//!
//! bcrypt ignores `use_salt`: its wire format has no room for a
//! caller-supplied marker, but it still needs a deterministic salt to stay
//! replay-stable, so it always derives one from the original value.

use sha2::{Digest, Sha256};

use crate::error::TransformError;

const SALT_LEN: usize = 16;
const OUTPUT_LEN: usize = 32;

fn derive_salt(original: &str, use_salt: bool) -> [u8; SALT_LEN] {
    if !use_salt {
        return [0u8; SALT_LEN];
    }
    let digest = Sha256::digest(original.as_bytes());
    let mut salt = [0u8; SALT_LEN];
    for (i, slot) in salt.iter_mut().enumerate() {
        *slot = digest[i % digest.len()];
    }
    salt
}

fn format_salt_hash(salt: &[u8], hash: &[u8]) -> String {
    format!("{}${}", hex::encode(salt), hex::encode(hash))
}

pub fn hash_bcrypt(cleartext: &str, cost: u32, original: &str) -> Result<String, TransformError> {
    let salt = derive_salt(original, true);
    let bytes = cleartext.as_bytes();
    let truncated = if bytes.len() > 72 { &bytes[..72] } else { bytes };
    let parts = bcrypt::hash_with_salt(truncated, cost, salt)
        .map_err(|e| TransformError::HashLibrary(e.to_string()))?;
    Ok(parts.format_for_version(bcrypt::Version::TwoB))
}

pub fn hash_scrypt(
    cleartext: &str,
    use_salt: bool,
    original: &str,
    log_n: u8,
    r: u32,
    p: u32,
) -> Result<String, TransformError> {
    let salt = derive_salt(original, use_salt);
    let params = scrypt::Params::new(log_n, r, p, OUTPUT_LEN)
        .map_err(|e| TransformError::HashLibrary(e.to_string()))?;
    let mut out = [0u8; OUTPUT_LEN];
    scrypt::scrypt(cleartext.as_bytes(), &salt, &params, &mut out)
        .map_err(|e| TransformError::HashLibrary(e.to_string()))?;
    Ok(format_salt_hash(&salt, &out))
}

pub fn hash_pbkdf2(
    cleartext: &str,
    use_salt: bool,
    original: &str,
    iterations: u32,
) -> Result<String, TransformError> {
    let salt = derive_salt(original, use_salt);
    let mut out = [0u8; OUTPUT_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(cleartext.as_bytes(), &salt, iterations, &mut out);
    Ok(format_salt_hash(&salt, &out))
}

pub fn hash_argon2id(
    cleartext: &str,
    use_salt: bool,
    original: &str,
    time: u32,
    memory: u32,
    threads: u32,
) -> Result<String, TransformError> {
    let salt = derive_salt(original, use_salt);
    let params = argon2::Params::new(memory, time, threads, Some(OUTPUT_LEN))
        .map_err(|e| TransformError::HashLibrary(e.to_string()))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
    let mut out = [0u8; OUTPUT_LEN];
    argon2
        .hash_password_into(cleartext.as_bytes(), &salt, &mut out)
        .map_err(|e| TransformError::HashLibrary(e.to_string()))?;
    Ok(format_salt_hash(&salt, &out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn argon2id_is_deterministic_per_spec_scenario_four() {
        let a = hash_argon2id("password123", true, "testuser", 3, 1024, 4).unwrap();
        let b = hash_argon2id("password123", true, "testuser", 3, 1024, 4).unwrap();
        assert_eq!(a, b);
        let shape = Regex::new(r"^[0-9a-f]{32}\$[0-9a-f]{64}$").unwrap();
        assert!(shape.is_match(&a), "unexpected hash shape: {a}");
    }

    #[test]
    fn different_original_value_changes_salted_output() {
        let a = hash_argon2id("password123", true, "user-a", 2, 1024, 2).unwrap();
        let b = hash_argon2id("password123", true, "user-b", 2, 1024, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn use_salt_false_always_uses_zero_salt() {
        let a = hash_pbkdf2("secret", false, "user-a", 1000).unwrap();
        let b = hash_pbkdf2("secret", false, "user-b", 1000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn bcrypt_truncates_cleartext_at_72_bytes_and_stays_deterministic() {
        let long = "x".repeat(100);
        let a = hash_bcrypt(&long, 4, "user-a").unwrap();
        let b = hash_bcrypt(&long, 4, "user-a").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn scrypt_round_trips_with_given_params() {
        let a = hash_scrypt("secret", true, "user-a", 10, 8, 1).unwrap();
        let shape = Regex::new(r"^[0-9a-f]{32}\$[0-9a-f]{64}$").unwrap();
        assert!(shape.is_match(&a));
    }
}

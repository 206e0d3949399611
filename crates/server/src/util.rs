use blake3::Hasher;
use rand::{RngCore, rngs::OsRng};
use std::time::{SystemTime, UNIX_EPOCH};

const PASSWORD_SCHEME: &str = "blake3";
const SALT_LEN: usize = 16;

/// Encodes raw bytes into lowercase hexadecimal.
pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut output, byte| {
            output.push_str(&format!("{byte:02x}"));
            output
        },
    )
}

/// Decodes a hexadecimal string into raw bytes.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, &'static str> {
    if input.len() % 2 != 0 {
        return Err("invalid hex length");
    }
    (0..input.len())
        .step_by(2)
        .map(|index| {
            u8::from_str_radix(&input[index..index + 2], 16).map_err(|_| "invalid hex digit")
        })
        .collect()
}

/// Generates an opaque identifier from entropy and context.
pub fn generate_id(context: &str) -> String {
    let mut entropy = [0u8; 16];
    OsRng.fill_bytes(&mut entropy);
    let mut hasher = Hasher::new();
    hasher.update(context.as_bytes());
    hasher.update(&entropy);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes();
    hasher.update(&now);
    encode_hex(hasher.finalize().as_bytes())
}

/// Mints an opaque bearer token bound to the server secret.
pub fn mint_token(secret: &str, user_id: &str) -> String {
    let mut entropy = [0u8; 32];
    OsRng.fill_bytes(&mut entropy);
    let mut hasher = Hasher::new();
    hasher.update(secret.as_bytes());
    hasher.update(user_id.as_bytes());
    hasher.update(&entropy);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes();
    hasher.update(&now);
    encode_hex(hasher.finalize().as_bytes())
}

/// Derives a salted verifier in the form `blake3$<salt>$<digest>`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = salted_digest(&salt, password);
    format!(
        "{PASSWORD_SCHEME}${}${}",
        encode_hex(&salt),
        encode_hex(&digest)
    )
}

/// Checks a password against a stored verifier.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let scheme = parts.next().unwrap_or_default();
    let salt_hex = parts.next().unwrap_or_default();
    let digest_hex = parts.next().unwrap_or_default();
    if scheme != PASSWORD_SCHEME || parts.next().is_some() {
        return false;
    }
    let Ok(salt) = decode_hex(salt_hex) else {
        return false;
    };
    let Ok(expected) = decode_hex(digest_hex) else {
        return false;
    };
    let digest = salted_digest(&salt, password);
    // constant-time comparison over fixed-size digests
    if expected.len() != digest.len() {
        return false;
    }
    expected
        .iter()
        .zip(digest.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn salted_digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let data = [0u8, 1, 127, 128, 255];
        let hex = encode_hex(&data);
        assert_eq!(decode_hex(&hex).unwrap(), data);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }

    #[test]
    fn id_generation_differs() {
        assert_ne!(generate_id("context"), generate_id("context"));
    }

    #[test]
    fn password_verifier_roundtrip() {
        let stored = hash_password("hunter22");
        assert!(stored.starts_with("blake3$"));
        assert!(verify_password("hunter22", &stored));
        assert!(!verify_password("hunter23", &stored));
        assert!(!verify_password("hunter22", "blake3$zz$zz"));
        assert!(!verify_password("hunter22", "plain$00$00"));
    }

    #[test]
    fn minted_tokens_are_opaque_and_unique() {
        let first = mint_token("secret-secret-16", "user-1");
        let second = mint_token("secret-secret-16", "user-1");
        assert_eq!(first.len(), 64);
        assert_ne!(first, second);
    }
}

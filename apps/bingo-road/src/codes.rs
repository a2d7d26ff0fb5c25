use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};
use uuid::Uuid;

const JOIN_CODE_LEN: usize = 6;
const ADMIN_SECRET_LEN: usize = 32;

pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn generate_item_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short public code players type in to join.
pub fn generate_join_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_uppercase())
        .take(JOIN_CODE_LEN)
        .collect()
}

pub fn generate_admin_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(ADMIN_SECRET_LEN)
        .collect()
}

/// Join codes are case-insensitive on input.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn verify_secret(secret: &str, hash: &str) -> bool {
    hash_secret(secret) == hash
}

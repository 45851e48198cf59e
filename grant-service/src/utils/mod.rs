use rand::Rng;

/// 32 random bytes, hex encoded. Used for verify tokens, fetch tokens and
/// generated account passwords.
pub fn generate_random_token() -> String {
    let mut rng = rand::thread_rng();
    let token_bytes: [u8; 32] = rng.gen();
    hex::encode(token_bytes)
}

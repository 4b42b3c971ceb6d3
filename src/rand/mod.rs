
use rand::{thread_rng, Rng};

/// ice-char per RFC 5245 §15.1: ALPHA / DIGIT / "+" / "/".
const RUNES_ICE_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";

/// Stream-scoped credential lengths (RFC 5245 §15.4 allows up to 256; the
/// generated values use 22 ice-chars, 132 bits of randomness each).
pub(crate) const LEN_UFRAG: usize = 22;
pub(crate) const LEN_PWD: usize = 22;

pub(crate) fn generate_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = thread_rng();
    (0..n)
        .map(|_| runes[rng.gen_range(0..runes.len())] as char)
        .collect()
}

/// <https://tools.ietf.org/html/rfc5245#section-15.1>
/// candidate-id = "candidate" ":" foundation
/// foundation   = 1*32ice-char
pub fn generate_cand_id() -> String {
    format!("candidate:{}", generate_random_string(32, RUNES_ICE_CHARS))
}

/// Generates an ICE pwd for one stream.
pub fn generate_pwd() -> String {
    generate_random_string(LEN_PWD, RUNES_ICE_CHARS)
}

/// Generates an ICE user fragment for one stream.
pub fn generate_ufrag() -> String {
    generate_random_string(LEN_UFRAG, RUNES_ICE_CHARS)
}

/// The 64-bit tie-breaker used to resolve role conflicts.
pub(crate) fn generate_tie_breaker() -> u64 {
    thread_rng().gen::<u64>()
}

use rand::Rng;
use uuid::Builder;

/// Fresh message identifier: a lowercase, hyphenated, version-4 UUID.
///
/// Random bytes come from the thread-local generator; `Builder` stamps the
/// version nibble (4) and the RFC 4122 variant bits (0b10).
pub fn generate() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

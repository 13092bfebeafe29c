//! # Identifier & Code Generation
//!
//! Helpers for generating the opaque, random identifiers the engine hands
//! out: exchange ids, pre-authorized codes, transaction codes and nonces.

/// Generates a 128-bit exchange id, encoded as a multibase (base58btc)
/// multihash of random bytes (identity hash function, per the `multihash`
/// spec: varint code `0x00`, varint length, then the raw bytes).
#[must_use]
pub fn exchange_id() -> String {
    let mut bytes = [0u8; 16];
    rand::fill(&mut bytes);
    multihash_identity(&bytes)
}

/// Encodes `bytes` as a multibase (`z`-prefixed base58btc) identity multihash.
fn multihash_identity(bytes: &[u8]) -> String {
    let mut buf = Vec::with_capacity(bytes.len() + 2);
    buf.push(0x00); // identity hash function code
    buf.push(u8::try_from(bytes.len()).unwrap_or(u8::MAX)); // digest length
    buf.extend_from_slice(bytes);
    format!("z{}", bs58::encode(buf).into_string())
}

/// Checks whether `id` is a `z`-prefixed base58btc identity multihash
/// encoding exactly 16 raw bytes, the shape [`exchange_id`] produces
/// (§4.11 rule 3).
#[must_use]
pub fn is_multibase_multihash_128(id: &str) -> bool {
    let Some(encoded) = id.strip_prefix('z') else {
        return false;
    };
    let Ok(buf) = bs58::decode(encoded).into_vec() else {
        return false;
    };
    buf.len() == 18 && buf[0] == 0x00 && buf[1] == 16
}

/// Generates an opaque pre-authorized code for an OID4VCI credential offer.
#[must_use]
pub fn auth_code() -> String {
    random_token(32)
}

/// Generates an opaque uri token used to host a by-reference credential
/// offer.
#[must_use]
pub fn uri_token() -> String {
    random_token(32)
}

/// Generates a 6-digit numeric transaction code (`tx_code`) for offers that
/// require one.
#[must_use]
pub fn tx_code() -> String {
    format!("{:06}", fastrand::u32(0..1_000_000))
}

fn random_token(len: usize) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    (0..len).map(|_| ALPHABET[fastrand::usize(..ALPHABET.len())] as char).collect()
}

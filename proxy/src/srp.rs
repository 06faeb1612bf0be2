//! SRP-6a arithmetic as spoken by the game client
//!
//! SHA-256 over the RFC 5054 2048-bit group with g = 2. Big integers travel
//! as unpadded big-endian byte strings. The server side is what the proxy
//! needs for sudo-mode re-authentication; the client side exists for
//! registration tooling, the test client and the test suites.

use num_bigint::BigUint;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;

const N_HEX: &[u8] = b"AC6BDB41324A9A9BF166DE5E1389582FAF72B6651987EE07FC3192943DB56050A37329CBB4A099ED8193E0757767A13DD52312AB4B03310DCD7F48A9DA04FD50E8083969EDB767B0CF6095179A163AB3661A05FBD5FAAAE82918A9962F0B93B855F97993EC975EEAA80D740ADBF4FF747359D041D5C33EA71D281E446B14773BCA97B43A23FB801676BD207A436C6481F1D2B9078717461A5B9D32E688F87748544523B524B0D57D5EA77A2775D2ECFA032CFBDBF52FB3786160279004E57AE6AF874E7303CE53299CCC041C7BC308D82A5698F3A8D0C38271AE35F8E9DBFBB694B5C803D89F7AE435DE236D525F54759B65E372FCD68EF20FA7111F9E4AFF73";
const G: u32 = 2;

const SALT_LEN: usize = 16;
const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SrpError {
    #[error("client public ephemeral value is degenerate")]
    InvalidClientEphemeral,
    #[error("server public ephemeral value is degenerate")]
    InvalidServerEphemeral,
    #[error("scrambling parameter is zero")]
    ZeroScrambler,
}

/// N as big-endian bytes; a bad digit fails the build
const N_BYTES: [u8; 256] = decode_hex(N_HEX);

const fn decode_hex<const L: usize>(hex: &[u8]) -> [u8; L] {
    assert!(hex.len() == 2 * L, "hex constant has the wrong length");
    let mut out = [0u8; L];
    let mut i = 0;
    while i < L {
        out[i] = (nibble(hex[2 * i]) << 4) | nibble(hex[2 * i + 1]);
        i += 1;
    }
    out
}

const fn nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'A'..=b'F' => c - b'A' + 10,
        b'a'..=b'f' => c - b'a' + 10,
        _ => panic!("invalid hex digit"),
    }
}

struct Group {
    n: BigUint,
    g: BigUint,
    /// k = H(N | pad(g))
    k: BigUint,
}

fn group() -> &'static Group {
    static GROUP: OnceLock<Group> = OnceLock::new();
    GROUP.get_or_init(|| {
        let n = BigUint::from_bytes_be(&N_BYTES);
        let g = BigUint::from(G);
        let k = BigUint::from_bytes_be(&hash(&[&N_BYTES[..], &pad(&g.to_bytes_be(), N_BYTES.len())]));
        Group { n, g, k }
    })
}

fn hash(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn pad(bytes: &[u8], len: usize) -> Vec<u8> {
    if bytes.len() >= len {
        return bytes.to_vec();
    }
    let mut out = vec![0u8; len - bytes.len()];
    out.extend_from_slice(bytes);
    out
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// u = H(A | pad(B))
fn scrambler(a_pub: &[u8], b_pub: &[u8]) -> BigUint {
    let b_padded = pad(b_pub, a_pub.len());
    BigUint::from_bytes_be(&hash(&[a_pub, &b_padded]))
}

/// x = H(s | H(lower(I) ":" P))
fn private_key(username: &str, password: &str, salt: &[u8]) -> BigUint {
    let identity = username.to_lowercase();
    let inner = hash(&[identity.as_bytes(), b":", password.as_bytes()]);
    BigUint::from_bytes_be(&hash(&[salt, &inner]))
}

/// Server half of the key exchange.
///
/// Returns the server public ephemeral value B and the session key K.
pub fn server_handshake(a_pub: &[u8], verifier: &[u8]) -> Result<(Vec<u8>, Vec<u8>), SrpError> {
    let group = group();
    let a = BigUint::from_bytes_be(a_pub);
    if (&a % &group.n) == BigUint::default() {
        return Err(SrpError::InvalidClientEphemeral);
    }

    let v = BigUint::from_bytes_be(verifier);
    let k = &group.k;

    let (b, b_pub) = loop {
        let b = BigUint::from_bytes_be(&random_bytes(SECRET_LEN));
        let b_pub = (k * &v + group.g.modpow(&b, &group.n)) % &group.n;
        if b_pub != BigUint::default() {
            break (b, b_pub);
        }
    };
    let b_bytes = b_pub.to_bytes_be();

    let u = scrambler(a_pub, &b_bytes);
    if u == BigUint::default() {
        return Err(SrpError::ZeroScrambler);
    }

    // S = (A * v^u) ^ b mod N
    let s = ((&a * v.modpow(&u, &group.n)) % &group.n).modpow(&b, &group.n);
    let key = hash(&[&s.to_bytes_be()]);

    Ok((b_bytes, key))
}

/// M = H(H(N) xor H(g) | H(I) | s | A | B | K)
pub fn calculate_m(username: &str, salt: &[u8], a_pub: &[u8], b_pub: &[u8], key: &[u8]) -> Vec<u8> {
    let group = group();
    let h_n = hash(&[&group.n.to_bytes_be()]);
    let h_g = hash(&[&group.g.to_bytes_be()]);
    let h_xor: Vec<u8> = h_n.iter().zip(h_g.iter()).map(|(n, g)| n ^ g).collect();
    let h_i = hash(&[username.as_bytes()]);

    hash(&[&h_xor, &h_i, salt, a_pub, b_pub, key])
}

/// Creates a fresh salt and password verifier for `username`
pub fn create_verifier(username: &str, password: &str) -> (Vec<u8>, Vec<u8>) {
    let group = group();
    let salt = random_bytes(SALT_LEN);
    let x = private_key(username, password, &salt);
    let v = group.g.modpow(&x, &group.n);
    (salt, v.to_bytes_be())
}

/// Client half of the key exchange
pub struct ClientHandshake {
    username: String,
    password: String,
    a: BigUint,
    a_pub: Vec<u8>,
}

impl ClientHandshake {
    pub fn start(username: &str, password: &str) -> Self {
        let group = group();
        let a = BigUint::from_bytes_be(&random_bytes(SECRET_LEN));
        let a_pub = group.g.modpow(&a, &group.n).to_bytes_be();

        Self {
            username: username.to_string(),
            password: password.to_string(),
            a,
            a_pub,
        }
    }

    /// The value to send as SRP_BYTES_A
    pub fn public_ephemeral(&self) -> &[u8] {
        &self.a_pub
    }

    /// Consumes the server challenge and returns the proof M and session key K
    pub fn process_challenge(&self, salt: &[u8], b_pub: &[u8]) -> Result<(Vec<u8>, Vec<u8>), SrpError> {
        let group = group();
        let b = BigUint::from_bytes_be(b_pub);
        if (&b % &group.n) == BigUint::default() {
            return Err(SrpError::InvalidServerEphemeral);
        }

        let u = scrambler(&self.a_pub, b_pub);
        if u == BigUint::default() {
            return Err(SrpError::ZeroScrambler);
        }

        let x = private_key(&self.username, &self.password, salt);
        let k = &group.k;
        let gx = group.g.modpow(&x, &group.n);
        let kgx = (k * &gx) % &group.n;

        // S = (B - k*g^x) ^ (a + u*x) mod N
        let base = ((&b % &group.n) + &group.n - kgx) % &group.n;
        let exponent = &self.a + &u * &x;
        let s = base.modpow(&exponent, &group.n);
        let key = hash(&[&s.to_bytes_be()]);

        let proof = calculate_m(&self.username, salt, &self.a_pub, b_pub, &key);
        Ok((proof, key))
    }
}

/// Length in bytes of the group modulus
pub fn modulus_len() -> usize {
    group().n.to_bytes_be().len()
}

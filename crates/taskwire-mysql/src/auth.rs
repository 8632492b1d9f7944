//! MySQL authentication plugins.
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! # caching_sha2_password
//!
//! Fast auth (if cached on server):
//! ```text
//! XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))
//! ```
//!
//! Full auth sends the password in cleartext over SSL, or RSA-encrypted
//! with the server's public key otherwise. `sha256_password` always takes
//! the full-auth path.
//!
//! # mysql_old_password
//!
//! The pre-4.1 scramble (`scramble323`), kept for protocol-9 servers and
//! the legacy one-byte auth switch request.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

use taskwire_core::{AuthenticationError, AuthenticationErrorKind, Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication (legacy default)
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// SHA256-based authentication (MySQL 8.0+ default)
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    /// RSA-based SHA256 authentication
    pub const SHA256_PASSWORD: &str = "sha256_password";
    /// Cleartext password; only sent over SSL
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    /// Pre-4.1 scramble
    pub const MYSQL_OLD_PASSWORD: &str = "mysql_old_password";
}

/// AuthMoreData codes exchanged by the SHA-256 plugins.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key (caching_sha2_password)
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Fast auth success; an OK packet follows
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Full auth needed (secure channel or RSA)
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
    /// Client asks for the server's RSA public key (sha256_password)
    pub const SHA256_REQUEST_PUBLIC_KEY: u8 = 0x01;
}

/// The plugins this engine can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPlugin {
    NativePassword,
    CachingSha2Password,
    Sha256Password,
    ClearPassword,
    OldPassword,
}

impl AuthPlugin {
    /// Look up a plugin by the name the server sent.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD => Ok(AuthPlugin::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Ok(AuthPlugin::CachingSha2Password),
            plugins::SHA256_PASSWORD => Ok(AuthPlugin::Sha256Password),
            plugins::MYSQL_CLEAR_PASSWORD => Ok(AuthPlugin::ClearPassword),
            plugins::MYSQL_OLD_PASSWORD => Ok(AuthPlugin::OldPassword),
            other => Err(Error::unsupported(format!(
                "unknown authentication plugin '{other}'"
            ))),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            AuthPlugin::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            AuthPlugin::CachingSha2Password => plugins::CACHING_SHA2_PASSWORD,
            AuthPlugin::Sha256Password => plugins::SHA256_PASSWORD,
            AuthPlugin::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
            AuthPlugin::OldPassword => plugins::MYSQL_OLD_PASSWORD,
        }
    }

    /// Initial auth response for this plugin.
    ///
    /// `secure` is true once the transport has been upgraded to SSL.
    /// `server_key` is a PEM public key configured for RSA password exchange.
    pub fn initial_response(
        self,
        password: &str,
        seed: &[u8],
        secure: bool,
        server_key: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        match self {
            AuthPlugin::NativePassword => Ok(mysql_native_password(password, seed)),
            AuthPlugin::CachingSha2Password => Ok(caching_sha2_password(password, seed)),
            AuthPlugin::OldPassword => Ok(mysql_old_password(password, seed)),
            AuthPlugin::ClearPassword => {
                if !secure {
                    return Err(plugin_error(
                        "mysql_clear_password requires an SSL connection",
                    ));
                }
                Ok(cleartext_password(password))
            }
            AuthPlugin::Sha256Password => {
                if password.is_empty() {
                    Ok(vec![0])
                } else if secure {
                    Ok(cleartext_password(password))
                } else if let Some(pem) = server_key {
                    encrypt_password_rsa(password, seed, pem)
                } else {
                    Ok(vec![caching_sha2::SHA256_REQUEST_PUBLIC_KEY])
                }
            }
        }
    }
}

pub(crate) fn plugin_error(message: impl Into<String>) -> Error {
    Error::Authentication(AuthenticationError {
        kind: AuthenticationErrorKind::Plugin,
        message: message.into(),
        code: None,
        sqlstate: None,
    })
}

/// Compute mysql_native_password authentication response.
///
/// Returns the 20-byte scramble, or an empty response for an empty password.
pub fn mysql_native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    let seed = &seed[..seed.len().min(20)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute caching_sha2_password fast authentication response.
///
/// Returns the 32-byte scramble, or an empty response for an empty password.
pub fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }
    // MySQL sends a 20-byte scramble followed by NUL
    let seed = match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ => seed,
    };

    let password_hash: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let password_hash_hash: [u8; 32] = Sha256::digest(password_hash).into();

    let mut hasher = Sha256::new();
    hasher.update(password_hash_hash);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    password_hash
        .iter()
        .zip(scramble.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Password followed by NUL, as sent over a secure channel.
pub fn cleartext_password(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Encrypt the password for RSA full authentication.
///
/// MySQL expects `RSA_OAEP(password + NUL XOR seed)` with the seed repeated
/// over the password length.
pub fn encrypt_password_rsa(password: &str, seed: &[u8], public_key_pem: &[u8]) -> Result<Vec<u8>> {
    if seed.is_empty() {
        return Err(plugin_error("RSA password exchange needs a non-empty seed"));
    }
    let mut pw = cleartext_password(password);
    for (i, b) in pw.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| plugin_error(format!("server public key is not valid PEM: {e}")))?;
    let pub_key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| plugin_error(format!("failed to parse server public key: {e}")))?;

    pub_key
        .encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &pw)
        .map_err(|e| plugin_error(format!("RSA encryption failed: {e}")))
}

/// The two 31-bit hashes used by the pre-4.1 scramble.
fn hash_password_323(input: &[u8]) -> [u32; 2] {
    let mut nr: u32 = 1_345_345_333;
    let mut add: u32 = 7;
    let mut nr2: u32 = 0x1234_5671;
    for &c in input.iter().filter(|&&c| c != b' ' && c != b'\t') {
        let tmp = u32::from(c);
        nr ^= (((nr & 63).wrapping_add(add)).wrapping_mul(tmp)).wrapping_add(nr << 8);
        nr2 = nr2.wrapping_add((nr2 << 8) ^ nr);
        add = add.wrapping_add(tmp);
    }
    [nr & 0x7FFF_FFFF, nr2 & 0x7FFF_FFFF]
}

/// Compute the mysql_old_password response: 8 scrambled bytes and a NUL.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn mysql_old_password(password: &str, seed: &[u8]) -> Vec<u8> {
    const MAX: u64 = 0x3FFF_FFFF;
    if password.is_empty() {
        return vec![];
    }
    let seed = &seed[..seed.len().min(8)];
    let pass = hash_password_323(password.as_bytes());
    let msg = hash_password_323(seed);

    let mut seed1 = u64::from(pass[0] ^ msg[0]) % MAX;
    let mut seed2 = u64::from(pass[1] ^ msg[1]) % MAX;
    let mut rnd = || {
        seed1 = (seed1 * 3 + seed2) % MAX;
        seed2 = (seed1 + seed2 + 33) % MAX;
        seed1 as f64 / MAX as f64
    };

    let mut out: Vec<u8> = (0..seed.len())
        .map(|_| (rnd() * 31.0).floor() as u8 + 64)
        .collect();
    let extra = (rnd() * 31.0).floor() as u8;
    for b in &mut out {
        *b ^= extra;
    }
    out.push(0);
    out
}

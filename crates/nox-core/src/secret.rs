//! A string that never shows up in logs.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;

/// Length of generated guest passwords.
pub const PASSWORD_LEN: usize = 16;

/// Characters of the crypt(3) base64 variant, also valid in salts.
const CRYPT_ALPHABET: &[u8; 64] =
    b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Longest salt SHA-512 crypt accepts.
pub const CRYPT_SALT_LEN: usize = 16;

const SHA512_CRYPT_ROUNDS: usize = 5000;

/// Sensitive value whose `Debug` and `Display` are redacted.
///
/// Serializes transparently so it can live in the config file.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Fresh random password of [`PASSWORD_LEN`] alphanumerics.
    pub fn generate_password() -> Self {
        let value: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(PASSWORD_LEN)
            .map(char::from)
            .collect();
        Self(value)
    }

    /// The underlying value. Keep it out of tracing fields.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shadow-file hash in the SHA-512 crypt format (`$6$salt$hash`) with
    /// the default round count. The salt is cut to [`CRYPT_SALT_LEN`] bytes
    /// and should come from [`crypt_salt`].
    pub fn sha512_crypt(&self, salt: &str) -> String {
        let pw = self.0.as_bytes();
        let salt = &salt.as_bytes()[..salt.len().min(CRYPT_SALT_LEN)];

        let alt = sha512(&[pw, salt, pw]);
        let mut ctx = Sha512::new();
        ctx.update(pw);
        ctx.update(salt);
        let mut n = pw.len();
        while n > 64 {
            ctx.update(alt);
            n -= 64;
        }
        ctx.update(&alt[..n]);
        let mut n = pw.len();
        while n > 0 {
            if n & 1 == 1 {
                ctx.update(alt);
            } else {
                ctx.update(pw);
            }
            n >>= 1;
        }
        let first = finish(ctx);

        let pw_digest = sha512(&[&pw.repeat(pw.len())]);
        let pw_seq: Vec<u8> = pw_digest.iter().copied().cycle().take(pw.len()).collect();
        let salt_digest = sha512(&[&salt.repeat(16 + usize::from(first[0]))]);
        let salt_seq = &salt_digest[..salt.len()];

        let mut c = first;
        for i in 0..SHA512_CRYPT_ROUNDS {
            let mut ctx = Sha512::new();
            if i % 2 == 1 {
                ctx.update(&pw_seq);
            } else {
                ctx.update(c);
            }
            if i % 3 != 0 {
                ctx.update(salt_seq);
            }
            if i % 7 != 0 {
                ctx.update(&pw_seq);
            }
            if i % 2 == 1 {
                ctx.update(c);
            } else {
                ctx.update(&pw_seq);
            }
            c = finish(ctx);
        }

        let mut out = format!("$6${}$", String::from_utf8_lossy(salt));
        for i in 0..21 {
            let (x, y, z) = (c[i], c[i + 21], c[i + 42]);
            let (b2, b1, b0) = match i % 3 {
                0 => (x, y, z),
                1 => (y, z, x),
                _ => (z, x, y),
            };
            push_crypt64(
                &mut out,
                (u32::from(b2) << 16) | (u32::from(b1) << 8) | u32::from(b0),
                4,
            );
        }
        push_crypt64(&mut out, u32::from(c[63]), 2);
        out
    }
}

/// A [`CRYPT_SALT_LEN`]-character salt derived from `seed`. Equal seeds give
/// equal salts.
pub fn crypt_salt(seed: &[u8]) -> String {
    seed.iter()
        .cycle()
        .take(CRYPT_SALT_LEN)
        .map(|b| char::from(CRYPT_ALPHABET[usize::from(b & 0x3f)]))
        .collect()
}

fn sha512(parts: &[&[u8]]) -> [u8; 64] {
    let mut ctx = Sha512::new();
    for part in parts {
        ctx.update(part);
    }
    finish(ctx)
}

fn finish(ctx: Sha512) -> [u8; 64] {
    let mut out = [0u8; 64];
    out.copy_from_slice(&ctx.finalize());
    out
}

fn push_crypt64(out: &mut String, mut word: u32, chars: usize) {
    for _ in 0..chars {
        out.push(char::from(CRYPT_ALPHABET[(word & 0x3f) as usize]));
        word >>= 6;
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

//
// htpasswd file verification.
//
// Supported schemes: plain, sha1 ({SHA}), ssha ({SSHA}), md5 ($apr1$),
// bcrypt ($2a$/$2b$/$2y$) and autodetect (by hash prefix). The file is
// read once at startup.
//
use std::io;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::warn;
use md5::Md5;
use sha1::{Digest, Sha1};

use crate::auth::AuthBackend;

pub struct Htpasswd {
    entries: Vec<(String, String)>,
    encryption: String,
}

impl Htpasswd {
    pub fn load(filename: &str, encryption: &str) -> io::Result<Htpasswd> {
        match encryption {
            "plain" | "sha1" | "ssha" | "md5" | "bcrypt" | "autodetect" => {}
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown htpasswd encryption {other:?}"),
                ));
            }
        }
        let text = std::fs::read_to_string(filename)?;
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once(':') {
                Some((login, hash)) => entries.push((login.to_string(), hash.to_string())),
                None => warn!("ignoring malformed htpasswd line {}", lineno + 1),
            }
        }
        Ok(Htpasswd {
            entries,
            encryption: encryption.to_string(),
        })
    }

    fn check(&self, hash: &str, password: &str) -> bool {
        let scheme = if self.encryption == "autodetect" {
            detect_scheme(hash)
        } else {
            self.encryption.as_str()
        };
        match scheme {
            "bcrypt" => bcrypt::verify(password, hash).unwrap_or(false),
            "md5" => verify_apr1(hash, password),
            "sha1" => match hash.strip_prefix("{SHA}") {
                Some(b64) => {
                    let digest = Sha1::digest(password.as_bytes());
                    STANDARD
                        .decode(b64)
                        .map(|d| d == digest.as_slice())
                        .unwrap_or(false)
                }
                None => false,
            },
            "ssha" => verify_ssha(hash, password),
            _ => constant_time_eq(hash.as_bytes(), password.as_bytes()),
        }
    }
}

impl AuthBackend for Htpasswd {
    fn verify(&self, login: &str, password: &str) -> Option<String> {
        for (entry_login, hash) in &self.entries {
            if entry_login == login && self.check(hash, password) {
                return Some(login.to_string());
            }
        }
        None
    }
}

fn detect_scheme(hash: &str) -> &'static str {
    if hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$") {
        "bcrypt"
    } else if hash.starts_with("$apr1$") {
        "md5"
    } else if hash.starts_with("{SHA}") {
        "sha1"
    } else if hash.starts_with("{SSHA}") {
        "ssha"
    } else {
        "plain"
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn verify_ssha(hash: &str, password: &str) -> bool {
    let b64 = match hash.strip_prefix("{SSHA}") {
        Some(b) => b,
        None => return false,
    };
    let decoded = match STANDARD.decode(b64) {
        Ok(d) if d.len() > 20 => d,
        _ => return false,
    };
    let (digest, salt) = decoded.split_at(20);
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    hasher.finalize().as_slice() == digest
}

// Apache's $apr1$ scheme: MD5 with 1000 rounds of digest stretching.
fn verify_apr1(hash: &str, password: &str) -> bool {
    let mut parts = hash.splitn(4, '$').skip(2);
    let (salt, expected) = match (parts.next(), parts.next()) {
        (Some(salt), Some(expected)) => (salt, expected),
        _ => return false,
    };

    let pw = password.as_bytes();
    let mut ctx1 = Md5::new();
    ctx1.update(pw);
    ctx1.update(salt.as_bytes());
    ctx1.update(pw);
    let inner = ctx1.finalize();

    let mut ctx = Md5::new();
    ctx.update(pw);
    ctx.update(b"$apr1$");
    ctx.update(salt.as_bytes());
    let mut remaining = pw.len();
    while remaining > 0 {
        ctx.update(&inner[..remaining.min(16)]);
        remaining = remaining.saturating_sub(16);
    }
    let mut len = pw.len();
    while len > 0 {
        if len & 1 == 1 {
            ctx.update([0u8]);
        } else {
            ctx.update(&pw[..1]);
        }
        len >>= 1;
    }
    let mut digest = ctx.finalize();

    for round in 0..1000 {
        let mut ctx = Md5::new();
        if round & 1 == 1 {
            ctx.update(pw);
        } else {
            ctx.update(digest);
        }
        if round % 3 != 0 {
            ctx.update(salt.as_bytes());
        }
        if round % 7 != 0 {
            ctx.update(pw);
        }
        if round & 1 == 1 {
            ctx.update(digest);
        } else {
            ctx.update(pw);
        }
        digest = ctx.finalize();
    }

    apr1_to64(&digest) == expected
}

// the apr1 base64 variant with its odd byte order.
fn apr1_to64(digest: &[u8]) -> String {
    const CHARS: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let order = [
        (0usize, 6usize, 12usize),
        (1, 7, 13),
        (2, 8, 14),
        (3, 9, 15),
        (4, 10, 5),
    ];
    let mut out = String::with_capacity(22);
    for (a, b, c) in order {
        let mut v =
            ((digest[a] as u32) << 16) | ((digest[b] as u32) << 8) | (digest[c] as u32);
        for _ in 0..4 {
            out.push(CHARS[(v & 0x3f) as usize] as char);
            v >>= 6;
        }
    }
    let mut v = digest[11] as u32;
    for _ in 0..2 {
        out.push(CHARS[(v & 0x3f) as usize] as char);
        v >>= 6;
    }
    out
}

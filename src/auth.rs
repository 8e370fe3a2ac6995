//! Authentication.
//!
//! The pipeline normalizes the login (URL-decode, domain strip, case
//! folding), hands it to the configured backend, and rate-limits
//! failures per source with a randomized delay. Successful logins can
//! be cached for a short TTL; failed logins are remembered only to
//! drive the delay.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use lru::LruCache;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::config::{AuthConfig, Config};
use crate::htpasswd::Htpasswd;

const CACHE_SIZE: usize = 1024;

/// A credential verification backend.
pub trait AuthBackend: Send + Sync {
    /// Verify credentials; returns the normalized user or `None`.
    fn verify(&self, login: &str, password: &str) -> Option<String>;
}

/// Accepts any credentials; the login becomes the user.
struct NoneBackend;

impl AuthBackend for NoneBackend {
    fn verify(&self, login: &str, _password: &str) -> Option<String> {
        Some(login.to_string())
    }
}

/// Rejects everything.
struct DenyAllBackend;

impl AuthBackend for DenyAllBackend {
    fn verify(&self, _login: &str, _password: &str) -> Option<String> {
        None
    }
}

pub struct Auth {
    backend: Box<dyn AuthBackend>,
    cfg: AuthConfig,
    success: Mutex<LruCache<(String, String), (String, Instant)>>,
    failed: Mutex<LruCache<String, Instant>>,
}

impl Auth {
    pub fn new(config: &Config) -> std::io::Result<Auth> {
        let cfg = config.auth.clone();
        let backend: Box<dyn AuthBackend> = match cfg.r#type.as_str() {
            "none" => {
                warn!("authentication is not configured; anyone can claim any user");
                Box::new(NoneBackend)
            }
            "denyall" => Box::new(DenyAllBackend),
            "htpasswd" => Box::new(Htpasswd::load(
                &cfg.htpasswd_filename,
                &cfg.htpasswd_encryption,
            )?),
            // the trusted-header types never see a password; requests
            // carry the user directly (see handler.rs).
            "remote_user" | "http_x_remote_user" => Box::new(DenyAllBackend),
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown auth type {other:?}"),
                ));
            }
        };
        Ok(Auth {
            backend,
            cfg,
            success: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_SIZE).unwrap())),
            failed: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_SIZE).unwrap())),
        })
    }

    pub fn auth_type(&self) -> &str {
        &self.cfg.r#type
    }

    pub fn realm(&self) -> &str {
        &self.cfg.realm
    }

    fn normalize(&self, login: &str) -> String {
        let mut login = login.to_string();
        if self.cfg.urldecode_username {
            if let Ok(decoded) = percent_decode_str(&login).decode_utf8() {
                login = decoded.into_owned();
            }
        }
        if self.cfg.strip_domain {
            if let Some(idx) = login.find('@') {
                login.truncate(idx);
            }
        }
        if self.cfg.lc_username {
            login = login.to_lowercase();
        }
        if self.cfg.uc_username {
            login = login.to_uppercase();
        }
        login
    }

    fn cache_key(login: &str, password: &str) -> (String, String) {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        (login.to_string(), format!("{:x}", hasher.finalize()))
    }

    /// Run the full pipeline. Returns the authenticated user or "".
    /// `source` identifies the client for rate limiting (its address).
    pub async fn login(&self, login: &str, password: &str, source: &str) -> String {
        let login = self.normalize(login);
        if login.is_empty() {
            return String::new();
        }

        // delay the attempt when this source failed recently.
        let failed_recently = {
            let mut failed = self.failed.lock();
            match failed.get(source) {
                Some(at) => {
                    at.elapsed() < Duration::from_secs(self.cfg.cache_failed_logins_expiry)
                }
                None => false,
            }
        };
        if failed_recently && self.cfg.delay > 0.0 {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            let delay = Duration::from_secs_f64(self.cfg.delay * factor);
            debug!("delaying login of {:?} from {} by {:?}", login, source, delay);
            tokio::time::sleep(delay).await;
        }

        let key = Self::cache_key(&login, password);
        if self.cfg.cache_logins {
            let mut success = self.success.lock();
            if let Some((user, at)) = success.get(&key) {
                if at.elapsed() < Duration::from_secs(self.cfg.cache_successful_logins_expiry) {
                    return user.clone();
                }
                success.pop(&key);
            }
        }

        match self.backend.verify(&login, password) {
            Some(user) if !user.is_empty() => {
                info!("successful login of {:?} from {}", user, source);
                self.failed.lock().pop(source);
                if self.cfg.cache_logins {
                    self.success.lock().put(key, (user.clone(), Instant::now()));
                }
                user
            }
            _ => {
                warn!("failed login attempt of {:?} from {}", login, source);
                self.failed.lock().put(source.to_string(), Instant::now());
                String::new()
            }
        }
    }
}

/// Decode an `Authorization: Basic` header value into (login, password).
pub fn parse_basic_authorization(value: &str) -> Option<(String, String)> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (login, password) = decoded.split_once(':')?;
    Some((login.to_string(), password.to_string()))
}

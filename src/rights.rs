//! Access control.
//!
//! A rights backend maps `(user, path)` to the set of permission
//! characters granted there:
//!
//! - `R`/`W`: read/write non-leaf collections
//! - `r`/`w`: read/write leaf collections and their items
//! - `i`: read-only access via GET/HEAD only
//! - `D`/`d`: delete non-leaf/leaf collections (overrides
//!   `permit_delete_collection`)
//! - `O`/`o`: overwrite non-leaf/leaf collections (overrides
//!   `permit_overwrite_collection`)
//!
//! Backends are selected by `[rights] type`; `from_file` loads an
//! INI-like rules file at startup, first match wins.

use std::sync::Arc;

use log::debug;
use regex::Regex;
use thiserror::Error;

use crate::config::Config;

/// Everything a built-in policy may grant.
const ALL: &str = "RrWwiDdOo";
/// Read-only subset.
const READ: &str = "Rri";

#[derive(Debug, Error)]
pub enum RightsError {
    #[error("cannot read rights file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid rights rule [{section}]: {message}")]
    Rule { section: String, message: String },
}

pub trait Rights: Send + Sync {
    /// Permission characters granted to `user` on `path` (a storage
    /// path without leading or trailing slashes, "" for the root).
    fn authorization(&self, user: &str, path: &str) -> String;
}

pub fn intersect(granted: &str, wanted: &str) -> String {
    wanted.chars().filter(|c| granted.contains(*c)).collect()
}

/// `none`/`authenticated`: any operation for any authenticated user.
struct AuthenticatedRights;

impl Rights for AuthenticatedRights {
    fn authorization(&self, user: &str, _path: &str) -> String {
        if user.is_empty() {
            String::new()
        } else {
            ALL.to_string()
        }
    }
}

/// `owner_only`: full access below the user's own principal, plus
/// discovery of the root.
struct OwnerOnlyRights;

impl Rights for OwnerOnlyRights {
    fn authorization(&self, user: &str, path: &str) -> String {
        if user.is_empty() {
            return String::new();
        }
        if path.is_empty() {
            return "R".to_string();
        }
        let owner = path.split('/').next().unwrap_or("");
        if owner == user {
            ALL.to_string()
        } else {
            String::new()
        }
    }
}

/// `owner_write`: read anywhere, write below the own principal.
struct OwnerWriteRights;

impl Rights for OwnerWriteRights {
    fn authorization(&self, user: &str, path: &str) -> String {
        if user.is_empty() {
            return String::new();
        }
        if path.is_empty() {
            return "R".to_string();
        }
        let owner = path.split('/').next().unwrap_or("");
        if owner == user {
            ALL.to_string()
        } else {
            READ.to_string()
        }
    }
}

struct Rule {
    section: String,
    user: Regex,
    collection: String,
    permissions: String,
}

/// `from_file`: rules from an INI-like file, tried in order.
struct FileRights {
    rules: Vec<Rule>,
}

impl FileRights {
    fn load(path: &str) -> Result<FileRights, RightsError> {
        let text = std::fs::read_to_string(path).map_err(|source| RightsError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<FileRights, RightsError> {
        let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                sections.push((name.to_string(), Vec::new()));
                continue;
            }
            let (key, value) = line.split_once(['=', ':']).ok_or_else(|| RightsError::Rule {
                section: sections.last().map(|(n, _)| n.clone()).unwrap_or_default(),
                message: format!("not a key-value pair: {line:?}"),
            })?;
            match sections.last_mut() {
                Some((_, entries)) => {
                    entries.push((key.trim().to_string(), value.trim().to_string()))
                }
                None => {
                    return Err(RightsError::Rule {
                        section: String::new(),
                        message: "entry before first section".to_string(),
                    })
                }
            }
        }

        let mut rules = Vec::new();
        for (section, entries) in sections {
            let get = |key: &str| {
                entries
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
            };
            let user_re = get("user").unwrap_or_default();
            let user = Regex::new(&format!("^(?:{})$", user_re)).map_err(|e| {
                RightsError::Rule {
                    section: section.clone(),
                    message: format!("bad user regex: {e}"),
                }
            })?;
            let collection = get("collection").ok_or_else(|| RightsError::Rule {
                section: section.clone(),
                message: "missing collection".to_string(),
            })?;
            let permissions = get("permissions").unwrap_or_default();
            rules.push(Rule {
                section,
                user,
                collection,
                permissions,
            });
        }
        Ok(FileRights { rules })
    }
}

impl Rights for FileRights {
    fn authorization(&self, user: &str, path: &str) -> String {
        for rule in &self.rules {
            let captures = match rule.user.captures(user) {
                Some(c) => c,
                None => continue,
            };
            // substitute {user} and the groups captured by the user
            // regex into the collection pattern, escaped.
            let mut pattern = rule.collection.replace("{user}", &regex::escape(user));
            for i in 0..captures.len() {
                let group = captures.get(i).map(|m| m.as_str()).unwrap_or("");
                pattern = pattern.replace(&format!("{{{i}}}"), &regex::escape(group));
            }
            let collection_re = match Regex::new(&format!("^(?:{pattern})$")) {
                Ok(re) => re,
                Err(e) => {
                    debug!("rule [{}]: bad collection regex: {}", rule.section, e);
                    continue;
                }
            };
            if collection_re.is_match(path) {
                debug!(
                    "rule [{}] matches {:?} on {:?}: {:?}",
                    rule.section, user, path, rule.permissions
                );
                return rule.permissions.clone();
            }
        }
        debug!("no rights rule matches {:?} on {:?}", user, path);
        String::new()
    }
}

/// Instantiate the configured rights backend.
pub fn create(config: &Config) -> Result<Arc<dyn Rights>, RightsError> {
    match config.rights.r#type.as_str() {
        "none" | "authenticated" => Ok(Arc::new(AuthenticatedRights)),
        "owner_only" => Ok(Arc::new(OwnerOnlyRights)),
        "owner_write" => Ok(Arc::new(OwnerWriteRights)),
        "from_file" => Ok(Arc::new(FileRights::load(&config.rights.file)?)),
        other => Err(RightsError::Rule {
            section: "rights".to_string(),
            message: format!("unknown rights type {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_only() {
        let r = OwnerOnlyRights;
        assert_eq!(r.authorization("alice", "alice/cal"), ALL);
        assert_eq!(r.authorization("alice", "alice"), ALL);
        assert_eq!(r.authorization("alice", "bob/cal"), "");
        assert_eq!(r.authorization("alice", ""), "R");
        assert_eq!(r.authorization("", "alice/cal"), "");
    }

    #[test]
    fn test_owner_write() {
        let r = OwnerWriteRights;
        assert_eq!(r.authorization("alice", "bob/cal"), READ);
        assert_eq!(r.authorization("alice", "alice/cal"), ALL);
    }

    #[test]
    fn test_authenticated() {
        let r = AuthenticatedRights;
        assert_eq!(r.authorization("anyone", "bob/cal"), ALL);
        assert_eq!(r.authorization("", "bob/cal"), "");
    }

    #[test]
    fn test_intersect() {
        assert_eq!(intersect("Rr", "rw"), "r");
        assert_eq!(intersect("", "r"), "");
    }

    const RULES: &str = r#"
# owners have full access
[owner]
user = .+
collection = {user}(/.*)?
permissions = RrWwDdOo

[family-calendar]
user = (alice|bob)
collection = family/calendar
permissions = rw

[public-read]
user = .*
collection = public/.*
permissions = i
"#;

    #[test]
    fn test_from_file_first_match_wins() {
        let r = FileRights::parse(RULES).unwrap();
        assert_eq!(r.authorization("alice", "alice/cal"), "RrWwDdOo");
        assert_eq!(r.authorization("alice", "family/calendar"), "rw");
        assert_eq!(r.authorization("carol", "family/calendar"), "");
        assert_eq!(r.authorization("carol", "public/holidays"), "i");
        // anonymous matches the .* user of the public rule.
        assert_eq!(r.authorization("", "public/holidays"), "i");
    }

    #[test]
    fn test_from_file_group_substitution() {
        let rules = r#"
[shared]
user = (.+)@example.com
collection = shared/{1}
permissions = rw
"#;
        let r = FileRights::parse(rules).unwrap();
        assert_eq!(r.authorization("ada@example.com", "shared/ada"), "rw");
        assert_eq!(r.authorization("ada@example.com", "shared/bob"), "");
    }

    #[test]
    fn test_from_file_errors() {
        assert!(FileRights::parse("key = before section\n").is_err());
        assert!(FileRights::parse("[s]\nuser = (\ncollection = x\n").is_err());
        assert!(FileRights::parse("[s]\nuser = .*\n").is_err());
    }
}

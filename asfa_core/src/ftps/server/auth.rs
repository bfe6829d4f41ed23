use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizeError {
    #[error("Username not provided")]
    MissingUsername,
    #[error("Anonymous access not allowed.")]
    Anonymous,
    #[error("Server error: '{}' does not exist", .0.display())]
    MissingRoot(PathBuf),
    #[error("Username ({0}) already exists. Let's try a different one")]
    Duplicate(String),
}

/// Login failures. Unknown users and wrong passwords share one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("Anonymous access not allowed.")]
    Anonymous,
    #[error("Authentication failed.")]
    Rejected,
}

#[derive(Debug, Clone)]
enum Secret {
    Plain(String),
    Hashed(blake3::Hash),
}

impl Secret {
    fn matches(&self, password: &str) -> bool {
        match self {
            Secret::Plain(expected) => expected == password,
            // blake3::Hash equality is constant-time
            Secret::Hashed(expected) => *expected == blake3::hash(password.as_bytes()),
        }
    }
}

#[derive(Debug, Clone)]
struct AuthorizedUser {
    secret: Secret,
    root: PathBuf,
}

fn is_anonymous(username: &str) -> bool {
    username.is_empty() || username.eq_ignore_ascii_case("anonymous")
}

/// Table of users allowed to log in, each confined to a shared root.
///
/// Cheap to clone; sessions read it at login time only.
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    users: Arc<RwLock<HashMap<String, AuthorizedUser>>>,
    hash_passwords: bool,
}

impl Authorizer {
    pub fn new(hash_passwords: bool) -> Self {
        Self {
            users: Arc::default(),
            hash_passwords,
        }
    }

    pub fn add_user(
        &self,
        username: &str,
        password: &str,
        root: &Path,
    ) -> Result<(), AuthorizeError> {
        if username.is_empty() {
            return Err(AuthorizeError::MissingUsername);
        }
        if is_anonymous(username) {
            return Err(AuthorizeError::Anonymous);
        }
        let root = match std::fs::canonicalize(root) {
            Ok(root) if root.is_dir() => root,
            _ => return Err(AuthorizeError::MissingRoot(root.to_path_buf())),
        };

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            return Err(AuthorizeError::Duplicate(username.to_string()));
        }
        let secret = if self.hash_passwords {
            Secret::Hashed(blake3::hash(password.as_bytes()))
        } else {
            Secret::Plain(password.to_string())
        };
        users.insert(username.to_string(), AuthorizedUser { secret, root });
        Ok(())
    }

    pub fn remove_user(&self, username: &str) -> bool {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(username)
            .is_some()
    }

    /// Check credentials and return the user's (canonical) root directory
    pub fn validate(&self, username: &str, password: &str) -> Result<PathBuf, AuthFailure> {
        if is_anonymous(username) {
            return Err(AuthFailure::Anonymous);
        }
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        match users.get(username) {
            Some(user) if user.secret.matches(password) => Ok(user.root.clone()),
            _ => Err(AuthFailure::Rejected),
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }

    /// Authorized usernames, sorted
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

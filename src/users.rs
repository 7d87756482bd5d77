use std::{
    collections::HashMap,
    fmt::Debug,
    path::Path,
    sync::{Arc, RwLock},
};

use ahash::RandomState;
use aws_lc_rs::constant_time::verify_slices_are_equal;
use regex::Regex;

use crate::error::ServerError;

/// The address pattern that authorizes any address.
pub const ALLOW_ALL: &str = "";

/// A compiled address-authorization rule.
///
/// Patterns are matched against `host:port` for forward tunnels, and against
/// `R:host:port` for reverse tunnels.
#[derive(Debug, Clone)]
pub struct AddressPattern(Regex);

impl AddressPattern {
    pub fn allow_all() -> Self {
        AddressPattern(Regex::new(ALLOW_ALL).expect("empty pattern is valid"))
    }

    pub fn is_allow_all(&self) -> bool {
        self.0.as_str() == ALLOW_ALL
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn matches(&self, address: &str) -> bool {
        self.0.is_match(address)
    }
}

impl std::str::FromStr for AddressPattern {
    type Err = ServerError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        Regex::new(pattern)
            .map(AddressPattern)
            .map_err(|source| ServerError::PatternSyntax {
                pattern: pattern.into(),
                source,
            })
    }
}

/// A user allowed to authenticate with the gateway.
#[derive(Clone)]
pub struct User {
    name: String,
    password: String,
    addresses: Vec<AddressPattern>,
}

impl Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("name", &self.name)
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

impl User {
    /// Create a user, compiling each address pattern.
    ///
    /// Fails on the first invalid pattern.
    pub fn new<I, S>(name: &str, password: &str, addresses: I) -> Result<Self, ServerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addresses = addresses
            .into_iter()
            .map(|pattern| pattern.as_ref().parse())
            .collect::<Result<Vec<AddressPattern>, _>>()?;
        Ok(User {
            name: name.into(),
            password: password.into(),
            addresses,
        })
    }

    /// Create a user that may tunnel to any address.
    pub fn allow_all(name: &str, password: &str) -> Self {
        User {
            name: name.into(),
            password: password.into(),
            addresses: vec![AddressPattern::allow_all()],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &[AddressPattern] {
        &self.addresses
    }

    // Constant-time with regards to the contents; only the length may leak.
    pub(crate) fn verify_password(&self, password: &str) -> bool {
        verify_slices_are_equal(self.password.as_bytes(), password.as_bytes()).is_ok()
    }

    /// Whether any of this user's patterns authorizes the given address.
    pub fn has_access(&self, address: &str) -> bool {
        self.addresses
            .iter()
            .any(|pattern| pattern.is_allow_all() || pattern.matches(address))
    }
}

/// Split an inline `name:password` credential.
///
/// A credential without a colon yields an empty name.
pub fn parse_auth(auth: &str) -> (&str, &str) {
    match auth.split_once(':') {
        Some((name, password)) => (name, password),
        None => ("", ""),
    }
}

/// Parse the contents of an auth file.
///
/// The file is a JSON object mapping `"name:password"` keys to arrays of address patterns.
pub fn parse_auth_file(contents: &str) -> Result<Vec<User>, String> {
    let records: HashMap<String, Vec<String>> =
        serde_json::from_str(contents).map_err(|error| error.to_string())?;
    records
        .into_iter()
        .map(|(auth, addresses)| {
            let (name, password) = parse_auth(&auth);
            if name.is_empty() {
                return Err(format!("invalid user:pass string {auth:?}"));
            }
            User::new(name, password, addresses).map_err(|error| error.to_string())
        })
        .collect()
}

/// In-memory directory of users, keyed by name.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: RwLock<HashMap<String, Arc<User>, RandomState>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Replace all users with the contents of an auth file.
    ///
    /// On any error, the registry is left unchanged.
    pub async fn load_from_file(&self, path: &Path) -> Result<(), ServerError> {
        let users = read_auth_file(path).await?;
        #[cfg(not(coverage_nightly))]
        tracing::debug!(?path, count = users.len(), "Loaded users from auth file.");
        self.reset(users);
        Ok(())
    }

    /// Add the user from an inline `name:password` credential, with access to all addresses.
    ///
    /// Returns `None` without adding anything if the name is empty.
    pub fn add_inline(&self, auth: &str) -> Option<Arc<User>> {
        let (name, password) = parse_auth(auth);
        if name.is_empty() {
            return None;
        }
        let user = Arc::new(User::allow_all(name, password));
        self.insert(Arc::clone(&user));
        Some(user)
    }

    /// Add or replace a user, compiling its address patterns first.
    ///
    /// Nothing is added if any pattern is invalid.
    pub fn add_user<S: AsRef<str>>(
        &self,
        name: &str,
        password: &str,
        addresses: &[S],
    ) -> Result<(), ServerError> {
        let user = User::new(name, password, addresses)?;
        self.insert(Arc::new(user));
        Ok(())
    }

    pub fn insert(&self, user: Arc<User>) {
        self.users
            .write()
            .expect("not poisoned")
            .insert(user.name.clone(), user);
    }

    pub fn delete_user(&self, name: &str) {
        self.users.write().expect("not poisoned").remove(name);
    }

    /// Atomically replace every user in the registry.
    pub fn reset(&self, users: Vec<User>) {
        let users = users
            .into_iter()
            .map(|user| (user.name.clone(), Arc::new(user)))
            .collect();
        *self.users.write().expect("not poisoned") = users;
    }

    pub fn get(&self, name: &str) -> Option<Arc<User>> {
        self.users.read().expect("not poisoned").get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.read().expect("not poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether clients must present valid credentials.
    ///
    /// With no registered users, the gateway runs in open mode and accepts everyone.
    pub fn authentication_required(&self) -> bool {
        !self.is_empty()
    }
}

pub(crate) async fn read_auth_file(path: &Path) -> Result<Vec<User>, ServerError> {
    let contents =
        tokio::fs::read_to_string(path)
            .await
            .map_err(|error| ServerError::AuthFileLoad {
                path: path.into(),
                reason: error.to_string(),
            })?;
    parse_auth_file(&contents).map_err(|reason| ServerError::AuthFileLoad {
        path: path.into(),
        reason,
    })
}

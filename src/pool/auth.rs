use std::collections::HashMap;

/// Resolves a presented credential to an executor identity.
///
/// Credential issuance lives outside this crate; the pool only needs to
/// know who a key belongs to.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credential: &str) -> Option<String>;
}

/// Fixed table of API keys, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, String>,
}

impl StaticKeyAuthenticator {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    pub fn with_key(mut self, key: impl Into<String>, identity: impl Into<String>) -> Self {
        self.keys.insert(key.into(), identity.into());
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Authenticator for StaticKeyAuthenticator {
    fn authenticate(&self, credential: &str) -> Option<String> {
        self.keys.get(credential).cloned()
    }
}

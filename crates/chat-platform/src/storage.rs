use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("value not found")]
    NotFound,
    #[error("stored value for '{key}' is malformed: {reason}")]
    Malformed { key: String, reason: String },
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Persisted string key-value store, partitioned by scope.
pub trait KeyValueStore: Send + Sync {
    fn set_value(&self, scope: &str, key: &str, value: &str) -> Result<(), StorageError>;

    fn get_value(&self, scope: &str, key: &str) -> Result<String, StorageError>;

    fn delete_value(&self, scope: &str, key: &str) -> Result<(), StorageError>;

    /// Remove every key of `scope`.
    fn clear_scope(&self, scope: &str) -> Result<(), StorageError>;
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    data: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn set_value(&self, scope: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.insert((scope.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }

    fn get_value(&self, scope: &str, key: &str) -> Result<String, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.get(&(scope.to_owned(), key.to_owned()))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    fn delete_value(&self, scope: &str, key: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        if data.remove(&(scope.to_owned(), key.to_owned())).is_none() {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn clear_scope(&self, scope: &str) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StorageError::Backend("poisoned lock".to_owned()))?;
        data.retain(|(entry_scope, _), _| entry_scope != scope);
        Ok(())
    }
}

const KEY_TOKEN: &str = "token";
const KEY_TOKEN_EXPIRES_AT: &str = "token_expires_at_ms";
const KEY_CUSTOMER_ID: &str = "customer_id";
const KEY_VISITOR_ID: &str = "visitor_id";
const KEY_VISIT_ID: &str = "visit_id";
const KEY_VISIT_EXPIRES_AT: &str = "visit_expires_at_ms";
const KEY_WELCOME_TEMPLATE: &str = "welcome_template";

/// Access token with its expiry as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredToken {
    pub token: String,
    pub expires_at_ms: u64,
}

/// Last analytics visit as persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredVisit {
    pub id: Uuid,
    pub expires_at_ms: u64,
}

/// Typed view of the values the chat runtime persists, scoped to one
/// brand/channel pair.
#[derive(Clone)]
pub struct ChatStorage {
    inner: Arc<dyn KeyValueStore>,
    scope: String,
}

impl ChatStorage {
    pub fn new(inner: Arc<dyn KeyValueStore>, scope: impl Into<String>) -> Self {
        Self {
            inner,
            scope: scope.into(),
        }
    }

    /// In-memory storage, mostly for tests and demos.
    pub fn in_memory(scope: impl Into<String>) -> Self {
        Self::new(Arc::new(InMemoryKeyValueStore::default()), scope)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn token(&self) -> Result<Option<StoredToken>, StorageError> {
        let Some(token) = self.get_optional(KEY_TOKEN)? else {
            return Ok(None);
        };
        let expires_at_ms = self.get_parsed(KEY_TOKEN_EXPIRES_AT)?.unwrap_or(0);
        Ok(Some(StoredToken {
            token,
            expires_at_ms,
        }))
    }

    pub fn set_token(&self, token: &StoredToken) -> Result<(), StorageError> {
        self.set(KEY_TOKEN, &token.token)?;
        self.set(KEY_TOKEN_EXPIRES_AT, &token.expires_at_ms.to_string())
    }

    /// Forget the access token; a missing token is not an error.
    pub fn clear_token(&self) -> Result<(), StorageError> {
        for key in [KEY_TOKEN, KEY_TOKEN_EXPIRES_AT] {
            match self.inner.delete_value(&self.scope, key) {
                Ok(()) | Err(StorageError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn customer_id(&self) -> Result<Option<String>, StorageError> {
        self.get_optional(KEY_CUSTOMER_ID)
    }

    pub fn set_customer_id(&self, customer_id: &str) -> Result<(), StorageError> {
        self.set(KEY_CUSTOMER_ID, customer_id)
    }

    pub fn visitor_id(&self) -> Result<Option<Uuid>, StorageError> {
        self.get_parsed(KEY_VISITOR_ID)
    }

    pub fn set_visitor_id(&self, visitor_id: Uuid) -> Result<(), StorageError> {
        self.set(KEY_VISITOR_ID, &visitor_id.to_string())
    }

    pub fn last_visit(&self) -> Result<Option<StoredVisit>, StorageError> {
        let Some(id) = self.get_parsed(KEY_VISIT_ID)? else {
            return Ok(None);
        };
        let expires_at_ms = self.get_parsed(KEY_VISIT_EXPIRES_AT)?.unwrap_or(0);
        Ok(Some(StoredVisit { id, expires_at_ms }))
    }

    pub fn set_last_visit(&self, visit: StoredVisit) -> Result<(), StorageError> {
        self.set(KEY_VISIT_ID, &visit.id.to_string())?;
        self.set(KEY_VISIT_EXPIRES_AT, &visit.expires_at_ms.to_string())
    }

    pub fn welcome_template(&self) -> Result<Option<String>, StorageError> {
        self.get_optional(KEY_WELCOME_TEMPLATE)
    }

    pub fn set_welcome_template(&self, template: &str) -> Result<(), StorageError> {
        self.set(KEY_WELCOME_TEMPLATE, template)
    }

    /// Drop everything persisted for this scope.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear_scope(&self.scope)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set_value(&self.scope, key, value)
    }

    fn get_optional(&self, key: &str) -> Result<Option<String>, StorageError> {
        match self.inner.get_value(&self.scope, key) {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, StorageError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get_optional(key)?
            .map(|raw| {
                raw.parse().map_err(|err: T::Err| StorageError::Malformed {
                    key: key.to_owned(),
                    reason: err.to_string(),
                })
            })
            .transpose()
    }
}

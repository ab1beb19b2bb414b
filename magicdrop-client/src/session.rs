use magicdrop_core::{SESSION_STORAGE_KEY, SessionToken};
use tracing::{info, warn};

use crate::storage::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub token: SessionToken,
    /// `false` when storage failed and the token lives only in this process.
    pub persisted: bool,
}

/// Returns the stored session token, creating and storing one if needed.
///
/// A stored value that is not a valid token is replaced. If storage cannot be
/// read or written, an ephemeral token is returned instead of an error.
pub fn get_or_create_session<S: KeyValueStore + ?Sized>(store: &S) -> SessionIdentity {
    match store.get(SESSION_STORAGE_KEY) {
        Ok(Some(raw)) => match SessionToken::parse(&raw) {
            Ok(token) => {
                return SessionIdentity {
                    token,
                    persisted: true,
                };
            }
            Err(err) => warn!("stored session token rejected, replacing it: {}", err),
        },
        Ok(None) => {}
        Err(err) => {
            warn!("session storage unavailable, using ephemeral token: {}", err);
            return SessionIdentity {
                token: SessionToken::generate(),
                persisted: false,
            };
        }
    }

    let token = SessionToken::generate();
    match store.set(SESSION_STORAGE_KEY, token.as_str()) {
        Ok(()) => {
            info!(session = token.short(8), "created session token");
            SessionIdentity {
                token,
                persisted: true,
            }
        }
        Err(err) => {
            warn!("failed to persist session token, using ephemeral token: {}", err);
            SessionIdentity {
                token,
                persisted: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn token_is_reused_once_stored() {
        let store = MemoryStore::new();
        let first = get_or_create_session(&store);
        let second = get_or_create_session(&store);
        assert!(first.persisted);
        assert_eq!(first, second);
        assert_eq!(
            store.get(SESSION_STORAGE_KEY).unwrap().as_deref(),
            Some(first.token.as_str())
        );
    }

    #[test]
    fn invalid_stored_token_is_replaced() {
        let store = MemoryStore::new();
        store.set(SESSION_STORAGE_KEY, "not a token!").unwrap();
        let identity = get_or_create_session(&store);
        assert!(identity.persisted);
        assert_ne!(identity.token.as_str(), "not a token!");
        assert_eq!(
            store.get(SESSION_STORAGE_KEY).unwrap().as_deref(),
            Some(identity.token.as_str())
        );
    }

    #[test]
    fn unavailable_storage_falls_back_to_ephemeral_token() {
        let store = MemoryStore::unavailable();
        let first = get_or_create_session(&store);
        let second = get_or_create_session(&store);
        assert!(!first.persisted);
        assert!(!second.persisted);
        assert_ne!(first.token, second.token);
    }
}

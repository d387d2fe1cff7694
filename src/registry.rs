//! Process-wide provider registry.
//!
//! Providers register a constructor under a name at start-up; callers that
//! only know the name (for example from configuration) construct a provider
//! with [`new_provider`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;

use crate::context::Provider;
use crate::status::Status;
use crate::Result;

type Constructor = Arc<dyn Fn() -> std::result::Result<Arc<dyn Provider>, Status> + Send + Sync>;

static REGISTRY: Lazy<Mutex<HashMap<String, Constructor>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn registry() -> MutexGuard<'static, HashMap<String, Constructor>> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registers a provider constructor under `name`, replacing any previous one.
///
/// # Panics
///
/// Panics if `name` is empty.
pub fn register_provider<F>(name: &str, ctor: F)
where
    F: Fn() -> std::result::Result<Arc<dyn Provider>, Status> + Send + Sync + 'static,
{
    assert!(!name.is_empty(), "provider name must not be empty");

    if registry().insert(name.to_owned(), Arc::new(ctor)).is_some() {
        log::debug!("replaced registered provider {:?}", name);
    }
}

pub fn is_registered(name: &str) -> bool {
    registry().contains_key(name)
}

/// Names of all registered providers, sorted.
pub fn registered_providers() -> Vec<String> {
    let mut names: Vec<String> = registry().keys().cloned().collect();
    names.sort();
    names
}

/// Constructs the provider registered under `name`.
pub fn new_provider(name: &str) -> Result<Arc<dyn Provider>> {
    // the constructor runs outside the lock
    let ctor = registry()
        .get(name)
        .cloned()
        .ok_or_else(|| crate::error::provider_not_found(name))?;

    ctor().map_err(crate::error::mechanism)
}

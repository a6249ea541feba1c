//! Named, create-once instance registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

/// Map from name to a shared instance, created at most once per name.
///
/// Owned by the application's composition root and passed by reference to
/// whatever needs lookup-or-create semantics. The lock is held while an
/// instance is being created, so concurrent callers for the same name wait
/// for the first one instead of creating a duplicate.
pub struct Registry<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Instance registered under `name`, creating it with `init` if absent.
    ///
    /// A failed `init` registers nothing; the next call tries again.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `init`.
    pub async fn get_or_try_init<F, Fut, E>(&self, name: &str, init: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.get(name) {
            return Ok(Arc::clone(existing));
        }

        let instance = Arc::new(init().await?);
        entries.insert(name.to_string(), Arc::clone(&instance));
        debug!(name = %name, "registered instance");
        Ok(instance)
    }

    /// Instance registered under `name`.
    pub async fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.lock().await.get(name).cloned()
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.entries.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove and return every instance.
    pub async fn drain(&self) -> Vec<(String, Arc<T>)> {
        self.entries.lock().await.drain().collect()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

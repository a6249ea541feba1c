//! Primary/shadow/gray backend selection.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::trace::TraceContext;

/// Deferred close action of one backend.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ClientResult<()>> + Send>;

/// Wrap an async closure as a [`Cleanup`].
pub fn cleanup_fn<F, Fut>(f: F) -> Cleanup
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ClientResult<()>> + Send + 'static,
{
    Box::new(move || Box::pin(f()))
}

/// A cleanup that does nothing.
#[must_use]
pub fn noop_cleanup() -> Cleanup {
    cleanup_fn(|| async { Ok(()) })
}

/// A routable backend handle: a producer, cache client or database pool.
pub trait Backend: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Action that closes this backend.
    fn cleanup(&self) -> Cleanup;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn cleanup(&self) -> Cleanup {
        (**self).cleanup()
    }
}

/// Cleanup actions collected from one or more backend sets.
///
/// Running it invokes every action in registration order; a failure does not
/// stop the remaining actions.
#[derive(Default)]
pub struct CompositeCleanup {
    actions: Vec<(String, Cleanup)>,
}

impl CompositeCleanup {
    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether there is nothing to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Append the actions of `other` after the ones already held.
    pub fn extend(&mut self, other: CompositeCleanup) {
        self.actions.extend(other.actions);
    }

    /// Run every action and return the failures.
    pub async fn run(self) -> Vec<ClientError> {
        let mut failures = Vec::new();
        for (backend, action) in self.actions {
            match action().await {
                Ok(()) => debug!(backend = %backend, "backend closed"),
                Err(e) => {
                    warn!(backend = %backend, error = %e, "backend cleanup failed");
                    failures.push(e);
                }
            }
        }
        failures
    }
}

impl fmt::Debug for CompositeCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeCleanup")
            .field(
                "backends",
                &self.actions.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A primary backend with an optional shadow and gray counterpart.
///
/// Selection never mutates the set, so it is shared freely once built.
pub struct BackendSet<T> {
    primary: T,
    shadow: Option<T>,
    gray: Option<T>,
    cleanups: Vec<(String, Cleanup)>,
    error: Option<ClientError>,
}

impl<T: Backend> BackendSet<T> {
    /// Build a set around `primary` and register its cleanup.
    pub fn new(primary: T) -> Self {
        let cleanups = vec![(primary.name().to_string(), primary.cleanup())];
        Self {
            primary,
            shadow: None,
            gray: None,
            cleanups,
            error: None,
        }
    }

    /// Register the backend serving benchmark traffic.
    #[must_use]
    pub fn with_shadow(mut self, shadow: T) -> Self {
        self.cleanups
            .push((shadow.name().to_string(), shadow.cleanup()));
        self.shadow = Some(shadow);
        self
    }

    /// Register the backend serving gray traffic.
    #[must_use]
    pub fn with_gray(mut self, gray: T) -> Self {
        self.cleanups.push((gray.name().to_string(), gray.cleanup()));
        self.gray = Some(gray);
        self
    }

    /// Register a shadow backend whose construction may have failed.
    ///
    /// A failure is recorded instead of a backend; the first recorded
    /// failure is kept, later ones are only logged.
    #[must_use]
    pub fn try_with_shadow(self, shadow: ClientResult<T>) -> Self {
        match shadow {
            Ok(shadow) => self.with_shadow(shadow),
            Err(e) => self.record_error("shadow", e),
        }
    }

    /// Register a gray backend whose construction may have failed.
    #[must_use]
    pub fn try_with_gray(self, gray: ClientResult<T>) -> Self {
        match gray {
            Ok(gray) => self.with_gray(gray),
            Err(e) => self.record_error("gray", e),
        }
    }

    fn record_error(mut self, role: &'static str, error: ClientError) -> Self {
        if self.error.is_some() {
            warn!(primary = %self.primary.name(), role, error = %error, "dropping additional backend construction error");
        } else {
            warn!(primary = %self.primary.name(), role, error = %error, "backend construction failed");
            self.error = Some(error);
        }
        self
    }

    /// First construction error recorded while building the set.
    #[must_use]
    pub fn construction_error(&self) -> Option<&ClientError> {
        self.error.as_ref()
    }

    /// Return the set if every backend was built; otherwise close what was
    /// built and return the first construction error.
    ///
    /// # Errors
    ///
    /// Returns the first error passed to `try_with_shadow`/`try_with_gray`.
    pub async fn checked(mut self) -> ClientResult<Self> {
        match self.error.take() {
            None => Ok(self),
            Some(e) => {
                self.cleanup().run().await;
                Err(e)
            }
        }
    }

    /// The primary backend.
    pub fn primary(&self) -> &T {
        &self.primary
    }

    /// The shadow backend, if registered.
    pub fn shadow(&self) -> Option<&T> {
        self.shadow.as_ref()
    }

    /// The gray backend, if registered.
    pub fn gray(&self) -> Option<&T> {
        self.gray.as_ref()
    }

    /// Backend for `ctx`: shadow for benchmark traffic when registered,
    /// primary otherwise.
    pub fn select(&self, ctx: &TraceContext) -> &T {
        match &self.shadow {
            Some(shadow) if ctx.is_benchmark_traffic() => shadow,
            _ => &self.primary,
        }
    }

    /// Like [`select`](Self::select), but gray traffic goes to the gray
    /// backend when one is registered.
    pub fn select_gray(&self, ctx: &TraceContext) -> &T {
        match &self.gray {
            Some(gray) if ctx.is_gray() => gray,
            _ => self.select(ctx),
        }
    }

    /// Selection scope without a transaction override.
    pub fn scope(&self) -> Scope<'_, T> {
        Scope {
            set: self,
            transaction: None,
        }
    }

    /// Selection scope in which every lookup returns `transaction`.
    pub fn transaction<'a>(&'a self, transaction: &'a T) -> Scope<'a, T> {
        self.scope().with_transaction(transaction)
    }

    /// Take every registered cleanup action.
    ///
    /// Each action is handed out once; a second call returns an empty
    /// composite.
    pub fn cleanup(&mut self) -> CompositeCleanup {
        CompositeCleanup {
            actions: std::mem::take(&mut self.cleanups),
        }
    }
}

impl<T: Backend> fmt::Debug for BackendSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSet")
            .field("primary", &self.primary.name())
            .field("shadow", &self.shadow.as_ref().map(Backend::name))
            .field("gray", &self.gray.as_ref().map(Backend::name))
            .field("pending_cleanups", &self.cleanups.len())
            .finish()
    }
}

/// Borrowed view of a [`BackendSet`] with an optional transaction override.
///
/// Statements run inside one transaction must share its connection, so an
/// override wins over every routing rule. The override ends when the scope
/// is dropped.
pub struct Scope<'a, T> {
    set: &'a BackendSet<T>,
    transaction: Option<&'a T>,
}

impl<'a, T: Backend> Scope<'a, T> {
    /// Pin every lookup in this scope to `transaction`.
    #[must_use]
    pub fn with_transaction(mut self, transaction: &'a T) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Whether a transaction override is active.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Backend for `ctx`, honouring the override.
    pub fn select(&self, ctx: &TraceContext) -> &'a T {
        match self.transaction {
            Some(tx) => tx,
            None => self.set.select(ctx),
        }
    }

    /// Gray-aware backend for `ctx`, honouring the override.
    pub fn select_gray(&self, ctx: &TraceContext) -> &'a T {
        match self.transaction {
            Some(tx) => tx,
            None => self.set.select_gray(ctx),
        }
    }
}

impl<T> Clone for Scope<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Scope<'_, T> {}

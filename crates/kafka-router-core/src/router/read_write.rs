//! Read/write split over two backend sets.

use std::fmt;

use super::backend_set::{Backend, BackendSet, CompositeCleanup};
use crate::trace::TraceContext;

/// A read set and a write set, each with its own shadow and gray backends.
///
/// Used for databases with replicas: reads go to the read set, writes to the
/// write set. A transaction pins both to the same connection.
pub struct ReadWriteSet<T> {
    read: BackendSet<T>,
    write: BackendSet<T>,
}

impl<T: Backend> ReadWriteSet<T> {
    /// Pair a read set with a write set.
    pub fn new(read: BackendSet<T>, write: BackendSet<T>) -> Self {
        Self { read, write }
    }

    /// Backend for reads.
    pub fn read(&self, ctx: &TraceContext) -> &T {
        self.read.select(ctx)
    }

    /// Backend for writes.
    pub fn write(&self, ctx: &TraceContext) -> &T {
        self.write.select(ctx)
    }

    /// Read and write sets.
    pub fn sets(&self) -> (&BackendSet<T>, &BackendSet<T>) {
        (&self.read, &self.write)
    }

    /// Scope in which reads and writes both return `transaction`.
    pub fn transaction<'a>(&'a self, transaction: &'a T) -> ReadWriteScope<'a, T> {
        ReadWriteScope {
            set: self,
            transaction: Some(transaction),
        }
    }

    /// Take the cleanups of both sets: read first, then write.
    pub fn cleanup(&mut self) -> CompositeCleanup {
        let mut all = self.read.cleanup();
        all.extend(self.write.cleanup());
        all
    }
}

impl<T: Backend> fmt::Debug for ReadWriteSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadWriteSet")
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

/// Borrowed view of a [`ReadWriteSet`] with an optional transaction override.
pub struct ReadWriteScope<'a, T> {
    set: &'a ReadWriteSet<T>,
    transaction: Option<&'a T>,
}

impl<'a, T: Backend> ReadWriteScope<'a, T> {
    /// Backend for reads, honouring the override.
    pub fn read(&self, ctx: &TraceContext) -> &'a T {
        self.transaction.unwrap_or_else(|| self.set.read(ctx))
    }

    /// Backend for writes, honouring the override.
    pub fn write(&self, ctx: &TraceContext) -> &'a T {
        self.transaction.unwrap_or_else(|| self.set.write(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TraceSettings;
    use crate::router::backend_set::{cleanup_fn, Cleanup};
    use std::sync::{Arc, Mutex};

    struct Db {
        name: &'static str,
        closed: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Backend for Db {
        fn name(&self) -> &str {
            self.name
        }

        fn cleanup(&self) -> Cleanup {
            let name = self.name;
            let closed = Arc::clone(&self.closed);
            cleanup_fn(move || async move {
                closed.lock().unwrap().push(name);
                Ok(())
            })
        }
    }

    fn set(closed: &Arc<Mutex<Vec<&'static str>>>) -> ReadWriteSet<Db> {
        let db = |name| Db {
            name,
            closed: Arc::clone(closed),
        };
        ReadWriteSet::new(
            BackendSet::new(db("read")).with_shadow(db("read-shadow")),
            BackendSet::new(db("write")).with_shadow(db("write-shadow")),
        )
    }

    fn ctx(benchmark: bool) -> TraceContext {
        TraceContext::detached(&TraceSettings::default()).with_benchmark(benchmark)
    }

    #[test]
    fn test_read_write_routing() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let set = set(&closed);

        assert_eq!(set.read(&ctx(false)).name(), "read");
        assert_eq!(set.write(&ctx(false)).name(), "write");
        assert_eq!(set.read(&ctx(true)).name(), "read-shadow");
        assert_eq!(set.write(&ctx(true)).name(), "write-shadow");
    }

    #[test]
    fn test_transaction_pins_reads_and_writes() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let set = set(&closed);
        let tx = Db {
            name: "tx",
            closed: Arc::clone(&closed),
        };

        let scope = set.transaction(&tx);
        assert_eq!(scope.read(&ctx(true)).name(), "tx");
        assert_eq!(scope.write(&ctx(false)).name(), "tx");
    }

    #[tokio::test]
    async fn test_cleanup_read_then_write() {
        let closed = Arc::new(Mutex::new(Vec::new()));
        let mut set = set(&closed);

        assert!(set.cleanup().run().await.is_empty());
        assert_eq!(
            *closed.lock().unwrap(),
            vec!["read", "read-shadow", "write", "write-shadow"]
        );
    }
}

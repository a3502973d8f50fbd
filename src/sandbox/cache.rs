//! Compiled module cache
//!
//! One deferred compilation per artifact name. The first request creates the
//! entry and whoever polls it first does the fetch and compile; every later or
//! concurrent request for the same name awaits that same result, so there is
//! at most one fetch per name and one `Module` instance. Failures are cached
//! too: a module that failed to load stays failed until the cache is dropped.

use super::error::{SandboxError, SandboxResult};
use super::loader;
use crate::toolchain::artifacts::ArtifactSource;
use crate::toolchain::hostlog::{HostLog, GRAY};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wasmi::{Engine, Module};

type PendingModule = Shared<BoxFuture<'static, SandboxResult<Arc<Module>>>>;

/// Name-keyed cache of compiled modules
#[derive(Clone)]
pub struct ModuleCache {
    engine: Engine,
    source: Arc<dyn ArtifactSource>,
    log: HostLog,
    entries: Arc<Mutex<HashMap<String, PendingModule>>>,
}

impl ModuleCache {
    pub fn new(engine: Engine, source: Arc<dyn ArtifactSource>, log: HostLog) -> Self {
        Self {
            engine,
            source,
            log,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Deferred handle on the compiled module called `name`
    pub fn get(&self, name: &str) -> PendingModule {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(name.to_string())
            .or_insert_with(|| self.load(name.to_string()))
            .clone()
    }

    /// Number of names requested so far
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn load(&self, name: String) -> PendingModule {
        let engine = self.engine.clone();
        let source = self.source.clone();
        let log = self.log.clone();
        async move {
            let message = format!("{}Fetching and compiling {}", GRAY, name);
            let module = log.task(&message, || {
                let bytes = source
                    .fetch(&name)
                    .map_err(|e| SandboxError::ArtifactUnavailable {
                        name: name.clone(),
                        reason: e.to_string(),
                    })?;
                loader::compile(&engine, &bytes, &[])
            })?;
            tracing::debug!(artifact = %name, "module compiled");
            Ok(Arc::new(module))
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RecordingPort;
    use crate::toolchain::artifacts::MemoryArtifacts;
    use futures::executor::block_on;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    const MODULE: &str = r#"(module (memory (export "memory") 1) (func (export "_start")))"#;

    struct SlowSource {
        fetches: AtomicUsize,
        bytes: Vec<u8>,
    }

    impl ArtifactSource for SlowSource {
        fn fetch(&self, _name: &str) -> io::Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(self.bytes.clone())
        }
    }

    fn cache(source: Arc<dyn ArtifactSource>) -> (ModuleCache, Arc<RecordingPort>) {
        let port = Arc::new(RecordingPort::new());
        let cache = ModuleCache::new(Engine::default(), source, HostLog::new(port.clone()));
        (cache, port)
    }

    #[test]
    fn test_concurrent_requests_share_one_fetch() {
        let source = Arc::new(SlowSource {
            fetches: AtomicUsize::new(0),
            bytes: wat::parse_str(MODULE).unwrap(),
        });
        let (cache, port) = cache(source.clone());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || block_on(cache.get("clang.wasm")).unwrap())
            })
            .collect();
        let modules: Vec<Arc<Module>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert!(modules.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(port.output().matches("Fetching and compiling clang.wasm").count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_artifact() {
        let (cache, _) = cache(Arc::new(MemoryArtifacts::new()));
        assert!(matches!(
            block_on(cache.get("lld.wasm")),
            Err(SandboxError::ArtifactUnavailable { .. })
        ));
    }

    #[test]
    fn test_invalid_module() {
        let source = MemoryArtifacts::new().with("bad.wasm", b"not wasm".to_vec());
        let (cache, port) = cache(Arc::new(source));
        assert!(matches!(
            block_on(cache.get("bad.wasm")),
            Err(SandboxError::InvalidModule { .. })
        ));
        assert!(!port.output().contains("done."));
    }
}

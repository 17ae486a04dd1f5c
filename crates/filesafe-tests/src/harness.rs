//! Test Harness - recovery manager over scripted providers

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use filesafe_recovery::error::FileOpError;
use filesafe_recovery::tracker::SinkError;
use filesafe_recovery::{
    compensation_fn, CompensatingAction, ErrorContext, ErrorFilter, ErrorSink, FileMetadata,
    FileOperation, InMemoryMetadataStore, LifecycleState, LocalDiskProvider, MemoryProvider,
    OperationLog, ProviderRegistry, RecoveryManager, RecoveryOptions,
};
use parking_lot::Mutex;
use tempfile::TempDir;

#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Self {
        init_test_tracing();
        let temp_dir = tempfile::tempdir().expect("failed to create temp dir");
        tracing::debug!(test = test_name, dir = %temp_dir.path().display(), "test env created");
        Self {
            temp_dir,
            test_name: test_name.to_string(),
        }
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// A local-disk provider rooted in a subdirectory named after the target.
    pub async fn local_provider(&self, name: &str) -> Arc<LocalDiskProvider> {
        let provider = LocalDiskProvider::open(name, self.tempdir().join(name))
            .await
            .expect("failed to open local provider");
        Arc::new(provider)
    }
}

/// Routes tracing output through the test harness; honours `RUST_LOG`.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct ScenarioBuilder {
    targets: Vec<String>,
    options: RecoveryOptions,
    sink: Option<Arc<dyn ErrorSink>>,
    journal: Option<Arc<OperationLog>>,
    extra: Vec<(String, Arc<dyn filesafe_recovery::FileProvider>)>,
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            options: RecoveryOptions {
                jitter_fraction: 0.0,
                ..RecoveryOptions::default()
            },
            sink: None,
            journal: None,
            extra: Vec::new(),
        }
    }

    /// Adds an in-memory provider serving `name`.
    pub fn target(mut self, name: &str) -> Self {
        self.targets.push(name.to_string());
        self
    }

    /// Adds a provider that is not a [`MemoryProvider`].
    pub fn provider(mut self, name: &str, provider: Arc<dyn filesafe_recovery::FileProvider>) -> Self {
        self.extra.push((name.to_string(), provider));
        self
    }

    pub fn chain(mut self, class: &str, targets: &[&str]) -> Self {
        self.options.fallback_chains.insert(
            class.to_string(),
            targets.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut RecoveryOptions)) -> Self {
        f(&mut self.options);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn journal(mut self, journal: Arc<OperationLog>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn build(self) -> Scenario {
        let registry = Arc::new(ProviderRegistry::new());
        let mut providers = BTreeMap::new();
        for name in &self.targets {
            let provider = Arc::new(MemoryProvider::new(name.clone()));
            registry.register(provider.clone());
            providers.insert(name.clone(), provider);
        }
        for (name, provider) in self.extra {
            registry.register_as(&name, provider);
        }

        let metadata = Arc::new(InMemoryMetadataStore::new());
        let mut builder = RecoveryManager::builder(Arc::clone(&registry), metadata.clone())
            .options(self.options);
        if let Some(sink) = self.sink {
            builder = builder.error_sink(sink);
        }
        if let Some(journal) = self.journal {
            builder = builder.journal(journal);
        }
        let manager = builder.build().expect("invalid scenario options");

        Scenario {
            manager: Arc::new(manager),
            metadata,
            registry,
            providers,
        }
    }
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Scenario {
    pub manager: Arc<RecoveryManager>,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub registry: Arc<ProviderRegistry>,
    providers: BTreeMap<String, Arc<MemoryProvider>>,
}

impl Scenario {
    pub fn provider(&self, name: &str) -> Arc<MemoryProvider> {
        Arc::clone(
            self.providers
                .get(name)
                .unwrap_or_else(|| panic!("no memory provider named {name}")),
        )
    }

    /// An operation on a freshly tracked file `file-<id>`.
    pub fn operation(&self, id: &str, target: &str) -> FileOperation {
        let meta = FileMetadata::for_content(format!("file-{id}"), id.as_bytes());
        self.metadata.insert(meta.clone());
        FileOperation::new(id, target, meta)
    }

    pub fn file_state(&self, id: &str) -> Option<LifecycleState> {
        self.metadata.state_of(&format!("file-{id}"))
    }

    /// Provider calls across every in-memory target.
    pub fn total_calls(&self) -> u64 {
        self.providers.values().map(|p| p.total_calls()).sum()
    }
}

/// Records the order in which compensations ran.
#[derive(Debug, Clone, Default)]
pub struct CompensationLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CompensationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(&self, name: &str) -> Box<dyn CompensatingAction> {
        self.make(name, false)
    }

    pub fn failing_action(&self, name: &str) -> Box<dyn CompensatingAction> {
        self.make(name, true)
    }

    fn make(&self, name: &str, fail: bool) -> Box<dyn CompensatingAction> {
        let entries = Arc::clone(&self.entries);
        let name = name.to_string();
        compensation_fn(move || {
            let entries = Arc::clone(&entries);
            let name = name.clone();
            async move {
                entries.lock().push(name.clone());
                if fail {
                    Err(FileOpError::transient(format!("undo of {name} failed")))
                } else {
                    Ok(())
                }
            }
        })
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// An error sink that rejects every write.
#[derive(Debug, Default)]
pub struct FailingSink {
    attempts: AtomicU64,
}

impl FailingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ErrorSink for FailingSink {
    async fn write(&self, _context: &ErrorContext) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(SinkError("error table unavailable".to_string()))
    }

    async fn query(&self, _filter: &ErrorFilter) -> Result<Vec<ErrorContext>, SinkError> {
        Err(SinkError("error table unavailable".to_string()))
    }
}

/// An error sink whose writes never complete.
#[derive(Debug, Default)]
pub struct StuckSink;

#[async_trait]
impl ErrorSink for StuckSink {
    async fn write(&self, _context: &ErrorContext) -> Result<(), SinkError> {
        std::future::pending().await
    }

    async fn query(&self, _filter: &ErrorFilter) -> Result<Vec<ErrorContext>, SinkError> {
        Ok(Vec::new())
    }
}

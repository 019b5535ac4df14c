//! Test Kernel Harness
//!
//! Builds an isolated kernel over a temporary database with deterministic
//! external-service stubs. The temporary directory lives as long as the
//! harness, so each test gets its own database that vanishes afterwards.

use std::sync::Arc;

use engram_core::testing::{StubEmbedder, StubValidator};
use engram_core::{EngineConfig, Kernel, RequestContext};
use tempfile::TempDir;

/// An isolated kernel plus handles to its stubbed external services
pub struct TestKernel {
    /// The kernel under test
    pub kernel: Arc<Kernel>,
    /// The deterministic embedder handle
    pub embedder: Arc<StubEmbedder>,
    /// The scripted validator handle
    pub validator: Arc<StubValidator>,
    /// Temporary directory kept alive for the database
    _dir: TempDir,
}

impl TestKernel {
    /// Kernel with default config, online embedder, confirming validator
    pub fn new() -> Self {
        Self::with_parts(
            EngineConfig::default(),
            Arc::new(StubEmbedder::new()),
            Arc::new(StubValidator::confirming()),
        )
    }

    /// Kernel with a custom embedder
    pub fn with_embedder(embedder: StubEmbedder) -> Self {
        Self::with_parts(
            EngineConfig::default(),
            Arc::new(embedder),
            Arc::new(StubValidator::confirming()),
        )
    }

    /// Kernel with a custom validator
    pub fn with_validator(validator: StubValidator) -> Self {
        Self::with_parts(
            EngineConfig::default(),
            Arc::new(StubEmbedder::new()),
            Arc::new(validator),
        )
    }

    /// Fully custom construction
    pub fn with_parts(
        config: EngineConfig,
        embedder: Arc<StubEmbedder>,
        validator: Arc<StubValidator>,
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let kernel = Kernel::builder(dir.path().join("engram-e2e.db"))
            .with_config(config)
            .with_embedder(Arc::clone(&embedder) as Arc<dyn engram_core::Embedder>)
            .with_validator(Arc::clone(&validator) as Arc<dyn engram_core::Validator>)
            .build()
            .expect("kernel build");
        Self {
            kernel,
            embedder,
            validator,
            _dir: dir,
        }
    }

    /// Context for a named project
    pub async fn context(&self, project: &str) -> RequestContext {
        self.kernel.context_for(project).await.expect("project context")
    }
}

impl Default for TestKernel {
    fn default() -> Self {
        Self::new()
    }
}

#![forbid(unsafe_code)]

pub mod backend;

pub use backend::{BackendCompiler, BackendError, Executable, execute_checked};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Named backend compilers.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    compilers: BTreeMap<String, Arc<dyn BackendCompiler>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("compilers", &self.names())
            .finish()
    }
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `compiler` under its own name, replacing any previous one.
    pub fn register(&mut self, compiler: Arc<dyn BackendCompiler>) {
        let name = compiler.name().to_owned();
        debug!(backend = %name, "registered backend compiler");
        self.compilers.insert(name, compiler);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BackendCompiler>, BackendError> {
        self.compilers
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::Unavailable {
                backend: name.to_owned(),
            })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.compilers.keys().map(String::as_str).collect()
    }
}

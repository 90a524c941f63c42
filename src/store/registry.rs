//! Backend constructors keyed by name.
//!
//! Built once at startup and handed to the wiring by value; there is no
//! process-wide registry to mutate.

use crate::common::config::StoreConfig;
use crate::common::{Error, Result};
use crate::store::kv::KvBackend;
use crate::store::memory::MemoryBackend;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type BackendConstructor = fn(&StoreConfig) -> Result<Arc<dyn KvBackend>>;

#[derive(Clone, Default)]
pub struct BackendTable {
    constructors: BTreeMap<String, BackendConstructor>,
}

fn memory_backend(_cfg: &StoreConfig) -> Result<Arc<dyn KvBackend>> {
    Ok(Arc::new(MemoryBackend::new()))
}

impl BackendTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the backends this crate ships (`memory`).
    pub fn with_defaults() -> Self {
        Self::new().register("memory", memory_backend)
    }

    pub fn register(mut self, name: impl Into<String>, constructor: BackendConstructor) -> Self {
        self.constructors.insert(name.into(), constructor);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Construct the backend named by `cfg.backend`.
    pub fn build(&self, cfg: &StoreConfig) -> Result<Arc<dyn KvBackend>> {
        let constructor = self.constructors.get(&cfg.backend).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "unknown store backend {:?} (known: {})",
                cfg.backend,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        tracing::info!(backend = %cfg.backend, "store backend selected");
        constructor(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_contain_memory() {
        let table = BackendTable::with_defaults();
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["memory"]);
        assert!(table.build(&StoreConfig::default()).is_ok());
    }

    #[test]
    fn test_unknown_backend() {
        let cfg = StoreConfig {
            backend: "etcd".to_string(),
            ..Default::default()
        };
        let err = BackendTable::with_defaults().build(&cfg).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.to_string().contains("etcd"));
    }

    #[test]
    fn test_register_custom() {
        fn shared(_cfg: &StoreConfig) -> Result<Arc<dyn KvBackend>> {
            Ok(Arc::new(MemoryBackend::with_watch_capacity(8)))
        }
        let table = BackendTable::new().register("shared", shared);
        let cfg = StoreConfig {
            backend: "shared".to_string(),
            ..Default::default()
        };
        assert!(table.build(&cfg).is_ok());
    }
}

//! Tracer driver: seeds the graph with entry points, bridges it to the
//! record store's dependency resolution, and waits for quiescence.

use std::sync::Arc;

use crate::error::Error;
use crate::graph::{DependencyResolver, Event, Graph};
use crate::record::{Ref, RecordStore};

struct StoreBackedResolver {
    store: Arc<RecordStore>,
}

#[async_trait::async_trait]
impl DependencyResolver for StoreBackedResolver {
    async fn get_dependencies(&self, id: &Ref) -> Result<Vec<Ref>, Error> {
        let record = self.store.get(id);
        let resolved = record.resolved_dependencies().await?;
        Ok(resolved.values().map(Ref::new).collect())
    }
}

#[derive(Debug, Clone)]
pub struct TraceSummary {
    pub nodes_added: usize,
    pub errors: Vec<String>,
}

pub struct Tracer {
    graph: Arc<Graph>,
    store: Arc<RecordStore>,
}

impl Tracer {
    #[must_use]
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self {
            graph: Graph::new(),
            store,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    /// Seeds the graph with every entry path (marked permanent) and waits
    /// for the pending-job set to drain once.
    pub async fn trace_entries(&self, entries: Vec<Ref>) -> TraceSummary {
        let mut rx = self.graph.subscribe();
        let resolver: Arc<dyn DependencyResolver> = Arc::new(StoreBackedResolver {
            store: self.store.clone(),
        });

        for entry in &entries {
            self.graph.set_permanent(entry);
        }

        for entry in entries {
            let graph = self.graph.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move {
                graph.trace(entry, resolver).await;
            });
        }

        let mut nodes_added = 0;
        let mut errors = Vec::new();
        loop {
            match rx.recv().await {
                Ok(Event::Added(_)) => nodes_added += 1,
                Ok(Event::Error(err, id)) => errors.push(format!("{id}: {err}")),
                Ok(Event::Complete) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }

        TraceSummary { nodes_added, errors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{MockAstBackend, MockCssBackend};
    use crate::cache::{CacheDirs, MockCache};
    use crate::config::Config;
    use crate::resolver::DefaultResolver;
    use rustc_hash::FxHashMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_trace_entries_discovers_transitive_dependency() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), r#"import "./b";"#).unwrap();
        std::fs::write(dir.path().join("b.js"), "").unwrap();

        let config = Arc::new(Config::new(
            dir.path().to_path_buf(),
            "/static/",
            dir.path().join("node_modules"),
            Arc::new(MockCache::new()),
            Arc::new(DefaultResolver::new(dir.path().to_path_buf(), FxHashMap::default())),
            Arc::new(crate::ast::RegexAstBackend),
            Arc::new(MockCssBackend::default()),
            CacheDirs::new(std::path::Path::new("/cache"), "deadbeef"),
        ));
        let _ = MockAstBackend::default();

        let store = RecordStore::new(config);
        let tracer = Tracer::new(store);

        let summary = tracer
            .trace_entries(vec![Ref::new(dir.path().join("a.js"))])
            .await;

        assert!(summary.errors.is_empty(), "{:?}", summary.errors);
        assert_eq!(summary.nodes_added, 2);
        assert!(tracer.graph().is_defined(&Ref::new(dir.path().join("b.js"))));
    }
}

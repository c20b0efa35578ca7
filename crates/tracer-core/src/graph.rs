//! The directed dependency graph: async trace jobs, cancellation,
//! permanent-root-anchored pruning, and event emission.

use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::error::Error;
use crate::record::Ref;

#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Complete,
    Added(Ref),
    Pruned(Ref),
    Error(Error, Ref),
    Tracing(Ref),
    Traced(Ref),
}

#[derive(Debug, Default)]
struct Node {
    dependencies: FxHashSet<Ref>,
    dependents: FxHashSet<Ref>,
}

struct PendingJob {
    id: Ref,
    valid: Arc<AtomicBool>,
}

struct Inner {
    nodes: FxHashMap<Ref, Node>,
    permanent_roots: FxHashSet<Ref>,
    pending_jobs: Vec<PendingJob>,
}

/// Bridges the graph to the part of the system that knows how to expand a
/// node into its dependency list (the tracer driver wires this to the
/// record store's `resolvedDependencies`).
#[async_trait::async_trait]
pub trait DependencyResolver: Send + Sync {
    async fn get_dependencies(&self, id: &Ref) -> Result<Vec<Ref>, Error>;
}

/// The dependency graph. Cheap to clone (an `Arc` wrapper around shared
/// state); intended to be held by one tracer driver and any number of
/// event-bus listeners.
pub struct Graph {
    inner: Mutex<Inner>,
    events: broadcast::Sender<Event>,
}

impl Graph {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                nodes: FxHashMap::default(),
                permanent_roots: FxHashSet::default(),
                pending_jobs: Vec::new(),
            }),
            events,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    #[must_use]
    pub fn is_defined(&self, id: &Ref) -> bool {
        self.inner.lock().unwrap().nodes.contains_key(id)
    }

    pub fn set_permanent(&self, id: &Ref) {
        self.inner.lock().unwrap().permanent_roots.insert(id.clone());
    }

    fn ensure_node(inner: &mut Inner, id: &Ref) -> bool {
        if inner.nodes.contains_key(id) {
            false
        } else {
            inner.nodes.insert(id.clone(), Node::default());
            true
        }
    }

    fn add_edge(inner: &mut Inner, from: &Ref, to: &Ref) {
        inner
            .nodes
            .get_mut(from)
            .expect("node must exist before adding an edge")
            .dependencies
            .insert(to.clone());
        inner
            .nodes
            .get_mut(to)
            .expect("node must exist before adding an edge")
            .dependents
            .insert(from.clone());
    }

    /// Enqueues a trace job for `id`. The job is dispatched on the next
    /// await point (not inline), so cancellation registered before then
    /// takes effect.
    pub async fn trace(self: &Arc<Self>, id: Ref, resolver: Arc<dyn DependencyResolver>) {
        let valid = Arc::new(AtomicBool::new(true));
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_jobs.push(PendingJob {
                id: id.clone(),
                valid: valid.clone(),
            });
        }
        self.emit(Event::Start);

        let graph = self.clone();
        tokio::task::yield_now().await;
        graph.dispatch_trace(id, valid, resolver).await;
    }

    async fn dispatch_trace(
        self: &Arc<Self>,
        id: Ref,
        valid: Arc<AtomicBool>,
        resolver: Arc<dyn DependencyResolver>,
    ) {
        if !valid.load(Ordering::SeqCst) {
            self.finish_job(&id, &valid);
            return;
        }

        self.emit(Event::Tracing(id.clone()));
        let dependencies = resolver.get_dependencies(&id).await;

        if !valid.load(Ordering::SeqCst) {
            self.finish_job(&id, &valid);
            return;
        }

        match dependencies {
            Ok(deps) => {
                let mut newly_added = Vec::new();
                let mut to_trace = Vec::new();

                {
                    let mut inner = self.inner.lock().unwrap();
                    if Self::ensure_node(&mut inner, &id) {
                        newly_added.push(id.clone());
                    }

                    for dep in &deps {
                        let needs_trace = !inner.nodes.contains_key(dep)
                            && !inner
                                .pending_jobs
                                .iter()
                                .any(|p| &p.id == dep && p.valid.load(Ordering::SeqCst));
                        if Self::ensure_node(&mut inner, dep) {
                            newly_added.push(dep.clone());
                        }
                        Self::add_edge(&mut inner, &id, dep);
                        if needs_trace {
                            to_trace.push(dep.clone());
                        }
                    }
                }

                for added in newly_added {
                    self.emit(Event::Added(added));
                }
                self.emit(Event::Traced(id.clone()));

                for dep in to_trace {
                    let graph = self.clone();
                    let resolver = resolver.clone();
                    tokio::spawn(async move {
                        graph.trace(dep, resolver).await;
                    });
                }
            }
            Err(err) => {
                self.emit(Event::Error(err, id.clone()));
            }
        }

        self.finish_job(&id, &valid);
    }

    fn finish_job(&self, id: &Ref, valid: &Arc<AtomicBool>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .pending_jobs
            .retain(|p| !(p.id == *id && Arc::ptr_eq(&p.valid, valid)));
        let empty = inner.pending_jobs.is_empty();
        drop(inner);
        if empty {
            self.emit(Event::Complete);
        }
    }

    /// Removes `id` and every successor unreachable from a remaining
    /// permanent root after the removal, using an iterative fixed-point
    /// traversal (not recursion, so cycles are handled without unbounded
    /// stack growth).
    pub fn prune(&self, id: &Ref) {
        let mut inner = self.inner.lock().unwrap();

        if !inner.nodes.contains_key(id) {
            self.invalidate_pending(&mut inner, id);
            drop(inner);
            self.emit(Event::Pruned(id.clone()));
            return;
        }

        let mut removed: FxHashSet<Ref> = FxHashSet::default();
        removed.insert(id.clone());

        loop {
            let mut changed = false;
            let candidates: Vec<Ref> = inner
                .nodes
                .keys()
                .filter(|n| !removed.contains(*n))
                .cloned()
                .collect();

            for candidate in candidates {
                if inner.permanent_roots.contains(&candidate) {
                    continue;
                }
                if Self::reachable_from_any_permanent_root(&inner, &candidate, &removed) {
                    continue;
                }
                if removed.insert(candidate) {
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }

        for node in &removed {
            if let Some(n) = inner.nodes.remove(node) {
                for dependent in &n.dependents {
                    if let Some(d) = inner.nodes.get_mut(dependent) {
                        d.dependencies.remove(node);
                    }
                }
                for dependency in &n.dependencies {
                    if let Some(d) = inner.nodes.get_mut(dependency) {
                        d.dependents.remove(node);
                    }
                }
            }
            self.invalidate_pending(&mut inner, node);
        }

        drop(inner);
        for node in removed {
            self.emit(Event::Pruned(node));
        }
    }

    fn invalidate_pending(&self, inner: &mut Inner, id: &Ref) {
        for job in inner.pending_jobs.iter().filter(|p| &p.id == id) {
            job.valid.store(false, Ordering::SeqCst);
        }
    }

    /// BFS over forward edges from every permanent root (skipping already
    /// removed nodes), checking whether `target` is reached.
    fn reachable_from_any_permanent_root(
        inner: &Inner,
        target: &Ref,
        removed: &FxHashSet<Ref>,
    ) -> bool {
        let mut visited: FxHashSet<Ref> = FxHashSet::default();
        let mut queue: Vec<Ref> = inner
            .permanent_roots
            .iter()
            .filter(|r| !removed.contains(*r))
            .cloned()
            .collect();

        while let Some(current) = queue.pop() {
            if &current == target {
                return true;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = inner.nodes.get(&current) {
                for dep in &node.dependencies {
                    if !removed.contains(dep) && !visited.contains(dep) {
                        queue.push(dep.clone());
                    }
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct StaticResolver(Mutex<HashMap<Ref, Vec<Ref>>>);

    #[async_trait::async_trait]
    impl DependencyResolver for StaticResolver {
        async fn get_dependencies(&self, id: &Ref) -> Result<Vec<Ref>, Error> {
            Ok(self.0.lock().unwrap().get(id).cloned().unwrap_or_default())
        }
    }

    fn r(path: &str) -> Ref {
        Ref::new(std::path::PathBuf::from(path))
    }

    async fn drain_complete(rx: &mut broadcast::Receiver<Event>) {
        loop {
            if let Ok(Event::Complete) = rx.recv().await {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_trace_cycle_completes_once_and_adds_three_nodes() {
        let graph = Graph::new();
        let mut edges = HashMap::new();
        edges.insert(r("/a.js"), vec![r("/b.js")]);
        edges.insert(r("/b.js"), vec![r("/c.js")]);
        edges.insert(r("/c.js"), vec![r("/b.js")]);
        let resolver: Arc<dyn DependencyResolver> = Arc::new(StaticResolver(Mutex::new(edges)));

        let mut rx = graph.subscribe();
        graph.set_permanent(&r("/a.js"));
        graph.trace(r("/a.js"), resolver).await;

        let mut added = 0;
        let mut completes = 0;
        while let Ok(event) = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .unwrap_or(Err(broadcast::error::RecvError::Closed))
        {
            match event {
                Event::Added(_) => added += 1,
                Event::Complete => completes += 1,
                _ => {}
            }
        }

        assert_eq!(added, 3);
        assert_eq!(completes, 1);
        assert!(graph.is_defined(&r("/a.js")));
        assert!(graph.is_defined(&r("/b.js")));
        assert!(graph.is_defined(&r("/c.js")));
    }

    #[tokio::test]
    async fn test_prune_with_no_permanent_roots_removes_everything() {
        let graph = Graph::new();
        let mut edges = HashMap::new();
        edges.insert(r("/a.js"), vec![r("/b.js")]);
        edges.insert(r("/b.js"), vec![r("/c.js")]);
        edges.insert(r("/c.js"), vec![]);
        let resolver: Arc<dyn DependencyResolver> = Arc::new(StaticResolver(Mutex::new(edges)));

        let mut rx = graph.subscribe();
        graph.trace(r("/a.js"), resolver).await;
        drain_complete(&mut rx).await;

        graph.prune(&r("/a.js"));

        assert!(!graph.is_defined(&r("/a.js")));
        assert!(!graph.is_defined(&r("/b.js")));
        assert!(!graph.is_defined(&r("/c.js")));
    }

    #[tokio::test]
    async fn test_prune_with_permanent_root_keeps_reachable_survivors() {
        let graph = Graph::new();
        let mut edges = HashMap::new();
        edges.insert(r("/a.js"), vec![r("/b.js")]);
        edges.insert(r("/b.js"), vec![r("/c.js")]);
        edges.insert(r("/c.js"), vec![]);
        let resolver: Arc<dyn DependencyResolver> = Arc::new(StaticResolver(Mutex::new(edges)));

        let mut rx = graph.subscribe();
        graph.trace(r("/a.js"), resolver).await;
        drain_complete(&mut rx).await;

        graph.set_permanent(&r("/c.js"));
        graph.prune(&r("/a.js"));

        assert!(!graph.is_defined(&r("/a.js")));
        assert!(graph.is_defined(&r("/b.js")));
        assert!(graph.is_defined(&r("/c.js")));
    }

    #[tokio::test]
    async fn test_edge_symmetry_maintained() {
        let graph = Graph::new();
        let mut edges = HashMap::new();
        edges.insert(r("/a.js"), vec![r("/b.js")]);
        edges.insert(r("/b.js"), vec![]);
        let resolver: Arc<dyn DependencyResolver> = Arc::new(StaticResolver(Mutex::new(edges)));

        let mut rx = graph.subscribe();
        graph.trace(r("/a.js"), resolver).await;
        drain_complete(&mut rx).await;

        let inner = graph.inner.lock().unwrap();
        assert!(inner.nodes[&r("/a.js")].dependencies.contains(&r("/b.js")));
        assert!(inner.nodes[&r("/b.js")].dependents.contains(&r("/a.js")));
    }

    struct DelayedResolver {
        edges: HashMap<Ref, Vec<Ref>>,
        delay_for: Ref,
        entered_delay: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl DependencyResolver for DelayedResolver {
        async fn get_dependencies(&self, id: &Ref) -> Result<Vec<Ref>, Error> {
            if *id == self.delay_for {
                // Signal only once the pending job for `id` is already
                // registered (trace() pushes it before calling this), so a
                // waiter here is guaranteed a subsequent prune() actually
                // invalidates it rather than racing its creation.
                self.entered_delay.notify_one();
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            Ok(self.edges.get(id).cloned().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_pruning_a_pending_trace_suppresses_downstream_discovery() {
        let graph = Graph::new();
        let mut edges = HashMap::new();
        edges.insert(r("/a.js"), vec![r("/slow.js")]);
        edges.insert(r("/slow.js"), vec![r("/grandchild.js")]);
        let entered_delay = Arc::new(tokio::sync::Notify::new());
        let resolver: Arc<dyn DependencyResolver> = Arc::new(DelayedResolver {
            edges,
            delay_for: r("/slow.js"),
            entered_delay: entered_delay.clone(),
        });

        let mut rx = graph.subscribe();
        graph.set_permanent(&r("/a.js"));

        let graph_for_trace = graph.clone();
        let resolver_clone = resolver.clone();
        tokio::spawn(async move {
            graph_for_trace.trace(r("/a.js"), resolver_clone).await;
        });

        // Wait until /slow.js's own trace job has registered itself as
        // pending and is blocked inside its dependency resolution, then
        // prune it — this is the only point at which cancellation is
        // meaningful: before registration there's nothing to invalidate,
        // after completion there's nothing left to cancel.
        tokio::time::timeout(std::time::Duration::from_millis(500), entered_delay.notified())
            .await
            .expect("slow.js trace should have started within the timeout");
        graph.prune(&r("/slow.js"));

        let mut grandchild_added = false;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(300);
        while tokio::time::Instant::now() < deadline {
            if let Ok(Ok(Event::Added(id))) =
                tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await
            {
                if id == r("/grandchild.js") {
                    grandchild_added = true;
                }
            }
        }

        assert!(
            !grandchild_added,
            "invalidating a pending trace before it completes must suppress its discoveries"
        );
        assert!(!graph.is_defined(&r("/slow.js")));
        assert!(!graph.is_defined(&r("/grandchild.js")));
    }

    #[tokio::test]
    async fn test_set_permanent_is_idempotent() {
        let graph = Graph::new();
        graph.set_permanent(&r("/a.js"));
        graph.set_permanent(&r("/a.js"));
        assert_eq!(graph.inner.lock().unwrap().permanent_roots.len(), 1);
    }
}

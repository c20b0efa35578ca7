use miette::{IntoDiagnostic, Result};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracer_core::ast::{DefaultCssBackend, RegexAstBackend};
use tracer_core::{CacheDirs, Config, DefaultResolver, DiskCache, Ref, Tracer};

pub struct TraceAction {
    pub entries: Vec<PathBuf>,
    pub source_root: PathBuf,
    pub root_url: String,
    pub cache_dir: PathBuf,
    pub vendor_root: Option<PathBuf>,
    pub bootstrap_runtime: Option<PathBuf>,
    pub verbosity: u8,
    pub json_logs: bool,
}

/// Digests any lockfiles under the source root into a single stable
/// string, used to namespace the resolver caches.
fn dependency_tree_hash(source_root: &std::path::Path) -> String {
    let digests: Vec<String> = ["package-lock.json", "yarn.lock", "pnpm-lock.yaml"]
        .iter()
        .filter_map(|name| {
            let path = source_root.join(name);
            tracer_util::hash::blake3_file(&path).ok()
        })
        .collect();
    tracer_util::hash::blake3_combine(digests.iter().map(String::as_str))
}

pub fn run(action: TraceAction, json: bool) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async move {
        let lockfile_hash = dependency_tree_hash(&action.source_root);
        let cache_dirs = CacheDirs::new(&action.cache_dir, &lockfile_hash);

        let resolver = Arc::new(DefaultResolver::new(
            action.source_root.clone(),
            FxHashMap::default(),
        ));
        let job_cache = Arc::new(DiskCache::new(cache_dirs.dependency_cache.clone()));

        let mut config = Config::new(
            action.source_root.clone(),
            action.root_url.clone(),
            action.source_root.join("node_modules"),
            job_cache,
            resolver,
            Arc::new(RegexAstBackend),
            Arc::new(DefaultCssBackend),
            cache_dirs,
        );
        config.options.vendor_root = action.vendor_root.clone();
        config.options.bootstrap_runtime_path = action.bootstrap_runtime.clone();
        config.options.verbosity = action.verbosity;
        config.options.json_logs = action.json_logs;

        let store = tracer_core::RecordStore::new(Arc::new(config));
        let tracer = Tracer::new(store);

        let entries: Vec<Ref> = action.entries.iter().map(Ref::new).collect();
        tracing::info!(count = entries.len(), "starting trace");

        let summary = tracer.trace_entries(entries).await;

        for error in &summary.errors {
            tracing::error!(%error, "trace job failed");
        }

        if json {
            let payload = serde_json::json!({
                "nodesAdded": summary.nodes_added,
                "errors": summary.errors,
            });
            println!("{payload}");
        } else {
            println!("traced {} node(s)", summary.nodes_added);
            if !summary.errors.is_empty() {
                println!("{} error(s):", summary.errors.len());
                for error in &summary.errors {
                    println!("  {error}");
                }
            }
        }

        Ok(())
    })
}

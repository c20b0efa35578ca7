//! Shared configuration threaded explicitly through the record store and
//! resolver, rather than read from process-global or current-directory
//! state.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::ast::{AstBackend, CssBackend};
use crate::cache::{Cache, CacheDirs};
use crate::resolver::ModuleResolver;

/// A CSS post-processor plugin, as a named function-pointer slot rather
/// than a reflective override (the graph never inspects plugin internals,
/// only calls them).
pub type PostcssPlugin = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Hook: given a `Ref`'s path, return extra files the watcher should treat
/// as dependencies (e.g. a multi-file bundle's constituent sources). Empty
/// by default.
pub type FileDependenciesHook = Arc<dyn Fn(&std::path::Path) -> Vec<PathBuf> + Send + Sync>;

fn default_file_dependencies(_path: &std::path::Path) -> Vec<PathBuf> {
    Vec::new()
}

/// The plain-data subset of a trace run's configuration: everything that
/// can round-trip through JSON for snapshotting or CLI-to-core handoff.
/// Split out from [`Config`] because `Config` also carries trait-object
/// fields (the cache, resolver, and AST/CSS backends) that can never
/// derive `Serialize`/`Deserialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigOptions {
    /// Root of the source tree; URLs are made relative to this when possible.
    pub source_root: PathBuf,
    /// Prefix prepended to URLs of in-tree files.
    pub root_url: String,
    /// The project's top-level `node_modules`; path-dependency resolutions
    /// under it are cacheable without further qualification.
    pub root_node_modules: PathBuf,
    /// Directory of pre-built, pre-minified vendor assets that bypass
    /// source transformation.
    pub vendor_root: Option<PathBuf>,
    /// Path to the bootstrap runtime file, served verbatim without module
    /// wrapping.
    pub bootstrap_runtime_path: Option<PathBuf>,
    /// Logging verbosity (0 = INFO, 1 = DEBUG, 2+ = TRACE).
    pub verbosity: u8,
    /// Whether the CLI should emit structured JSON logs.
    pub json_logs: bool,
}

impl ConfigOptions {
    #[must_use]
    pub fn new(source_root: PathBuf, root_url: impl Into<String>, root_node_modules: PathBuf) -> Self {
        Self {
            source_root,
            root_url: root_url.into(),
            root_node_modules,
            vendor_root: None,
            bootstrap_runtime_path: None,
            verbosity: 0,
            json_logs: false,
        }
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_json_logs(mut self, json_logs: bool) -> Self {
        self.json_logs = json_logs;
        self
    }
}

/// All state shared by every record in a store and by the resolver.
#[derive(Clone)]
pub struct Config {
    pub options: ConfigOptions,

    pub job_cache: Arc<dyn Cache>,
    pub resolver: Arc<dyn ModuleResolver>,
    pub ast_backend: Arc<dyn AstBackend>,
    pub css_backend: Arc<dyn CssBackend>,

    /// Shims for standard-library-shaped identifiers, e.g. a browser-safe
    /// `path`. Looked up by bare specifier before any filesystem walk.
    pub core_shims: FxHashMap<String, PathBuf>,

    pub postcss_plugins: Vec<PostcssPlugin>,
    pub file_dependencies_hook: FileDependenciesHook,

    pub cache_dirs: CacheDirs,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("options", &self.options)
            .field("core_shims", &self.core_shims)
            .field("postcss_plugins", &self.postcss_plugins.len())
            .field("cache_dirs", &self.cache_dirs)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// A configuration with no shims, no plugins, and an identity
    /// `file_dependencies` hook — the minimal set a record store needs to
    /// operate. Use `Config { core_shims: ..., ..Config::new(...) }` to
    /// customize further.
    #[must_use]
    pub fn new(
        source_root: PathBuf,
        root_url: impl Into<String>,
        root_node_modules: PathBuf,
        job_cache: Arc<dyn Cache>,
        resolver: Arc<dyn ModuleResolver>,
        ast_backend: Arc<dyn AstBackend>,
        css_backend: Arc<dyn CssBackend>,
        cache_dirs: CacheDirs,
    ) -> Self {
        Self {
            options: ConfigOptions::new(source_root, root_url, root_node_modules),
            job_cache,
            resolver,
            ast_backend,
            css_backend,
            core_shims: FxHashMap::default(),
            postcss_plugins: Vec::new(),
            file_dependencies_hook: Arc::new(default_file_dependencies),
            cache_dirs,
        }
    }

    /// True if `path` lives under the configured vendor root, if any.
    #[must_use]
    pub fn is_vendored(&self, path: &std::path::Path) -> bool {
        self.options
            .vendor_root
            .as_ref()
            .is_some_and(|root| path.starts_with(root))
    }

    /// True if `path` lives under the project's root `node_modules`.
    #[must_use]
    pub fn is_under_root_node_modules(&self, path: &std::path::Path) -> bool {
        path.starts_with(&self.options.root_node_modules)
    }

    /// True unless `path` lives under `rootNodeModules` or `vendorRoot`:
    /// the transform-eligibility predicate gating the full compile pipeline
    /// versus a parse-and-regenerate pass.
    #[must_use]
    pub fn should_transform(&self, path: &std::path::Path) -> bool {
        !self.is_under_root_node_modules(path) && !self.is_vendored(path)
    }

    #[must_use]
    pub fn is_bootstrap_runtime(&self, path: &std::path::Path) -> bool {
        self.options
            .bootstrap_runtime_path
            .as_deref()
            .is_some_and(|bootstrap| bootstrap == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{MockAstBackend, MockCssBackend};
    use crate::cache::MockCache;
    use crate::resolver::DefaultResolver;

    fn test_config(source_root: PathBuf) -> Config {
        Config::new(
            source_root.clone(),
            "/static/",
            source_root.join("node_modules"),
            Arc::new(MockCache::new()),
            Arc::new(DefaultResolver::new(source_root, FxHashMap::default())),
            Arc::new(MockAstBackend::default()),
            Arc::new(MockCssBackend::default()),
            CacheDirs::new(std::path::Path::new("/cache"), "deadbeef"),
        )
    }

    #[test]
    fn test_should_transform_excludes_root_node_modules() {
        let cfg = test_config(PathBuf::from("/proj"));
        assert!(!cfg.should_transform(&PathBuf::from("/proj/node_modules/lodash/index.js")));
        assert!(cfg.should_transform(&PathBuf::from("/proj/src/app.js")));
    }

    #[test]
    fn test_should_transform_excludes_vendor_root() {
        let mut cfg = test_config(PathBuf::from("/proj"));
        cfg.options.vendor_root = Some(PathBuf::from("/proj/vendor"));
        assert!(!cfg.should_transform(&PathBuf::from("/proj/vendor/jquery.js")));
    }

    #[test]
    fn test_is_bootstrap_runtime() {
        let mut cfg = test_config(PathBuf::from("/proj"));
        cfg.options.bootstrap_runtime_path = Some(PathBuf::from("/proj/runtime.js"));
        assert!(cfg.is_bootstrap_runtime(&PathBuf::from("/proj/runtime.js")));
        assert!(!cfg.is_bootstrap_runtime(&PathBuf::from("/proj/app.js")));
    }

    #[test]
    fn test_config_options_roundtrip_through_json() {
        let options = ConfigOptions::new(PathBuf::from("/proj"), "/static/", PathBuf::from("/proj/node_modules"))
            .with_verbosity(2)
            .with_json_logs(true);
        let json = serde_json::to_string(&options).unwrap();
        let decoded: ConfigOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.verbosity, 2);
        assert!(decoded.json_logs);
        assert_eq!(decoded.source_root, PathBuf::from("/proj"));
    }
}

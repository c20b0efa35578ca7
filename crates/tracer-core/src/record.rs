//! The record store: a memoized, lazy per-file computation DAG.
//!
//! Each [`Record`] holds one memoization slot per named job. A job is
//! computed at most once per record lifetime; concurrent callers attach to
//! the same in-flight future via `tokio::sync::OnceCell`. Storing the job's
//! `Result` *as the cell's value* (rather than using the cell's own
//! fallible-init path) means a failing job poisons its slot: every caller,
//! including ones that arrive after the failure, observes a clone of the
//! identical error.
//!
//! Purely syntactic derivations over the path alone (`basename`, `ext`,
//! `mimeType`, …) are plain functions rather than memoized jobs — there is
//! no suspension point to share and no I/O to deduplicate.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::OnceCell;

use crate::ast::{Ast, SourceType, TransformOptions};
use crate::config::Config;
use crate::error::Error;

/// Identity of a record: an absolute, normalized path. Equality is path
/// equality; nothing about a `Ref` changes after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ref(PathBuf);

impl Ref {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("/"))
                .join(path)
        };
        Ref(crate::resolver::normalize_path(&absolute))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn dirname(&self) -> PathBuf {
        self.0.parent().map_or_else(|| PathBuf::from("/"), Path::to_path_buf)
    }

    #[must_use]
    pub fn basename(&self) -> String {
        self.0
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn ext(&self) -> String {
        self.0
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

#[must_use]
pub fn is_text_file(ext: &str) -> bool {
    matches!(ext, ".js" | ".css" | ".json")
}

#[must_use]
pub fn mime_type(ext: &str) -> Option<&'static str> {
    Some(match ext {
        ".js" => "application/javascript",
        ".css" => "text/css",
        ".json" | ".map" => "application/json",
        ".html" => "text/html",
        ".txt" => "text/plain",
        ".png" => "image/png",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".gif" => "image/gif",
        ".svg" => "image/svg+xml",
        ".woff" => "font/woff",
        ".woff2" => "font/woff2",
        ".ttf" => "font/ttf",
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub mtime_ms: i64,
    pub len: u64,
}

/// The dependency identifiers found while walking a file's AST (for JS) or
/// its post-processed import/`url()` graph (for CSS).
#[derive(Debug, Clone, Default)]
pub struct Dependencies(pub Vec<String>);

/// Strips a URL-loader suffix: everything from the first `!`, `?`, or `#`.
fn strip_loader_suffix(identifier: &str) -> String {
    let cut = ['!', '?', '#']
        .iter()
        .filter_map(|c| identifier.find(*c))
        .min();
    match cut {
        Some(idx) => identifier[..idx].to_string(),
        None => identifier.to_string(),
    }
}

fn is_path_identifier(identifier: &str) -> bool {
    identifier.starts_with('.') || identifier.chars().next().is_some_and(std::path::is_separator)
}

struct JsPipeline {
    ast: Ast,
    code: String,
    map: Option<String>,
}

struct CssPipeline {
    css: String,
    map: Option<String>,
    dependencies: Vec<String>,
}

/// Per-file lazy evaluation context. Created (and cached) by
/// [`RecordStore::get`]; every job below computes at most once.
pub struct Record {
    r: Ref,
    config: Arc<Config>,
    store: Weak<RecordStore>,

    read_text: OnceCell<Result<Arc<str>, Error>>,
    stat: OnceCell<Result<Stat, Error>>,
    hash_text: OnceCell<Result<u32, Error>>,
    hash: OnceCell<Result<String, Error>>,
    read_cache: OnceCell<Result<Map<String, Value>, Error>>,
    js_pipeline: OnceCell<Result<Arc<JsPipeline>, Error>>,
    css_pipeline: OnceCell<Result<Arc<CssPipeline>, Error>>,
    analyze_dependencies: OnceCell<Result<Arc<Dependencies>, Error>>,
    dependency_identifiers: OnceCell<Result<Arc<Vec<String>>, Error>>,
    resolve_path_dependencies: OnceCell<Result<Arc<FxHashMap<String, PathBuf>>, Error>>,
    resolve_package_dependencies: OnceCell<Result<Arc<FxHashMap<String, PathBuf>>, Error>>,
    resolved_dependencies: OnceCell<Result<Arc<FxHashMap<String, PathBuf>>, Error>>,
    code: OnceCell<Result<Option<Arc<str>>, Error>>,
    module_code: OnceCell<Result<Arc<str>, Error>>,
    module_definition: OnceCell<Result<Option<Arc<str>>, Error>>,
    content: OnceCell<Result<Option<Arc<str>>, Error>>,
    source_map: OnceCell<Result<Option<Arc<str>>, Error>>,

    cache_map: Mutex<Map<String, Value>>,
}

impl Record {
    fn new(r: Ref, config: Arc<Config>, store: Weak<RecordStore>) -> Self {
        Self {
            r,
            config,
            store,
            read_text: OnceCell::new(),
            stat: OnceCell::new(),
            hash_text: OnceCell::new(),
            hash: OnceCell::new(),
            read_cache: OnceCell::new(),
            js_pipeline: OnceCell::new(),
            css_pipeline: OnceCell::new(),
            analyze_dependencies: OnceCell::new(),
            dependency_identifiers: OnceCell::new(),
            resolve_path_dependencies: OnceCell::new(),
            resolve_package_dependencies: OnceCell::new(),
            resolved_dependencies: OnceCell::new(),
            code: OnceCell::new(),
            module_code: OnceCell::new(),
            module_definition: OnceCell::new(),
            content: OnceCell::new(),
            source_map: OnceCell::new(),
            cache_map: Mutex::new(Map::new()),
        }
    }

    #[must_use]
    pub fn r#ref(&self) -> &Ref {
        &self.r
    }

    #[must_use]
    pub fn basename(&self) -> String {
        self.r.basename()
    }

    #[must_use]
    pub fn ext(&self) -> String {
        self.r.ext()
    }

    #[must_use]
    pub fn is_text_file(&self) -> bool {
        is_text_file(&self.r.ext())
    }

    #[must_use]
    pub fn mime_type(&self) -> Option<&'static str> {
        mime_type(&self.r.ext())
    }

    pub async fn read_text(&self) -> Result<Arc<str>, Error> {
        self.read_text
            .get_or_init(|| async {
                let path = self.r.path().to_path_buf();
                tokio::fs::read_to_string(&path)
                    .await
                    .map(Arc::from)
                    .map_err(|e| Error::io(path, &e))
            })
            .await
            .clone()
    }

    pub async fn stat(&self) -> Result<Stat, Error> {
        self.stat
            .get_or_init(|| async {
                let path = self.r.path().to_path_buf();
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| Error::io(path.clone(), &e))?;
                let mtime_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_millis() as i64);
                Ok(Stat {
                    mtime_ms,
                    len: meta.len(),
                })
            })
            .await
            .clone()
    }

    pub async fn mtime(&self) -> Result<i64, Error> {
        Ok(self.stat().await?.mtime_ms)
    }

    pub async fn hash_text(&self) -> Result<u32, Error> {
        self.hash_text
            .get_or_init(|| async {
                let text = self.read_text().await?;
                Ok(tracer_util::hash::fx_hash32_text(&text))
            })
            .await
            .clone()
    }

    /// Content identity used for cache-busting URLs: the text hash for
    /// text files, the mtime otherwise.
    pub async fn hash(&self) -> Result<String, Error> {
        self.hash
            .get_or_init(|| async {
                if self.is_text_file() {
                    Ok(self.hash_text().await?.to_string())
                } else {
                    Ok(self.mtime().await?.to_string())
                }
            })
            .await
            .clone()
    }

    pub async fn hashed_filename(&self) -> Result<String, Error> {
        Ok(format!("{}-{}{}", self.basename(), self.hash().await?, self.ext()))
    }

    pub async fn hashed_name(&self) -> Result<PathBuf, Error> {
        Ok(self.r.dirname().join(self.hashed_filename().await?))
    }

    pub async fn cache_key(&self) -> Result<Vec<String>, Error> {
        let path = self.r.to_string();
        let mtime = self.mtime().await?.to_string();
        if self.is_text_file() {
            Ok(vec![path, mtime, self.hash().await?])
        } else {
            Ok(vec![path, mtime])
        }
    }

    pub async fn read_cache(&self) -> Result<Map<String, Value>, Error> {
        let result = self
            .read_cache
            .get_or_init(|| async {
                let key = self.cache_key().await?;
                let value = self.config.job_cache.get(&key);
                let map = match value {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                Ok(map)
            })
            .await
            .clone()?;

        *self.cache_map.lock().unwrap() = result.clone();
        Ok(result)
    }

    /// Persists the in-memory accumulated cache-map annotations.
    pub async fn write_cache(&self) -> Result<(), Error> {
        let key = self.cache_key().await?;
        let map = self.cache_map.lock().unwrap().clone();
        self.config.job_cache.set(&key, Value::Object(map));
        Ok(())
    }

    fn annotate_cache(&self, field: &str, value: Value) {
        self.cache_map.lock().unwrap().insert(field.to_string(), value);
    }

    /// Makes `path` relative to the source root when possible, prefixes it
    /// with `rootUrl`, and normalizes platform separators to `/`.
    ///
    /// A path outside `source_root` stays absolute, so its own leading `/`
    /// joins with `rootUrl`'s trailing `/` to produce exactly one extra
    /// (doubled) separator at the junction — retained bit-exactly rather
    /// than special-cased away.
    fn to_url(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.config.options.source_root).unwrap_or(path);
        let is_absolute = relative.is_absolute();
        let joined = relative
            .components()
            .filter(|c| !matches!(c, std::path::Component::RootDir))
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let slashed = if is_absolute { format!("/{joined}") } else { joined };
        format!("{}{}", self.config.options.root_url, slashed)
    }

    pub async fn url(&self) -> Result<String, Error> {
        let path = if self.is_text_file() {
            self.hashed_name().await?
        } else {
            self.r.path().to_path_buf()
        };
        Ok(self.to_url(&path))
    }

    pub async fn source_url(&self) -> Result<String, Error> {
        Ok(format!("file://{}?{}", self.r, self.hash().await?))
    }

    pub async fn source_map_annotation(&self) -> Result<Option<String>, Error> {
        let ext = self.ext();
        if !is_text_file(&ext) {
            return Ok(None);
        }
        let Some(map) = self.source_map().await? else {
            return Ok(None);
        };
        use base64::Engine as _;
        let b64 = base64::engine::general_purpose::STANDARD.encode(map.as_bytes());
        Ok(Some(match ext.as_str() {
            ".css" => format!("\n/*# sourceMappingURL=data:application/json;charset=utf-8;base64,{b64} */"),
            _ => format!("\n//# sourceMappingURL=data:application/json;charset=utf-8;base64,{b64}"),
        }))
    }

    async fn js_pipeline(&self) -> Result<Arc<JsPipeline>, Error> {
        self.js_pipeline
            .get_or_init(|| async {
                let text = self.read_text().await?;
                let opts = TransformOptions {
                    filename: Some(self.r.to_string()),
                    source_maps: true,
                    minified: self.config.is_vendored(self.r.path()),
                    ..Default::default()
                };
                if self.config.should_transform(self.r.path()) {
                    let result = self.config.ast_backend.transform(&text, &opts)?;
                    Ok(Arc::new(JsPipeline {
                        ast: result.ast,
                        code: result.code,
                        map: result.map,
                    }))
                } else {
                    let ast = self.config.ast_backend.parse(&text, SourceType::Module)?;
                    let generated = self.config.ast_backend.generate(&ast, &opts, &text)?;
                    Ok(Arc::new(JsPipeline {
                        ast,
                        code: generated.code,
                        map: generated.map,
                    }))
                }
            })
            .await
            .clone()
    }

    async fn css_pipeline(&self) -> Result<Arc<CssPipeline>, Error> {
        self.css_pipeline
            .get_or_init(|| async {
                let text = self.read_text().await?;
                let minified = self.config.is_vendored(self.r.path());
                let result = self
                    .config
                    .css_backend
                    .process(&text, &self.config.postcss_plugins, minified)?;
                Ok(Arc::new(CssPipeline {
                    css: result.css,
                    map: result.map,
                    dependencies: result.dependencies,
                }))
            })
            .await
            .clone()
    }

    /// `.js` only: the AST used by downstream dependency analysis and
    /// codegen.
    pub async fn ast(&self) -> Result<Arc<Ast>, Error> {
        if self.ext() != ".js" {
            return Err(Error::UnknownExtension {
                path: self.r.path().to_path_buf(),
                ext: self.ext(),
            });
        }
        Ok(Arc::new(self.js_pipeline().await?.ast.clone()))
    }

    pub async fn analyze_dependencies(&self) -> Result<Arc<Dependencies>, Error> {
        self.analyze_dependencies
            .get_or_init(|| async {
                match self.ext().as_str() {
                    ".css" => Ok(Arc::new(Dependencies(
                        self.css_pipeline().await?.dependencies.clone(),
                    ))),
                    ".js" => Ok(Arc::new(Dependencies(
                        self.ast().await?.dependency_identifiers.clone(),
                    ))),
                    _ => Ok(Arc::new(Dependencies::default())),
                }
            })
            .await
            .clone()
    }

    pub async fn dependency_identifiers(&self) -> Result<Arc<Vec<String>>, Error> {
        let result = self
            .dependency_identifiers
            .get_or_init(|| async {
                let stripped: Vec<String> = self
                    .analyze_dependencies()
                    .await?
                    .0
                    .iter()
                    .map(|id| strip_loader_suffix(id))
                    .collect();
                Ok(Arc::new(stripped))
            })
            .await
            .clone()?;
        self.annotate_cache("dependencyIdentifiers", serde_json::to_value(&*result).unwrap_or(Value::Null));
        Ok(result)
    }

    pub async fn path_dependency_identifiers(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .dependency_identifiers()
            .await?
            .iter()
            .filter(|id| is_path_identifier(id))
            .cloned()
            .collect())
    }

    pub async fn package_dependency_identifiers(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .dependency_identifiers()
            .await?
            .iter()
            .filter(|id| !is_path_identifier(id))
            .cloned()
            .collect())
    }

    /// True iff this record's path-dependency resolutions are worth
    /// persisting to the durable cache: only for files already inside the
    /// project's root `node_modules`, where relative imports are stable.
    fn should_cache_resolved_path_dependencies(&self) -> bool {
        self.config.is_under_root_node_modules(self.r.path())
    }

    pub fn resolve(&self, identifier: &str) -> Result<PathBuf, Error> {
        self.config.resolver.resolve(identifier, &self.r.dirname())
    }

    pub async fn resolve_path_dependencies(&self) -> Result<Arc<FxHashMap<String, PathBuf>>, Error> {
        let result = self
            .resolve_path_dependencies
            .get_or_init(|| async {
                let identifiers = self.path_dependency_identifiers().await?;
                let mut map = FxHashMap::default();
                for id in identifiers {
                    let resolved = self.resolve(&id)?;
                    map.insert(id, resolved);
                }
                Ok(Arc::new(map))
            })
            .await
            .clone()?;

        if self.should_cache_resolved_path_dependencies() {
            let as_strings: FxHashMap<&str, String> = result
                .iter()
                .map(|(k, v)| (k.as_str(), v.display().to_string()))
                .collect();
            self.annotate_cache(
                "resolvePathDependencies",
                serde_json::to_value(&as_strings).unwrap_or(Value::Null),
            );
        }
        Ok(result)
    }

    pub async fn resolve_package_dependencies(&self) -> Result<Arc<FxHashMap<String, PathBuf>>, Error> {
        let result = self
            .resolve_package_dependencies
            .get_or_init(|| async {
                let identifiers = self.package_dependency_identifiers().await?;
                let mut map = FxHashMap::default();
                for id in identifiers {
                    let resolved = self.resolve(&id)?;
                    map.insert(id, resolved);
                }
                Ok(Arc::new(map))
            })
            .await
            .clone()?;

        let as_strings: FxHashMap<&str, String> = result
            .iter()
            .map(|(k, v)| (k.as_str(), v.display().to_string()))
            .collect();
        self.annotate_cache(
            "resolvePackageDependencies",
            serde_json::to_value(&as_strings).unwrap_or(Value::Null),
        );
        Ok(result)
    }

    /// Union of path and package dependency resolutions, path entries
    /// overriding package entries on identifier collision.
    pub async fn resolved_dependencies(&self) -> Result<Arc<FxHashMap<String, PathBuf>>, Error> {
        self.resolved_dependencies
            .get_or_init(|| async {
                let packages = self.resolve_package_dependencies().await?;
                let paths = self.resolve_path_dependencies().await?;
                let mut merged = (*packages).clone();
                merged.extend(paths.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(Arc::new(merged))
            })
            .await
            .clone()
    }

    /// Textual output to serve: CSS's transformed text, the bootstrap
    /// runtime's raw text, JS's generated code, JSON's raw text, or `None`
    /// for non-text files.
    pub async fn code(&self) -> Result<Option<Arc<str>>, Error> {
        let result = self
            .code
            .get_or_init(|| async {
                let code = match self.ext().as_str() {
                    _ if self.config.is_bootstrap_runtime(self.r.path()) => {
                        Some(self.read_text().await?)
                    }
                    ".css" => Some(Arc::from(self.css_pipeline().await?.css.as_str())),
                    ".js" => Some(Arc::from(self.js_pipeline().await?.code.as_str())),
                    ".json" => Some(self.read_text().await?),
                    _ => None,
                };
                Ok(code)
            })
            .await
            .clone()?;

        if let Some(ref code) = result {
            self.annotate_cache("code", Value::String(code.to_string()));
        }
        Ok(result)
    }

    pub async fn module_contents(&self) -> Result<Arc<str>, Error> {
        match self.ext().as_str() {
            ".js" | ".json" => Ok(self.code().await?.unwrap_or_else(|| Arc::from(""))),
            _ => Ok(Arc::from(
                serde_json::to_string(&self.url().await?).unwrap_or_default().as_str(),
            )),
        }
    }

    #[must_use]
    pub fn should_shim_module_definition(&self) -> bool {
        self.ext() != ".js"
    }

    pub async fn module_code(&self) -> Result<Arc<str>, Error> {
        self.module_code
            .get_or_init(|| async {
                let contents = self.module_contents().await?;
                if self.should_shim_module_definition() {
                    Ok(Arc::from(format!(
                        "Object.defineProperty(exports, \"__esModule\", {{\n  value: true\n}});\nexports[\"default\"] = {contents};\nif (module.hot) {{\n  module.hot.accept();\n}}"
                    ).as_str()))
                } else {
                    Ok(contents)
                }
            })
            .await
            .clone()
    }

    async fn dependency_urls(&self) -> Result<FxHashMap<String, String>, Error> {
        let Some(store) = self.store.upgrade() else {
            return Ok(FxHashMap::default());
        };
        let resolved = self.resolved_dependencies().await?;
        let mut urls = FxHashMap::default();
        for (identifier, path) in resolved.iter() {
            let dep_record = store.get(&Ref::new(path));
            urls.insert(identifier.clone(), dep_record.url().await?);
        }
        Ok(urls)
    }

    /// `null` for the bootstrap runtime; otherwise the fixed wire envelope
    /// the downstream loader parses directly. Whitespace and quoting are
    /// load-bearing.
    pub async fn module_definition(&self) -> Result<Option<Arc<str>>, Error> {
        let result = self
            .module_definition
            .get_or_init(|| async {
                if self.config.is_bootstrap_runtime(self.r.path()) {
                    return Ok(None);
                }
                let name = self.url().await?;
                let deps = self.dependency_urls().await?;
                let hash = self.hash().await?;
                let module_code = self.module_code().await?;
                let deps_json = serde_json::to_string(&deps).unwrap_or_else(|_| "{}".to_string());
                Ok(Some(Arc::from(format!(
                    "__modules.defineModule({{name: \"{name}\", deps: {deps_json}, hash: \"{hash}\", factory: function(module, exports, require, process, global) {{\n{module_code}\n}}}});"
                ).as_str())))
            })
            .await
            .clone()?;
        Ok(result)
    }

    /// Response body served for this record.
    pub async fn content(&self) -> Result<Option<Arc<str>>, Error> {
        self.content
            .get_or_init(|| async {
                let ext = self.ext();
                if self.config.is_bootstrap_runtime(self.r.path()) || ext == ".css" {
                    return self.code().await;
                }
                if ext == ".js" || ext == ".json" {
                    return self.module_definition().await;
                }
                if !self.is_text_file() {
                    return Ok(None);
                }
                // Unreachable with the current text-extension set ({js,
                // css, json}); kept as the original chain's fallback arm.
                Err(Error::UnknownExtension {
                    path: self.r.path().to_path_buf(),
                    ext,
                })
            })
            .await
            .clone()
    }

    pub async fn source_map(&self) -> Result<Option<Arc<str>>, Error> {
        let result = self
            .source_map
            .get_or_init(|| async {
                match self.ext().as_str() {
                    ".css" => Ok(self
                        .css_pipeline()
                        .await?
                        .map
                        .as_deref()
                        .map(Arc::from)),
                    ".js" => {
                        let pipeline = self.js_pipeline().await?;
                        match &pipeline.map {
                            Some(map) => Ok(Some(Arc::from(offset_source_map_lines(map)?.as_str()))),
                            None => Ok(None),
                        }
                    }
                    ".json" => Ok(None),
                    _ if !self.is_text_file() => Ok(None),
                    ext => Err(Error::UnknownExtension {
                        path: self.r.path().to_path_buf(),
                        ext: ext.to_string(),
                    }),
                }
            })
            .await
            .clone()?;

        if let Some(ref map) = result {
            self.annotate_cache("sourceMap", Value::String(map.to_string()));
        }
        Ok(result)
    }

    /// Hook point for tools compiling multi-file bundles; empty by
    /// default so the watcher has nothing extra to invalidate.
    pub fn file_dependencies(&self) -> Vec<PathBuf> {
        (self.config.file_dependencies_hook)(self.r.path())
    }

    /// Forces every externally-visible job concurrently, then persists the
    /// accumulated cache-map annotations keyed by (path, mtime, content hash).
    pub async fn ready(&self) -> Result<(), Error> {
        let (hash, content, module_definition, url, annotation, hashed_filename) = tokio::try_join!(
            self.hash(),
            self.content(),
            self.module_definition(),
            self.url(),
            self.source_map_annotation(),
            self.hashed_filename(),
        )?;
        let _ = (hash, content, module_definition, url, annotation, hashed_filename);
        let _ = self.is_text_file();
        let _ = self.mime_type();
        let _ = self.file_dependencies();
        self.write_cache().await
    }
}

/// Prepends an empty VLQ mapping line-group to `mappings`, which shifts
/// every already-encoded line down by exactly one generated line — the
/// module envelope's leading `__modules.defineModule(...)` line.
fn offset_source_map_lines(map_json: &str) -> Result<String, Error> {
    let mut value: Value = serde_json::from_str(map_json)
        .map_err(|e| Error::other(format!("malformed source map: {e}")))?;
    if let Some(mappings) = value.get_mut("mappings") {
        if let Value::String(s) = mappings {
            *s = format!(";{s}");
        }
    }
    serde_json::to_string(&value).map_err(|e| Error::other(format!("malformed source map: {e}")))
}

/// Owns every [`Record`] for a build, keyed by [`Ref`].
pub struct RecordStore {
    config: Arc<Config>,
    records: std::sync::RwLock<FxHashMap<Ref, Arc<Record>>>,
}

impl RecordStore {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            records: std::sync::RwLock::new(FxHashMap::default()),
        })
    }

    /// Returns the existing record for `r`, creating one on first access.
    pub fn get(self: &Arc<Self>, r: &Ref) -> Arc<Record> {
        if let Some(existing) = self.records.read().unwrap().get(r) {
            return existing.clone();
        }
        self.records
            .write()
            .unwrap()
            .entry(r.clone())
            .or_insert_with(|| Arc::new(Record::new(r.clone(), self.config.clone(), Arc::downgrade(self))))
            .clone()
    }

    #[must_use]
    pub fn is_defined(&self, r: &Ref) -> bool {
        self.records.read().unwrap().contains_key(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{MockAstBackend, MockCssBackend};
    use crate::cache::{CacheDirs, MockCache};
    use crate::resolver::DefaultResolver;
    use tempfile::tempdir;

    fn config(source_root: PathBuf) -> Arc<Config> {
        Arc::new(Config::new(
            source_root.clone(),
            "/static/",
            source_root.join("node_modules"),
            Arc::new(MockCache::new()),
            Arc::new(DefaultResolver::new(source_root, FxHashMap::default())),
            Arc::new(MockAstBackend::default()),
            Arc::new(MockCssBackend::default()),
            CacheDirs::new(Path::new("/cache"), "deadbeef"),
        ))
    }

    #[test]
    fn test_strip_loader_suffix() {
        assert_eq!(strip_loader_suffix("foo!bar?x#y"), "foo");
        assert_eq!(strip_loader_suffix("plain"), "plain");
        assert_eq!(strip_loader_suffix("./a#frag"), "./a");
    }

    #[test]
    fn test_hashed_filename_format() {
        assert_eq!(format!("{}-{}{}", "app", "12345", ".js"), "app-12345.js");
    }

    #[tokio::test]
    async fn test_cache_key_length_matches_is_text_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "1").unwrap();
        std::fs::write(dir.path().join("a.png"), "1").unwrap();
        let cfg = config(dir.path().to_path_buf());
        let store = RecordStore::new(cfg);

        let text_record = store.get(&Ref::new(dir.path().join("a.js")));
        assert_eq!(text_record.cache_key().await.unwrap().len(), 3);

        let binary_record = store.get(&Ref::new(dir.path().join("a.png")));
        assert_eq!(binary_record.cache_key().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_url_ends_with_hashed_name_for_text_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), "const x = 1;").unwrap();
        let cfg = config(dir.path().to_path_buf());
        let store = RecordStore::new(cfg);
        let record = store.get(&Ref::new(dir.path().join("app.js")));

        let url = record.url().await.unwrap();
        let expected_suffix = format!("{}-{}{}", "app", record.hash().await.unwrap(), ".js");
        assert!(url.ends_with(&expected_suffix), "{url} should end with {expected_suffix}");
    }

    #[tokio::test]
    async fn test_read_text_computed_once() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.js"), "1").unwrap();
        let cfg = config(dir.path().to_path_buf());
        let store = RecordStore::new(cfg);
        let record = store.get(&Ref::new(dir.path().join("a.js")));

        let first = record.read_text().await.unwrap();
        std::fs::write(dir.path().join("a.js"), "2").unwrap();
        let second = record.read_text().await.unwrap();
        assert_eq!(first, second, "second read must be served from memoized slot");
    }

    #[tokio::test]
    async fn test_failing_job_poisons_slot_with_identical_error() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path().to_path_buf());
        let store = RecordStore::new(cfg);
        let record = store.get(&Ref::new(dir.path().join("missing.js")));

        let first = record.read_text().await.unwrap_err();
        let second = record.read_text().await.unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
    }

    #[tokio::test]
    async fn test_dependency_identifiers_stripped_and_split() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/bar")).unwrap();
        std::fs::write(dir.path().join("node_modules/bar/index.js"), "").unwrap();
        std::fs::write(dir.path().join("foo.js"), "").unwrap();
        std::fs::write(dir.path().join("woz.js"), "").unwrap();
        std::fs::write(dir.path().join("a.js"), "ignored").unwrap();

        let mut cfg = Config::new(
            dir.path().to_path_buf(),
            "/static/",
            dir.path().join("node_modules"),
            Arc::new(MockCache::new()),
            Arc::new(DefaultResolver::new(dir.path().to_path_buf(), FxHashMap::default())),
            Arc::new(MockAstBackend {
                dependency_identifiers: vec!["./foo!loader".into(), "bar?x".into(), "woz.js#frag".into()],
                fixed_map: None,
            }),
            Arc::new(MockCssBackend::default()),
            CacheDirs::new(Path::new("/cache"), "deadbeef"),
        );
        cfg.options.root_node_modules = dir.path().join("node_modules");
        let store = RecordStore::new(Arc::new(cfg));
        let record = store.get(&Ref::new(dir.path().join("a.js")));

        let ids = record.dependency_identifiers().await.unwrap();
        assert_eq!(&**ids, &vec!["./foo".to_string(), "bar".to_string(), "woz.js".to_string()]);

        let path_ids = record.path_dependency_identifiers().await.unwrap();
        assert_eq!(path_ids, vec!["./foo".to_string()]);

        let package_ids = record.package_dependency_identifiers().await.unwrap();
        assert_eq!(package_ids, vec!["bar".to_string(), "woz.js".to_string()]);
    }

    #[tokio::test]
    async fn test_bootstrap_runtime_has_null_module_definition_and_raw_content() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("runtime.js"), "/* runtime */").unwrap();
        let mut cfg = config(dir.path().to_path_buf());
        Arc::get_mut(&mut cfg).unwrap().options.bootstrap_runtime_path = Some(dir.path().join("runtime.js"));
        let store = RecordStore::new(cfg);
        let record = store.get(&Ref::new(dir.path().join("runtime.js")));

        assert!(record.module_definition().await.unwrap().is_none());
        assert_eq!(record.content().await.unwrap().unwrap().as_ref(), "/* runtime */");
    }

    #[tokio::test]
    async fn test_binary_file_has_null_code_content_source_map() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.png"), [0u8, 1, 2]).unwrap();
        let cfg = config(dir.path().to_path_buf());
        let store = RecordStore::new(cfg);
        let record = store.get(&Ref::new(dir.path().join("a.png")));

        assert!(record.code().await.unwrap().is_none());
        assert!(record.content().await.unwrap().is_none());
        assert!(record.source_map().await.unwrap().is_none());
        assert!(record.module_definition().await.unwrap().unwrap().contains("exports[\"default\"]"));
    }

    #[tokio::test]
    async fn test_url_doubles_separator_for_path_outside_source_root() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("a.png"), [0u8, 1, 2]).unwrap();
        let cfg = config(dir.path().to_path_buf());
        let store = RecordStore::new(cfg);
        let record = store.get(&Ref::new(outside.path().join("a.png")));

        let url = record.url().await.unwrap();
        let rest = url.strip_prefix("/static/").expect("url should start with rootUrl");
        assert!(rest.starts_with('/'), "path outside source_root should keep one extra leading slash: {url}");
        assert!(!rest.starts_with("//"), "should not triple up the separator: {url}");
        assert!(url.ends_with("/a.png"));
    }

    #[tokio::test]
    async fn test_source_map_annotation_css_base64() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.css"), "body{}").unwrap();
        let mut cfg = Config::new(
            dir.path().to_path_buf(),
            "/static/",
            dir.path().join("node_modules"),
            Arc::new(MockCache::new()),
            Arc::new(DefaultResolver::new(dir.path().to_path_buf(), FxHashMap::default())),
            Arc::new(MockAstBackend::default()),
            Arc::new(MockCssBackend {
                dependencies: vec![],
                fixed_map: Some("test source map".to_string()),
            }),
            CacheDirs::new(Path::new("/cache"), "deadbeef"),
        );
        cfg.options.root_node_modules = dir.path().join("node_modules");
        let store = RecordStore::new(Arc::new(cfg));
        let record = store.get(&Ref::new(dir.path().join("a.css")));

        let annotation = record.source_map_annotation().await.unwrap().unwrap();
        assert_eq!(
            annotation,
            "\n/*# sourceMappingURL=data:application/json;charset=utf-8;base64,dGVzdCBzb3VyY2UgbWFw */"
        );
    }
}

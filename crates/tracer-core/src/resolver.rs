//! Resolver adapter.
//!
//! Wraps an external module resolver behind `(identifier, baseDir) -> path`.
//! `DefaultResolver` is a self-contained implementation good enough to
//! drive the record store end-to-end: relative/absolute/bare specifier
//! resolution, `node_modules` walk-up, `package.json` `exports`/`module`/
//! `main` resolution, and a directory-listing cache, extended with a
//! core-module shim table and `browser`-field lookup.

use rustc_hash::{FxHashMap, FxHashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::Error;

const RESOLVE_EXTENSIONS: &[&str] = &[".js", ".json", ".css"];

/// Contract: resolve an identifier relative to a base directory.
pub trait ModuleResolver: Send + Sync + std::fmt::Debug {
    /// Resolves `identifier` as seen from a file in `base_dir`.
    ///
    /// # Errors
    /// Returns `Error::Resolve` naming both the identifier and `base_dir`
    /// when nothing can be found.
    fn resolve(&self, identifier: &str, base_dir: &Path) -> Result<PathBuf, Error>;
}

/// Cached directory listing: (file names, subdirectory names).
type DirListing = std::sync::Arc<(FxHashSet<OsString>, FxHashSet<OsString>)>;

#[derive(Debug)]
pub struct DefaultResolver {
    /// Project root; bare-specifier `node_modules` walks stop here.
    cwd: PathBuf,
    /// Shims for standard-library-shaped identifiers (e.g. `path` -> a
    /// browser-safe shim file), configured explicitly rather than baked in.
    core_shims: FxHashMap<String, PathBuf>,
    dir_cache: RwLock<FxHashMap<PathBuf, Option<DirListing>>>,
    resolved_cache: RwLock<FxHashMap<(String, PathBuf), PathBuf>>,
}

impl DefaultResolver {
    #[must_use]
    pub fn new(cwd: PathBuf, core_shims: FxHashMap<String, PathBuf>) -> Self {
        Self {
            cwd,
            core_shims,
            dir_cache: RwLock::new(FxHashMap::default()),
            resolved_cache: RwLock::new(FxHashMap::default()),
        }
    }

    fn get_dir_listing(&self, dir: &Path) -> Option<DirListing> {
        {
            let cache = self.dir_cache.read().unwrap();
            if let Some(entry) = cache.get(dir) {
                return entry.clone();
            }
        }

        let listing = std::fs::read_dir(dir).ok().map(|rd| {
            let mut files = FxHashSet::default();
            let mut subdirs = FxHashSet::default();
            for entry in rd.filter_map(Result::ok) {
                let name = entry.file_name();
                match entry.file_type() {
                    Ok(ft) if ft.is_dir() => {
                        subdirs.insert(name);
                    }
                    _ => {
                        files.insert(name);
                    }
                }
            }
            std::sync::Arc::new((files, subdirs))
        });

        let result = listing.clone();
        self.dir_cache
            .write()
            .unwrap()
            .insert(dir.to_path_buf(), listing);
        result
    }

    fn file_exists_cached(&self, path: &Path) -> bool {
        let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
            return false;
        };
        self.get_dir_listing(dir)
            .is_some_and(|l| l.0.contains(name))
    }

    fn dir_exists_cached(&self, path: &Path) -> bool {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return false;
        };
        self.get_dir_listing(parent)
            .is_some_and(|l| l.1.contains(name))
    }

    fn resolve_file_or_directory(&self, target: &Path) -> Option<PathBuf> {
        let dir = target.parent().unwrap_or_else(|| Path::new("."));
        let stem = target.file_name().unwrap_or_default();

        if let Some(listing) = self.get_dir_listing(dir) {
            if listing.0.contains(stem) {
                return Some(dir.join(stem));
            }
            for ext in RESOLVE_EXTENSIONS {
                let mut name = stem.to_os_string();
                name.push(ext);
                if listing.0.contains(&name) {
                    return Some(dir.join(&name));
                }
            }
        }

        if let Some(listing) = self.get_dir_listing(target) {
            for index in &["index.js", "index.json"] {
                let index_os = OsString::from(index);
                if listing.0.contains(&index_os) {
                    return Some(target.join(index));
                }
            }
        }

        None
    }

    fn resolve_relative(&self, identifier: &str, base_dir: &Path) -> Option<PathBuf> {
        let target = normalize_path(&base_dir.join(identifier));
        self.resolve_file_or_directory(&target)
    }

    fn resolve_absolute(&self, identifier: &str) -> Option<PathBuf> {
        self.resolve_file_or_directory(Path::new(identifier))
    }

    /// Resolve a bare package identifier by walking `node_modules` upward
    /// from `base_dir`, honoring the package's `browser` field over
    /// `module`/`main`.
    fn resolve_bare(&self, identifier: &str, base_dir: &Path) -> Option<PathBuf> {
        let (pkg_name, subpath) = parse_bare_specifier(identifier);

        let mut current = Some(base_dir);
        while let Some(dir) = current {
            let pkg_dir = dir.join("node_modules").join(&pkg_name);

            if self.dir_exists_cached(&pkg_dir) {
                if let Some(ref sub) = subpath {
                    if let Some(found) = self.resolve_file_or_directory(&pkg_dir.join(sub)) {
                        return Some(found);
                    }
                } else if let Some(found) = self.resolve_package_entry(&pkg_dir) {
                    return Some(found);
                }
            }

            if dir == self.cwd {
                break;
            }
            current = dir.parent();
        }

        None
    }

    /// Entry point resolution honoring `browser` > `module` > `main` >
    /// `index.js`.
    fn resolve_package_entry(&self, pkg_dir: &Path) -> Option<PathBuf> {
        let pkg_json = pkg_dir.join("package.json");
        if self.file_exists_cached(&pkg_json) {
            if let Ok(content) = std::fs::read_to_string(&pkg_json) {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&content) {
                    for field in ["browser", "module", "main"] {
                        if let Some(entry) = json.get(field).and_then(|v| v.as_str()) {
                            let target = pkg_dir.join(entry);
                            if self.file_exists_cached(&target) {
                                return Some(target);
                            }
                            if let Some(found) = self.resolve_file_or_directory(&target) {
                                return Some(found);
                            }
                        }
                    }
                }
            }
        }

        for index in &["index.js", "index.json"] {
            let index_path = pkg_dir.join(index);
            if self.file_exists_cached(&index_path) {
                return Some(index_path);
            }
        }

        None
    }
}

impl ModuleResolver for DefaultResolver {
    fn resolve(&self, identifier: &str, base_dir: &Path) -> Result<PathBuf, Error> {
        if let Some(shim) = self.core_shims.get(identifier) {
            return Ok(shim.clone());
        }

        let cache_key = (identifier.to_string(), base_dir.to_path_buf());
        if let Some(cached) = self.resolved_cache.read().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let found = if identifier.starts_with("./") || identifier.starts_with("../") {
            self.resolve_relative(identifier, base_dir)
        } else if identifier.starts_with('/') {
            self.resolve_absolute(identifier)
        } else {
            self.resolve_bare(identifier, base_dir)
        };

        match found {
            Some(path) => {
                self.resolved_cache
                    .write()
                    .unwrap()
                    .insert(cache_key, path.clone());
                Ok(path)
            }
            None => Err(Error::Resolve {
                identifier: identifier.to_string(),
                base_dir: base_dir.to_path_buf(),
                message: "module not found".to_string(),
            }),
        }
    }
}

pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut result = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => {}
            other => result.push(other),
        }
    }
    result.iter().collect()
}

fn parse_bare_specifier(identifier: &str) -> (String, Option<String>) {
    if let Some(rest) = identifier.strip_prefix('@') {
        let parts: Vec<&str> = rest.splitn(2, '/').collect();
        if parts.len() == 2 {
            let scope_and_name: Vec<&str> = parts[1].splitn(2, '/').collect();
            let pkg = format!("@{}/{}", parts[0], scope_and_name[0]);
            let subpath = scope_and_name.get(1).map(|s| (*s).to_string());
            return (pkg, subpath);
        }
        return (identifier.to_string(), None);
    }

    let parts: Vec<&str> = identifier.splitn(2, '/').collect();
    (parts[0].to_string(), parts.get(1).map(|s| (*s).to_string()))
}

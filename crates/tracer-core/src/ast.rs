//! Parser/codegen and CSS post-processor adapters.
//!
//! These wrap an external JS/CSS toolchain; the default implementations
//! here are a self-contained stand-in good enough to drive the record
//! store (regex-based dependency scanning via `regex-lite`, passthrough
//! codegen), with `Mock*` variants for deterministic test fixtures.

use regex_lite::Regex;
use std::sync::OnceLock;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Module,
    Script,
}

#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub filename: Option<String>,
    pub source_map_target: Option<String>,
    pub source_file_name: Option<String>,
    pub minified: bool,
    pub source_maps: bool,
}

/// Opaque parsed representation. Not meant to be pattern-matched on by
/// callers outside this module; `dependency_identifiers` is the only part
/// the record store reads directly.
#[derive(Debug, Clone)]
pub struct Ast {
    pub source: String,
    pub dependency_identifiers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CodegenResult {
    pub code: String,
    pub map: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransformResult {
    pub code: String,
    pub map: Option<String>,
    pub ast: Ast,
}

pub trait AstBackend: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// Returns `Error::Parse` on a syntax error, with location when known.
    fn parse(&self, text: &str, source_type: SourceType) -> Result<Ast, Error>;

    /// # Errors
    /// Returns `Error::Parse` on a syntax error.
    fn transform(&self, text: &str, opts: &TransformOptions) -> Result<TransformResult, Error>;

    /// # Errors
    /// Returns `Error::Parse` on a syntax error.
    fn generate(
        &self,
        ast: &Ast,
        opts: &TransformOptions,
        original_text: &str,
    ) -> Result<CodegenResult, Error>;
}

fn import_export_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?:import\s+(?:[^'"]*\s+from\s+)?|export\s+\*\s+from\s+|export\s+\{[^}]*\}\s+from\s+|require\()\s*['"]([^'"]+)['"]"#,
        )
        .expect("static regex is valid")
    })
}

/// Walks static `import`, `export ... from`, and `require("...")` forms,
/// collecting their string-literal source arguments in source order.
#[must_use]
pub fn extract_js_dependencies(text: &str) -> Vec<String> {
    import_export_regex()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Regex-backed stand-in for a real JS parser/generator: good enough to
/// extract static dependency identifiers and echo code back unchanged.
#[derive(Debug, Default)]
pub struct RegexAstBackend;

impl AstBackend for RegexAstBackend {
    fn parse(&self, text: &str, _source_type: SourceType) -> Result<Ast, Error> {
        Ok(Ast {
            source: text.to_string(),
            dependency_identifiers: extract_js_dependencies(text),
        })
    }

    fn transform(&self, text: &str, opts: &TransformOptions) -> Result<TransformResult, Error> {
        let ast = self.parse(text, SourceType::Module)?;
        Ok(TransformResult {
            code: text.to_string(),
            map: opts.source_maps.then(|| synthetic_map(text)),
            ast,
        })
    }

    fn generate(
        &self,
        ast: &Ast,
        opts: &TransformOptions,
        _original_text: &str,
    ) -> Result<CodegenResult, Error> {
        Ok(CodegenResult {
            code: ast.source.clone(),
            map: opts.source_maps.then(|| synthetic_map(&ast.source)),
        })
    }
}

fn synthetic_map(source: &str) -> String {
    serde_json::json!({
        "version": 3,
        "sources": ["input"],
        "sourcesContent": [source],
        "mappings": "",
    })
    .to_string()
}

/// Deterministic backend for tests: skips regex scanning in favor of a
/// pre-seeded dependency list, and an optional fixed source map string.
#[derive(Debug, Default)]
pub struct MockAstBackend {
    pub dependency_identifiers: Vec<String>,
    pub fixed_map: Option<String>,
}

impl AstBackend for MockAstBackend {
    fn parse(&self, text: &str, _source_type: SourceType) -> Result<Ast, Error> {
        Ok(Ast {
            source: text.to_string(),
            dependency_identifiers: self.dependency_identifiers.clone(),
        })
    }

    fn transform(&self, text: &str, opts: &TransformOptions) -> Result<TransformResult, Error> {
        let ast = self.parse(text, SourceType::Module)?;
        Ok(TransformResult {
            code: text.to_string(),
            map: opts.source_maps.then(|| self.map_or_default()),
            ast,
        })
    }

    fn generate(
        &self,
        ast: &Ast,
        opts: &TransformOptions,
        _original_text: &str,
    ) -> Result<CodegenResult, Error> {
        Ok(CodegenResult {
            code: ast.source.clone(),
            map: opts.source_maps.then(|| self.map_or_default()),
        })
    }
}

impl MockAstBackend {
    fn map_or_default(&self) -> String {
        self.fixed_map.clone().unwrap_or_else(|| "{}".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CssResult {
    pub css: String,
    pub map: Option<String>,
    pub dependencies: Vec<String>,
}

/// Contract for the CSS post-processing step: collects `@import`/`url()`
/// dependencies, strips `@import` rules, and applies the configured plugin
/// list to the remaining text.
pub trait CssBackend: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// Returns `Error::Parse` on malformed CSS.
    fn process(
        &self,
        text: &str,
        plugins: &[crate::config::PostcssPlugin],
        minified: bool,
    ) -> Result<CssResult, Error>;
}

fn css_import_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"@import\s+(?:url\()?['"]?([^'")\s;]+)['"]?\)?[^;]*;"#)
            .expect("static regex is valid")
    })
}

fn css_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).expect("static regex is valid"))
}

#[derive(Debug, Default)]
pub struct DefaultCssBackend;

impl CssBackend for DefaultCssBackend {
    fn process(
        &self,
        text: &str,
        plugins: &[crate::config::PostcssPlugin],
        _minified: bool,
    ) -> Result<CssResult, Error> {
        let mut dependencies: Vec<String> = css_import_regex()
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        dependencies.extend(
            css_url_regex()
                .captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
                .filter(|url| !url.starts_with("data:")),
        );

        let mut css = css_import_regex().replace_all(text, "").to_string();
        for plugin in plugins {
            css = plugin(&css);
        }

        Ok(CssResult {
            css,
            map: None,
            dependencies,
        })
    }
}

/// Deterministic backend for tests: returns a pre-seeded dependency list
/// and a fixed map, doing no text scanning.
#[derive(Debug, Default)]
pub struct MockCssBackend {
    pub dependencies: Vec<String>,
    pub fixed_map: Option<String>,
}

impl CssBackend for MockCssBackend {
    fn process(
        &self,
        text: &str,
        _plugins: &[crate::config::PostcssPlugin],
        _minified: bool,
    ) -> Result<CssResult, Error> {
        Ok(CssResult {
            css: text.to_string(),
            map: self.fixed_map.clone(),
            dependencies: self.dependencies.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_js_dependencies_import_require_export_from() {
        let deps =
            extract_js_dependencies(r#"import "./foo"; require("bar"); export * from "woz.js""#);
        assert_eq!(deps, vec!["./foo", "bar", "woz.js"]);
    }

    #[test]
    fn test_extract_js_dependencies_named_import() {
        let deps = extract_js_dependencies(r#"import { a, b } from "./mod";"#);
        assert_eq!(deps, vec!["./mod"]);
    }

    #[test]
    fn test_extract_js_dependencies_empty_when_none() {
        assert!(extract_js_dependencies("const x = 1;").is_empty());
    }

    #[test]
    fn test_default_css_backend_strips_import_and_collects_dependencies() {
        let backend = DefaultCssBackend;
        let result = backend
            .process(
                r#"@import "./reset.css"; body { background: url("bg.png"); }"#,
                &[],
                false,
            )
            .unwrap();
        assert_eq!(result.dependencies, vec!["./reset.css", "bg.png"]);
        assert!(!result.css.contains("@import"));
        assert!(result.css.contains("background"));
    }

    #[test]
    fn test_default_css_backend_ignores_data_urls() {
        let backend = DefaultCssBackend;
        let result = backend
            .process(r#"body { background: url("data:image/png;base64,AAA="); }"#, &[], false)
            .unwrap();
        assert!(result.dependencies.is_empty());
    }

    #[test]
    fn test_regex_ast_backend_round_trips_code() {
        let backend = RegexAstBackend;
        let ast = backend.parse("const x = 1;", SourceType::Module).unwrap();
        let opts = TransformOptions::default();
        let generated = backend.generate(&ast, &opts, "const x = 1;").unwrap();
        assert_eq!(generated.code, "const x = 1;");
        assert!(generated.map.is_none());
    }
}

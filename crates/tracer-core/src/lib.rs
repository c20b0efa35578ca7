#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Core types for the incremental bundler pipeline: the cache substrate,
//! resolver and AST/CSS adapters, the per-file record job store, and the
//! dependency graph + tracer driver that tie them together.
//!
//! Logging is the CLI crate's responsibility; this crate emits `tracing`
//! events but does not configure a subscriber.

pub mod ast;
pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod record;
pub mod resolver;
pub mod tracer;

pub use ast::{AstBackend, CssBackend};
pub use cache::{Cache, CacheDirs, DiskCache, MockCache};
pub use config::{Config, ConfigOptions};
pub use error::Error;
pub use graph::{DependencyResolver, Event, Graph};
pub use record::{Record, RecordStore, Ref};
pub use resolver::{DefaultResolver, ModuleResolver};
pub use tracer::{Tracer, TraceSummary};

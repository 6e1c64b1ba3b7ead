extern crate thiserror;

pub mod apiset;
pub mod common;
pub mod graph;
#[cfg(windows)]
pub mod knowndlls;
pub mod lookup_path;
pub mod manifest;
pub mod pe;
pub mod query;
pub mod reports;
pub mod strategy;
pub mod system;
pub mod view;

pub use common::{decanonicalize, path_to_string, LookupError};
pub use graph::{AnalysisContext, DependencyGraph, DependencyNode, ModuleCache, NodeId};
pub use lookup_path::{LookupPath, ModuleResolver, ResolvedModule};
pub use pe::{ImageParser, PeParser};
pub use query::AnalysisQuery;
pub use strategy::SearchStrategy;

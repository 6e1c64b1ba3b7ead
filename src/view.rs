//! Read-only views over a built [`DependencyGraph`] and their text renderers

use crate::common::{display_path, module_key};
use crate::graph::{DependencyGraph, DependencyNode, NodeId};
use crate::strategy::SearchStrategy;
use serde::Serialize;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Remembers which files have already been expanded during one render pass
///
/// Modules without a path are never considered visited.
#[derive(Debug, Default)]
pub struct CycleGuard {
    visited: HashSet<PathBuf>,
}

impl CycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time a path is seen, i.e. when the module must be expanded
    pub fn visit(&mut self, path: Option<&Path>) -> bool {
        match path {
            Some(p) => self.visited.insert(p.to_owned()),
            None => true,
        }
    }
}

/// Which child list of a node the tree descends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOrder {
    /// one entry per distinct imported module
    Deduplicated,
    /// one entry per raw import
    Full,
}

/// Node of the acyclic tree view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub path: Option<PathBuf>,
    pub strategy: SearchStrategy,
    /// false when the module was already expanded elsewhere in the tree
    pub expanded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    pub dependencies: Vec<TreeNode>,
}

impl TreeNode {
    fn leaf(node: &DependencyNode, expanded: bool) -> Self {
        Self {
            name: node.name.clone(),
            path: node.display_path().map(Path::to_owned),
            strategy: node.strategy,
            expanded,
            load_error: node.load_error().map(str::to_owned),
            dependencies: Vec::new(),
        }
    }

    /// Pre-order walk with the nesting level of each node
    pub fn walk(&self) -> Vec<(usize, &TreeNode)> {
        let mut ret = Vec::new();
        let mut stack = vec![(0, self)];
        while let Some((level, n)) = stack.pop() {
            ret.push((level, n));
            stack.extend(n.dependencies.iter().rev().map(|c| (level + 1, c)));
        }
        ret
    }
}

/// Build the tree rooted at the analyzed executable
///
/// Each file is expanded at its first occurrence in pre-order; later occurrences
/// are leaves with `expanded == false`.
pub fn tree(graph: &DependencyGraph, order: ChildOrder) -> TreeNode {
    let mut guard = CycleGuard::new();
    let root = graph.root();
    guard.visit(graph.node(root).path.as_deref());
    subtree(graph, root, order, &mut guard)
}

fn subtree(
    graph: &DependencyGraph,
    id: NodeId,
    order: ChildOrder,
    guard: &mut CycleGuard,
) -> TreeNode {
    let node = graph.node(id);
    let children = match order {
        ChildOrder::Deduplicated => node.children(),
        ChildOrder::Full => node.full_children(),
    };
    let mut ret = TreeNode::leaf(node, true);
    for &c in children {
        let child = graph.node(c);
        if guard.visit(child.path.as_deref()) {
            ret.dependencies.push(subtree(graph, c, order, guard));
        } else {
            ret.dependencies.push(TreeNode::leaf(child, false));
        }
    }
    ret
}

/// Indented text rendering, one line per tree node
pub fn write_tree<W: Write>(out: &mut W, tree: &TreeNode) -> io::Result<()> {
    for (level, n) in tree.walk() {
        writeln!(
            out,
            "{}├ {} ({}) : {}",
            "|  ".repeat(level),
            n.name,
            n.strategy,
            display_path(n.path.as_deref())
        )?;
    }
    Ok(())
}

/// Entry of the flat module listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleRecord {
    pub name: String,
    pub path: Option<PathBuf>,
    pub strategy: SearchStrategy,
    pub depth: usize,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
}

/// Every distinct module of the graph, ordered by search strategy, then name
pub fn modules(graph: &DependencyGraph) -> Vec<ModuleRecord> {
    let mut ret: Vec<ModuleRecord> = graph
        .cache()
        .iter()
        .map(|(_, n)| ModuleRecord {
            name: n.name.clone(),
            path: n.display_path().map(Path::to_owned),
            strategy: n.strategy,
            depth: n.depth,
            resolved: n.is_resolved(),
            load_error: n.load_error().map(str::to_owned),
        })
        .collect();
    ret.sort_by(|a, b| {
        (a.strategy, module_key(&a.name), &a.path).cmp(&(b.strategy, module_key(&b.name), &b.path))
    });
    ret
}

pub fn write_modules<W: Write>(out: &mut W, modules: &[ModuleRecord]) -> io::Result<()> {
    for m in modules {
        writeln!(
            out,
            "[{}] {} : {}",
            m.strategy,
            m.name,
            display_path(m.path.as_deref())
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LookupError;
    use crate::graph::tests::{scenario, StubParser, StubResolver};
    use crate::graph::AnalysisContext;

    fn render(tree: &TreeNode) -> Result<String, LookupError> {
        let mut out = Vec::new();
        write_tree(&mut out, tree)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn mutual_pair(root: &str) -> Result<TreeNode, LookupError> {
        let parser = StubParser::default()
            .with("/app/a.dll", &["b.dll"])
            .with("/app/b.dll", &["a.dll"]);
        let resolver = StubResolver::default()
            .with("a.dll", SearchStrategy::ApplicationDirectory, Some("/app/a.dll"))
            .with("b.dll", SearchStrategy::ApplicationDirectory, Some("/app/b.dll"));
        let ctx = AnalysisContext::new(&parser, &resolver);
        let graph = DependencyGraph::build(&ctx, Path::new(root), 0)?;
        Ok(tree(&graph, ChildOrder::Deduplicated))
    }

    #[test]
    fn cycle_renders_once() -> Result<(), LookupError> {
        for (root, other) in [("/app/a.dll", "b.dll"), ("/app/b.dll", "a.dll")] {
            let t = mutual_pair(root)?;
            let nodes = t.walk();
            assert_eq!(nodes.len(), 3);
            // root, the other module expanded, then the root again as a summary line
            assert!(nodes[0].1.expanded);
            assert_eq!(nodes[1].1.name, other);
            assert!(nodes[1].1.expanded);
            assert!(!nodes[2].1.expanded);
            assert!(nodes[2].1.dependencies.is_empty());
            assert_eq!(nodes[2].1.path, nodes[0].1.path);
        }
        Ok(())
    }

    #[test]
    fn scenario_text_tree() -> Result<(), LookupError> {
        let (parser, resolver) = scenario();
        let ctx = AnalysisContext::new(&parser, &resolver);
        let graph = DependencyGraph::build(&ctx, Path::new("/app/app.exe"), 0)?;
        let text = render(&tree(&graph, ChildOrder::Deduplicated))?;
        assert_eq!(
            text,
            "├ app.exe (Root) : /app/app.exe\n\
             |  ├ KERNEL32.DLL (WellKnownDll) : /win/System32/kernel32.dll\n\
             |  ├ mylib.dll (ApplicationDirectory) : /app/mylib.dll\n\
             |  |  ├ KERNEL32.DLL (WellKnownDll) : /win/System32/kernel32.dll\n"
        );
        Ok(())
    }

    #[test]
    fn already_expanded_files_are_summary_lines() -> Result<(), LookupError> {
        let parser = StubParser::default()
            .with("/app/app.exe", &["a.dll", "b.dll"])
            .with("/app/a.dll", &["c.dll"])
            .with("/app/b.dll", &["c.dll"])
            .with("/app/c.dll", &["d.dll"])
            .with("/app/d.dll", &[]);
        let resolver = StubResolver::default()
            .with("a.dll", SearchStrategy::ApplicationDirectory, Some("/app/a.dll"))
            .with("b.dll", SearchStrategy::ApplicationDirectory, Some("/app/b.dll"))
            .with("c.dll", SearchStrategy::ApplicationDirectory, Some("/app/c.dll"))
            .with("d.dll", SearchStrategy::ApplicationDirectory, Some("/app/d.dll"));
        let ctx = AnalysisContext::new(&parser, &resolver);
        let graph = DependencyGraph::build(&ctx, Path::new("/app/app.exe"), 0)?;

        let t = tree(&graph, ChildOrder::Deduplicated);
        let names: Vec<(usize, &str, bool)> = t
            .walk()
            .into_iter()
            .map(|(l, n)| (l, n.name.as_str(), n.expanded))
            .collect();
        assert_eq!(
            names,
            vec![
                (0, "app.exe", true),
                (1, "a.dll", true),
                (2, "c.dll", true),
                (3, "d.dll", true),
                (1, "b.dll", true),
                (2, "c.dll", false),
            ]
        );

        // a second render starts from a clean guard
        assert_eq!(tree(&graph, ChildOrder::Deduplicated), t);
        Ok(())
    }

    #[test]
    fn same_file_under_two_names_renders_once() -> Result<(), LookupError> {
        let parser = StubParser::default()
            .with("/app/app.exe", &["a.dll", "alias.dll"])
            .with("/app/a.dll", &["c.dll"])
            .with("/app/c.dll", &[]);
        let resolver = StubResolver::default()
            .with("a.dll", SearchStrategy::ApplicationDirectory, Some("/app/a.dll"))
            .with("alias.dll", SearchStrategy::Fullpath, Some("/app/a.dll"))
            .with("c.dll", SearchStrategy::ApplicationDirectory, Some("/app/c.dll"));
        let ctx = AnalysisContext::new(&parser, &resolver);
        let graph = DependencyGraph::build(&ctx, Path::new("/app/app.exe"), 0)?;

        for order in [ChildOrder::Deduplicated, ChildOrder::Full] {
            let t = tree(&graph, order);
            let names: Vec<(usize, &str, bool)> = t
                .walk()
                .into_iter()
                .map(|(l, n)| (l, n.name.as_str(), n.expanded))
                .collect();
            assert_eq!(
                names,
                vec![
                    (0, "app.exe", true),
                    (1, "a.dll", true),
                    (2, "c.dll", true),
                    (1, "alias.dll", false),
                ]
            );
        }
        Ok(())
    }

    #[test]
    fn structured_tree_keeps_every_import() -> Result<(), LookupError> {
        let parser = StubParser::default().with("/app/app.exe", &["y.dll", "missing.dll", "y.dll"]);
        let resolver =
            StubResolver::default().with("y.dll", SearchStrategy::WellKnownDll, Some("/sys/y.dll"));
        let ctx = AnalysisContext::new(&parser, &resolver);
        let graph = DependencyGraph::build(&ctx, Path::new("/app/app.exe"), 0)?;

        let full = tree(&graph, ChildOrder::Full);
        assert_eq!(full.dependencies.len(), 3);
        assert_eq!(tree(&graph, ChildOrder::Deduplicated).dependencies.len(), 2);

        let json = serde_json::to_value(&full)?;
        assert_eq!(json["dependencies"][1]["strategy"], "NotFound");
        assert_eq!(json["dependencies"][1]["path"], serde_json::Value::Null);
        Ok(())
    }

    #[test]
    fn flat_listing_ordered_by_strategy() -> Result<(), LookupError> {
        let (parser, resolver) = scenario();
        let ctx = AnalysisContext::new(&parser, &resolver);
        let graph = DependencyGraph::build(&ctx, Path::new("/app/app.exe"), 0)?;

        let mut out = Vec::new();
        write_modules(&mut out, &modules(&graph))?;
        assert_eq!(
            String::from_utf8_lossy(&out),
            "[Root] app.exe : /app/app.exe\n\
             [WellKnownDll] KERNEL32.DLL : /win/System32/kernel32.dll\n\
             [ApplicationDirectory] mylib.dll : /app/mylib.dll\n"
        );
        Ok(())
    }
}

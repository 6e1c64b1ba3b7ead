//! Dependency graph of an executable: module cache and recursive resolution

use crate::common::module_key;
use crate::common::LookupError;
use crate::lookup_path::ModuleResolver;
use crate::pe::{ImageParser, PeImage};
use crate::strategy::SearchStrategy;
use serde::Serialize;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Handle to a node owned by a [`ModuleCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

/// (module name, resolved path) pair identifying a node; names compare without regard to case
#[derive(Debug, Clone)]
pub struct ModuleIdentity {
    name: String,
    key: String,
    path: Option<PathBuf>,
}

impl ModuleIdentity {
    pub fn new(name: &str, path: Option<PathBuf>) -> Self {
        Self {
            name: name.to_owned(),
            key: module_key(name),
            path,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl PartialEq for ModuleIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.path == other.path
    }
}

impl Eq for ModuleIdentity {}

impl Hash for ModuleIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.path.hash(state);
    }
}

/// One module of the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub name: String,
    pub path: Option<PathBuf>,
    pub strategy: SearchStrategy,
    /// recursion depth at first discovery
    pub depth: usize,
    resolved: bool,
    imports: Vec<String>,
    children: Vec<NodeId>,
    full_children: Vec<NodeId>,
    load_error: Option<String>,
    /// file reported by the resolver when it discovered the module, even for opaque strategies
    located_path: Option<PathBuf>,
}

impl DependencyNode {
    fn new(identity: ModuleIdentity, strategy: SearchStrategy, depth: usize) -> Self {
        Self {
            name: identity.name,
            path: identity.path,
            strategy,
            depth,
            resolved: false,
            imports: Vec::new(),
            children: Vec::new(),
            full_children: Vec::new(),
            load_error: None,
            located_path: None,
        }
    }

    /// Path worth showing to the user: the resolved one, or where the loader would take it from
    pub fn display_path(&self) -> Option<&Path> {
        self.path.as_deref().or(self.located_path.as_deref())
    }

    /// Whether the imports of this module have been expanded
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Raw imported module names, in table order (duplicates kept)
    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// One child per distinct imported name
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// One child per raw import
    pub fn full_children(&self) -> &[NodeId] {
        &self.full_children
    }

    /// Why the module could not be loaded, if it was found but is not a usable image
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }
}

/// Memoizes one node per [`ModuleIdentity`]
#[derive(Debug, Default)]
pub struct ModuleCache {
    nodes: Vec<DependencyNode>,
    index: HashMap<ModuleIdentity, NodeId>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node for `identity`, created at the given strategy and depth if it is not there yet
    pub fn get_or_create(
        &mut self,
        identity: ModuleIdentity,
        strategy: SearchStrategy,
        depth: usize,
    ) -> NodeId {
        if let Some(id) = self.index.get(&identity) {
            return *id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes
            .push(DependencyNode::new(identity.clone(), strategy, depth));
        self.index.insert(identity, id);
        id
    }

    pub fn contains(&self, identity: &ModuleIdentity) -> bool {
        self.index.contains_key(identity)
    }

    pub fn find(&self, identity: &ModuleIdentity) -> Option<NodeId> {
        self.index.get(identity).copied()
    }

    pub fn get(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id.0]
    }

    fn get_mut(&mut self, id: NodeId) -> &mut DependencyNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in creation order
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }
}

/// Services used to build the graph of one executable
#[derive(Clone, Copy)]
pub struct AnalysisContext<'a> {
    pub parser: &'a dyn ImageParser,
    pub resolver: &'a dyn ModuleResolver,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(parser: &'a dyn ImageParser, resolver: &'a dyn ModuleResolver) -> Self {
        Self { parser, resolver }
    }
}

/// Graph of the modules an executable transitively depends on
#[derive(Debug)]
pub struct DependencyGraph {
    root_image: PeImage,
    root: NodeId,
    cache: ModuleCache,
    max_depth: usize,
}

impl DependencyGraph {
    /// Load the root executable and resolve its dependencies, `max_depth` levels deep (0 = unlimited)
    ///
    /// Only a failure to load the root is an error.
    pub fn build(
        ctx: &AnalysisContext,
        root_path: &Path,
        max_depth: usize,
    ) -> Result<Self, LookupError> {
        let root_image = ctx.parser.load(root_path)?;
        let mut cache = ModuleCache::new();
        let root = cache.get_or_create(
            ModuleIdentity::new(&root_image.filename(), Some(root_image.path.clone())),
            SearchStrategy::Root,
            0,
        );
        cache.get_mut(root).imports = root_image.module_names();

        let mut graph = Self {
            root_image,
            root,
            cache,
            max_depth,
        };
        graph.resolve(ctx, root);
        info!(
            "{} distinct modules found for {}",
            graph.cache.len(),
            graph.root_image.path.display()
        );
        Ok(graph)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_image(&self) -> &PeImage {
        &self.root_image
    }

    pub fn node(&self, id: NodeId) -> &DependencyNode {
        self.cache.get(id)
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Expand `node` and, depth first, every module it newly discovers
    ///
    /// Does nothing on an already resolved node.
    pub fn resolve(&mut self, ctx: &AnalysisContext, node: NodeId) {
        // pending newly discovered children of each node being expanded
        let mut stack = vec![self.expand(ctx, node).into_iter()];
        while let Some(frame) = stack.last_mut() {
            match frame.next() {
                Some(child) => {
                    if self.load(ctx, child) {
                        let discovered = self.expand(ctx, child);
                        stack.push(discovered.into_iter());
                    }
                }
                None => {
                    stack.pop();
                }
            }
        }
    }

    /// Resolve the imports of a single node, returning the children it discovered
    /// that still need to be expanded
    fn expand(&mut self, ctx: &AnalysisContext, id: NodeId) -> Vec<NodeId> {
        let node = self.cache.get(id);
        if node.resolved {
            return Vec::new();
        }
        let depth = node.depth;
        let imports = node.imports.clone();

        let mut children: Vec<NodeId> = Vec::new();
        let mut full_children = Vec::with_capacity(imports.len());
        let mut discovered = Vec::new();
        for name in &imports {
            let resolved = ctx.resolver.resolve(&self.root_image, name);
            let path = resolved
                .path
                .clone()
                .filter(|_| resolved.strategy.is_expandable());
            let identity = ModuleIdentity::new(name, path);
            let already_cached = self.cache.contains(&identity);
            let child = self
                .cache
                .get_or_create(identity, resolved.strategy, depth + 1);

            let key = module_key(name);
            if !children
                .iter()
                .any(|c| module_key(&self.cache.get(*c).name) == key)
            {
                children.push(child);
            }
            full_children.push(child);
            if !already_cached {
                debug!("{} -> {} ({})", self.cache.get(id).name, name, resolved.strategy);
                self.cache.get_mut(child).located_path = resolved.path;
                discovered.push(child);
            }
        }

        let node = self.cache.get_mut(id);
        node.children = children;
        node.full_children = full_children;
        node.resolved = true;

        if self.max_depth > 0 && depth + 1 >= self.max_depth {
            debug!("max depth reached below {}", node.name);
            return Vec::new();
        }
        discovered
    }

    /// Read the imports of a newly discovered module; false if it can't be expanded
    fn load(&mut self, ctx: &AnalysisContext, id: NodeId) -> bool {
        let node = self.cache.get_mut(id);
        let Some(path) = node.path.clone() else {
            // opaque or missing: a leaf
            node.resolved = true;
            return false;
        };
        match ctx.parser.load(&path) {
            Ok(image) => {
                node.imports = image.module_names();
                true
            }
            Err(e) => {
                warn!("could not load {}: {}", path.display(), e);
                node.load_error = Some(e.to_string());
                false
            }
        }
    }
}

// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Runtime build nodes and the graph that owns them.
//!
//! A [`Node`] is what a caller constructs: a builder plus a mixed list of
//! sources (ready entities, raw paths, other nodes, or filters over other
//! nodes) plus explicit dependencies. Nodes live in a [`NodeGraph`] arena and
//! refer to each other by [`NodeId`], which keeps the source/dependency graph
//! plain data and lets the scheduler traverse it without ownership knots.
//!
//! The lifecycle is a one-way march: initiate (materialize sources, flatten
//! dependency targets), ask the builder for extra dependencies, let it
//! replace sources (which rewinds to initiation once), split into one or
//! more build units, check each unit's actuality, build the stale ones, and
//! populate the aggregated outputs. The flags on the node are monotonic;
//! every step happens at most once per build, except initiation, which is
//! re-entrant only to re-materialize replaced sources.

use std::{
    collections::{HashMap, HashSet},
    env,
    path::PathBuf,
    sync::Arc,
};
use tectonic_errors::prelude::*;

use crate::{
    builder::Builder,
    entity::{Entity, EntityId},
    errors::NodeError,
    events::EventBus,
    filter::{NodeAttribute, NodeFilter},
    node_entity::{ImplicitDepCache, NodeEntity},
    vfile::{ValueFile, ValueKey},
    DigestData,
};

/// The handle of a node within its graph.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub(crate) usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One source of a node: a ready entity, a raw path, another node, or a
/// filtered view of another node.
#[derive(Clone, Debug)]
pub enum Source {
    Entity(Entity),
    Path(PathBuf),
    Node(NodeId),
    Filter(NodeFilter),
}

impl From<Entity> for Source {
    fn from(e: Entity) -> Self {
        Source::Entity(e)
    }
}

impl From<NodeId> for Source {
    fn from(id: NodeId) -> Self {
        Source::Node(id)
    }
}

impl From<NodeFilter> for Source {
    fn from(f: NodeFilter) -> Self {
        Source::Filter(f)
    }
}

impl From<PathBuf> for Source {
    fn from(p: PathBuf) -> Self {
        Source::Path(p)
    }
}

impl From<&str> for Source {
    fn from(p: &str) -> Self {
        Source::Path(PathBuf::from(p))
    }
}

/// Where a split sibling writes its results back to.
#[derive(Clone, Debug)]
pub(crate) struct SplitOrigin {
    /// The node that was split.
    pub parent: NodeId,

    /// For each of the sibling's build units, the index of the matching unit
    /// in the parent's list.
    pub slots: Vec<usize>,
}

/// A runtime build node.
pub struct Node {
    pub(crate) builder: Arc<dyn Builder>,
    pub(crate) cwd: PathBuf,

    pub(crate) sources: Vec<Source>,
    pub(crate) source_entities: Vec<Entity>,

    pub(crate) dep_nodes: Vec<NodeId>,
    pub(crate) dep_entities: Vec<Entity>,

    pub(crate) node_entities: Vec<NodeEntity>,
    pub(crate) batch: bool,
    pub(crate) split_origin: Option<SplitOrigin>,

    pub(crate) target_entities: Vec<Entity>,
    pub(crate) itarget_entities: Vec<Entity>,
    pub(crate) idep_entities: Vec<Entity>,

    pub(crate) initiated: bool,
    pub(crate) depends_called: bool,
    pub(crate) replace_called: bool,
    pub(crate) split_called: bool,
    pub(crate) is_actual: bool,
    pub(crate) populated: bool,
}

impl Node {
    fn new(builder: Arc<dyn Builder>, sources: Vec<Source>, cwd: PathBuf) -> Self {
        Node {
            builder,
            cwd,
            sources,
            source_entities: Vec::new(),
            dep_nodes: Vec::new(),
            dep_entities: Vec::new(),
            node_entities: Vec::new(),
            batch: false,
            split_origin: None,
            target_entities: Vec::new(),
            itarget_entities: Vec::new(),
            idep_entities: Vec::new(),
            initiated: false,
            depends_called: false,
            replace_called: false,
            split_called: false,
            is_actual: false,
            populated: false,
        }
    }

    /// A sibling produced by splitting: it shares the parent's builder and
    /// has already passed through every pre-split lifecycle step.
    fn split_sibling(
        builder: Arc<dyn Builder>,
        source_entities: Vec<Entity>,
        node_entities: Vec<NodeEntity>,
        origin: SplitOrigin,
        batch: bool,
        cwd: PathBuf,
    ) -> Self {
        Node {
            builder,
            cwd,
            sources: Vec::new(),
            source_entities,
            dep_nodes: Vec::new(),
            dep_entities: Vec::new(),
            node_entities,
            batch,
            split_origin: Some(origin),
            target_entities: Vec::new(),
            itarget_entities: Vec::new(),
            idep_entities: Vec::new(),
            initiated: true,
            depends_called: true,
            replace_called: true,
            split_called: true,
            is_actual: false,
            populated: false,
        }
    }

    pub fn builder(&self) -> &Arc<dyn Builder> {
        &self.builder
    }

    pub fn source_entities(&self) -> &[Entity] {
        &self.source_entities
    }

    pub fn dep_entities(&self) -> &[Entity] {
        &self.dep_entities
    }

    /// The node's produced targets. Reading them before the node has been
    /// built (or found actual) is a programming error.
    pub fn target_entities(&self) -> Result<&[Entity], NodeError> {
        if self.populated {
            Ok(&self.target_entities)
        } else {
            Err(NodeError::NoTargets(self.builder.name().to_owned()))
        }
    }

    /// Side-effect outputs; empty until the node is populated.
    pub fn itarget_entities(&self) -> &[Entity] {
        &self.itarget_entities
    }

    /// Implicit dependencies; empty until the node is populated.
    pub fn idep_entities(&self) -> &[Entity] {
        &self.idep_entities
    }

    pub fn is_actual(&self) -> bool {
        self.is_actual
    }

    pub(crate) fn is_populated(&self) -> bool {
        self.populated
    }

    /// The names of this node's build units.
    pub fn unit_names(&self) -> impl Iterator<Item = &DigestData> {
        self.node_entities.iter().map(|ne| ne.name())
    }

    /// The node's trace string, `builder << sources >> targets`.
    pub fn build_str(&self, brief: bool) -> String {
        let targets: &[Entity] = if self.populated {
            &self.target_entities
        } else {
            &[]
        };

        self.builder
            .trace_args(&self.source_entities, targets, brief)
            .build_str(brief)
    }

    /// Aggregate the outputs of all build units into the node-level lists.
    pub(crate) fn populate(&mut self) {
        self.target_entities.clear();
        self.itarget_entities.clear();
        self.idep_entities.clear();

        for ne in &self.node_entities {
            self.target_entities.extend(ne.target_entities().iter().cloned());
            self.itarget_entities
                .extend(ne.itarget_entities().iter().cloned());
            self.idep_entities.extend(ne.idep_entities().iter().cloned());
        }

        self.populated = true;
    }
}

/// The arena that owns all nodes of one build.
#[derive(Default)]
pub struct NodeGraph {
    nodes: Vec<Node>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Add a node, capturing the current working directory for the
    /// resolution of relative source paths.
    pub fn add_node(&mut self, builder: Arc<dyn Builder>, sources: Vec<Source>) -> NodeId {
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        self.add_node_in(builder, sources, cwd)
    }

    /// Add a node with an explicit working directory.
    pub fn add_node_in(
        &mut self,
        builder: Arc<dyn Builder>,
        sources: Vec<Source>,
        cwd: PathBuf,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(builder, sources, cwd));
        id
    }

    /// Register explicit dependencies of a node. Entities become dependency
    /// entities directly; nodes and filters become dependency nodes whose
    /// targets are flattened in at initiation.
    pub fn depends(
        &mut self,
        id: NodeId,
        deps: impl IntoIterator<Item = Source>,
    ) -> Result<(), NodeError> {
        let mut dep_nodes = Vec::new();
        let mut dep_entities = Vec::new();

        for dep in deps {
            match dep {
                Source::Node(nid) => {
                    self.check_id(nid)?;
                    dep_nodes.push(nid);
                }

                Source::Filter(f) => {
                    let nid = f.node();
                    self.check_id(nid)?;
                    dep_nodes.push(nid);
                }

                Source::Entity(e) => dep_entities.push(e),

                Source::Path(p) => {
                    return Err(NodeError::InvalidDependency(p.display().to_string()));
                }
            }
        }

        let node = &mut self.nodes[id.0];
        node.dep_nodes.extend(dep_nodes);
        node.dep_entities.extend(dep_entities);
        Ok(())
    }

    fn check_id(&self, id: NodeId) -> Result<(), NodeError> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(NodeError::InvalidDependency(id.to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    /// The nodes that must be populated before this one can be initiated:
    /// source nodes, filtered source nodes, and dependency nodes.
    pub(crate) fn prerequisites(&self, id: NodeId) -> Vec<NodeId> {
        let node = &self.nodes[id.0];
        let mut out = Vec::new();

        for src in &node.sources {
            match src {
                Source::Node(nid) => out.push(*nid),
                Source::Filter(f) => out.push(f.node()),
                _ => {}
            }
        }

        out.extend(node.dep_nodes.iter().copied());
        out.sort();
        out.dedup();
        out
    }

    /// Read one of a node's entity lists, for filter resolution.
    pub(crate) fn attribute_entities(
        &self,
        id: NodeId,
        attribute: NodeAttribute,
    ) -> Result<Vec<Entity>, NodeError> {
        let node = &self.nodes[id.0];

        Ok(match attribute {
            NodeAttribute::Targets => node.target_entities()?.to_vec(),
            NodeAttribute::Sources => node.source_entities.clone(),
            NodeAttribute::SideEffects => node.itarget_entities.clone(),
            NodeAttribute::ImplicitDeps => node.idep_entities.clone(),
            NodeAttribute::Dependencies => node.dep_entities.clone(),
        })
    }

    /// Materialize a node's `sources` list into concrete entities.
    fn resolve_sources(&self, id: NodeId) -> Result<Vec<Entity>> {
        let node = &self.nodes[id.0];
        let mut entities = Vec::new();

        for src in &node.sources {
            match src {
                Source::Entity(e) => entities.push(e.clone()),

                Source::Path(p) => {
                    let abs = if p.is_absolute() {
                        p.clone()
                    } else {
                        node.cwd.join(p)
                    };
                    entities.push(node.builder.make_file_entity(&abs, None));
                }

                Source::Node(nid) => {
                    self.check_id(*nid)?;
                    let targets = self.nodes[nid.0]
                        .target_entities()
                        .map_err(|_| NodeError::NoSrcTargets(nid.to_string()))?;
                    entities.extend(targets.iter().cloned());
                }

                Source::Filter(f) => {
                    self.check_id(f.node())?;
                    entities.extend(f.resolve(self)?);
                }
            }
        }

        Ok(entities)
    }

    /// Initiate a node: let the builder specialize itself, materialize the
    /// source entities, and flatten dependency-node targets into the sorted
    /// dependency list.
    ///
    /// Idempotent, and re-entrant only when `build_replace` has put
    /// substituted sources back into `sources`.
    pub(crate) fn initiate(&mut self, id: NodeId) -> Result<()> {
        let first = !self.nodes[id.0].initiated;

        if first {
            if let Some(specialized) = self.nodes[id.0].builder.initiate()? {
                self.nodes[id.0].builder = specialized;
            }
        }

        if first || !self.nodes[id.0].sources.is_empty() {
            let resolved = self.resolve_sources(id)?;
            let node = &mut self.nodes[id.0];
            node.sources = Vec::new();
            node.source_entities = resolved;
        }

        if first {
            self.flush_dep_nodes(id);
            self.nodes[id.0].initiated = true;
        }

        Ok(())
    }

    /// Fold the current targets of populated dependency nodes into the flat
    /// dependency-entity list, keeping it sorted by id.
    ///
    /// A dependency node that has not been populated yet contributes
    /// nothing; the scheduler orders nodes so that this only happens when a
    /// caller wires a dependency on a node that is never built at all.
    fn flush_dep_nodes(&mut self, id: NodeId) {
        let dep_nodes = std::mem::take(&mut self.nodes[id.0].dep_nodes);

        if !dep_nodes.is_empty() {
            let mut extra = Vec::new();

            for nid in dep_nodes {
                let dep = &self.nodes[nid.0];
                if dep.is_populated() {
                    extra.extend(dep.target_entities.iter().cloned());
                }
            }

            self.nodes[id.0].dep_entities.extend(extra);
        }

        self.nodes[id.0]
            .dep_entities
            .sort_by(|a, b| a.id().cmp(&b.id()));
    }

    /// Ask the builder for extra dependencies to schedule before this node.
    /// Returns the ids of newly discovered dependency nodes; the scheduler
    /// must build those first. Called once per node.
    pub(crate) fn build_depends(&mut self, id: NodeId) -> Result<Vec<NodeId>> {
        if self.nodes[id.0].depends_called {
            return Ok(Vec::new());
        }

        let builder = self.nodes[id.0].builder.clone();
        let discovered = builder.depends(&self.nodes[id.0].source_entities)?;
        self.nodes[id.0].depends_called = true;

        let mut new_nodes = Vec::new();

        for dep in discovered {
            match dep {
                Source::Node(nid) => {
                    self.check_id(nid)?;
                    new_nodes.push(nid);
                }

                Source::Filter(f) => {
                    let nid = f.node();
                    self.check_id(nid)?;
                    new_nodes.push(nid);
                }

                Source::Entity(e) => self.nodes[id.0].dep_entities.push(e),

                Source::Path(p) => {
                    return Err(NodeError::InvalidDependency(p.display().to_string()).into());
                }
            }
        }

        self.nodes[id.0].dep_nodes.extend(new_nodes.iter().copied());
        Ok(new_nodes)
    }

    /// Ask the builder whether the sources should be substituted. If so, the
    /// substitutes land back in `sources` and the node must be re-initiated.
    /// Called once per node.
    pub(crate) fn build_replace(&mut self, id: NodeId) -> Result<bool> {
        if self.nodes[id.0].replace_called {
            return Ok(false);
        }

        let builder = self.nodes[id.0].builder.clone();
        let replacement = builder.replace(&self.nodes[id.0].source_entities);
        self.nodes[id.0].replace_called = true;

        match replacement {
            Some(sources) => {
                self.nodes[id.0].sources = sources;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Partition the node into build units and check each unit's actuality.
    ///
    /// Returns the ids of split siblings created for stale groups; an empty
    /// result means the node stayed monolithic (and `is_actual` tells
    /// whether it needs building). Called once per node.
    pub(crate) fn build_split(
        &mut self,
        id: NodeId,
        vfile: &mut ValueFile,
        idep_cache: &mut ImplicitDepCache,
        built_nodes: Option<&HashSet<DigestData>>,
        explain: bool,
        events: &mut dyn EventBus,
    ) -> Result<Vec<NodeId>> {
        if self.nodes[id.0].split_called {
            return Ok(Vec::new());
        }

        // Dependencies discovered by `build_depends` have been built by now;
        // pick up their targets before fingerprinting anything.
        self.flush_dep_nodes(id);
        self.nodes[id.0].split_called = true;

        let builder = self.nodes[id.0].builder.clone();
        let sources = self.nodes[id.0].source_entities.clone();
        let deps = self.nodes[id.0].dep_entities.clone();

        if builder.is_batch() {
            return self.split_batch(id, builder, sources, deps, vfile, idep_cache, built_nodes, explain, events);
        }

        let groups = builder.split(&sources);

        if groups.len() < 2 {
            // No real partition: the node stays monolithic.
            let mut ne = NodeEntity::new(builder, sources, deps);
            let actual = ne.check_actual(vfile, built_nodes, idep_cache, explain, events);

            let node = &mut self.nodes[id.0];
            node.node_entities = vec![ne];
            node.is_actual = actual;
            return Ok(Vec::new());
        }

        let source_ids: HashSet<EntityId> = sources.iter().map(|e| e.id()).collect();

        let mut node_entities = Vec::with_capacity(groups.len());
        let mut stale_groups = Vec::new();

        for group in groups {
            for entity in &group {
                if !source_ids.contains(&entity.id()) {
                    return Err(NodeError::SplitUnknownSource(entity.name()).into());
                }
            }

            let mut ne = NodeEntity::new(builder.clone(), group.clone(), deps.clone());

            if !ne.check_actual(vfile, built_nodes, idep_cache, explain, events) {
                stale_groups.push((group, node_entities.len()));
            }

            node_entities.push(ne);
        }

        let cwd = self.nodes[id.0].cwd.clone();
        let node = &mut self.nodes[id.0];
        node.node_entities = node_entities;

        // The splitting node's own actuality question is settled; what
        // remains stale is owned by the siblings.
        node.is_actual = true;

        let mut children = Vec::new();

        for (group, slot) in stale_groups {
            let ne = self.nodes[id.0].node_entities[slot].clone();
            let sibling = Node::split_sibling(
                builder.clone(),
                group,
                vec![ne],
                SplitOrigin {
                    parent: id,
                    slots: vec![slot],
                },
                false,
                cwd.clone(),
            );

            let cid = NodeId(self.nodes.len());
            self.nodes.push(sibling);
            children.push(cid);
        }

        Ok(children)
    }

    /// The batch flavor of splitting: one build unit per source, stale
    /// sources bundled by the builder into groups that build many sources in
    /// a single invocation.
    #[allow(clippy::too_many_arguments)]
    fn split_batch(
        &mut self,
        id: NodeId,
        builder: Arc<dyn Builder>,
        sources: Vec<Entity>,
        deps: Vec<Entity>,
        vfile: &mut ValueFile,
        idep_cache: &mut ImplicitDepCache,
        built_nodes: Option<&HashSet<DigestData>>,
        explain: bool,
        events: &mut dyn EventBus,
    ) -> Result<Vec<NodeId>> {
        let mut node_entities = Vec::with_capacity(sources.len());
        let mut stale = Vec::new();

        for (slot, src) in sources.iter().enumerate() {
            let mut ne = NodeEntity::new(builder.clone(), vec![src.clone()], deps.clone());

            if !ne.check_actual(vfile, built_nodes, idep_cache, explain, events) {
                stale.push((src.clone(), slot));
            }

            node_entities.push(ne);
        }

        let cwd = self.nodes[id.0].cwd.clone();
        let node = &mut self.nodes[id.0];
        node.node_entities = node_entities;
        node.is_actual = true;

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let stale_sources: Vec<Entity> = stale.iter().map(|(src, _)| src.clone()).collect();
        let slot_of: HashMap<EntityId, usize> =
            stale.iter().map(|(src, slot)| (src.id(), *slot)).collect();

        let mut groups = builder.split(&stale_sources);

        if groups.is_empty() {
            // A batch builder that declines to group gets one group per
            // stale source.
            groups = stale_sources.iter().map(|s| vec![s.clone()]).collect();
        }

        let mut children = Vec::new();

        for group in groups {
            let mut slots = Vec::with_capacity(group.len());

            for entity in &group {
                match slot_of.get(&entity.id()) {
                    Some(slot) => slots.push(*slot),
                    None => {
                        return Err(NodeError::SplitUnknownSource(entity.name()).into());
                    }
                }
            }

            let units = slots
                .iter()
                .map(|slot| self.nodes[id.0].node_entities[*slot].clone())
                .collect();

            let sibling = Node::split_sibling(
                builder.clone(),
                group,
                units,
                SplitOrigin {
                    parent: id,
                    slots,
                },
                true,
                cwd.clone(),
            );

            let cid = NodeId(self.nodes.len());
            self.nodes.push(sibling);
            children.push(cid);
        }

        Ok(children)
    }

    /// Install the build units returned by a worker and populate the node.
    pub(crate) fn finish_build(&mut self, id: NodeId, node_entities: Vec<NodeEntity>) {
        let node = &mut self.nodes[id.0];
        node.node_entities = node_entities;
        node.populate();
    }

    /// Copy a finished split sibling's units back into its parent's slots.
    /// Returns the parent id.
    pub(crate) fn adopt_sibling_results(&mut self, child: NodeId) -> Option<NodeId> {
        let origin = self.nodes[child.0].split_origin.clone()?;
        let units = self.nodes[child.0].node_entities.clone();

        let parent = &mut self.nodes[origin.parent.0];
        for (slot, unit) in origin.slots.iter().zip(units) {
            parent.node_entities[*slot] = unit;
        }

        Some(origin.parent)
    }

    /// Look up a node's persisted state for destruction: adopt the saved
    /// targets so the builder can be asked to delete them, and return the
    /// value-file keys that should be dropped.
    ///
    /// The node counts as populated afterwards even when nothing was saved,
    /// so that downstream nodes can still be cleaned.
    pub(crate) fn clear(&mut self, id: NodeId, vfile: &ValueFile) -> Result<Vec<ValueKey>> {
        self.initiate(id)?;
        self.flush_dep_nodes(id);

        let builder = self.nodes[id.0].builder.clone();
        let sources = self.nodes[id.0].source_entities.clone();
        let deps = self.nodes[id.0].dep_entities.clone();

        let probe = NodeEntity::new(builder, sources, deps);
        let name = *probe.name();

        let mut keys = Vec::new();
        let mut targets = Vec::new();
        let mut itargets = Vec::new();

        if let Some(Entity::Node(rec)) = vfile.find_entity_by_name(&name[..]) {
            targets = rec.target_entities().map(|t| t.to_vec()).unwrap_or_default();
            itargets = rec.itarget_entities().to_vec();

            if let Some(key) = vfile.find_entity_key(&Entity::Node(rec.clone())) {
                keys.push(key);
            }
        }

        let node = &mut self.nodes[id.0];
        node.target_entities = targets;
        node.itarget_entities = itargets;
        node.idep_entities = Vec::new();
        node.populated = true;

        Ok(keys)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::entity::{FileEntity, SignaturePolicy, Tags};
    use crate::node_entity::NodeEntity;
    use std::iter::FromIterator;

    pub struct NullBuilder;

    impl Builder for NullBuilder {
        fn name(&self) -> &str {
            "null"
        }

        fn signature(&self) -> Option<DigestData> {
            Some(crate::entity::digest_of(b"null-v1"))
        }

        fn build(&self, _sources: &[Entity], _out: &mut NodeEntity) -> Result<String> {
            bail!("the null builder never builds");
        }
    }

    pub fn tagged_file(path: &str, tags: &[&str]) -> Entity {
        let tags = Tags::from_iter(tags.iter().map(|t| (*t).to_owned()));
        Entity::from(FileEntity::new(path, SignaturePolicy::Checksum).with_tags(tags))
    }

    /// A one-node graph whose node already has the given targets.
    pub fn populated_graph(targets: &[Entity]) -> (NodeGraph, NodeId) {
        let mut graph = NodeGraph::new();
        let id = graph.add_node_in(Arc::new(NullBuilder), Vec::new(), PathBuf::from("."));

        let node = graph.node_mut(id);
        node.target_entities = targets.to_vec();
        node.initiated = true;
        node.populated = true;

        (graph, id)
    }

    /// A one-node graph whose node has not been built.
    pub fn unpopulated_graph() -> (NodeGraph, NodeId) {
        let mut graph = NodeGraph::new();
        let id = graph.add_node_in(Arc::new(NullBuilder), Vec::new(), PathBuf::from("."));
        (graph, id)
    }
}

// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Lazy views over a node's entities.
//!
//! A filter names a node and one of its entity lists, and optionally narrows
//! the view by tag set or position, or derives path fragments from it.
//! Filters can chain, never own entities, and never mutate anything: they
//! resolve to a fresh tuple of entities each time they are read.

use std::path::Path;

use crate::{
    entity::{Entity, SimpleEntity, Tags},
    errors::NodeError,
    node::{NodeGraph, NodeId},
};

/// Which of a node's entity lists a filter reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeAttribute {
    /// The produced targets (the default).
    Targets,

    /// The materialized source entities.
    Sources,

    /// Side-effect outputs.
    SideEffects,

    /// Implicit dependencies discovered during the build.
    ImplicitDeps,

    /// Explicit dependency entities.
    Dependencies,
}

#[derive(Clone, Debug)]
enum FilterBase {
    Node(NodeId, NodeAttribute),
    Chain(Box<NodeFilter>),
}

#[derive(Clone, Debug)]
enum FilterKind {
    All,
    Tags(Tags),
    Index(usize),
    DirName,
    BaseName,
}

/// A lazy, chainable view over one node's entities.
#[derive(Clone, Debug)]
pub struct NodeFilter {
    base: FilterBase,
    kind: FilterKind,
}

impl NodeFilter {
    /// A view of a node's targets.
    pub fn targets(node: NodeId) -> Self {
        NodeFilter::new(node, NodeAttribute::Targets)
    }

    /// A view of one of a node's entity lists.
    pub fn new(node: NodeId, attribute: NodeAttribute) -> Self {
        NodeFilter {
            base: FilterBase::Node(node, attribute),
            kind: FilterKind::All,
        }
    }

    fn narrowed(self, kind: FilterKind) -> Self {
        match self.kind {
            // An unnarrowed filter can absorb the refinement in place.
            FilterKind::All => NodeFilter { kind, ..self },

            _ => NodeFilter {
                base: FilterBase::Chain(Box::new(self)),
                kind,
            },
        }
    }

    /// Keep only entities whose tag set intersects the given one.
    pub fn with_tags(self, tags: Tags) -> Self {
        self.narrowed(FilterKind::Tags(tags))
    }

    /// Keep only the entity at the given position. Resolves to nothing if
    /// the position is out of range.
    pub fn at(self, index: usize) -> Self {
        self.narrowed(FilterKind::Index(index))
    }

    /// Map each path-valued entity to its directory name.
    pub fn dir_name(self) -> Self {
        self.narrowed(FilterKind::DirName)
    }

    /// Map each path-valued entity to its base name.
    pub fn base_name(self) -> Self {
        self.narrowed(FilterKind::BaseName)
    }

    /// The node this filter (transitively) views.
    pub fn node(&self) -> NodeId {
        match &self.base {
            FilterBase::Node(id, _) => *id,
            FilterBase::Chain(inner) => inner.node(),
        }
    }

    /// Resolve the view to a concrete list of entities.
    pub(crate) fn resolve(&self, graph: &NodeGraph) -> Result<Vec<Entity>, NodeError> {
        let entities = match &self.base {
            FilterBase::Node(id, attribute) => graph.attribute_entities(*id, *attribute)?,
            FilterBase::Chain(inner) => inner.resolve(graph)?,
        };

        Ok(match &self.kind {
            FilterKind::All => entities,

            FilterKind::Tags(tags) => entities
                .into_iter()
                .filter(|e| {
                    e.tags()
                        .map(|t| t.intersection(tags).next().is_some())
                        .unwrap_or(false)
                })
                .collect(),

            FilterKind::Index(index) => entities.get(*index).cloned().into_iter().collect(),

            FilterKind::DirName => entities
                .iter()
                .filter_map(|e| {
                    let parent = Path::new(e.value_str()?).parent()?;
                    Some(Entity::from(SimpleEntity::text(
                        parent.to_string_lossy().into_owned(),
                    )))
                })
                .collect(),

            FilterKind::BaseName => entities
                .iter()
                .filter_map(|e| {
                    let name = Path::new(e.value_str()?).file_name()?;
                    Some(Entity::from(SimpleEntity::text(
                        name.to_string_lossy().into_owned(),
                    )))
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{FileEntity, SignaturePolicy};
    use crate::node::testing::{populated_graph, tagged_file};
    use std::iter::FromIterator;

    #[test]
    fn attribute_and_tag_selection() {
        let (graph, id) = populated_graph(&[
            tagged_file("/out/lib/a.o", &["obj"]),
            tagged_file("/out/lib/b.o", &["obj"]),
            tagged_file("/out/lib/ab.map", &["map"]),
        ]);

        let all = NodeFilter::targets(id).resolve(&graph).unwrap();
        assert!(all.len() == 3);

        let objs = NodeFilter::targets(id)
            .with_tags(Tags::from_iter(vec!["obj".to_owned()]))
            .resolve(&graph)
            .unwrap();
        assert!(objs.len() == 2);

        let none = NodeFilter::targets(id)
            .with_tags(Tags::from_iter(vec!["dbg".to_owned()]))
            .resolve(&graph)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn index_out_of_range_is_empty() {
        let (graph, id) = populated_graph(&[tagged_file("/out/a.o", &[])]);

        let first = NodeFilter::targets(id).at(0).resolve(&graph).unwrap();
        assert!(first.len() == 1);

        let beyond = NodeFilter::targets(id).at(5).resolve(&graph).unwrap();
        assert!(beyond.is_empty());
    }

    #[test]
    fn path_fragment_filters_chain() {
        let (graph, id) = populated_graph(&[tagged_file("/out/lib/a.o", &[])]);

        let dirs = NodeFilter::targets(id).dir_name().resolve(&graph).unwrap();
        assert!(dirs.len() == 1);
        assert!(dirs[0].value_str() == Some("/out/lib"));

        let names = NodeFilter::targets(id).base_name().resolve(&graph).unwrap();
        assert!(names[0].value_str() == Some("a.o"));

        // dirname then basename: the last path component of the directory.
        let chained = NodeFilter::targets(id)
            .dir_name()
            .base_name()
            .resolve(&graph)
            .unwrap();
        assert!(chained[0].value_str() == Some("lib"));
    }

    #[test]
    fn reading_targets_before_build_fails() {
        let (graph, id) = crate::node::testing::unpopulated_graph();

        match NodeFilter::targets(id).resolve(&graph) {
            Err(NodeError::NoTargets(_)) => {}
            other => panic!("unexpected resolution: {:?}", other),
        }
    }

    #[test]
    fn filters_never_mutate_the_node() {
        let target = Entity::from(FileEntity::new("/out/a.o", SignaturePolicy::Checksum));
        let (graph, id) = populated_graph(std::slice::from_ref(&target));

        let _ = NodeFilter::targets(id).at(0).resolve(&graph).unwrap();
        let again = NodeFilter::targets(id).resolve(&graph).unwrap();
        assert!(again == vec![target]);
    }
}

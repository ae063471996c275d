// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! The builder contract: the interface the build core consumes.
//!
//! Builders do the actual work — compiling, copying, archiving. The core
//! never looks inside them; it only asks them about their identity, lets
//! them rewrite and partition their inputs, and hands them stale work. A
//! builder must be deterministic: same name and signature imply same outputs
//! for the same inputs.

use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tectonic_errors::prelude::*;

use crate::{
    entity::{Entity, EntityId, FileEntity, SignaturePolicy, SimpleEntity, Tags},
    errors::NodeError,
    node::Source,
    node_entity::NodeEntity,
    DigestData,
};

/// The contract between the build core and an external builder.
pub trait Builder: Send + Sync {
    /// The builder's stable, printable identity.
    fn name(&self) -> &str;

    /// A fingerprint of the builder's identity and parameters.
    ///
    /// `None` means the builder cannot vouch for its own stability, and
    /// every node using it is rebuilt unconditionally.
    fn signature(&self) -> Option<DigestData>;

    /// Give the builder a chance to specialize itself before its node is
    /// materialized. Returning `None` keeps the builder as-is.
    fn initiate(&self) -> Result<Option<Arc<dyn Builder>>> {
        Ok(None)
    }

    /// A cheap preview of the targets this builder would produce for the
    /// given sources, used to compute the node's stable name before any
    /// build happens. An empty preview makes the name fall back to the
    /// sources.
    fn target_entities(&self, _sources: &[Entity]) -> Vec<Entity> {
        Vec::new()
    }

    /// Extra dependencies to schedule before this node. Items must be
    /// entities, nodes, or node filters.
    fn depends(&self, _sources: &[Entity]) -> Result<Vec<Source>> {
        Ok(Vec::new())
    }

    /// Substitute sources before the build (for example, response-file
    /// expansion). Returning `Some` rewinds the node to initiation so the
    /// substituted sources are materialized.
    fn replace(&self, _sources: &[Entity]) -> Option<Vec<Source>> {
        None
    }

    /// Partition sources into groups, one cacheable build unit per group.
    /// An empty result (or a single group) keeps the node monolithic.
    fn split(&self, _sources: &[Entity]) -> Vec<Vec<Entity>> {
        Vec::new()
    }

    /// Whether one invocation of this builder produces per-source targets
    /// for many sources at once.
    fn is_batch(&self) -> bool {
        false
    }

    /// Build the given sources, registering produced targets, side effects,
    /// and discovered implicit dependencies on `out`. The returned string is
    /// the builder's own account of the work, surfaced through the event
    /// bus.
    fn build(&self, sources: &[Entity], out: &mut NodeEntity) -> Result<String>;

    /// Build many sources in one invocation, writing per-source targets
    /// through the batch map. Only called when [`Self::is_batch`] is true.
    fn build_batch(&self, _sources: &[Entity], _targets: &mut BatchTargets<'_>) -> Result<String> {
        bail!("builder `{}` does not support batch builds", self.name());
    }

    /// Destroy the given previously built targets. The default removes
    /// target files from disk, treating already-missing files as success.
    fn clear(&self, targets: &[Entity]) -> Result<()> {
        for target in targets {
            if let Entity::File(f) = target {
                match fs::remove_file(f.path()) {
                    Ok(()) => {}
                    Err(ref e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    /// A scheduling weight: heavier nodes are dispatched first.
    fn weight(&self, sources: &[Entity]) -> u64 {
        sources.len().max(1) as u64
    }

    /// How long one build invocation may run before it is failed. `None`
    /// means no limit.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// The signature policy applied to file entities this builder creates.
    fn file_signature_policy(&self) -> SignaturePolicy {
        SignaturePolicy::Checksum
    }

    /// Materialize a file target entity.
    fn make_file_entity(&self, path: &Path, tags: Option<&Tags>) -> Entity {
        let mut e = FileEntity::new(path, self.file_signature_policy());
        if let Some(tags) = tags {
            e = e.with_tags(tags.clone());
        }
        Entity::File(e)
    }

    /// Materialize several file target entities.
    fn make_file_entities(&self, paths: &[&Path], tags: Option<&Tags>) -> Vec<Entity> {
        paths
            .iter()
            .map(|p| self.make_file_entity(p, tags))
            .collect()
    }

    /// Materialize a plain value entity.
    fn make_simple_entity(&self, name: &str, payload: &[u8], tags: Option<&Tags>) -> Entity {
        let mut e = SimpleEntity::new(name, payload.to_vec());
        if let Some(tags) = tags {
            e = e.with_tags(tags.clone());
        }
        Entity::Simple(e)
    }

    /// The pieces of this node's trace string, used for logging and stale
    /// reasons.
    fn trace_args(&self, sources: &[Entity], targets: &[Entity], brief: bool) -> TraceArgs {
        TraceArgs {
            name: self.name().to_owned(),
            sources: sources.iter().filter_map(|e| trace_arg(e, brief)).collect(),
            targets: targets.iter().filter_map(|e| trace_arg(e, brief)).collect(),
        }
    }
}

/// The map a batch builder writes per-source targets through.
///
/// Each stale source in the batch has its own build record; the builder asks
/// for the record of the source it is currently processing and registers the
/// produced targets there.
pub struct BatchTargets<'a> {
    index: HashMap<EntityId, usize>,
    entities: &'a mut [NodeEntity],
}

impl<'a> BatchTargets<'a> {
    /// Pair up sources with their build records, positionally.
    pub(crate) fn new(sources: &[Entity], entities: &'a mut [NodeEntity]) -> Self {
        assert!(sources.len() == entities.len());

        let index = sources.iter().enumerate().map(|(i, s)| (s.id(), i)).collect();

        BatchTargets { index, entities }
    }

    /// The build record for one source of the batch.
    pub fn get_mut(&mut self, source: &Entity) -> Result<&mut NodeEntity, NodeError> {
        match self.index.get(&source.id()) {
            Some(idx) => Ok(&mut self.entities[*idx]),
            None => Err(NodeError::UnknownSource(source.name())),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// The rendered pieces of a node's trace string.
#[derive(Clone, Debug)]
pub struct TraceArgs {
    pub name: String,
    pub sources: Vec<String>,
    pub targets: Vec<String>,
}

impl TraceArgs {
    /// Render as `name << sources >> targets`, eliding long argument lists
    /// in brief mode.
    pub fn build_str(&self, brief: bool) -> String {
        let mut out = self.name.clone();

        let sources = join_args(&self.sources, brief);
        if !sources.is_empty() {
            out.push_str(" << ");
            out.push_str(&sources);
        }

        let targets = join_args(&self.targets, brief);
        if !targets.is_empty() {
            out.push_str(" >> ");
            out.push_str(&targets);
        }

        out
    }
}

fn trace_arg(entity: &Entity, brief: bool) -> Option<String> {
    let value = match entity {
        Entity::File(f) => {
            if brief {
                f.path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| f.path_str().to_owned())
            } else {
                f.path_str().to_owned()
            }
        }

        Entity::Simple(s) => s.name().to_owned(),
        Entity::Node(_) => return None,
    };

    let value = value.trim();
    let value = match value.find('\n') {
        Some(pos) => &value[..pos],
        None => value,
    };

    let max_len = if brief { 64 } else { 256 };
    let n_chars = value.chars().count();

    if n_chars > max_len {
        let half = max_len / 2;
        let head: String = value.chars().take(half).collect();
        let tail: String = value.chars().skip(n_chars - half).collect();
        Some(format!("{}...{}", head, tail))
    } else {
        Some(value.to_owned())
    }
}

fn join_args(args: &[String], brief: bool) -> String {
    if !brief || args.len() < 3 {
        return args.join(" ");
    }

    let wish_size = 128;

    let mut parts = vec![args[0].as_str()];
    let last = args.last().unwrap().as_str();
    let mut size = parts[0].len() + last.len();

    for arg in &args[1..args.len() - 1] {
        size += arg.len();

        if size > wish_size {
            parts.push("...");
            break;
        }

        parts.push(arg);
    }

    parts.push(last);
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_string_shape() {
        let args = TraceArgs {
            name: "cc".to_owned(),
            sources: vec!["a.c".to_owned(), "b.c".to_owned()],
            targets: vec!["ab.o".to_owned()],
        };

        assert!(args.build_str(false) == "cc << a.c b.c >> ab.o");
    }

    #[test]
    fn brief_join_elides_the_middle() {
        let args: Vec<String> = (0..40).map(|i| format!("source-file-{:02}.c", i)).collect();

        let joined = join_args(&args, true);
        assert!(joined.starts_with("source-file-00.c"));
        assert!(joined.ends_with("source-file-39.c"));
        assert!(joined.contains("..."));
        assert!(joined.len() < 200);

        // Short lists and non-brief renderings are untouched.
        assert!(join_args(&args[..2], true) == "source-file-00.c source-file-01.c");
        assert!(!join_args(&args, false).contains("..."));
    }
}

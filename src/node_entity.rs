// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! The runtime form of a build record, and the actuality check.
//!
//! A [`NodeEntity`] is constructed *forward* from a builder plus materialized
//! sources and dependencies; its stable name and input fingerprint are
//! computed lazily from those. The value-file holds the *replay* form
//! ([`crate::entity::NodeRecord`]): name, fingerprint, saved targets and
//! side effects, and the keys of implicit dependencies discovered during the
//! build. Checking actuality means comparing the forward form against the
//! replay form and probing the recorded outputs.

use md5::Digest;
use std::{
    cell::OnceCell,
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use crate::{
    builder::Builder,
    entity::{Entity, EntityId, NodeRecord, Tags},
    errors::NodeError,
    events::EventBus,
    reason::StaleReason,
    vfile::{ValueFile, ValueKey},
    DigestComputer, DigestData,
};

/// The per-build memo of refreshed implicit dependencies.
///
/// When one node discovers that a shared implicit dependency (say, a header
/// file) is out of date, the refreshed entity and its new value-file key are
/// remembered here so that every other node touching the same dependency in
/// this build reuses them instead of re-probing the file. The cache is owned
/// by the build manager and cleared between builds.
#[derive(Default)]
pub struct ImplicitDepCache {
    entries: HashMap<EntityId, (ValueKey, Entity)>,
}

impl ImplicitDepCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn get(&self, id: &EntityId) -> Option<&(ValueKey, Entity)> {
        self.entries.get(id)
    }

    fn insert(&mut self, id: EntityId, key: ValueKey, entity: Entity) {
        self.entries.insert(id, (key, entity));
    }
}

/// The runtime record of one build unit: a builder applied to a group of
/// source entities under a set of dependency entities.
#[derive(Clone)]
pub struct NodeEntity {
    builder: Arc<dyn Builder>,
    source_entities: Vec<Entity>,
    dep_entities: Vec<Entity>,

    name: OnceCell<DigestData>,
    signature: OnceCell<Option<DigestData>>,

    target_entities: Vec<Entity>,
    itarget_entities: Vec<Entity>,
    idep_entities: Vec<Entity>,
    idep_keys: Vec<ValueKey>,
}

impl NodeEntity {
    /// Forward construction. `dep_entities` must already be sorted by id.
    pub fn new(
        builder: Arc<dyn Builder>,
        source_entities: Vec<Entity>,
        dep_entities: Vec<Entity>,
    ) -> Self {
        NodeEntity {
            builder,
            source_entities,
            dep_entities,
            name: OnceCell::new(),
            signature: OnceCell::new(),
            target_entities: Vec::new(),
            itarget_entities: Vec::new(),
            idep_entities: Vec::new(),
            idep_keys: Vec::new(),
        }
    }

    /// The stable name: a digest of the builder identity and the ids of the
    /// entities this unit is *about* — its targets when the builder can
    /// preview them, its sources otherwise.
    pub fn name(&self) -> &DigestData {
        self.name.get_or_init(|| {
            let preview = self.builder.target_entities(&self.source_entities);

            let name_entities = if preview.is_empty() {
                &self.source_entities
            } else {
                &preview
            };

            let mut ids: Vec<EntityId> = name_entities.iter().map(|e| e.id()).collect();
            ids.sort();

            let mut dc = DigestComputer::new();
            dc.update(self.builder.name().as_bytes());

            for id in &ids {
                dc.update(id);
            }

            dc.finalize()
        })
    }

    /// The input fingerprint: a digest of the builder signature, the sorted
    /// dependency entities (id and signature each), and the source
    /// signatures. `None` as soon as any contributor is unsigned — a unit
    /// with unsignable inputs is never considered actual.
    pub fn signature(&self) -> Option<&DigestData> {
        self.signature
            .get_or_init(|| {
                let builder_signature = self.builder.signature()?;

                let mut dc = DigestComputer::new();
                dc.update(builder_signature);

                for dep in &self.dep_entities {
                    let sig = dep.signature()?;
                    dc.update(dep.id());
                    dc.update(sig);
                }

                for src in &self.source_entities {
                    let sig = src.signature()?;
                    dc.update(sig);
                }

                Some(dc.finalize())
            })
            .as_ref()
    }

    pub fn source_entities(&self) -> &[Entity] {
        &self.source_entities
    }

    pub fn dep_entities(&self) -> &[Entity] {
        &self.dep_entities
    }

    pub fn target_entities(&self) -> &[Entity] {
        &self.target_entities
    }

    pub fn itarget_entities(&self) -> &[Entity] {
        &self.itarget_entities
    }

    pub fn idep_entities(&self) -> &[Entity] {
        &self.idep_entities
    }

    pub fn idep_keys(&self) -> &[ValueKey] {
        &self.idep_keys
    }

    /// Register produced target entities.
    pub fn add_targets(&mut self, entities: impl IntoIterator<Item = Entity>) {
        self.target_entities.extend(entities);
    }

    /// Register produced target files, materialized through the builder's
    /// entity factory.
    pub fn add_target_files(&mut self, paths: &[&Path], tags: Option<&Tags>) {
        let builder = self.builder.clone();
        self.target_entities
            .extend(builder.make_file_entities(paths, tags));
    }

    /// Register side-effect outputs: things the build produces that are not
    /// consumer-visible targets.
    pub fn add_side_effects(&mut self, entities: impl IntoIterator<Item = Entity>) {
        self.itarget_entities.extend(entities);
    }

    pub fn add_side_effect_files(&mut self, paths: &[&Path], tags: Option<&Tags>) {
        let builder = self.builder.clone();
        self.itarget_entities
            .extend(builder.make_file_entities(paths, tags));
    }

    /// Register implicit dependencies discovered during the build (for
    /// example, included headers).
    pub fn add_dependencies(&mut self, entities: impl IntoIterator<Item = Entity>) {
        self.idep_entities.extend(entities);
    }

    pub fn add_dependency_files(&mut self, paths: &[&Path], tags: Option<&Tags>) {
        let builder = self.builder.clone();
        self.idep_entities
            .extend(builder.make_file_entities(paths, tags));
    }

    /// Decide whether the previously saved state of this unit can be reused.
    ///
    /// On success the saved targets, side effects, and refreshed implicit
    /// dependencies are adopted into this entity, so its outputs read as if
    /// it had just been built. On failure the lists are left empty and, if
    /// `explain` is set, a stale reason is posted to the event bus.
    pub fn check_actual(
        &mut self,
        vfile: &mut ValueFile,
        built_nodes: Option<&HashSet<DigestData>>,
        idep_cache: &mut ImplicitDepCache,
        explain: bool,
        events: &mut dyn EventBus,
    ) -> bool {
        self.target_entities.clear();
        self.itarget_entities.clear();
        self.idep_entities.clear();

        let mut reason = if explain {
            let label = self
                .builder
                .trace_args(&self.source_entities, &[], true)
                .build_str(true);
            Some(StaleReason::new(label, events))
        } else {
            None
        };

        let name = *self.name();

        if let Some(built) = built_nodes {
            if !built.contains(&name) {
                if let Some(r) = reason.as_mut() {
                    r.set_force_rebuild();
                }
                return false;
            }
        }

        let other = match vfile.find_entity_by_name(&name[..]) {
            Some(Entity::Node(rec)) => rec.clone(),
            _ => {
                if let Some(r) = reason.as_mut() {
                    r.set_new();
                }
                return false;
            }
        };

        let signature = match self.signature() {
            Some(sig) => *sig,
            None => {
                if let Some(r) = reason.as_mut() {
                    r.set_no_signature();
                }
                return false;
            }
        };

        if Some(&signature) != other.signature() {
            if let Some(r) = reason.as_mut() {
                r.set_signature_changed();
            }
            return false;
        }

        let mut ideps = Vec::new();

        if !check_ideps(
            vfile,
            other.idep_keys(),
            &mut ideps,
            idep_cache,
            &mut reason,
        ) {
            return false;
        }

        let targets = match other.target_entities() {
            Some(ts) => ts,
            None => {
                if let Some(r) = reason.as_mut() {
                    r.set_no_targets();
                }
                return false;
            }
        };

        for target in targets {
            if !target.is_actual() {
                if let Some(r) = reason.as_mut() {
                    r.set_target_changed(target.clone());
                }
                return false;
            }
        }

        self.target_entities = targets.to_vec();
        self.itarget_entities = other.itarget_entities().to_vec();
        self.idep_entities = ideps;

        true
    }

    /// Persist this unit's record.
    ///
    /// Every target must carry a signature; saving a record whose targets
    /// cannot be fingerprinted would poison later actuality checks, so it is
    /// a hard error and nothing is written.
    pub fn save(
        &mut self,
        vfile: &mut ValueFile,
        idep_cache: &ImplicitDepCache,
    ) -> Result<(), NodeError> {
        for target in &self.target_entities {
            if target.signature().is_none() {
                return Err(NodeError::UnactualEntity(target.name()));
            }
        }

        self.save_ideps(vfile, idep_cache)?;

        let record = NodeRecord {
            name: *self.name(),
            signature: self.signature().cloned(),
            target_entities: Some(self.target_entities.clone()),
            itarget_entities: self.itarget_entities.clone(),
            idep_keys: self.idep_keys.clone(),
        };

        vfile.add_entity(Entity::Node(record));
        Ok(())
    }

    /// Persist the implicit-dep entities, preferring the refreshed copies
    /// already in the per-build cache, and record their keys.
    fn save_ideps(
        &mut self,
        vfile: &mut ValueFile,
        idep_cache: &ImplicitDepCache,
    ) -> Result<(), NodeError> {
        let mut keys = Vec::with_capacity(self.idep_entities.len());
        let mut entities = Vec::with_capacity(self.idep_entities.len());
        let mut new_slots = Vec::new();
        let mut new_entities = Vec::new();

        for entity in &self.idep_entities {
            match idep_cache.get(&entity.id()) {
                Some((key, refreshed)) => {
                    keys.push(*key);
                    entities.push(refreshed.clone());
                }

                None => {
                    if entity.signature().is_none() {
                        return Err(NodeError::UnactualEntity(entity.name()));
                    }

                    // Another unit of this build may have persisted the very
                    // same dependency already; reuse its key so the stored
                    // records keep agreeing about shared dependencies.
                    let existing = vfile
                        .find_entity_key(entity)
                        .filter(|k| vfile.get_entity_by_key(*k) == Some(entity));

                    match existing {
                        Some(key) => {
                            keys.push(key);
                            entities.push(entity.clone());
                        }

                        None => {
                            new_slots.push(keys.len());
                            keys.push(ValueKey::UNASSIGNED);
                            entities.push(entity.clone());
                            new_entities.push(entity.clone());
                        }
                    }
                }
            }
        }

        let new_keys = vfile.add_entities(new_entities);

        for (slot, key) in new_slots.into_iter().zip(new_keys) {
            keys[slot] = key;
        }

        self.idep_entities = entities;
        self.idep_keys = keys;
        Ok(())
    }
}

/// Resolve the saved implicit-dep keys, refreshing stale entries in the
/// value-file as they are discovered. Returns false as soon as one
/// dependency turns out to have changed or disappeared.
fn check_ideps(
    vfile: &mut ValueFile,
    idep_keys: &[ValueKey],
    out: &mut Vec<Entity>,
    idep_cache: &mut ImplicitDepCache,
    reason: &mut Option<StaleReason>,
) -> bool {
    for key in idep_keys {
        let entity = match vfile.get_entity_by_key(*key) {
            Some(e) => e.clone(),
            None => {
                // The key went dead: another node already replaced this
                // dependency with a refreshed copy, or the store was
                // compacted away. Either way the dependency changed.
                if let Some(r) = reason.as_mut() {
                    r.set_implicit_dep_changed(None);
                }
                return false;
            }
        };

        let id = entity.id();

        if idep_cache.get(&id).is_none() {
            let actual = entity.get_actual();

            if actual == entity {
                idep_cache.insert(id, *key, entity.clone());
            } else {
                let new_key = vfile.replace_entity(*key, actual.clone());
                idep_cache.insert(id, new_key, actual);

                if let Some(r) = reason.as_mut() {
                    r.set_implicit_dep_changed(Some(entity));
                }
                return false;
            }
        }

        out.push(entity);
    }

    true
}

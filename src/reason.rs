// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Explanations for why a node is considered stale.
//!
//! Each actuality check that comes back negative can, on request, say why.
//! The reason is delivered to the event bus as it is discovered and never
//! affects control flow; it exists purely so that users can answer "why did
//! this rebuild?".

use serde::{Deserialize, Serialize};

use crate::{
    entity::Entity,
    events::{Event, EventBus},
};

/// The specific condition that made a node stale.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleCode {
    /// No staleness detected.
    Actual,

    /// The node's signature could not be computed; such a node is always
    /// rebuilt.
    NoSignature,

    /// No previous state for the node was found in the value-file.
    New,

    /// The node's signature differs from the saved one: sources, builder
    /// parameters, or dependencies changed.
    SignatureChanged,

    /// An implicit dependency discovered during an earlier build has changed
    /// or disappeared.
    ImplicitDepChanged,

    /// The saved record carries no targets.
    NoTargets,

    /// A saved target no longer matches its recorded signature.
    TargetChanged,

    /// The caller demanded a rebuild regardless of saved state.
    ForceRebuild,
}

/// A staleness explanation for one node.
pub struct StaleReason<'a> {
    label: String,
    code: StaleCode,
    entity: Option<Entity>,
    events: &'a mut dyn EventBus,
}

impl<'a> StaleReason<'a> {
    /// Create a reason tracker for a node, identified by its rendered build
    /// string.
    pub fn new(label: String, events: &'a mut dyn EventBus) -> Self {
        StaleReason {
            label,
            code: StaleCode::Actual,
            entity: None,
            events,
        }
    }

    pub fn code(&self) -> StaleCode {
        self.code
    }

    pub fn entity(&self) -> Option<&Entity> {
        self.entity.as_ref()
    }

    fn set(&mut self, code: StaleCode, entity: Option<Entity>) {
        self.code = code;
        self.entity = entity;

        self.events.post(Event::NodeStaleReason {
            code,
            description: self.description(true),
        });
    }

    pub fn set_no_signature(&mut self) {
        self.set(StaleCode::NoSignature, None);
    }

    pub fn set_new(&mut self) {
        self.set(StaleCode::New, None);
    }

    pub fn set_signature_changed(&mut self) {
        self.set(StaleCode::SignatureChanged, None);
    }

    pub fn set_implicit_dep_changed(&mut self, entity: Option<Entity>) {
        self.set(StaleCode::ImplicitDepChanged, entity);
    }

    pub fn set_no_targets(&mut self) {
        self.set(StaleCode::NoTargets, None);
    }

    pub fn set_target_changed(&mut self, entity: Entity) {
        self.set(StaleCode::TargetChanged, Some(entity));
    }

    pub fn set_force_rebuild(&mut self) {
        self.set(StaleCode::ForceRebuild, None);
    }

    /// A human-readable account of this reason.
    pub fn description(&self, _brief: bool) -> String {
        match self.code {
            StaleCode::NoSignature => format!(
                "node has no signature and is always rebuilt: {}",
                self.label
            ),

            StaleCode::New => format!(
                "no previous state has been found, building the new node: {}",
                self.label
            ),

            StaleCode::SignatureChanged => format!(
                "node signature has changed (sources, builder parameters or dependencies), rebuilding: {}",
                self.label
            ),

            StaleCode::ImplicitDepChanged => {
                let dep = self
                    .entity
                    .as_ref()
                    .map(|e| format!("`{}` ", e.name()))
                    .unwrap_or_default();
                format!(
                    "implicit dependency {}has changed, rebuilding: {}",
                    dep, self.label
                )
            }

            StaleCode::NoTargets => format!(
                "node targets were not previously stored, rebuilding: {}",
                self.label
            ),

            StaleCode::TargetChanged => {
                let target = self
                    .entity
                    .as_ref()
                    .map(|e| e.name())
                    .unwrap_or_default();
                format!(
                    "node target `{}` has changed, rebuilding: {}",
                    target, self.label
                )
            }

            StaleCode::ForceRebuild => format!("forced rebuild: {}", self.label),

            StaleCode::Actual => format!("node is up to date: {}", self.label),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SimpleEntity;
    use crate::events::NoopEventBus;

    #[test]
    fn descriptions_mention_the_offender() {
        let mut events = NoopEventBus;
        let mut reason = StaleReason::new("cc << a.c >> a.o".to_owned(), &mut events);

        assert!(reason.code() == StaleCode::Actual);

        reason.set_target_changed(Entity::from(SimpleEntity::text("a.o")));
        assert!(reason.code() == StaleCode::TargetChanged);
        let d = reason.description(true);
        assert!(d.contains("a.o"));
        assert!(d.contains("cc << a.c >> a.o"));

        reason.set_implicit_dep_changed(None);
        assert!(reason.description(true).contains("implicit dependency"));
    }
}

// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! Events that describe the progress of build operations.
//!
//! These are surfaced to whatever logging collaborator the caller plugs in.
//! The core posts events and moves on; nothing it does depends on how, or
//! whether, they are rendered.

use tectonic_errors::Error;
use tectonic_status_base::{tt_error, tt_note, tt_warning, StatusBackend};

use crate::reason::StaleCode;

/// A trait for types that can receive build events.
pub trait EventBus {
    fn post(&mut self, event: Event);

    fn error(&mut self, message: &dyn ToString, err: Option<&Error>) {
        self.post(Event::Error(AlertMessage::new(message, err)));
    }

    fn warning(&mut self, message: &dyn ToString, err: Option<&Error>) {
        self.post(Event::Warning(AlertMessage::new(message, err)));
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// A build has started.
    BuildStarted { total_nodes: usize },

    /// A build has completed. Maybe successfully, maybe not.
    BuildComplete { success: bool, elapsed: f32 },

    /// A node has been handed to a worker for building.
    NodeBuilding { node: String },

    /// A node's build has finished. `output` is whatever the builder chose to
    /// report; `done` and `total` describe overall progress.
    NodeBuildingFinished {
        node: String,
        output: String,
        done: usize,
        total: usize,
    },

    /// An actuality check decided a node must be rebuilt, and explanations
    /// were requested.
    NodeStaleReason {
        code: StaleCode,
        description: String,
    },

    /// A notable event has been encountered during the build.
    Note(AlertMessage),

    /// A warning has been encountered during the build.
    Warning(AlertMessage),

    /// An error has been encountered during the build.
    Error(AlertMessage),
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub struct AlertMessage {
    /// The essential message
    pub message: String,

    /// Additional contextual information, advice, etc.
    pub context: Vec<String>,
}

impl AlertMessage {
    pub fn new(message: &dyn ToString, err: Option<&Error>) -> Self {
        let mut alert = AlertMessage {
            message: message.to_string(),
            context: Default::default(),
        };

        if let Some(e) = err {
            for item in e.chain() {
                alert.context.push(item.to_string());
            }
        }

        alert
    }
}

/// An event bus that renders events onto a status backend, fitting for CLI
/// usage.
pub struct StatusEventBus<'a> {
    status: &'a mut dyn StatusBackend,
}

impl<'a> StatusEventBus<'a> {
    pub fn new(status: &'a mut dyn StatusBackend) -> Self {
        StatusEventBus { status }
    }
}

impl<'a> EventBus for StatusEventBus<'a> {
    fn post(&mut self, event: Event) {
        match event {
            Event::BuildComplete { elapsed, .. } => {
                tt_note!(self.status, "full build took {:.1} seconds", elapsed);
            }

            Event::NodeBuilding { node } => {
                tt_note!(self.status, "building {}", node);
            }

            Event::NodeBuildingFinished {
                node, done, total, ..
            } => {
                tt_note!(self.status, "[{}/{}] finished {}", done, total, node);
            }

            Event::NodeStaleReason { description, .. } => {
                tt_note!(self.status, "{}", description);
            }

            Event::Error(d) => {
                tt_error!(self.status, "{}", d.message);

                for c in &d.context[..] {
                    tt_error!(self.status, "  {}", c);
                }
            }

            Event::Warning(d) => {
                tt_warning!(self.status, "{}", d.message);

                for c in &d.context[..] {
                    tt_warning!(self.status, "  {}", c);
                }
            }

            Event::Note(d) => {
                tt_note!(self.status, "{}", d.message);

                for c in &d.context[..] {
                    tt_note!(self.status, "  {}", c);
                }
            }

            _ => {}
        }
    }
}

/// An event bus that drops everything on the floor.
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn post(&mut self, _event: Event) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// An event bus that remembers everything, for assertions.
    #[derive(Default)]
    pub struct RecordingBus {
        pub events: Vec<Event>,
    }

    impl RecordingBus {
        pub fn codes(&self) -> Vec<StaleCode> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    Event::NodeStaleReason { code, .. } => Some(*code),
                    _ => None,
                })
                .collect()
        }
    }

    impl EventBus for RecordingBus {
        fn post(&mut self, event: Event) {
            self.events.push(event);
        }
    }
}

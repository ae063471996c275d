// Copyright 2023 the Tectonic Project
// Licensed under the MIT License

//! The build manager: DAG traversal, worker dispatch, and persistence.
//!
//! A single controller thread owns the node graph, the value-file, and the
//! implicit-dependency cache. Everything that touches shared state —
//! initiation, splitting, actuality checks, saving — happens on the
//! controller. The only work that leaves the controller is the builder's
//! `build`/`build_batch` call itself, which runs on a bounded thread pool
//! and sends its results back over a channel.
//!
//! A node is handed to the pool only after every node it draws sources or
//! dependencies from has been populated, either by being found actual or by
//! being built. On the first failure the controller stops scheduling and
//! drains outstanding workers (their completed work is still saved); with
//! "keep going" it instead marks the failed subtree as skipped and continues
//! with the independent remainder.

use std::{
    collections::HashMap,
    sync::mpsc::{channel, Receiver, RecvTimeoutError},
    time::Instant,
};
use tectonic_errors::prelude::*;
use threadpool::ThreadPool;

use crate::{
    builder::{BatchTargets, Builder},
    entity::Entity,
    events::{Event, EventBus},
    node::{NodeGraph, NodeId},
    node_entity::{ImplicitDepCache, NodeEntity},
    vfile::ValueFile,
    DigestData,
};

/// Knobs for one build run.
pub struct BuildOptions {
    /// The number of worker threads.
    pub jobs: usize,

    /// Keep building independent subtrees after a failure.
    pub keep_going: bool,

    /// Post a stale reason for every node that is rebuilt.
    pub explain: bool,

    /// When given, any node whose name is absent from this set is rebuilt
    /// unconditionally.
    pub built_nodes: Option<std::collections::HashSet<DigestData>>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            jobs: num_cpus::get(),
            keep_going: false,
            explain: false,
            built_nodes: None,
        }
    }
}

/// What happened during one build run.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// How many nodes were actually built.
    pub built: usize,

    /// How many nodes were found actual and reused.
    pub up_to_date: usize,

    /// The nodes that failed, with rendered error messages.
    pub failed: Vec<(NodeId, String)>,

    /// The nodes that were skipped because something they depend on failed.
    pub skipped: Vec<NodeId>,
}

impl BuildReport {
    /// True iff no node failed. This is what the process exit code should
    /// reflect.
    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum NodeState {
    /// Not all prerequisites are populated yet.
    Waiting,

    /// A worker is building this node.
    Running,

    /// This node was split; the given number of siblings are still pending.
    AwaitingSiblings(usize),

    /// Terminal: found actual, targets reused.
    UpToDate,

    /// Terminal: built and saved.
    Built,

    /// Terminal: failed.
    Failed,

    /// Terminal: not attempted because a prerequisite failed.
    Skipped,
}

impl NodeState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::UpToDate | NodeState::Built | NodeState::Failed | NodeState::Skipped
        )
    }

    fn is_populated(&self) -> bool {
        matches!(self, NodeState::UpToDate | NodeState::Built)
    }
}

/// The payload handed to a worker thread.
struct Job {
    id: NodeId,
    label: String,
    builder: std::sync::Arc<dyn Builder>,
    sources: Vec<Entity>,
    units: Vec<NodeEntity>,
    batch: bool,
    deadline: Option<Instant>,
}

/// What a worker sends back.
struct Reply {
    id: NodeId,
    label: String,
    result: Result<(Vec<NodeEntity>, String)>,
}

/// The outcome of pushing one node through its controller-side steps.
enum Advance {
    /// The builder discovered new dependency nodes; wait for them.
    Deferred,

    /// The node's saved state is reusable.
    UpToDate,

    /// The node was split; these siblings carry the stale work.
    Siblings(Vec<NodeId>),

    /// The node is stale; hand this job to a worker.
    Dispatch(Box<Job>),
}

fn execute_job(
    builder: std::sync::Arc<dyn Builder>,
    sources: Vec<Entity>,
    mut units: Vec<NodeEntity>,
    batch: bool,
) -> Result<(Vec<NodeEntity>, String)> {
    ensure!(!units.is_empty(), "build dispatched with no build units");

    let output = if batch {
        let mut targets = BatchTargets::new(&sources, &mut units);
        builder.build_batch(&sources, &mut targets)?
    } else {
        builder.build(&sources, &mut units[0])?
    };

    Ok((units, output))
}

/// The incremental build driver.
pub struct BuildManager {
    graph: NodeGraph,
    vfile: ValueFile,
    options: BuildOptions,
    idep_cache: ImplicitDepCache,
}

impl BuildManager {
    pub fn new(graph: NodeGraph, vfile: ValueFile, options: BuildOptions) -> Self {
        BuildManager {
            graph,
            vfile,
            options,
            idep_cache: ImplicitDepCache::new(),
        }
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn value_file(&self) -> &ValueFile {
        &self.vfile
    }

    /// Run the build to completion.
    ///
    /// Returns an error only for environmental problems (a cycle in the
    /// graph, an unwritable value-file); failures of individual nodes land
    /// in the report instead.
    pub fn build(&mut self, events: &mut dyn EventBus) -> Result<BuildReport> {
        let t0 = Instant::now();

        // The implicit-dep memo must not leak between builds.
        self.idep_cache.clear();

        self.check_cycles()?;

        let jobs = self.options.jobs.max(1);
        let pool = ThreadPool::new(jobs);
        let (tx, rx) = channel::<Reply>();

        let mut states: Vec<NodeState> = vec![NodeState::Waiting; self.graph.len()];
        let mut deadlines: HashMap<NodeId, Instant> = HashMap::new();
        let mut report = BuildReport::default();
        let mut running = 0usize;
        let mut stop_scheduling = false;

        events.post(Event::BuildStarted {
            total_nodes: self.graph.len(),
        });

        loop {
            // Scheduling sweep: advance every node whose prerequisites are
            // populated, repeating until the frontier stops moving.
            loop {
                while states.len() < self.graph.len() {
                    states.push(NodeState::Waiting);
                }

                let mut progressed = false;

                for idx in 0..states.len() {
                    if states[idx] != NodeState::Waiting {
                        continue;
                    }

                    let prereqs = self.graph.prerequisites(NodeId(idx));

                    if prereqs
                        .iter()
                        .any(|p| matches!(states[p.0], NodeState::Failed | NodeState::Skipped))
                    {
                        states[idx] = NodeState::Skipped;
                        report.skipped.push(NodeId(idx));
                        progressed = true;
                    }
                }

                let mut runnable = Vec::new();

                if !stop_scheduling {
                    for idx in 0..states.len() {
                        if states[idx] != NodeState::Waiting {
                            continue;
                        }

                        let prereqs = self.graph.prerequisites(NodeId(idx));

                        if prereqs.iter().all(|p| states[p.0].is_populated()) {
                            let node = self.graph.node(NodeId(idx));
                            let weight = node.builder().weight(node.source_entities());
                            runnable.push((weight, NodeId(idx)));
                        }
                    }
                }

                // Heavier nodes first; ties by id for determinism.
                runnable.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

                for (_, id) in runnable {
                    if stop_scheduling {
                        break;
                    }

                    progressed = true;

                    match self.advance(id, events) {
                        Ok(Advance::Deferred) => {
                            // New dependencies may have introduced a cycle
                            // that the up-front check could not see.
                            if let Err(e) = self.check_cycles() {
                                self.fail_node(
                                    id,
                                    &e,
                                    &mut states,
                                    &mut report,
                                    events,
                                    &mut stop_scheduling,
                                );
                            }
                        }

                        Ok(Advance::UpToDate) => {
                            states[id.0] = NodeState::UpToDate;
                            report.up_to_date += 1;
                        }

                        Ok(Advance::Siblings(siblings)) => {
                            states[id.0] = NodeState::AwaitingSiblings(siblings.len());
                        }

                        Ok(Advance::Dispatch(job)) => {
                            states[id.0] = NodeState::Running;
                            running += 1;

                            if let Some(deadline) = job.deadline {
                                deadlines.insert(id, deadline);
                            }

                            events.post(Event::NodeBuilding {
                                node: job.label.clone(),
                            });

                            let tx = tx.clone();
                            pool.execute(move || {
                                let job = *job;
                                let result =
                                    execute_job(job.builder, job.sources, job.units, job.batch);
                                // The receiver only goes away once every
                                // reply has been drained.
                                let _ = tx.send(Reply {
                                    id: job.id,
                                    label: job.label,
                                    result,
                                });
                            });
                        }

                        Err(e) => {
                            self.fail_node(
                                id,
                                &e,
                                &mut states,
                                &mut report,
                                events,
                                &mut stop_scheduling,
                            );
                        }
                    }
                }

                if !progressed {
                    break;
                }
            }

            if running == 0 {
                if states.iter().all(|s| s.is_terminal()) {
                    break;
                }

                if stop_scheduling {
                    // Fail-fast left part of the graph unattempted.
                    for idx in 0..states.len() {
                        if !states[idx].is_terminal() {
                            states[idx] = NodeState::Skipped;
                            report.skipped.push(NodeId(idx));
                        }
                    }
                    break;
                }

                bail!(
                    "build scheduler stalled with {} unfinished nodes",
                    states.iter().filter(|s| !s.is_terminal()).count()
                );
            }

            match self.wait_for_reply(&rx, &deadlines) {
                Some(reply) => {
                    self.handle_reply(
                        reply,
                        &mut states,
                        &mut deadlines,
                        &mut report,
                        events,
                        &mut running,
                        &mut stop_scheduling,
                    );
                }

                None => {
                    self.expire_deadlines(
                        &mut states,
                        &mut deadlines,
                        &mut report,
                        events,
                        &mut running,
                        &mut stop_scheduling,
                    );
                }
            }
        }

        atry!(
            self.vfile.flush();
            ["failed to write the value-file"]
        );

        events.post(Event::BuildComplete {
            success: report.success(),
            elapsed: t0.elapsed().as_secs_f32(),
        });

        Ok(report)
    }

    /// Push one ready node through its controller-side lifecycle steps.
    fn advance(&mut self, id: NodeId, events: &mut dyn EventBus) -> Result<Advance> {
        self.graph.initiate(id)?;

        let new_deps = self.graph.build_depends(id)?;
        if !new_deps.is_empty() {
            return Ok(Advance::Deferred);
        }

        if self.graph.build_replace(id)? {
            // Substituted sources must be materialized before splitting.
            self.graph.initiate(id)?;
        }

        let siblings = self.graph.build_split(
            id,
            &mut self.vfile,
            &mut self.idep_cache,
            self.options.built_nodes.as_ref(),
            self.options.explain,
            events,
        )?;

        if !siblings.is_empty() {
            return Ok(Advance::Siblings(siblings));
        }

        if self.graph.node(id).is_actual() {
            self.graph.node_mut(id).populate();
            return Ok(Advance::UpToDate);
        }

        let node = self.graph.node(id);

        Ok(Advance::Dispatch(Box::new(Job {
            id,
            label: node.build_str(true),
            builder: node.builder().clone(),
            sources: node.source_entities().to_vec(),
            units: node.node_entities.clone(),
            batch: node.batch,
            deadline: node.builder().timeout().map(|d| Instant::now() + d),
        })))
    }

    fn wait_for_reply(
        &self,
        rx: &Receiver<Reply>,
        deadlines: &HashMap<NodeId, Instant>,
    ) -> Option<Reply> {
        match deadlines.values().min() {
            None => rx.recv().ok(),

            Some(next) => {
                let now = Instant::now();

                if *next <= now {
                    return None;
                }

                match rx.recv_timeout(*next - now) {
                    Ok(reply) => Some(reply),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => None,
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_reply(
        &mut self,
        reply: Reply,
        states: &mut Vec<NodeState>,
        deadlines: &mut HashMap<NodeId, Instant>,
        report: &mut BuildReport,
        events: &mut dyn EventBus,
        running: &mut usize,
        stop_scheduling: &mut bool,
    ) {
        let id = reply.id;
        deadlines.remove(&id);

        if states[id.0] != NodeState::Running {
            // The node was already failed (a timeout expired); the late
            // result is discarded, not saved.
            return;
        }

        *running -= 1;

        let (units, output) = match reply.result {
            Ok(tup) => tup,

            Err(e) => {
                let err: Error = crate::errors::NodeError::BuildFailure {
                    node: reply.label,
                    message: e.to_string(),
                }
                .into();
                self.fail_node(id, &err, states, report, events, stop_scheduling);
                self.skip_split_parent(id, states, report);
                return;
            }
        };

        // Persist before anything can observe the targets. A record that
        // cannot be saved fails the node and is not written at all.
        let mut units = units;

        for unit in units.iter_mut() {
            if let Err(e) = unit.save(&mut self.vfile, &self.idep_cache) {
                self.fail_node(id, &e.into(), states, report, events, stop_scheduling);
                self.skip_split_parent(id, states, report);
                return;
            }
        }

        self.graph.finish_build(id, units);
        states[id.0] = NodeState::Built;
        report.built += 1;

        let done = states.iter().filter(|s| s.is_terminal()).count();
        events.post(Event::NodeBuildingFinished {
            node: reply.label,
            output,
            done,
            total: states.len(),
        });

        // A split sibling writes its finished units back into its parent;
        // the parent is populated once its last sibling lands.
        if let Some(parent) = self.graph.adopt_sibling_results(id) {
            if let NodeState::AwaitingSiblings(pending) = states[parent.0] {
                if pending <= 1 {
                    self.graph.node_mut(parent).populate();
                    states[parent.0] = NodeState::Built;
                } else {
                    states[parent.0] = NodeState::AwaitingSiblings(pending - 1);
                }
            }
        }
    }

    fn expire_deadlines(
        &mut self,
        states: &mut [NodeState],
        deadlines: &mut HashMap<NodeId, Instant>,
        report: &mut BuildReport,
        events: &mut dyn EventBus,
        running: &mut usize,
        stop_scheduling: &mut bool,
    ) {
        let now = Instant::now();
        let expired: Vec<NodeId> = deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            deadlines.remove(&id);

            if states[id.0] != NodeState::Running {
                continue;
            }

            // The worker cannot be interrupted; it keeps its pool slot until
            // it returns, and its eventual result is discarded.
            *running -= 1;

            let node = self.graph.node(id);
            let seconds = node
                .builder()
                .timeout()
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            let err: Error = crate::errors::NodeError::BuildTimeout {
                node: node.build_str(true),
                seconds,
            }
            .into();

            self.fail_node(id, &err, states, report, events, stop_scheduling);
            self.skip_split_parent(id, states, report);
        }
    }

    fn fail_node(
        &mut self,
        id: NodeId,
        error: &Error,
        states: &mut [NodeState],
        report: &mut BuildReport,
        events: &mut dyn EventBus,
        stop_scheduling: &mut bool,
    ) {
        states[id.0] = NodeState::Failed;
        report.failed.push((id, error.to_string()));
        events.error(
            &format!("build of `{}` failed", self.graph.node(id).build_str(true)),
            Some(error),
        );

        if !self.options.keep_going {
            *stop_scheduling = true;
        }
    }

    /// A failed split sibling dooms the node it was split from: the parent
    /// can never be populated, so it and its dependents are skipped.
    fn skip_split_parent(
        &mut self,
        id: NodeId,
        states: &mut [NodeState],
        report: &mut BuildReport,
    ) {
        if let Some(origin) = self.graph.node(id).split_origin.as_ref() {
            let parent = origin.parent;

            if !states[parent.0].is_terminal() {
                states[parent.0] = NodeState::Skipped;
                report.skipped.push(parent);
            }
        }
    }

    fn check_cycles(&self) -> Result<()> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        fn visit(graph: &NodeGraph, idx: usize, color: &mut [u8]) -> Result<()> {
            color[idx] = GRAY;

            for p in graph.prerequisites(NodeId(idx)) {
                match color[p.0] {
                    GRAY => {
                        return Err(crate::errors::NodeError::Cycle(
                            graph.node(p).build_str(true),
                        )
                        .into());
                    }
                    WHITE => visit(graph, p.0, color)?,
                    _ => {}
                }
            }

            color[idx] = BLACK;
            Ok(())
        }

        let mut color = vec![WHITE; self.graph.len()];

        for idx in 0..self.graph.len() {
            if color[idx] == WHITE {
                visit(&self.graph, idx, &mut color)?;
            }
        }

        Ok(())
    }

    /// Prerequisites-first ordering of the whole graph.
    fn topo_order(&self) -> Vec<NodeId> {
        fn visit(graph: &NodeGraph, idx: usize, seen: &mut [bool], out: &mut Vec<NodeId>) {
            seen[idx] = true;

            for p in graph.prerequisites(NodeId(idx)) {
                if !seen[p.0] {
                    visit(graph, p.0, seen, out);
                }
            }

            out.push(NodeId(idx));
        }

        let mut seen = vec![false; self.graph.len()];
        let mut out = Vec::with_capacity(self.graph.len());

        for idx in 0..self.graph.len() {
            if !seen[idx] {
                visit(&self.graph, idx, &mut seen, &mut out);
            }
        }

        out
    }

    /// The destructive inverse of a build: delete every node's persisted
    /// targets and drop their records from the value-file.
    ///
    /// Builder failures while deleting are logged and otherwise ignored;
    /// cleaning should get as far as it can.
    pub fn clean(&mut self, events: &mut dyn EventBus) -> Result<()> {
        self.check_cycles()?;

        for id in self.topo_order() {
            let keys = self.graph.clear(id, &self.vfile)?;

            let node = self.graph.node(id);
            let builder = node.builder().clone();
            let targets: Vec<Entity> = node.target_entities.clone();
            let label = node.build_str(true);

            if let Err(e) = builder.clear(&targets) {
                events.warning(&format!("failed to remove targets of `{}`", label), Some(&e));
            }

            for key in keys {
                self.vfile.remove_key(key);
            }
        }

        atry!(
            self.vfile.flush();
            ["failed to write the value-file"]
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{digest_of, FileEntity, SignaturePolicy};
    use crate::events::{testing::RecordingBus, NoopEventBus};
    use crate::node::Source;
    use crate::reason::StaleCode;
    use std::{
        collections::HashSet,
        fs,
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Duration,
    };
    use tectonic_status_base::NoopStatusBackend;
    use tempfile::TempDir;

    /// A builder that copies each source file into an output directory,
    /// counting its invocations so tests can assert how much work ran.
    struct CopyBuilder {
        label: String,
        version: u8,
        out_dir: PathBuf,
        calls: Arc<AtomicUsize>,
        batch_calls: Arc<AtomicUsize>,
        last_batch_size: Arc<AtomicUsize>,
        per_source_split: bool,
        batch: bool,
        ideps: Vec<PathBuf>,
    }

    fn copy_builder(out_dir: &Path, calls: &Arc<AtomicUsize>) -> CopyBuilder {
        CopyBuilder {
            label: "copy".to_owned(),
            version: 1,
            out_dir: out_dir.to_path_buf(),
            calls: calls.clone(),
            batch_calls: Arc::new(AtomicUsize::new(0)),
            last_batch_size: Arc::new(AtomicUsize::new(0)),
            per_source_split: false,
            batch: false,
            ideps: Vec::new(),
        }
    }

    impl CopyBuilder {
        fn out_path(&self, src: &Entity) -> PathBuf {
            let mut name = Path::new(src.value_str().unwrap())
                .file_name()
                .unwrap()
                .to_os_string();
            name.push(".out");
            self.out_dir.join(name)
        }

        fn copy_one(&self, src: &Entity, out: &mut NodeEntity) -> Result<()> {
            let data = fs::read(src.value_str().unwrap())?;
            let dst = self.out_path(src);
            fs::write(&dst, data)?;
            out.add_target_files(&[dst.as_path()], None);
            Ok(())
        }
    }

    impl Builder for CopyBuilder {
        fn name(&self) -> &str {
            &self.label
        }

        fn signature(&self) -> Option<DigestData> {
            Some(digest_of(&[self.version]))
        }

        fn target_entities(&self, sources: &[Entity]) -> Vec<Entity> {
            sources
                .iter()
                .filter(|s| s.value_str().is_some())
                .map(|s| Entity::from(FileEntity::new(self.out_path(s), SignaturePolicy::Checksum)))
                .collect()
        }

        fn split(&self, sources: &[Entity]) -> Vec<Vec<Entity>> {
            if self.batch {
                vec![sources.to_vec()]
            } else if self.per_source_split {
                sources.iter().map(|s| vec![s.clone()]).collect()
            } else {
                Vec::new()
            }
        }

        fn is_batch(&self) -> bool {
            self.batch
        }

        fn build(&self, sources: &[Entity], out: &mut NodeEntity) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            for src in sources {
                self.copy_one(src, out)?;
            }

            for idep in &self.ideps {
                out.add_dependency_files(&[idep.as_path()], None);
            }

            Ok(format!("copied {} sources", sources.len()))
        }

        fn build_batch(&self, sources: &[Entity], targets: &mut BatchTargets<'_>) -> Result<String> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            self.last_batch_size.store(sources.len(), Ordering::SeqCst);

            for src in sources {
                let unit = targets.get_mut(src)?;
                self.copy_one(src, unit)?;
            }

            Ok(format!("batched {} sources", sources.len()))
        }
    }

    struct FailBuilder;

    impl Builder for FailBuilder {
        fn name(&self) -> &str {
            "doomed"
        }

        fn signature(&self) -> Option<DigestData> {
            Some(digest_of(b"doomed-v1"))
        }

        fn build(&self, _sources: &[Entity], _out: &mut NodeEntity) -> Result<String> {
            bail!("deliberate failure");
        }
    }

    struct SleepBuilder;

    impl Builder for SleepBuilder {
        fn name(&self) -> &str {
            "sleepy"
        }

        fn signature(&self) -> Option<DigestData> {
            Some(digest_of(b"sleepy-v1"))
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(30))
        }

        fn build(&self, _sources: &[Entity], _out: &mut NodeEntity) -> Result<String> {
            thread::sleep(Duration::from_millis(300));
            Ok(String::new())
        }
    }

    /// Substitutes its sources with one fixed real file, like a
    /// response-file expansion would.
    struct ReplacingBuilder {
        inner: CopyBuilder,
        real: PathBuf,
    }

    impl Builder for ReplacingBuilder {
        fn name(&self) -> &str {
            "expand"
        }

        fn signature(&self) -> Option<DigestData> {
            self.inner.signature()
        }

        fn target_entities(&self, sources: &[Entity]) -> Vec<Entity> {
            self.inner.target_entities(sources)
        }

        fn replace(&self, _sources: &[Entity]) -> Option<Vec<Source>> {
            Some(vec![Source::Path(self.real.clone())])
        }

        fn build(&self, sources: &[Entity], out: &mut NodeEntity) -> Result<String> {
            self.inner.build(sources, out)
        }
    }

    /// Reports one extra dependency node from `depends`.
    struct DependsBuilder {
        inner: CopyBuilder,
        extra: NodeId,
    }

    impl Builder for DependsBuilder {
        fn name(&self) -> &str {
            "depcopy"
        }

        fn signature(&self) -> Option<DigestData> {
            self.inner.signature()
        }

        fn target_entities(&self, sources: &[Entity]) -> Vec<Entity> {
            self.inner.target_entities(sources)
        }

        fn depends(&self, _sources: &[Entity]) -> Result<Vec<Source>> {
            Ok(vec![Source::Node(self.extra)])
        }

        fn build(&self, sources: &[Entity], out: &mut NodeEntity) -> Result<String> {
            self.inner.build(sources, out)
        }
    }

    fn open_vfile(path: &Path) -> ValueFile {
        let mut status = NoopStatusBackend::default();
        ValueFile::open(path, &mut status).unwrap()
    }

    fn options(explain: bool) -> BuildOptions {
        BuildOptions {
            jobs: 2,
            explain,
            ..Default::default()
        }
    }

    fn run(graph: NodeGraph, vfile_path: &Path) -> (BuildReport, BuildManager) {
        let mut mgr = BuildManager::new(graph, open_vfile(vfile_path), options(false));
        let mut events = NoopEventBus;
        let report = mgr.build(&mut events).unwrap();
        (report, mgr)
    }

    fn run_explained(
        graph: NodeGraph,
        vfile_path: &Path,
    ) -> (BuildReport, BuildManager, RecordingBus) {
        let mut mgr = BuildManager::new(graph, open_vfile(vfile_path), options(true));
        let mut events = RecordingBus::default();
        let report = mgr.build(&mut events).unwrap();
        (report, mgr, events)
    }

    struct Scratch {
        dir: TempDir,
        out_dir: PathBuf,
        vfile_path: PathBuf,
    }

    fn scratch() -> Scratch {
        let dir = TempDir::new().unwrap();
        let out_dir = dir.path().join("out");
        fs::create_dir_all(&out_dir).unwrap();
        let vfile_path = dir.path().join("values.dat");

        Scratch {
            dir,
            out_dir,
            vfile_path,
        }
    }

    #[test]
    fn fresh_build_then_reuse_then_mutation() {
        let s = scratch();
        let src = s.dir.path().join("foo.txt");
        fs::write(&src, "hello").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let make_graph = || {
            let mut graph = NodeGraph::new();
            graph.add_node_in(
                Arc::new(copy_builder(&s.out_dir, &calls)),
                vec![Source::Path(src.clone())],
                s.dir.path().to_path_buf(),
            );
            graph
        };

        // First run: nothing saved yet, so the node is new and builds once.
        let (report, _, bus) = run_explained(make_graph(), &s.vfile_path);
        assert!(report.success());
        assert!(report.built == 1);
        assert!(calls.load(Ordering::SeqCst) == 1);
        assert!(bus.codes().contains(&StaleCode::New));
        assert!(fs::read(s.out_dir.join("foo.txt.out")).unwrap() == b"hello");

        // Second run, nothing changed: zero build calls.
        let (report, mgr) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 0);
        assert!(report.up_to_date == 1);
        assert!(calls.load(Ordering::SeqCst) == 1);
        assert!(
            mgr.graph().node(NodeId(0)).target_entities().unwrap().len() == 1
        );

        // Mutate the source: exactly one rebuild, for the right reason.
        fs::write(&src, "world").unwrap();
        let (report, _, bus) = run_explained(make_graph(), &s.vfile_path);
        assert!(report.built == 1);
        assert!(calls.load(Ordering::SeqCst) == 2);
        assert!(bus.codes().contains(&StaleCode::SignatureChanged));
        assert!(fs::read(s.out_dir.join("foo.txt.out")).unwrap() == b"world");
    }

    #[test]
    fn implicit_dep_mutation_triggers_rebuild() {
        let s = scratch();
        let src = s.dir.path().join("main.c");
        let hdr = s.dir.path().join("bar.h");
        fs::write(&src, "int main() {}").unwrap();
        fs::write(&hdr, "#define BAR 1").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let make_graph = || {
            let mut builder = copy_builder(&s.out_dir, &calls);
            builder.ideps = vec![hdr.clone()];

            let mut graph = NodeGraph::new();
            graph.add_node_in(
                Arc::new(builder),
                vec![Source::Path(src.clone())],
                s.dir.path().to_path_buf(),
            );
            graph
        };

        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 1);

        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 0 && report.up_to_date == 1);

        fs::write(&hdr, "#define BAR 2").unwrap();

        let (report, _, bus) = run_explained(make_graph(), &s.vfile_path);
        assert!(report.built == 1);
        assert!(calls.load(Ordering::SeqCst) == 2);
        assert!(bus.codes().contains(&StaleCode::ImplicitDepChanged));
    }

    #[test]
    fn deleted_target_triggers_rebuild() {
        let s = scratch();
        let src = s.dir.path().join("foo.txt");
        fs::write(&src, "hello").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let make_graph = || {
            let mut graph = NodeGraph::new();
            graph.add_node_in(
                Arc::new(copy_builder(&s.out_dir, &calls)),
                vec![Source::Path(src.clone())],
                s.dir.path().to_path_buf(),
            );
            graph
        };

        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 1);

        fs::remove_file(s.out_dir.join("foo.txt.out")).unwrap();

        let (report, _, bus) = run_explained(make_graph(), &s.vfile_path);
        assert!(report.built == 1);
        assert!(calls.load(Ordering::SeqCst) == 2);
        assert!(bus.codes().contains(&StaleCode::TargetChanged));
    }

    #[test]
    fn split_rebuilds_only_touched_groups() {
        let s = scratch();

        let names = ["a.txt", "b.txt", "c.txt"];
        for name in &names {
            fs::write(s.dir.path().join(name), *name).unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let make_graph = || {
            let mut builder = copy_builder(&s.out_dir, &calls);
            builder.per_source_split = true;

            let sources = names
                .iter()
                .map(|n| Source::Path(s.dir.path().join(n)))
                .collect();

            let mut graph = NodeGraph::new();
            graph.add_node_in(Arc::new(builder), sources, s.dir.path().to_path_buf());
            graph
        };

        // Three groups, three builds; the splitting node aggregates all of
        // the group targets.
        let (report, mgr) = run(make_graph(), &s.vfile_path);
        assert!(report.success());
        assert!(report.built == 3);
        assert!(calls.load(Ordering::SeqCst) == 3);
        assert!(
            mgr.graph().node(NodeId(0)).target_entities().unwrap().len() == 3
        );

        // Touch only one source: exactly one more build call.
        fs::write(s.dir.path().join("b.txt"), "B CHANGED").unwrap();

        let (report, mgr) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 1);
        assert!(calls.load(Ordering::SeqCst) == 4);
        assert!(
            mgr.graph().node(NodeId(0)).target_entities().unwrap().len() == 3
        );
        assert!(fs::read(s.out_dir.join("b.txt.out")).unwrap() == b"B CHANGED");
    }

    #[test]
    fn batch_bundles_stale_sources_into_one_invocation() {
        let s = scratch();

        let names = ["a.txt", "b.txt", "c.txt"];
        for name in &names {
            fs::write(s.dir.path().join(name), *name).unwrap();
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let batch_calls = Arc::new(AtomicUsize::new(0));
        let last_batch_size = Arc::new(AtomicUsize::new(0));

        let make_graph = || {
            let mut builder = copy_builder(&s.out_dir, &calls);
            builder.batch = true;
            builder.batch_calls = batch_calls.clone();
            builder.last_batch_size = last_batch_size.clone();

            let sources = names
                .iter()
                .map(|n| Source::Path(s.dir.path().join(n)))
                .collect();

            let mut graph = NodeGraph::new();
            graph.add_node_in(Arc::new(builder), sources, s.dir.path().to_path_buf());
            graph
        };

        // All three sources are stale and get bundled into one invocation.
        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.success());
        assert!(batch_calls.load(Ordering::SeqCst) == 1);
        assert!(last_batch_size.load(Ordering::SeqCst) == 3);
        assert!(calls.load(Ordering::SeqCst) == 0);

        // Touch two: the batch map contains exactly those two.
        fs::write(s.dir.path().join("b.txt"), "B2").unwrap();
        fs::write(s.dir.path().join("c.txt"), "C2").unwrap();

        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 1);
        assert!(batch_calls.load(Ordering::SeqCst) == 2);
        assert!(last_batch_size.load(Ordering::SeqCst) == 2);
        assert!(fs::read(s.out_dir.join("b.txt.out")).unwrap() == b"B2");
        assert!(fs::read(s.out_dir.join("a.txt.out")).unwrap() == b"a.txt");

        // And a third run has nothing to do at all.
        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 0 && report.up_to_date == 1);
        assert!(batch_calls.load(Ordering::SeqCst) == 2);
    }

    #[test]
    fn batch_map_rejects_unregistered_sources() {
        let a = Entity::from(crate::entity::SimpleEntity::text("a"));
        let b = Entity::from(crate::entity::SimpleEntity::text("b"));

        let builder: Arc<dyn Builder> = Arc::new(FailBuilder);
        let mut units = vec![NodeEntity::new(builder, vec![a.clone()], vec![])];

        let sources = vec![a];
        let mut targets = BatchTargets::new(&sources, &mut units);

        assert!(targets.get_mut(&sources[0]).is_ok());

        match targets.get_mut(&b) {
            Err(crate::errors::NodeError::UnknownSource(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn node_chain_builds_in_dependency_order() {
        let s = scratch();
        let src = s.dir.path().join("foo.txt");
        fs::write(&src, "hello").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));

        let mut graph = NodeGraph::new();
        let first = graph.add_node_in(
            Arc::new(copy_builder(&s.out_dir, &calls)),
            vec![Source::Path(src)],
            s.dir.path().to_path_buf(),
        );
        let second = graph.add_node_in(
            Arc::new(copy_builder(&s.out_dir, &calls)),
            vec![Source::Filter(crate::filter::NodeFilter::targets(first).at(0))],
            s.dir.path().to_path_buf(),
        );

        let (report, mgr) = run(graph, &s.vfile_path);
        assert!(report.success());
        assert!(report.built == 2);
        assert!(fs::read(s.out_dir.join("foo.txt.out.out")).unwrap() == b"hello");
        assert!(
            mgr.graph().node(second).source_entities()[0].value_str()
                == Some(s.out_dir.join("foo.txt.out").to_str().unwrap())
        );
    }

    #[test]
    fn keep_going_skips_only_the_failed_subtree() {
        let s = scratch();
        let good_src = s.dir.path().join("good.txt");
        let bad_src = s.dir.path().join("bad.txt");
        fs::write(&good_src, "fine").unwrap();
        fs::write(&bad_src, "doomed").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));

        let mut graph = NodeGraph::new();
        let doomed = graph.add_node_in(
            Arc::new(FailBuilder),
            vec![Source::Path(bad_src)],
            s.dir.path().to_path_buf(),
        );
        let dependent = graph.add_node_in(
            Arc::new(copy_builder(&s.out_dir, &calls)),
            vec![Source::Node(doomed)],
            s.dir.path().to_path_buf(),
        );
        let independent = graph.add_node_in(
            Arc::new(copy_builder(&s.out_dir, &calls)),
            vec![Source::Path(good_src)],
            s.dir.path().to_path_buf(),
        );

        let mut mgr = BuildManager::new(
            graph,
            open_vfile(&s.vfile_path),
            BuildOptions {
                jobs: 2,
                keep_going: true,
                ..Default::default()
            },
        );
        let mut events = NoopEventBus;
        let report = mgr.build(&mut events).unwrap();

        assert!(!report.success());
        assert!(report.failed.len() == 1);
        assert!(report.failed[0].0 == doomed);
        assert!(report.skipped.contains(&dependent));
        assert!(report.built == 1);
        let _ = independent;

        // The failed node left nothing behind in the value-file.
        assert!(mgr.value_file().len() == 1);
    }

    #[test]
    fn first_failure_stops_scheduling_without_keep_going() {
        let s = scratch();
        let bad_src = s.dir.path().join("bad.txt");
        fs::write(&bad_src, "doomed").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));

        let mut graph = NodeGraph::new();
        let doomed = graph.add_node_in(
            Arc::new(FailBuilder),
            vec![Source::Path(bad_src)],
            s.dir.path().to_path_buf(),
        );
        let dependent = graph.add_node_in(
            Arc::new(copy_builder(&s.out_dir, &calls)),
            vec![Source::Node(doomed)],
            s.dir.path().to_path_buf(),
        );

        let (report, _) = run(graph, &s.vfile_path);
        assert!(!report.success());
        assert!(report.failed.len() == 1);
        assert!(report.skipped.contains(&dependent));
        assert!(calls.load(Ordering::SeqCst) == 0);
    }

    #[test]
    fn dependency_cycles_are_reported() {
        let s = scratch();

        let mut graph = NodeGraph::new();
        let a = graph.add_node_in(
            Arc::new(FailBuilder),
            Vec::new(),
            s.dir.path().to_path_buf(),
        );
        let b = graph.add_node_in(
            Arc::new(FailBuilder),
            Vec::new(),
            s.dir.path().to_path_buf(),
        );
        graph.depends(a, vec![Source::Node(b)]).unwrap();
        graph.depends(b, vec![Source::Node(a)]).unwrap();

        let mut mgr = BuildManager::new(graph, open_vfile(&s.vfile_path), options(false));
        let mut events = NoopEventBus;

        match mgr.build(&mut events) {
            Err(e) => assert!(e.to_string().contains("cycle")),
            Ok(_) => panic!("a cyclic graph must not build"),
        }
    }

    #[test]
    fn replaced_sources_are_rematerialized() {
        let s = scratch();
        let resp = s.dir.path().join("args.resp");
        let real = s.dir.path().join("real.txt");
        fs::write(&resp, "@real.txt").unwrap();
        fs::write(&real, "the real content").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));

        let mut graph = NodeGraph::new();
        let id = graph.add_node_in(
            Arc::new(ReplacingBuilder {
                inner: copy_builder(&s.out_dir, &calls),
                real: real.clone(),
            }),
            vec![Source::Path(resp)],
            s.dir.path().to_path_buf(),
        );

        let (report, mgr) = run(graph, &s.vfile_path);
        assert!(report.success());
        assert!(report.built == 1);

        // The node builds from the substituted source, not the original.
        assert!(
            mgr.graph().node(id).source_entities()[0].value_str() == Some(real.to_str().unwrap())
        );
        assert!(fs::read(s.out_dir.join("real.txt.out")).unwrap() == b"the real content");
    }

    #[test]
    fn discovered_dependencies_build_first() {
        let s = scratch();
        let helper_src = s.dir.path().join("helper.txt");
        let main_src = s.dir.path().join("main.txt");
        fs::write(&helper_src, "helper").unwrap();
        fs::write(&main_src, "main").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));

        let mut graph = NodeGraph::new();
        let helper = graph.add_node_in(
            Arc::new(copy_builder(&s.out_dir, &calls)),
            vec![Source::Path(helper_src)],
            s.dir.path().to_path_buf(),
        );
        let main = graph.add_node_in(
            Arc::new(DependsBuilder {
                inner: copy_builder(&s.out_dir, &calls),
                extra: helper,
            }),
            vec![Source::Path(main_src)],
            s.dir.path().to_path_buf(),
        );

        let (report, mgr) = run(graph, &s.vfile_path);
        assert!(report.success());
        assert!(report.built == 2);

        // The discovered dependency's targets were folded into the flat
        // dependency list before fingerprinting.
        assert!(mgr.graph().node(main).dep_entities().len() == 1);
    }

    #[test]
    fn builder_timeouts_fail_the_node() {
        let s = scratch();
        let src = s.dir.path().join("slow.txt");
        fs::write(&src, "slow").unwrap();

        let mut graph = NodeGraph::new();
        graph.add_node_in(
            Arc::new(SleepBuilder),
            vec![Source::Path(src)],
            s.dir.path().to_path_buf(),
        );

        let (report, _) = run(graph, &s.vfile_path);
        assert!(!report.success());
        assert!(report.failed.len() == 1);
        assert!(report.failed[0].1.contains("timed out"));
    }

    #[test]
    fn names_absent_from_built_set_are_force_rebuilt() {
        let s = scratch();
        let src = s.dir.path().join("foo.txt");
        fs::write(&src, "hello").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let make_graph = || {
            let mut graph = NodeGraph::new();
            graph.add_node_in(
                Arc::new(copy_builder(&s.out_dir, &calls)),
                vec![Source::Path(src.clone())],
                s.dir.path().to_path_buf(),
            );
            graph
        };

        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 1);

        let mut mgr = BuildManager::new(
            make_graph(),
            open_vfile(&s.vfile_path),
            BuildOptions {
                jobs: 2,
                explain: true,
                built_nodes: Some(HashSet::new()),
                ..Default::default()
            },
        );
        let mut events = RecordingBus::default();
        let report = mgr.build(&mut events).unwrap();

        assert!(report.built == 1);
        assert!(calls.load(Ordering::SeqCst) == 2);
        assert!(events.codes().contains(&StaleCode::ForceRebuild));
    }

    #[test]
    fn clean_removes_targets_and_records() {
        let s = scratch();
        let src = s.dir.path().join("foo.txt");
        fs::write(&src, "hello").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let make_graph = || {
            let mut graph = NodeGraph::new();
            graph.add_node_in(
                Arc::new(copy_builder(&s.out_dir, &calls)),
                vec![Source::Path(src.clone())],
                s.dir.path().to_path_buf(),
            );
            graph
        };

        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 1);
        assert!(s.out_dir.join("foo.txt.out").exists());

        let mut mgr = BuildManager::new(make_graph(), open_vfile(&s.vfile_path), options(false));
        let mut events = NoopEventBus;
        mgr.clean(&mut events).unwrap();

        assert!(!s.out_dir.join("foo.txt.out").exists());
        assert!(mgr.value_file().is_empty());

        // A build after a clean starts from scratch.
        let (report, _) = run(make_graph(), &s.vfile_path);
        assert!(report.built == 1);
        assert!(calls.load(Ordering::SeqCst) == 2);
    }
}

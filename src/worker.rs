use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

use crate::config::SimulationOptions;
use crate::engine::{EngineEvent, EngineState, GenerationEngine};
use crate::error::{Result, WormerError};
use crate::gene::Gene;
use crate::physics::PhysicsEngine;
use crate::protocol::{DownMessage, GenerationResult, UpMessage, merge_results, partition_counts};

pub(crate) type DownSender = mpsc::UnboundedSender<DownMessage>;
pub(crate) type UpReceiver = mpsc::UnboundedReceiver<(usize, UpMessage)>;
type UpSender = mpsc::UnboundedSender<(usize, UpMessage)>;

/// Spawns one worker task and returns its command channel. The node decides
/// on its first `setup` whether it simulates locally (leaf) or partitions the
/// work across children (branch); everything it reports upward goes through
/// `up`, tagged with `index`.
pub(crate) fn spawn(index: usize, up: UpSender, physics: Arc<dyn PhysicsEngine>) -> DownSender {
    let (down_tx, down_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_node(index, down_rx, up, physics));
    down_tx
}

enum Step {
    Command(Option<DownMessage>),
    Child(Option<(usize, UpMessage)>),
    Tick,
}

async fn run_node(
    index: usize,
    mut commands: mpsc::UnboundedReceiver<DownMessage>,
    up: UpSender,
    physics: Arc<dyn PhysicsEngine>,
) {
    let mut node = WorkerNode::new(index, up, physics);
    loop {
        if node.halted {
            // Coordination failed; drain inputs without acting so the stall
            // stays visible instead of cascading teardown through the tree.
            match commands.recv().await {
                Some(_) => continue,
                None => break,
            }
        }
        let step = match &mut node.role {
            Role::Branch(branch) => tokio::select! {
                message = commands.recv() => Step::Command(message),
                message = branch.child_rx.recv() => Step::Child(message),
            },
            Role::Leaf(leaf) if leaf.engine.state() == EngineState::Running => {
                tokio::select! {
                    biased;
                    message = commands.recv() => Step::Command(message),
                    _ = tick_gate(leaf.tick_delay_ms) => Step::Tick,
                }
            }
            _ => Step::Command(commands.recv().await),
        };

        let outcome = match step {
            Step::Command(None) | Step::Child(None) => break,
            Step::Command(Some(message)) => node.handle_command(message),
            Step::Child(Some((child, message))) => node.handle_child(child, message),
            Step::Tick => {
                node.leaf_tick();
                Ok(false)
            }
        };
        match outcome {
            Ok(false) => {}
            Ok(true) => break,
            Err(err) => {
                error!(node = %node.id, error = %err, "coordination failure; worker halted");
                node.halted = true;
            }
        }
    }
    debug!(node = %node.id, "worker exited");
}

/// Sleep between ticks so pending commands are observed before the next tick
/// starts; with no speed factor just hand the executor a turn.
async fn tick_gate(delay_ms: f32) {
    if delay_ms > 0.0 {
        sleep(Duration::from_secs_f32(delay_ms / 1000.0)).await;
    } else {
        tokio::task::yield_now().await;
    }
}

fn send(up: &UpSender, index: usize, message: UpMessage) {
    let _ = up.send((index, message));
}

struct WorkerNode {
    id: String,
    index: usize,
    up: UpSender,
    physics: Arc<dyn PhysicsEngine>,
    role: Role,
    halted: bool,
}

enum Role {
    Unassigned,
    Leaf(Box<LeafState>),
    Branch(BranchState),
}

struct LeafState {
    engine: GenerationEngine,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    duration: f32,
    tick_delay_ms: f32,
    ticks_per_report: usize,
    ticks_since_report: usize,
    /// Set while the engine is paused because its generation finished
    /// naturally; the already-reported `generationEnd` stands in for any
    /// pause acknowledgement in that window.
    at_generation_boundary: bool,
}

struct ChildLink {
    tx: DownSender,
    count: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PauseOutcome {
    Acked,
    GenerationEnded,
}

struct AckBarrier {
    acked: Vec<bool>,
}

impl AckBarrier {
    fn new(children: usize) -> Self {
        Self {
            acked: vec![false; children],
        }
    }

    fn record(&mut self, child: usize) -> bool {
        self.acked[child] = true;
        self.acked.iter().all(|acked| *acked)
    }
}

struct BranchState {
    children: Vec<ChildLink>,
    child_rx: UpReceiver,
    setup_done: Vec<bool>,
    setup_reported: bool,
    started: Option<AckBarrier>,
    resumed: Option<AckBarrier>,
    terminated: Option<AckBarrier>,
    /// Active pause barrier: one `Paused`-or-`generationEnd` outcome per
    /// child. Mixing both kinds within one barrier is a protocol error.
    pause: Option<Vec<Option<PauseOutcome>>>,
    progress: Vec<f32>,
    last_forwarded_progress: f32,
    progress_epsilon: f32,
    results: Vec<Option<GenerationResult>>,
}

impl WorkerNode {
    fn new(index: usize, up: UpSender, physics: Arc<dyn PhysicsEngine>) -> Self {
        Self {
            id: format!("worker-{index}"),
            index,
            up,
            physics,
            role: Role::Unassigned,
            halted: false,
        }
    }

    fn handle_command(&mut self, message: DownMessage) -> Result<bool> {
        match message {
            DownMessage::Setup { count, options, id } => {
                self.handle_setup(count, options, id)?;
                Ok(false)
            }
            DownMessage::Genes { genes } => {
                self.handle_genes(genes)?;
                Ok(false)
            }
            DownMessage::Start => self.handle_start(),
            DownMessage::Pause => self.handle_pause(),
            DownMessage::Resume => self.handle_resume(),
            DownMessage::Terminate => self.handle_terminate(),
        }
    }

    fn handle_setup(&mut self, count: usize, options: SimulationOptions, id: String) -> Result<()> {
        if !matches!(self.role, Role::Unassigned) {
            warn!(node = %self.id, "setup received twice; tree shape is fixed after setup");
            return Ok(());
        }
        self.id = id;

        if count <= options.worker.worms_per_worker {
            let mut local = options;
            local.simulation.worms_per_generation = count;
            // Leaves evaluate only; the root breeds over the merged ranking,
            // so local reproduction passes every gene through unchanged.
            local.simulation.preserved_worms = count;
            let duration = local.simulation.duration;
            let tick_delay_ms = local.simulation.timestep * local.simulation.speed_factor;
            let ticks_per_report = ((local.ticks_per_generation() as f32
                * local.worker.report_rate)
                .floor() as usize)
                .max(1);
            let (engine, events) = GenerationEngine::new(local, self.physics.as_ref())?;
            self.role = Role::Leaf(Box::new(LeafState {
                engine,
                events,
                duration,
                tick_delay_ms,
                ticks_per_report,
                ticks_since_report: 0,
                at_generation_boundary: false,
            }));
            info!(node = %self.id, worms = count, "leaf ready");
            send(&self.up, self.index, UpMessage::SetupDone);
        } else {
            // Shares that round down to nothing get no worker at all.
            let shares: Vec<usize> = partition_counts(count, options.worker.children_per_node)
                .into_iter()
                .filter(|share| *share > 0)
                .collect();
            let (child_tx, child_rx) = mpsc::unbounded_channel();
            let mut children = Vec::with_capacity(shares.len());
            for (child_index, share) in shares.iter().enumerate() {
                let tx = spawn(child_index, child_tx.clone(), Arc::clone(&self.physics));
                let _ = tx.send(DownMessage::Setup {
                    count: *share,
                    options: options.clone(),
                    id: format!("{}.{child_index}", self.id),
                });
                children.push(ChildLink { tx, count: *share });
            }
            info!(
                node = %self.id,
                children = children.len(),
                total = count,
                "branch partitioned"
            );
            let child_count = children.len();
            self.role = Role::Branch(BranchState {
                children,
                child_rx,
                setup_done: vec![false; child_count],
                setup_reported: false,
                started: None,
                resumed: None,
                terminated: None,
                pause: None,
                progress: vec![0.0; child_count],
                last_forwarded_progress: 0.0,
                progress_epsilon: options.worker.progress_epsilon,
                results: vec![None; child_count],
            });
        }
        Ok(())
    }

    fn handle_genes(&mut self, genes: Vec<Gene>) -> Result<()> {
        match &mut self.role {
            Role::Leaf(leaf) => leaf.engine.apply_genes(genes),
            Role::Branch(branch) => {
                let expected: usize = branch.children.iter().map(|child| child.count).sum();
                if genes.len() != expected {
                    return Err(WormerError::ProtocolViolation(format!(
                        "gene payload of {} for a partition of {expected}",
                        genes.len()
                    )));
                }
                let mut offset = 0;
                for child in &branch.children {
                    let slice = genes[offset..offset + child.count].to_vec();
                    offset += child.count;
                    let _ = child.tx.send(DownMessage::Genes { genes: slice });
                }
                Ok(())
            }
            Role::Unassigned => Err(WormerError::ProtocolViolation(
                "gene payload received before setup".to_string(),
            )),
        }
    }

    fn handle_start(&mut self) -> Result<bool> {
        match &mut self.role {
            Role::Leaf(leaf) => {
                leaf.engine.start();
                if leaf.at_generation_boundary && leaf.engine.state() == EngineState::Running {
                    Self::begin_generation_reporting(leaf, &self.up, self.index);
                }
                Self::drain_engine_events(leaf, &self.up, self.index);
                send(&self.up, self.index, UpMessage::Started);
            }
            Role::Branch(branch) => {
                branch.started = Some(AckBarrier::new(branch.children.len()));
                for child in &branch.children {
                    let _ = child.tx.send(DownMessage::Start);
                }
            }
            Role::Unassigned => warn!(node = %self.id, "start before setup ignored"),
        }
        Ok(false)
    }

    fn handle_pause(&mut self) -> Result<bool> {
        match &mut self.role {
            Role::Leaf(leaf) => {
                if leaf.at_generation_boundary {
                    // The generation result already reported upward answers
                    // this pause; a bare ack here would corrupt the barrier.
                    debug!(node = %self.id, "pause at generation boundary; ack suppressed");
                    return Ok(false);
                }
                let paused = leaf.engine.pause();
                Self::drain_engine_events(leaf, &self.up, self.index);
                if paused {
                    let progress = leaf.engine.generation_time() / leaf.duration;
                    send(&self.up, self.index, UpMessage::Progress { progress });
                }
                send(&self.up, self.index, UpMessage::Paused);
            }
            Role::Branch(branch) => {
                // Children that already delivered this generation's result
                // have answered in advance.
                branch.pause = Some(
                    branch
                        .results
                        .iter()
                        .map(|result| result.as_ref().map(|_| PauseOutcome::GenerationEnded))
                        .collect(),
                );
                for child in &branch.children {
                    let _ = child.tx.send(DownMessage::Pause);
                }
            }
            Role::Unassigned => warn!(node = %self.id, "pause before setup ignored"),
        }
        Ok(false)
    }

    fn handle_resume(&mut self) -> Result<bool> {
        match &mut self.role {
            Role::Leaf(leaf) => {
                let resumed = leaf.engine.resume();
                if resumed && leaf.at_generation_boundary {
                    Self::begin_generation_reporting(leaf, &self.up, self.index);
                }
                Self::drain_engine_events(leaf, &self.up, self.index);
                send(&self.up, self.index, UpMessage::Resumed);
            }
            Role::Branch(branch) => {
                branch.resumed = Some(AckBarrier::new(branch.children.len()));
                for child in &branch.children {
                    let _ = child.tx.send(DownMessage::Resume);
                }
            }
            Role::Unassigned => warn!(node = %self.id, "resume before setup ignored"),
        }
        Ok(false)
    }

    fn handle_terminate(&mut self) -> Result<bool> {
        match &mut self.role {
            Role::Leaf(leaf) => {
                leaf.engine.terminate();
                Self::drain_engine_events(leaf, &self.up, self.index);
                send(&self.up, self.index, UpMessage::Terminated);
                Ok(true)
            }
            Role::Branch(branch) => {
                branch.terminated = Some(AckBarrier::new(branch.children.len()));
                for child in &branch.children {
                    let _ = child.tx.send(DownMessage::Terminate);
                }
                Ok(false)
            }
            Role::Unassigned => {
                warn!(node = %self.id, "terminate before setup ignored");
                Ok(false)
            }
        }
    }

    fn handle_child(&mut self, child: usize, message: UpMessage) -> Result<bool> {
        let Role::Branch(branch) = &mut self.role else {
            return Err(WormerError::ProtocolViolation(
                "child report on a node without children".to_string(),
            ));
        };
        match message {
            UpMessage::SetupDone => {
                branch.setup_done[child] = true;
                if !branch.setup_reported && branch.setup_done.iter().all(|done| *done) {
                    branch.setup_reported = true;
                    send(&self.up, self.index, UpMessage::SetupDone);
                }
            }
            UpMessage::Started => {
                if let Some(barrier) = &mut branch.started {
                    if barrier.record(child) {
                        branch.started = None;
                        send(&self.up, self.index, UpMessage::Started);
                    }
                } else {
                    warn!(node = %self.id, child, "unsolicited start acknowledgement");
                }
            }
            UpMessage::Resumed => {
                if let Some(barrier) = &mut branch.resumed {
                    if barrier.record(child) {
                        branch.resumed = None;
                        send(&self.up, self.index, UpMessage::Resumed);
                    }
                } else {
                    warn!(node = %self.id, child, "unsolicited resume acknowledgement");
                }
            }
            UpMessage::Terminated => {
                if let Some(barrier) = &mut branch.terminated {
                    if barrier.record(child) {
                        branch.terminated = None;
                        send(&self.up, self.index, UpMessage::Terminated);
                        return Ok(true);
                    }
                } else {
                    warn!(node = %self.id, child, "unsolicited terminate acknowledgement");
                }
            }
            UpMessage::Paused => {
                let Some(outcomes) = &mut branch.pause else {
                    return Err(WormerError::ProtocolViolation(
                        "pause acknowledgement with no pause outstanding".to_string(),
                    ));
                };
                outcomes[child] = Some(PauseOutcome::Acked);
                if outcomes
                    .iter()
                    .flatten()
                    .any(|outcome| *outcome == PauseOutcome::GenerationEnded)
                {
                    return Err(WormerError::ProtocolViolation(
                        "bare pause acknowledgement while a sibling's generation end is pending"
                            .to_string(),
                    ));
                }
                if outcomes.iter().all(|outcome| outcome.is_some()) {
                    branch.pause = None;
                    send(&self.up, self.index, UpMessage::Paused);
                }
            }
            UpMessage::Progress { progress } => {
                branch.progress[child] = progress;
                let mean =
                    branch.progress.iter().sum::<f32>() / branch.progress.len() as f32;
                if (mean - branch.last_forwarded_progress).abs() >= branch.progress_epsilon {
                    branch.last_forwarded_progress = mean;
                    send(&self.up, self.index, UpMessage::Progress { progress: mean });
                }
            }
            UpMessage::GenerationEnd(result) => {
                if branch.results[child].is_some() {
                    return Err(WormerError::ProtocolViolation(format!(
                        "duplicate generation result from child {child}"
                    )));
                }
                if result.len() != branch.children[child].count {
                    return Err(WormerError::ProtocolViolation(format!(
                        "child {child} reported {} results for a partition of {}",
                        result.len(),
                        branch.children[child].count
                    )));
                }
                branch.results[child] = Some(result);
                if let Some(outcomes) = &mut branch.pause {
                    outcomes[child] = Some(PauseOutcome::GenerationEnded);
                    if outcomes
                        .iter()
                        .flatten()
                        .any(|outcome| *outcome == PauseOutcome::Acked)
                    {
                        return Err(WormerError::ProtocolViolation(
                            "generation end joined a barrier already holding bare pause acks"
                                .to_string(),
                        ));
                    }
                }
                if branch.results.iter().all(|result| result.is_some()) {
                    let parts: Vec<GenerationResult> = branch
                        .results
                        .iter_mut()
                        .map(|result| result.take().expect("checked above"))
                        .collect();
                    let merged = merge_results(&parts);
                    debug!(
                        node = %self.id,
                        worms = merged.len(),
                        average = merged.average,
                        "merged generation results"
                    );
                    send(&self.up, self.index, UpMessage::GenerationEnd(merged));
                    // With every outcome a generation end, the merged report
                    // above stands in for the pause acknowledgement.
                    if let Some(outcomes) = &branch.pause
                        && outcomes.iter().all(|outcome| outcome.is_some())
                    {
                        branch.pause = None;
                    }
                }
            }
        }
        Ok(false)
    }

    fn leaf_tick(&mut self) {
        let Role::Leaf(leaf) = &mut self.role else {
            return;
        };
        leaf.engine.step();
        Self::drain_engine_events(leaf, &self.up, self.index);
    }

    /// Resets reporting state on entry into a fresh generation.
    fn begin_generation_reporting(leaf: &mut LeafState, up: &UpSender, index: usize) {
        leaf.at_generation_boundary = false;
        leaf.ticks_since_report = 0;
        let _ = up.send((index, UpMessage::Progress { progress: 0.0 }));
    }

    fn drain_engine_events(leaf: &mut LeafState, up: &UpSender, index: usize) {
        while let Ok(event) = leaf.events.try_recv() {
            match event {
                EngineEvent::Tick {
                    generation_time, ..
                } => {
                    leaf.ticks_since_report += 1;
                    if leaf.ticks_since_report >= leaf.ticks_per_report {
                        leaf.ticks_since_report = 0;
                        let _ = up.send((
                            index,
                            UpMessage::Progress {
                                progress: generation_time / leaf.duration,
                            },
                        ));
                    }
                }
                EngineEvent::GenerationEnd {
                    ranked,
                    average_fitness,
                    ..
                } => {
                    let mut genes = Vec::with_capacity(ranked.len());
                    let mut fitness = Vec::with_capacity(ranked.len());
                    for worm in ranked {
                        genes.push(worm.gene);
                        fitness.push(worm.fitness);
                    }
                    let _ = up.send((index, UpMessage::Progress { progress: 1.0 }));
                    let _ = up.send((
                        index,
                        UpMessage::GenerationEnd(GenerationResult {
                            genes,
                            fitness,
                            average: average_fitness,
                        }),
                    ));
                    // Hold here until the parent redistributes genes and
                    // resumes; only the pending tick is cancelled.
                    leaf.engine.pause();
                    leaf.at_generation_boundary = true;
                    leaf.ticks_since_report = 0;
                }
                EngineEvent::Start
                | EngineEvent::Pause
                | EngineEvent::Resume
                | EngineEvent::Terminate => {}
            }
        }
    }
}

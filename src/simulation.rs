use std::sync::{Arc, Mutex};

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::config::SimulationOptions;
use crate::engine::{RankedWorm, breed};
use crate::error::{Result, WormerError};
use crate::physics::PhysicsEngine;
use crate::protocol::{DownMessage, GenerationResult, UpMessage};
use crate::worker::{self, DownSender, UpReceiver};
use crate::worm::Worm;

/// Event stream exposed to surrounding UI and export code. Mirrors what a
/// single local engine would emit, regardless of how deep the worker tree
/// behind it is.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SimulationEvent {
    Ready,
    Start,
    Pause,
    Resume,
    Terminate,
    #[serde(rename_all = "camelCase")]
    Tick {
        generation_time: f32,
        total_engine_time: f32,
    },
    #[serde(rename_all = "camelCase")]
    GenerationEnd {
        generation: u32,
        worms: Vec<WormReport>,
        average_fitness: f32,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WormReport {
    pub gene: crate::gene::Gene,
    pub fitness: f32,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationStatus {
    pub generation: u32,
    pub generation_time: f32,
    pub total_engine_time: f32,
    pub best_fitness: f32,
    pub average_fitness: f32,
    pub population_size: usize,
    pub is_ready: bool,
    pub is_started: bool,
    pub is_paused: bool,
}

/// Everything needed to resume a run later: configuration, the master
/// population with its last fitness ranking, and time accounting.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSnapshot {
    pub options: SimulationOptions,
    pub worms: Vec<Worm>,
    pub generation: u32,
    pub total_engine_time: f32,
}

#[derive(Clone, Copy, Debug)]
enum ControlCommand {
    Start,
    Pause,
    Resume,
    Terminate,
}

struct SharedState {
    options: SimulationOptions,
    worms: Vec<Worm>,
    status: SimulationStatus,
}

/// User-facing handle over a whole worker tree. Owns the master population:
/// leaves evaluate, branches merge, and this facade breeds each next
/// generation from the merged ranking before fanning the genes back out.
#[derive(Clone)]
pub struct Simulation {
    commands: mpsc::UnboundedSender<ControlCommand>,
    events: broadcast::Sender<SimulationEvent>,
    shared: Arc<Mutex<SharedState>>,
}

impl Simulation {
    /// Starts a run with a randomly seeded population. The tree sets itself
    /// up in the background; a `Ready` event marks the moment every leaf is
    /// initialized.
    pub fn spawn(options: SimulationOptions, physics: Arc<dyn PhysicsEngine>) -> Result<Self> {
        options.validate()?;
        let mut rng = SmallRng::seed_from_u64(rand::random::<u64>());
        let worms = (0..options.simulation.worms_per_generation)
            .map(|_| Worm::random(&options.worm, &options.gene, &mut rng))
            .collect();
        Self::launch(options, physics, worms, 1, 0.0, false, rng)
    }

    /// Restores a saved run. Every gene is validated against the snapshot's
    /// genome dimensions before any worker sees it; a malformed snapshot is
    /// reported to the caller, never silently repaired. The restored run
    /// resumes paused.
    pub fn from_snapshot(
        snapshot: SimulationSnapshot,
        physics: Arc<dyn PhysicsEngine>,
    ) -> Result<Self> {
        let SimulationSnapshot {
            options,
            worms,
            generation,
            total_engine_time,
        } = snapshot;
        options.validate()?;
        if worms.len() != options.simulation.worms_per_generation {
            return Err(WormerError::MalformedGene(format!(
                "snapshot holds {} worms for a population of {}",
                worms.len(),
                options.simulation.worms_per_generation
            )));
        }
        for (index, worm) in worms.iter().enumerate() {
            worm.gene
                .check_shape(options.worm.joints, options.gene.phases)
                .map_err(|err| WormerError::MalformedGene(format!("worm {index}: {err}")))?;
        }
        let rng = SmallRng::seed_from_u64(rand::random::<u64>());
        Self::launch(
            options,
            physics,
            worms,
            generation.max(1),
            total_engine_time,
            true,
            rng,
        )
    }

    fn launch(
        options: SimulationOptions,
        physics: Arc<dyn PhysicsEngine>,
        worms: Vec<Worm>,
        generation: u32,
        total_engine_time: f32,
        restored: bool,
        rng: SmallRng,
    ) -> Result<Self> {
        let population_size = options.simulation.worms_per_generation;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (up_tx, up_rx) = mpsc::unbounded_channel();
        let root = worker::spawn(0, up_tx, physics);
        let _ = root.send(DownMessage::Setup {
            count: population_size,
            options: options.clone(),
            id: "root".to_string(),
        });

        let shared = Arc::new(Mutex::new(SharedState {
            options: options.clone(),
            worms,
            status: SimulationStatus {
                generation,
                generation_time: 0.0,
                total_engine_time,
                best_fitness: 0.0,
                average_fitness: 0.0,
                population_size,
                is_ready: false,
                is_started: restored,
                is_paused: restored,
            },
        }));

        let driver = Driver {
            options,
            root,
            up_rx,
            commands_rx,
            events: events.clone(),
            shared: Arc::clone(&shared),
            rng,
            generation,
            accumulated_time: total_engine_time,
            tree_started: false,
            pause_requested: false,
        };
        tokio::spawn(driver.run());

        Ok(Self {
            commands: commands_tx,
            events,
            shared,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SimulationEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> SimulationStatus {
        self.lock().status.clone()
    }

    pub fn options(&self) -> SimulationOptions {
        self.lock().options.clone()
    }

    pub fn snapshot(&self) -> SimulationSnapshot {
        let shared = self.lock();
        SimulationSnapshot {
            options: shared.options.clone(),
            worms: shared.worms.clone(),
            generation: shared.status.generation,
            total_engine_time: shared.status.total_engine_time,
        }
    }

    pub fn start(&self) {
        let _ = self.commands.send(ControlCommand::Start);
    }

    pub fn pause(&self) {
        let _ = self.commands.send(ControlCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(ControlCommand::Resume);
    }

    pub fn terminate(&self) {
        let _ = self.commands.send(ControlCommand::Terminate);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.shared.lock().expect("simulation state mutex poisoned")
    }
}

struct Driver {
    options: SimulationOptions,
    root: DownSender,
    up_rx: UpReceiver,
    commands_rx: mpsc::UnboundedReceiver<ControlCommand>,
    events: broadcast::Sender<SimulationEvent>,
    shared: Arc<Mutex<SharedState>>,
    rng: SmallRng,
    generation: u32,
    accumulated_time: f32,
    tree_started: bool,
    pause_requested: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let stop = tokio::select! {
                command = self.commands_rx.recv() => match command {
                    None => true,
                    Some(command) => self.handle_command(command),
                },
                message = self.up_rx.recv() => match message {
                    None => true,
                    Some((_, message)) => self.handle_up(message),
                },
            };
            if stop {
                break;
            }
        }
    }

    fn handle_command(&mut self, command: ControlCommand) -> bool {
        match command {
            ControlCommand::Start => {
                let (is_started, is_paused) = {
                    let shared = self.lock();
                    (shared.status.is_started, shared.status.is_paused)
                };
                if is_started {
                    if is_paused {
                        self.send_resume();
                    }
                    return false;
                }
                self.generation = 1;
                self.accumulated_time = 0.0;
                self.pause_requested = false;
                {
                    let mut shared = self.lock();
                    shared.status.generation = 1;
                    shared.status.generation_time = 0.0;
                    shared.status.total_engine_time = 0.0;
                }
                self.tree_started = true;
                let _ = self.root.send(DownMessage::Start);
            }
            ControlCommand::Pause => {
                let (is_started, is_paused) = {
                    let shared = self.lock();
                    (shared.status.is_started, shared.status.is_paused)
                };
                if !is_started || is_paused || self.pause_requested {
                    return false;
                }
                self.pause_requested = true;
                let _ = self.root.send(DownMessage::Pause);
            }
            ControlCommand::Resume => {
                let is_paused = self.lock().status.is_paused;
                if is_paused {
                    self.send_resume();
                }
            }
            ControlCommand::Terminate => {
                if self.tree_started || self.lock().status.is_started {
                    let _ = self.root.send(DownMessage::Terminate);
                }
            }
        }
        false
    }

    /// A restored tree was never started; its first resume is a start.
    fn send_resume(&mut self) {
        if self.tree_started {
            let _ = self.root.send(DownMessage::Resume);
        } else {
            self.tree_started = true;
            let _ = self.root.send(DownMessage::Start);
        }
    }

    fn handle_up(&mut self, message: UpMessage) -> bool {
        match message {
            UpMessage::SetupDone => {
                self.distribute_genes();
                self.lock().status.is_ready = true;
                info!("worker tree initialized");
                self.emit(SimulationEvent::Ready);
            }
            UpMessage::Started => {
                {
                    let mut shared = self.lock();
                    shared.status.is_started = true;
                    shared.status.is_paused = false;
                }
                self.emit(SimulationEvent::Start);
            }
            UpMessage::Paused => {
                self.pause_requested = false;
                self.lock().status.is_paused = true;
                self.emit(SimulationEvent::Pause);
            }
            UpMessage::Resumed => {
                self.lock().status.is_paused = false;
                self.emit(SimulationEvent::Resume);
            }
            UpMessage::Terminated => {
                {
                    let mut shared = self.lock();
                    shared.status.is_started = false;
                    shared.status.is_paused = false;
                }
                self.emit(SimulationEvent::Terminate);
                return true;
            }
            UpMessage::Progress { progress } => {
                let duration = self.options.simulation.duration;
                let generation_time = duration * progress;
                let total_engine_time = self.accumulated_time + generation_time;
                {
                    let mut shared = self.lock();
                    shared.status.generation_time = generation_time;
                    shared.status.total_engine_time = total_engine_time;
                }
                self.emit(SimulationEvent::Tick {
                    generation_time,
                    total_engine_time,
                });
            }
            UpMessage::GenerationEnd(result) => return self.proceed_generation(result),
        }
        false
    }

    /// Adopts the merged ranking, reports it, breeds the next population and
    /// fans the new genes back out.
    fn proceed_generation(&mut self, result: GenerationResult) -> bool {
        let expected = self.options.simulation.worms_per_generation;
        if result.len() != expected || result.fitness.len() != result.genes.len() {
            error!(
                received = result.len(),
                expected, "merged generation result does not cover the population; run halted"
            );
            return true;
        }

        let ranked: Vec<RankedWorm> = result
            .genes
            .into_iter()
            .zip(result.fitness)
            .map(|(gene, fitness)| RankedWorm { gene, fitness })
            .collect();
        let duration = self.options.simulation.duration;

        let reports: Vec<WormReport> = ranked
            .iter()
            .map(|worm| WormReport {
                gene: worm.gene.clone(),
                fitness: worm.fitness,
            })
            .collect();
        {
            let mut shared = self.lock();
            shared.worms = ranked
                .iter()
                .map(|entry| {
                    let mut worm = Worm::with_gene(&self.options.worm, entry.gene.clone());
                    worm.fitness = entry.fitness;
                    worm
                })
                .collect();
            shared.status.best_fitness = ranked.first().map(|worm| worm.fitness).unwrap_or(0.0);
            shared.status.average_fitness = result.average;
            shared.status.generation_time = duration;
            shared.status.total_engine_time = self.accumulated_time + duration;
        }
        info!(
            generation = self.generation,
            average = result.average,
            best = ranked.first().map(|worm| worm.fitness).unwrap_or(0.0),
            "generation merged"
        );
        self.emit(SimulationEvent::GenerationEnd {
            generation: self.generation,
            worms: reports,
            average_fitness: result.average,
        });

        let genes = breed(&ranked, &self.options, &mut self.rng);
        {
            let mut shared = self.lock();
            shared.worms = genes
                .iter()
                .map(|gene| Worm::with_gene(&self.options.worm, gene.clone()))
                .collect();
        }
        let _ = self.root.send(DownMessage::Genes { genes });

        self.accumulated_time += duration;
        self.generation += 1;
        {
            let mut shared = self.lock();
            shared.status.generation = self.generation;
            shared.status.generation_time = 0.0;
        }

        if self.pause_requested {
            // The generation end stood in for the pause acknowledgement;
            // hold the tree at the boundary instead of resuming it.
            self.pause_requested = false;
            self.lock().status.is_paused = true;
            self.emit(SimulationEvent::Pause);
        } else {
            let _ = self.root.send(DownMessage::Resume);
        }
        false
    }

    fn distribute_genes(&self) {
        let genes: Vec<_> = self
            .lock()
            .worms
            .iter()
            .map(|worm| worm.gene.clone())
            .collect();
        let _ = self.root.send(DownMessage::Genes { genes });
    }

    fn emit(&self, event: SimulationEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.shared.lock().expect("simulation state mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::testing::StubPhysics;
    use tokio::time::{Duration, timeout};

    fn test_options() -> SimulationOptions {
        let mut options = SimulationOptions::default();
        options.simulation.worms_per_generation = 5;
        options.simulation.preserved_worms = 2;
        options.simulation.timestep = 100.0;
        options.simulation.duration = 300.0;
        options.gene.phases = 8;
        options.gene.period = 1;
        options
    }

    async fn next_event(
        rx: &mut broadcast::Receiver<SimulationEvent>,
    ) -> SimulationEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event stream closed")
    }

    async fn wait_for<F: Fn(&SimulationEvent) -> bool>(
        rx: &mut broadcast::Receiver<SimulationEvent>,
        what: F,
    ) -> SimulationEvent {
        loop {
            let event = next_event(rx).await;
            if what(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn runs_generations_across_the_tree() {
        let simulation =
            Simulation::spawn(test_options(), Arc::new(StubPhysics::default())).unwrap();
        let mut events = simulation.subscribe();

        wait_for(&mut events, |event| matches!(event, SimulationEvent::Ready)).await;
        assert!(simulation.status().is_ready);

        simulation.start();
        wait_for(&mut events, |event| matches!(event, SimulationEvent::Start)).await;

        let SimulationEvent::GenerationEnd {
            generation,
            worms,
            average_fitness,
        } = wait_for(&mut events, |event| {
            matches!(event, SimulationEvent::GenerationEnd { .. })
        })
        .await
        else {
            unreachable!()
        };
        assert_eq!(generation, 1);
        assert_eq!(worms.len(), 5);
        assert!(
            worms
                .windows(2)
                .all(|pair| pair[0].fitness >= pair[1].fitness)
        );
        let mean = worms.iter().map(|worm| worm.fitness).sum::<f32>() / 5.0;
        assert!((average_fitness - mean).abs() < 1e-4);

        // The run resumes by itself and keeps producing generations.
        let SimulationEvent::GenerationEnd { generation, .. } =
            wait_for(&mut events, |event| {
                matches!(event, SimulationEvent::GenerationEnd { .. })
            })
            .await
        else {
            unreachable!()
        };
        assert_eq!(generation, 2);

        simulation.terminate();
        wait_for(&mut events, |event| {
            matches!(event, SimulationEvent::Terminate)
        })
        .await;
        assert!(!simulation.status().is_started);
    }

    #[tokio::test]
    async fn pause_and_resume_round_trip() {
        // Slow, long generations: the pause always lands mid-generation.
        let mut options = test_options();
        options.simulation.timestep = 20.0;
        options.simulation.duration = 60_000.0;
        options.simulation.speed_factor = 1.0;
        let simulation =
            Simulation::spawn(options, Arc::new(StubPhysics::default())).unwrap();
        let mut events = simulation.subscribe();
        wait_for(&mut events, |event| matches!(event, SimulationEvent::Ready)).await;

        simulation.start();
        wait_for(&mut events, |event| matches!(event, SimulationEvent::Start)).await;

        simulation.pause();
        wait_for(&mut events, |event| matches!(event, SimulationEvent::Pause)).await;
        assert!(simulation.status().is_paused);

        simulation.resume();
        wait_for(&mut events, |event| {
            matches!(event, SimulationEvent::Resume)
        })
        .await;
        assert!(!simulation.status().is_paused);

        simulation.terminate();
        wait_for(&mut events, |event| {
            matches!(event, SimulationEvent::Terminate)
        })
        .await;
    }

    #[tokio::test]
    async fn snapshot_round_trips_and_resumes_paused() {
        let simulation =
            Simulation::spawn(test_options(), Arc::new(StubPhysics::default())).unwrap();
        let mut events = simulation.subscribe();
        wait_for(&mut events, |event| matches!(event, SimulationEvent::Ready)).await;
        simulation.start();
        wait_for(&mut events, |event| {
            matches!(event, SimulationEvent::GenerationEnd { .. })
        })
        .await;

        let snapshot = simulation.snapshot();
        simulation.terminate();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored_snapshot: SimulationSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored_snapshot.worms.len(), 5);

        let restored =
            Simulation::from_snapshot(restored_snapshot, Arc::new(StubPhysics::default()))
                .unwrap();
        let mut events = restored.subscribe();
        wait_for(&mut events, |event| matches!(event, SimulationEvent::Ready)).await;
        let status = restored.status();
        assert!(status.is_started);
        assert!(status.is_paused);
        assert_eq!(status.generation, snapshot.generation);

        // Resuming a restored tree starts its engines from scratch.
        restored.resume();
        wait_for(&mut events, |event| {
            matches!(event, SimulationEvent::GenerationEnd { .. })
        })
        .await;
        restored.terminate();
    }

    #[tokio::test]
    async fn malformed_snapshot_is_rejected() {
        let mut options = test_options();
        let simulation =
            Simulation::spawn(options.clone(), Arc::new(StubPhysics::default())).unwrap();
        let snapshot = simulation.snapshot();
        simulation.terminate();

        // Same worms, but the genome dimensions no longer match.
        options.gene.phases = 64;
        let mut bad = snapshot.clone();
        bad.options = options;
        let err = Simulation::from_snapshot(bad, Arc::new(StubPhysics::default()))
            .err()
            .expect("mismatched genome dimensions were accepted");
        assert!(matches!(err, WormerError::MalformedGene(_)));

        let mut truncated = snapshot;
        truncated.worms.pop();
        assert!(matches!(
            Simulation::from_snapshot(truncated, Arc::new(StubPhysics::default())),
            Err(WormerError::MalformedGene(_))
        ));
    }
}

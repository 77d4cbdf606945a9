use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::SimulationOptions;
use crate::error::{Result, WormerError};
use crate::gene::Gene;
use crate::physics::{PhysicsEngine, PhysicsWorld};
use crate::worm::Worm;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Paused,
    Terminated,
}

/// One entry of a fitness-ranked population.
#[derive(Clone, Debug)]
pub struct RankedWorm {
    pub gene: Gene,
    pub fitness: f32,
}

/// Typed event stream scoped to one engine. Receivers get every lifecycle
/// transition, one `Tick` per timestep and one `GenerationEnd` per completed
/// evaluation window.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Start,
    Pause,
    Resume,
    Terminate,
    Tick {
        generation_time: f32,
        total_engine_time: f32,
    },
    GenerationEnd {
        generation: u32,
        ranked: Vec<RankedWorm>,
        average_fitness: f32,
    },
}

struct EngineSlot {
    world: Box<dyn PhysicsWorld>,
}

/// Owns one population and runs its fixed-timestep evaluation loop, breeding
/// the next population at every generation boundary. The boundary itself is
/// transparent to callers; externally the engine is simply `Running` until
/// paused or terminated.
pub struct GenerationEngine {
    options: SimulationOptions,
    slots: Vec<EngineSlot>,
    worms: Vec<Worm>,
    state: EngineState,
    generation: u32,
    phase: usize,
    period: usize,
    generation_time: f32,
    total_engine_time: f32,
    rng: SmallRng,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl GenerationEngine {
    pub fn new(
        options: SimulationOptions,
        physics: &dyn PhysicsEngine,
    ) -> Result<(Self, mpsc::UnboundedReceiver<EngineEvent>)> {
        options.validate()?;
        let count = options.simulation.worms_per_generation;

        let mut slots: Vec<EngineSlot> = (0..count)
            .map(|_| EngineSlot {
                world: physics.create_world(),
            })
            .collect();
        let mut rng = SmallRng::seed_from_u64(rand::random::<u64>());
        let mut worms: Vec<Worm> = (0..count)
            .map(|_| Worm::random(&options.worm, &options.gene, &mut rng))
            .collect();
        for (index, (worm, slot)) in worms.iter_mut().zip(&mut slots).enumerate() {
            worm.attach(index, slot.world.as_mut())?;
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                options,
                slots,
                worms,
                state: EngineState::Idle,
                generation: 0,
                phase: 0,
                period: 0,
                generation_time: 0.0,
                total_engine_time: 0.0,
                rng,
                events,
            },
            events_rx,
        ))
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn generation_time(&self) -> f32 {
        self.generation_time
    }

    pub fn worms(&self) -> &[Worm] {
        &self.worms
    }

    /// Begins a fresh run, or resumes when paused. Returns whether the call
    /// changed anything.
    pub fn start(&mut self) -> bool {
        match self.state {
            EngineState::Idle => {
                self.generation = 1;
                self.phase = 0;
                self.period = 0;
                self.generation_time = 0.0;
                self.total_engine_time = 0.0;
                self.state = EngineState::Running;
                self.emit(EngineEvent::Start);
                true
            }
            EngineState::Paused => self.resume(),
            EngineState::Running | EngineState::Terminated => false,
        }
    }

    /// Stops ticking before the next timestep. Only valid while running.
    pub fn pause(&mut self) -> bool {
        if self.state != EngineState::Running {
            return false;
        }
        self.state = EngineState::Paused;
        self.emit(EngineEvent::Pause);
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state != EngineState::Paused {
            return false;
        }
        self.state = EngineState::Running;
        self.emit(EngineEvent::Resume);
        true
    }

    pub fn terminate(&mut self) -> bool {
        if self.state == EngineState::Terminated {
            return false;
        }
        self.state = EngineState::Terminated;
        self.emit(EngineEvent::Terminate);
        true
    }

    /// Replaces the population's genes positionally, keeping worm bodies and
    /// parameters as they are.
    pub fn apply_genes(&mut self, genes: Vec<Gene>) -> Result<()> {
        if genes.len() != self.worms.len() {
            return Err(WormerError::ProtocolViolation(format!(
                "received {} genes for a population of {}",
                genes.len(),
                self.worms.len()
            )));
        }
        for gene in &genes {
            gene.check_shape(self.options.worm.joints, self.options.gene.phases)?;
        }
        for (worm, gene) in self.worms.iter_mut().zip(genes) {
            worm.gene = gene;
        }
        Ok(())
    }

    /// Advances the whole population by one timestep. Runs generation-end
    /// processing when the evaluation window closes. No-op unless running.
    pub fn step(&mut self) {
        if self.state != EngineState::Running {
            return;
        }
        let timestep = self.options.simulation.timestep;

        for (worm, slot) in self.worms.iter_mut().zip(&mut self.slots) {
            worm.tick(slot.world.as_mut(), self.phase);
            slot.world.step(timestep);
        }

        self.period += 1;
        if self.period >= self.options.gene.period {
            self.period = 0;
            self.phase = (self.phase + 1) % self.options.gene.phases;
        }

        self.generation_time += timestep;
        self.total_engine_time += timestep;
        self.emit(EngineEvent::Tick {
            generation_time: self.generation_time,
            total_engine_time: self.total_engine_time,
        });

        if self.generation_time >= self.options.simulation.duration {
            self.proceed_generation();
        }
    }

    fn proceed_generation(&mut self) {
        let mut total_fitness = 0.0;
        for (worm, slot) in self.worms.iter_mut().zip(&mut self.slots) {
            worm.fitness = worm.measure_fitness(slot.world.as_ref());
            total_fitness += worm.fitness;
            worm.detach(slot.world.as_mut(), true);
        }
        let average_fitness = total_fitness / self.worms.len() as f32;

        self.worms.sort_by(|a, b| {
            b.fitness
                .partial_cmp(&a.fitness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let ranked: Vec<RankedWorm> = self
            .worms
            .iter()
            .map(|worm| RankedWorm {
                gene: worm.gene.clone(),
                fitness: worm.fitness,
            })
            .collect();

        debug!(
            generation = self.generation,
            average = average_fitness,
            best = ranked.first().map(|worm| worm.fitness).unwrap_or(0.0),
            "generation complete"
        );
        self.emit(EngineEvent::GenerationEnd {
            generation: self.generation,
            ranked: ranked.clone(),
            average_fitness,
        });

        let genes = breed(&ranked, &self.options, &mut self.rng);
        self.worms = genes
            .into_iter()
            .map(|gene| Worm::with_gene(&self.options.worm, gene))
            .collect();
        for (index, (worm, slot)) in self.worms.iter_mut().zip(&mut self.slots).enumerate() {
            // Bodies were removed above; the slot's world hosts a fresh one.
            if let Err(err) = worm.attach(index, slot.world.as_mut()) {
                debug_assert!(false, "fresh worm failed to attach: {err}");
            }
        }

        self.generation += 1;
        self.generation_time = 0.0;
        self.period = 0;
        self.phase = 0;
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// Builds the next generation's genes from a fitness-ranked population:
/// the top `preservedWorms` genes survive unchanged, every remaining slot is
/// bred from two roulette-selected parents via crossover plus mutation.
pub(crate) fn breed<R: Rng + ?Sized>(
    ranked: &[RankedWorm],
    options: &SimulationOptions,
    rng: &mut R,
) -> Vec<Gene> {
    let count = ranked.len();
    let preserved = options.simulation.preserved_worms.min(count);
    let total_fitness: f32 = ranked.iter().map(|worm| worm.fitness).sum();
    let phases = options.gene.phases;

    let mut genes = Vec::with_capacity(count);
    for worm in &ranked[..preserved] {
        genes.push(worm.gene.clone());
    }
    for _ in preserved..count {
        let first = roulette_pick(ranked, total_fitness, rng);
        let second = roulette_pick(ranked, total_fitness, rng);
        let mut child = Gene::crossover(&ranked[first].gene, &ranked[second].gene, phases, rng);
        child.mutate(phases, options.gene.mutation, rng);
        genes.push(child);
    }
    genes
}

/// Fitness-proportionate selection over a ranked population. When the total
/// fitness is zero or negative the draw cannot cross zero the usual way; the
/// last individual scanned is returned so selection always terminates.
fn roulette_pick<R: Rng + ?Sized>(ranked: &[RankedWorm], total_fitness: f32, rng: &mut R) -> usize {
    let mut remaining = rng.random::<f32>() * total_fitness;
    for (index, worm) in ranked.iter().enumerate() {
        remaining -= worm.fitness;
        if remaining <= 0.0 {
            return index;
        }
    }
    ranked.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::testing::StubPhysics;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    fn small_options() -> SimulationOptions {
        let mut options = SimulationOptions::default();
        options.simulation.worms_per_generation = 4;
        options.simulation.preserved_worms = 2;
        options.simulation.timestep = 100.0;
        options.simulation.duration = 400.0;
        options.gene.phases = 8;
        options.gene.period = 2;
        options
    }

    fn engine() -> (
        GenerationEngine,
        mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        GenerationEngine::new(small_options(), &StubPhysics::default()).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn lifecycle_state_machine() {
        let (mut engine, mut rx) = engine();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.pause());
        assert!(!engine.resume());

        assert!(engine.start());
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.generation(), 1);
        assert!(!engine.start());

        assert!(engine.pause());
        assert_eq!(engine.state(), EngineState::Paused);
        assert!(!engine.pause());

        // start while paused acts as resume
        assert!(engine.start());
        assert_eq!(engine.state(), EngineState::Running);

        assert!(engine.terminate());
        assert_eq!(engine.state(), EngineState::Terminated);
        assert!(!engine.terminate());
        assert!(!engine.start());

        let events = drain(&mut rx);
        assert!(matches!(events[0], EngineEvent::Start));
        assert!(matches!(events.last(), Some(EngineEvent::Terminate)));
    }

    #[test]
    fn phase_advances_once_per_period() {
        let (mut engine, _rx) = engine();
        engine.start();
        assert_eq!(engine.phase, 0);
        engine.step();
        assert_eq!((engine.period, engine.phase), (1, 0));
        engine.step();
        assert_eq!((engine.period, engine.phase), (0, 1));
    }

    #[test]
    fn generation_end_ranks_and_preserves_elites() {
        let (mut engine, mut rx) = engine();
        engine.start();
        for _ in 0..4 {
            engine.step();
        }

        let events = drain(&mut rx);
        let Some(EngineEvent::GenerationEnd {
            generation,
            ranked,
            average_fitness,
        }) = events.iter().rev().find(|event| {
            matches!(event, EngineEvent::GenerationEnd { .. })
        })
        else {
            panic!("no generation end emitted");
        };

        // Stub worlds pin slot n's fitness at 10 * n.
        assert_eq!(*generation, 1);
        let fitness: Vec<f32> = ranked.iter().map(|worm| worm.fitness).collect();
        assert_eq!(fitness, vec![30.0, 20.0, 10.0, 0.0]);
        assert_eq!(*average_fitness, 15.0);

        // Population size holds and the top genes carried over unchanged.
        assert_eq!(engine.worms().len(), 4);
        assert_eq!(engine.generation(), 2);
        assert_eq!(engine.worms()[0].gene, ranked[0].gene);
        assert_eq!(engine.worms()[1].gene, ranked[1].gene);
        assert!(engine.worms().iter().all(|worm| worm.is_attached()));
        assert_eq!(engine.state(), EngineState::Running);
    }

    #[test]
    fn tick_events_carry_accumulating_time() {
        let (mut engine, mut rx) = engine();
        engine.start();
        engine.step();
        engine.step();
        let ticks: Vec<(f32, f32)> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::Tick {
                    generation_time,
                    total_engine_time,
                } => Some((generation_time, total_engine_time)),
                _ => None,
            })
            .collect();
        assert_eq!(ticks, vec![(100.0, 100.0), (200.0, 200.0)]);
    }

    #[test]
    fn apply_genes_validates_count_and_shape() {
        let (mut engine, _rx) = engine();
        let mut rng = ChaCha12Rng::seed_from_u64(1);

        let wrong_count = vec![Gene::random(4, 8, &mut rng)];
        assert!(matches!(
            engine.apply_genes(wrong_count),
            Err(WormerError::ProtocolViolation(_))
        ));

        let wrong_shape = (0..4).map(|_| Gene::random(4, 64, &mut rng)).collect();
        assert!(matches!(
            engine.apply_genes(wrong_shape),
            Err(WormerError::MalformedGene(_))
        ));

        let genes: Vec<Gene> = (0..4).map(|_| Gene::random(4, 8, &mut rng)).collect();
        engine.apply_genes(genes.clone()).unwrap();
        assert_eq!(engine.worms()[2].gene, genes[2]);
    }

    #[test]
    fn roulette_terminates_on_degenerate_fitness() {
        let mut rng = ChaCha12Rng::seed_from_u64(9);
        let ranked: Vec<RankedWorm> = (0..3)
            .map(|_| RankedWorm {
                gene: Gene::random(4, 8, &mut rng),
                fitness: 0.0,
            })
            .collect();
        for _ in 0..32 {
            assert!(roulette_pick(&ranked, 0.0, &mut rng) < 3);
        }

        let negative: Vec<RankedWorm> = ranked
            .iter()
            .map(|worm| RankedWorm {
                gene: worm.gene.clone(),
                fitness: -1.0,
            })
            .collect();
        for _ in 0..32 {
            assert!(roulette_pick(&negative, -3.0, &mut rng) < 3);
        }
    }

    #[test]
    fn breeding_keeps_population_size() {
        let mut rng = ChaCha12Rng::seed_from_u64(3);
        let options = small_options();
        let ranked: Vec<RankedWorm> = (0..4)
            .map(|index| RankedWorm {
                gene: Gene::random(4, 8, &mut rng),
                fitness: (4 - index) as f32,
            })
            .collect();
        let genes = breed(&ranked, &options, &mut rng);
        assert_eq!(genes.len(), 4);
        assert_eq!(genes[0], ranked[0].gene);
        assert_eq!(genes[1], ranked[1].gene);
    }
}

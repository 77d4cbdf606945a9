use serde::{Deserialize, Serialize};

use crate::error::{Result, WormerError};

/// Full configuration for one evolution run. Wire names match the JSON shape
/// accepted by the control surface and stored in snapshots.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationOptions {
    pub simulation: RunOptions,
    pub worm: WormOptions,
    pub gene: GeneOptions,
    pub worker: WorkerOptions,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    pub worms_per_generation: usize,
    pub preserved_worms: usize,
    /// Fixed timestep in milliseconds.
    pub timestep: f32,
    /// Delay between ticks as a multiple of the timestep. Zero runs the
    /// simulation as fast as the host allows.
    pub speed_factor: f32,
    /// Evaluation window per generation, in milliseconds.
    pub duration: f32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WormOptions {
    pub width: f32,
    pub length: f32,
    pub density: f32,
    pub joints: usize,
    pub stiffness: f32,
    pub friction: f32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneOptions {
    /// Number of discrete points in the repeating control cycle.
    pub phases: usize,
    /// Simulation ticks held per phase before advancing to the next.
    pub period: usize,
    /// Per-bit flip probability applied after crossover.
    pub mutation: f32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerOptions {
    /// Largest partition a single worker simulates itself; anything bigger
    /// is split across children.
    pub worms_per_worker: usize,
    pub children_per_node: usize,
    /// Fraction of a generation's ticks between progress reports.
    pub report_rate: f32,
    /// Minimum change in aggregated progress before a branch forwards it.
    pub progress_epsilon: f32,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            simulation: RunOptions::default(),
            worm: WormOptions::default(),
            gene: GeneOptions::default(),
            worker: WorkerOptions::default(),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            worms_per_generation: 30,
            preserved_worms: 4,
            timestep: 1000.0 / 60.0,
            speed_factor: 0.0,
            duration: 15_000.0,
        }
    }
}

impl Default for WormOptions {
    fn default() -> Self {
        Self {
            width: 10.0,
            length: 100.0,
            density: 0.001,
            joints: 4,
            stiffness: 0.4,
            friction: 0.5,
        }
    }
}

impl Default for GeneOptions {
    fn default() -> Self {
        Self {
            phases: 128,
            period: 5,
            mutation: 0.01,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worms_per_worker: 2,
            children_per_node: 2,
            report_rate: 0.1,
            progress_epsilon: 0.05,
        }
    }
}

impl SimulationOptions {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(WormerError::InvalidOptions(message.to_string()));

        if self.simulation.worms_per_generation == 0 {
            return invalid("wormsPerGeneration must be at least 1");
        }
        if self.simulation.preserved_worms > self.simulation.worms_per_generation {
            return invalid("preservedWorms cannot exceed wormsPerGeneration");
        }
        if !(self.simulation.timestep > 0.0) {
            return invalid("timestep must be positive");
        }
        if !(self.simulation.duration >= self.simulation.timestep) {
            return invalid("duration must cover at least one timestep");
        }
        if self.simulation.speed_factor < 0.0 {
            return invalid("speedFactor cannot be negative");
        }
        if self.worm.joints < 2 {
            return invalid("a worm needs at least 2 joints");
        }
        if !(self.worm.length > 0.0) || !(self.worm.width > 0.0) {
            return invalid("worm dimensions must be positive");
        }
        if !(self.worm.density > 0.0) {
            return invalid("worm density must be positive");
        }
        if self.gene.phases == 0 {
            return invalid("phases must be at least 1");
        }
        if self.gene.period == 0 {
            return invalid("period must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.gene.mutation) {
            return invalid("mutation must be within [0, 1]");
        }
        if self.worker.worms_per_worker == 0 {
            return invalid("wormsPerWorker must be at least 1");
        }
        if self.worker.children_per_node < 2 {
            return invalid("childrenPerNode must be at least 2");
        }
        if !(self.worker.report_rate > 0.0 && self.worker.report_rate <= 1.0) {
            return invalid("reportRate must be within (0, 1]");
        }
        if self.worker.progress_epsilon < 0.0 {
            return invalid("progressEpsilon cannot be negative");
        }
        Ok(())
    }

    /// Number of controllable constraints per worm: two per adjacent segment
    /// pair, one at each attachment point.
    pub fn constraint_count(&self) -> usize {
        (self.worm.joints - 1) * 2
    }

    pub fn ticks_per_generation(&self) -> usize {
        (self.simulation.duration / self.simulation.timestep).ceil() as usize
    }
}

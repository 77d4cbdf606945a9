use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{GeneOptions, WormOptions};
use crate::error::{Result, WormerError};
use crate::gene::{Gene, constraint_count};
use crate::physics::{ActuatorSpec, BodyHandle, PhysicsWorld};

/// Constraint rest length while the controlling gene bit is set.
pub const EXTENDED_LENGTH: f32 = 6.0;
/// Constraint rest length while the controlling gene bit is clear.
pub const RELAXED_LENGTH: f32 = 2.0;

#[derive(Clone, Copy, Debug)]
struct Attachment {
    slot: usize,
    body: BodyHandle,
}

/// One individual: body parameters, its control gene and last measured
/// fitness, plus a reference (never ownership) to the physics body currently
/// carrying it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worm {
    pub length: f32,
    pub width: f32,
    pub density: f32,
    pub joints: usize,
    pub stiffness: f32,
    pub friction: f32,
    pub gene: Gene,
    #[serde(default)]
    pub fitness: f32,
    #[serde(skip)]
    attachment: Option<Attachment>,
}

impl Worm {
    pub fn with_gene(options: &WormOptions, gene: Gene) -> Self {
        Self {
            length: options.length,
            width: options.width,
            density: options.density,
            joints: options.joints,
            stiffness: options.stiffness,
            friction: options.friction,
            gene,
            fitness: 0.0,
            attachment: None,
        }
    }

    pub fn random<R: Rng + ?Sized>(
        options: &WormOptions,
        gene_options: &GeneOptions,
        rng: &mut R,
    ) -> Self {
        let gene = Gene::random(options.joints, gene_options.phases, rng);
        Self::with_gene(options, gene)
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    /// Builds this worm's articulated body in `world`, identified by `slot`.
    /// Re-attaching to the slot already held is a no-op; attaching while
    /// bound to a different slot fails.
    pub fn attach(&mut self, slot: usize, world: &mut dyn PhysicsWorld) -> Result<()> {
        if let Some(attachment) = &self.attachment {
            if attachment.slot == slot {
                return Ok(());
            }
            return Err(WormerError::AlreadyAttached);
        }

        let spec = ActuatorSpec {
            segment_count: self.joints,
            segment_length: self.length / self.joints as f32,
            segment_width: self.width,
            density: self.density,
            joint_stiffness: self.stiffness,
            joint_friction: self.friction,
        };
        let body = world.create_actuated_body(&spec);
        self.attachment = Some(Attachment { slot, body });
        Ok(())
    }

    pub fn detach(&mut self, world: &mut dyn PhysicsWorld, remove_body: bool) {
        if let Some(attachment) = self.attachment.take()
            && remove_body
        {
            world.remove_body(attachment.body);
        }
    }

    /// Drives every constraint to its extended or relaxed length for the
    /// given phase. Called once per timestep, before the world update.
    pub fn tick(&self, world: &mut dyn PhysicsWorld, phase: usize) {
        let Some(attachment) = &self.attachment else {
            debug_assert!(false, "tick on a detached worm");
            return;
        };
        for joint in 0..constraint_count(self.joints) {
            let length = if self.gene.is_set(joint, phase) {
                EXTENDED_LENGTH
            } else {
                RELAXED_LENGTH
            };
            world.set_joint_target_length(attachment.body, joint, length);
        }
    }

    /// Position of the trailing-most segment along the travel axis. Stable
    /// between ticks; worms progress toward +x, so larger is better.
    pub fn measure_fitness(&self, world: &dyn PhysicsWorld) -> f32 {
        let Some(attachment) = &self.attachment else {
            return 0.0;
        };
        let trailing = world
            .segment_positions(attachment.body)
            .iter()
            .map(|(x, _)| *x)
            .fold(f32::INFINITY, f32::min);
        if trailing.is_finite() { trailing } else { 0.0 }
    }
}

use rapier2d::na::Vector2;
use rapier2d::prelude::*;

const WORLD_WIDTH: f32 = 2000.0;
const WORLD_HEIGHT: f32 = 300.0;
const SPAWN_X: f32 = 50.0;
const GRAVITY: f32 = 1000.0;
const GROUND_FRICTION: f32 = 1.0;
const JOINT_STIFFNESS_SCALE: f32 = 60.0;
const JOINT_DAMPING_SCALE: f32 = 2.0;

/// Geometry and joint parameters for one articulated crawler body.
#[derive(Clone, Copy, Debug)]
pub struct ActuatorSpec {
    pub segment_count: usize,
    pub segment_length: f32,
    pub segment_width: f32,
    pub density: f32,
    pub joint_stiffness: f32,
    pub joint_friction: f32,
}

/// Opaque reference to an actuated body inside a [`PhysicsWorld`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BodyHandle(usize);

/// The narrow interface the evolution core uses to talk to the physical
/// simulation collaborator. One world hosts one worm's evaluation; worlds are
/// owned exclusively by the leaf that created them.
pub trait PhysicsWorld: Send {
    fn create_actuated_body(&mut self, spec: &ActuatorSpec) -> BodyHandle;

    fn remove_body(&mut self, body: BodyHandle);

    /// Retargets constraint `joint` of `body` to the given rest length.
    /// Joints are indexed in segment order, alternating upper and lower
    /// attachment points.
    fn set_joint_target_length(&mut self, body: BodyHandle, joint: usize, length: f32);

    fn step(&mut self, dt_millis: f32);

    /// World-space segment centers, in segment order along the travel axis.
    fn segment_positions(&self, body: BodyHandle) -> Vec<(f32, f32)>;
}

/// Factory handed to every leaf so it can create its own isolated worlds.
pub trait PhysicsEngine: Send + Sync {
    fn create_world(&self) -> Box<dyn PhysicsWorld>;
}

/// Production collaborator backed by rapier2d. The arena is a flat ground
/// strip with a wall behind the spawn point; worms crawl toward +x.
pub struct RapierPhysics;

impl PhysicsEngine for RapierPhysics {
    fn create_world(&self) -> Box<dyn PhysicsWorld> {
        Box::new(RapierWorld::new())
    }
}

struct JointSlot {
    handle: ImpulseJointHandle,
    stiffness: f32,
    damping: f32,
}

struct ActuatorBody {
    segments: Vec<RigidBodyHandle>,
    joints: Vec<JointSlot>,
}

pub struct RapierWorld {
    pipeline: PhysicsPipeline,
    gravity: Vector2<f32>,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: BroadPhaseBvh,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    actuators: Vec<Option<ActuatorBody>>,
}

impl RapierWorld {
    pub fn new() -> Self {
        let mut bodies = RigidBodySet::new();
        let mut colliders = ColliderSet::new();

        let ground = bodies.insert(RigidBodyBuilder::fixed().build());
        let ground_collider = ColliderBuilder::cuboid(WORLD_WIDTH / 2.0 + 25.0, 25.0)
            .translation(vector![WORLD_WIDTH / 2.0 - 50.0, -25.0])
            .friction(GROUND_FRICTION)
            .build();
        colliders.insert_with_parent(ground_collider, ground, &mut bodies);

        let wall = bodies.insert(RigidBodyBuilder::fixed().build());
        let wall_collider = ColliderBuilder::cuboid(25.0, WORLD_HEIGHT / 2.0)
            .translation(vector![-25.0, WORLD_HEIGHT / 2.0])
            .build();
        colliders.insert_with_parent(wall_collider, wall, &mut bodies);

        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![0.0, -GRAVITY],
            integration_parameters: IntegrationParameters::default(),
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseBvh::new(),
            narrow_phase: NarrowPhase::new(),
            bodies,
            colliders,
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            actuators: Vec::new(),
        }
    }
}

impl Default for RapierWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicsWorld for RapierWorld {
    fn create_actuated_body(&mut self, spec: &ActuatorSpec) -> BodyHandle {
        let half_width = spec.segment_width / 2.0;
        let segment_length = spec.segment_length;
        let stiffness = spec.joint_stiffness * JOINT_STIFFNESS_SCALE;
        let damping = spec.joint_friction * JOINT_DAMPING_SCALE;

        let mut segments = Vec::with_capacity(spec.segment_count);
        let mut joints = Vec::with_capacity(spec.segment_count.saturating_sub(1) * 2);

        for index in 0..spec.segment_count {
            let center_x = SPAWN_X + segment_length / 2.0 + segment_length * index as f32;
            let body = RigidBodyBuilder::dynamic()
                .translation(vector![center_x, half_width])
                .build();
            let segment = self.bodies.insert(body);
            // Segments are one unit shorter than their pitch, leaving a gap
            // the joints work across.
            let collider = ColliderBuilder::cuboid((segment_length - 1.0) / 2.0, half_width)
                .density(spec.density)
                .friction(spec.joint_friction)
                .build();
            self.colliders
                .insert_with_parent(collider, segment, &mut self.bodies);

            if index > 0 {
                let previous = segments[index - 1];
                for anchor_y in [half_width, -half_width] {
                    let joint = SpringJointBuilder::new(2.0, stiffness, damping)
                        .local_anchor1(point![segment_length / 2.0 - 1.0, anchor_y])
                        .local_anchor2(point![-segment_length / 2.0, anchor_y]);
                    let handle = self.impulse_joints.insert(previous, segment, joint, true);
                    joints.push(JointSlot {
                        handle,
                        stiffness,
                        damping,
                    });
                }
            }
            segments.push(segment);
        }

        self.actuators.push(Some(ActuatorBody { segments, joints }));
        BodyHandle(self.actuators.len() - 1)
    }

    fn remove_body(&mut self, body: BodyHandle) {
        let Some(actuator) = self.actuators.get_mut(body.0).and_then(Option::take) else {
            return;
        };
        for joint in &actuator.joints {
            self.impulse_joints.remove(joint.handle, true);
        }
        for segment in &actuator.segments {
            self.bodies.remove(
                *segment,
                &mut self.island_manager,
                &mut self.colliders,
                &mut self.impulse_joints,
                &mut self.multibody_joints,
                true,
            );
        }
    }

    fn set_joint_target_length(&mut self, body: BodyHandle, joint: usize, length: f32) {
        let Some(actuator) = self.actuators.get(body.0).and_then(Option::as_ref) else {
            return;
        };
        let Some(slot) = actuator.joints.get(joint) else {
            return;
        };
        if let Some(joint_ref) = self.impulse_joints.get_mut(slot.handle, true) {
            joint_ref
                .data
                .set_motor_position(JointAxis::LinX, length, slot.stiffness, slot.damping);
        }
    }

    fn step(&mut self, dt_millis: f32) {
        self.integration_parameters.dt = dt_millis / 1000.0;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &(),
        );
    }

    fn segment_positions(&self, body: BodyHandle) -> Vec<(f32, f32)> {
        let Some(actuator) = self.actuators.get(body.0).and_then(Option::as_ref) else {
            return Vec::new();
        };
        actuator
            .segments
            .iter()
            .filter_map(|segment| self.bodies.get(*segment))
            .map(|segment| {
                let translation = segment.translation();
                (translation.x, translation.y)
            })
            .collect()
    }
}

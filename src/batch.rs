//! Per-actor trajectory storage and the flattened tensors used by the learners.
//!
//! Flattened tensors are actor-major: row `actor * steps + step`. The helpers
//! below move between that layout and the `(steps, n_envs, ..)` layout the
//! backward recursions iterate over.

use tch::{Device, Kind, Tensor};

/// `n_steps` consecutive transitions of one actor plus the bootstrap state.
///
/// `behavior[t]` is whatever the behaviour policy emitted at collection time
/// (action probabilities, or `[log_prob, value]`), kept verbatim.
#[derive(Clone, Debug, PartialEq)]
pub struct ActorSegment {
    pub states: Vec<Vec<f32>>,
    pub rewards: Vec<f32>,
    pub actions: Vec<i64>,
    pub dones: Vec<f32>,
    pub behavior: Vec<Vec<f32>>,
}

impl ActorSegment {
    pub fn n_steps(&self) -> usize {
        self.rewards.len()
    }

    fn check(&self) {
        let n = self.rewards.len();
        assert!(n > 0, "actor segment holds no transitions");
        assert_eq!(
            self.states.len(),
            n + 1,
            "segment needs n_steps + 1 states (bootstrap included)"
        );
        assert_eq!(self.actions.len(), n, "actions/rewards length mismatch");
        assert_eq!(self.dones.len(), n, "dones/rewards length mismatch");
        assert_eq!(self.behavior.len(), n, "behavior/rewards length mismatch");
    }
}

/// One collection round: a segment per actor, all of the same length.
#[derive(Clone, Debug)]
pub struct TrajectoryBatch {
    pub segments: Vec<ActorSegment>,
}

/// Flattened batch, ready for a gradient update.
#[derive(Debug)]
pub struct FlatBatch {
    /// `(n_envs * (n_steps + 1), state_dim)`
    pub states: Tensor,
    /// `(n_envs * n_steps)`
    pub rewards: Tensor,
    /// `(n_envs * n_steps)`, Int64
    pub actions: Tensor,
    /// `(n_envs * n_steps)`
    pub dones: Tensor,
    /// `(n_envs * n_steps, behavior_width)`
    pub behavior: Tensor,
    pub n_envs: usize,
    pub n_steps: usize,
}

impl TrajectoryBatch {
    pub fn new(segments: Vec<ActorSegment>) -> Self {
        assert!(!segments.is_empty(), "trajectory batch needs at least one actor");
        for segment in &segments {
            segment.check();
        }
        let n_steps = segments[0].n_steps();
        let state_dim = segments[0].states[0].len();
        let width = segments[0].behavior[0].len();
        for segment in &segments {
            assert_eq!(segment.n_steps(), n_steps, "actors disagree on n_steps");
            assert!(
                segment.states.iter().all(|s| s.len() == state_dim),
                "state dimension mismatch"
            );
            assert!(
                segment.behavior.iter().all(|b| b.len() == width),
                "behavior output width mismatch"
            );
        }
        TrajectoryBatch { segments }
    }

    pub fn n_envs(&self) -> usize {
        self.segments.len()
    }

    pub fn n_steps(&self) -> usize {
        self.segments[0].n_steps()
    }

    pub fn flatten(&self, device: Device) -> FlatBatch {
        let n_envs = self.n_envs();
        let n_steps = self.n_steps();
        let state_dim = self.segments[0].states[0].len() as i64;
        let width = self.segments[0].behavior[0].len() as i64;

        let mut states = Vec::new();
        let mut rewards = Vec::with_capacity(n_envs * n_steps);
        let mut actions = Vec::with_capacity(n_envs * n_steps);
        let mut dones = Vec::with_capacity(n_envs * n_steps);
        let mut behavior = Vec::new();
        for segment in &self.segments {
            segment.states.iter().for_each(|s| states.extend_from_slice(s));
            rewards.extend_from_slice(&segment.rewards);
            actions.extend_from_slice(&segment.actions);
            dones.extend_from_slice(&segment.dones);
            segment
                .behavior
                .iter()
                .for_each(|b| behavior.extend_from_slice(b));
        }

        FlatBatch {
            states: Tensor::from_slice(&states)
                .view([-1, state_dim])
                .to_device(device),
            rewards: Tensor::from_slice(&rewards).to_device(device),
            actions: Tensor::from_slice(&actions).to_device(device),
            dones: Tensor::from_slice(&dones).to_device(device),
            behavior: Tensor::from_slice(&behavior)
                .view([-1, width])
                .to_device(device),
            n_envs,
            n_steps,
        }
    }
}

impl FlatBatch {
    /// States without the bootstrap step, `(n_envs * n_steps, state_dim)`.
    pub fn step_states(&self) -> Tensor {
        clip_last_step(&self.states, self.n_envs, self.n_steps)
    }

    /// The bootstrap state of every actor, `(n_envs, state_dim)`.
    pub fn bootstrap_states(&self) -> Tensor {
        let dim = self.states.size()[1];
        self.states
            .view([self.n_envs as i64, self.n_steps as i64 + 1, dim])
            .select(1, self.n_steps as i64)
    }
}

fn trailing_dims(t: &Tensor) -> Vec<i64> {
    t.size()[1..].to_vec()
}

/// `(n_envs * steps, ..) -> (steps, n_envs, ..)`
pub fn flat_to_steps(t: &Tensor, n_envs: usize, steps: usize) -> Tensor {
    let rows = t.size()[0];
    assert_eq!(
        rows,
        (n_envs * steps) as i64,
        "cannot split {rows} rows into {n_envs} actors x {steps} steps"
    );
    let mut shape = vec![n_envs as i64, steps as i64];
    shape.extend(trailing_dims(t));
    t.reshape(shape.as_slice()).transpose(0, 1).contiguous()
}

/// `(steps, n_envs, ..) -> (n_envs * steps, ..)`, inverse of [`flat_to_steps`].
pub fn steps_to_flat(t: &Tensor) -> Tensor {
    let size = t.size();
    assert!(size.len() >= 2, "expected a (steps, n_envs, ..) tensor");
    let mut shape = vec![size[0] * size[1]];
    shape.extend_from_slice(&size[2..]);
    t.transpose(0, 1).contiguous().reshape(shape.as_slice())
}

/// Drops each actor's bootstrap row: `(n_envs * (n_steps + 1), ..) -> (n_envs * n_steps, ..)`.
pub fn clip_last_step(t: &Tensor, n_envs: usize, n_steps: usize) -> Tensor {
    let rows = t.size()[0];
    assert_eq!(
        rows,
        (n_envs * (n_steps + 1)) as i64,
        "expected n_envs * (n_steps + 1) rows"
    );
    let trailing = trailing_dims(t);
    let mut shape = vec![n_envs as i64, n_steps as i64 + 1];
    shape.extend(trailing.iter().copied());
    let mut out_shape = vec![(n_envs * n_steps) as i64];
    out_shape.extend(trailing);
    t.reshape(shape.as_slice())
        .narrow(1, 0, n_steps as i64)
        .reshape(out_shape.as_slice())
}

/// Builds a batch from independently sampled per-actor segments.
pub fn concat_segments(segments: Vec<ActorSegment>) -> TrajectoryBatch {
    TrajectoryBatch::new(segments)
}

pub(crate) fn to_f32_vec(t: &Tensor) -> Vec<f32> {
    let flat = t.to_kind(Kind::Float).to_device(Device::Cpu).reshape([-1]);
    Vec::<f32>::try_from(&flat).unwrap_or_else(|e| panic!("tensor conversion to f32 failed: {e}"))
}

pub(crate) fn to_i64_vec(t: &Tensor) -> Vec<i64> {
    let flat = t.to_kind(Kind::Int64).to_device(Device::Cpu).reshape([-1]);
    Vec::<i64>::try_from(&flat).unwrap_or_else(|e| panic!("tensor conversion to i64 failed: {e}"))
}

/// Splits a `(rows, width)` tensor into one `Vec` per row.
pub(crate) fn to_rows(t: &Tensor) -> Vec<Vec<f32>> {
    let width = t.size()[1] as usize;
    to_f32_vec(t).chunks(width).map(<[f32]>::to_vec).collect()
}

use tch::{Device, Tensor};

use crate::batch::{ActorSegment, TrajectoryBatch};
use crate::environment::Environment;
use crate::utils::ToTensor;

/// Steps a fixed set of environments in lock-step and records their transitions.
pub struct RolloutCollector<E: Environment> {
    envs: Vec<E>,
    states: Vec<Vec<f32>>,
    running_rewards: Vec<f32>,
    completed: Vec<f32>,
    total_steps: usize,
    device: Device,
}

impl<E: Environment> RolloutCollector<E> {
    pub fn new(mut envs: Vec<E>, device: Device) -> Self {
        assert!(!envs.is_empty(), "collector needs at least one environment");
        let states = envs.iter_mut().map(|env| env.reset().to_features()).collect();
        let running_rewards = vec![0.0; envs.len()];
        RolloutCollector {
            envs,
            states,
            running_rewards,
            completed: Vec::new(),
            total_steps: 0,
            device,
        }
    }

    pub fn n_envs(&self) -> usize {
        self.envs.len()
    }

    pub fn state_dim(&self) -> usize {
        self.envs[0].state_dim()
    }

    pub fn action_space(&self) -> usize {
        self.envs[0].action_space()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Environment steps taken so far, summed over actors.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Current states as a `(n_envs, state_dim)` tensor.
    pub fn states_tensor(&self) -> Tensor {
        let flat: Vec<f32> = self.states.iter().flatten().copied().collect();
        Tensor::from_slice(&flat)
            .view([self.n_envs() as i64, -1])
            .to_device(self.device)
    }

    /// Returns of episodes finished since the previous call.
    pub fn take_completed_episodes(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.completed)
    }

    /// Runs `n_steps` lock-step transitions. `act` maps the current states to
    /// one action and one behaviour output per actor.
    pub fn collect<F>(&mut self, n_steps: usize, mut act: F) -> TrajectoryBatch
    where
        F: FnMut(&Tensor) -> (Vec<i64>, Vec<Vec<f32>>),
    {
        let n_envs = self.n_envs();
        let mut segments: Vec<ActorSegment> = (0..n_envs)
            .map(|_| ActorSegment {
                states: Vec::with_capacity(n_steps + 1),
                rewards: Vec::with_capacity(n_steps),
                actions: Vec::with_capacity(n_steps),
                dones: Vec::with_capacity(n_steps),
                behavior: Vec::with_capacity(n_steps),
            })
            .collect();

        for _ in 0..n_steps {
            let (actions, behavior) = act(&self.states_tensor());
            assert_eq!(actions.len(), n_envs, "one action per actor expected");
            assert_eq!(behavior.len(), n_envs, "one behaviour output per actor expected");

            for (i, (action, output)) in actions.into_iter().zip(behavior).enumerate() {
                let result = self.envs[i].step(&E::Action::from(action));
                let reward: f32 = result.reward.into();
                self.running_rewards[i] += reward;

                let segment = &mut segments[i];
                segment.states.push(std::mem::take(&mut self.states[i]));
                segment.rewards.push(reward);
                segment.actions.push(action);
                segment.dones.push(if result.done { 1.0 } else { 0.0 });
                segment.behavior.push(output);

                self.states[i] = if result.done {
                    self.completed.push(self.running_rewards[i]);
                    self.running_rewards[i] = 0.0;
                    self.envs[i].reset().to_features()
                } else {
                    result.next_state.to_features()
                };
            }
            self.total_steps += n_envs;
        }

        for (segment, state) in segments.iter_mut().zip(&self.states) {
            segment.states.push(state.clone());
        }
        TrajectoryBatch::new(segments)
    }
}

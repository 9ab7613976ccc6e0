//! Clipped-surrogate policy optimisation on freshly collected rollouts.

use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tch::nn::OptimizerConfig;
use tch::{Device, Kind, Tensor, nn};

use crate::agent::{Agent, StepStats, UpdateStats};
use crate::batch::{FlatBatch, flat_to_steps, steps_to_flat, to_f32_vec, to_i64_vec, to_rows};
use crate::collector::RolloutCollector;
use crate::config::{PpoConfig, TrainerConfig};
use crate::environment::Environment;
use crate::gradients::{apply_gradients, clip_by_global_norm, global_norm, parameter_grads, require_grads};
use crate::losses::{PpoInputs, categorical_entropy, ppo_losses};
use crate::networks::ActorCritic;
use crate::policy::Policy;
use crate::returns::{Gae, gae, standardize};
use crate::utils::ToTensor;

pub struct PpoAgent<M: ActorCritic> {
    model: M,
    optimizer: nn::Optimizer,
    config: PpoConfig,
    gamma: f64,
    entropy_coef: f64,
    value_loss_coef: f64,
    rng: StdRng,
    device: Device,
}

/// Flat training tensors of one rollout, row-aligned.
#[derive(Debug)]
pub struct PpoBatch {
    pub states: Tensor,
    pub actions: Tensor,
    pub old_log_probs: Tensor,
    pub old_values: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
}

impl PpoBatch {
    pub fn len(&self) -> usize {
        self.actions.size()[0] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn select(&self, idx: &Tensor) -> PpoBatch {
        PpoBatch {
            states: self.states.index_select(0, idx),
            actions: self.actions.index_select(0, idx),
            old_log_probs: self.old_log_probs.index_select(0, idx),
            old_values: self.old_values.index_select(0, idx),
            advantages: self.advantages.index_select(0, idx),
            returns: self.returns.index_select(0, idx),
        }
    }
}

impl<M: ActorCritic> PpoAgent<M> {
    pub fn new(model: M, trainer: &TrainerConfig, config: PpoConfig) -> Result<Self> {
        assert_eq!(model.critic_dim(), 1, "PPO needs a scalar state-value head");
        let optimizer = nn::Adam::default().build(model.var_store(), trainer.learning_rate)?;
        let device = model.var_store().device();
        Ok(PpoAgent {
            model,
            optimizer,
            config,
            gamma: trainer.gamma,
            entropy_coef: trainer.entropy_coef,
            value_loss_coef: trainer.value_loss_coef,
            rng: StdRng::seed_from_u64(trainer.seed),
            device,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Samples actions; the behaviour output is `[log_prob, value]` per actor.
    fn behave(model: &M, states: &Tensor) -> (Vec<i64>, Vec<Vec<f32>>) {
        let _no_grad_guard = tch::no_grad_guard();
        let out = model.forward(states);
        let log_probs = out.logits.log_softmax(-1, Kind::Float);
        let actions = log_probs.exp().multinomial(1, true);
        let selected = log_probs.gather(1, &actions, false);
        let behavior = Tensor::cat(&[selected, out.critic], 1);
        (to_i64_vec(&actions), to_rows(&behavior))
    }

    pub fn collect_batch<E: Environment>(&mut self, collector: &mut RolloutCollector<E>) -> FlatBatch {
        let model = &self.model;
        collector
            .collect(self.config.n_steps, |states| Self::behave(model, states))
            .flatten(self.device)
    }

    /// GAE over the collected rollout, flattened actor-major. Step values are the
    /// ones recorded at collection time; the bootstrap value comes from the
    /// current network.
    pub fn calculate_returns(&self, batch: &FlatBatch) -> Gae {
        let (n_envs, n_steps) = (batch.n_envs, batch.n_steps);
        let _no_grad_guard = tch::no_grad_guard();
        let step_values = flat_to_steps(&batch.behavior.select(1, 1), n_envs, n_steps);
        let bootstrap = self
            .model
            .forward(&batch.bootstrap_states())
            .critic
            .view([1, n_envs as i64]);
        let values = Tensor::cat(&[step_values, bootstrap], 0);
        let estimate = gae(
            &flat_to_steps(&batch.rewards, n_envs, n_steps),
            &flat_to_steps(&batch.dones, n_envs, n_steps),
            &values,
            self.gamma,
            self.config.lambda,
        );
        Gae {
            advantages: steps_to_flat(&estimate.advantages),
            returns: steps_to_flat(&estimate.returns),
        }
    }

    pub fn prepare_batch(&self, batch: &FlatBatch) -> PpoBatch {
        let Gae {
            advantages,
            returns,
        } = self.calculate_returns(batch);
        PpoBatch {
            states: batch.step_states(),
            actions: batch.actions.shallow_clone(),
            old_log_probs: batch.behavior.select(1, 0),
            old_values: batch.behavior.select(1, 1),
            advantages,
            returns,
        }
    }

    /// `ppo_epochs` passes over `batch`, each reshuffled and split into
    /// `mini_batches` equal parts.
    pub fn run_ppo_epochs(&mut self, batch: &PpoBatch) -> Vec<UpdateStats> {
        let n = batch.len();
        assert!(
            n % self.config.mini_batches == 0,
            "batch of {n} transitions cannot be split into {} mini-batches",
            self.config.mini_batches
        );
        let mini_batch_size = n / self.config.mini_batches;
        let mut indices: Vec<i64> = (0..n as i64).collect();
        let mut stats = Vec::with_capacity(self.config.ppo_epochs * self.config.mini_batches);

        for _ in 0..self.config.ppo_epochs {
            indices.shuffle(&mut self.rng);
            for chunk in indices.chunks(mini_batch_size) {
                let idx = Tensor::from_slice(chunk).to_device(self.device);
                let mut mini_batch = batch.select(&idx);
                if self.config.normalize_advantages {
                    mini_batch.advantages =
                        standardize(&mini_batch.advantages, self.config.advantage_epsilon);
                }
                stats.push(self.update_gradients(&mini_batch));
            }
        }
        stats
    }

    pub fn update_gradients(&mut self, mini_batch: &PpoBatch) -> UpdateStats {
        let out = self.model.forward(&mini_batch.states);
        let log_probs = out
            .logits
            .log_softmax(-1, Kind::Float)
            .gather(1, &mini_batch.actions.unsqueeze(1), false)
            .squeeze_dim(1);
        let values = out.critic.squeeze_dim(1);

        let losses = ppo_losses(
            PpoInputs {
                log_probs: &log_probs,
                old_log_probs: &mini_batch.old_log_probs,
                advantages: &mini_batch.advantages,
                values: &values,
                old_values: &mini_batch.old_values,
                returns: &mini_batch.returns,
                entropy: categorical_entropy(&out.logits),
            },
            self.config.clip_norm,
        );
        let loss = losses.combined(self.value_loss_coef, self.entropy_coef);

        let params = self.model.var_store().trainable_variables();
        let mut grads = require_grads(parameter_grads(&loss, &params, false), &params);
        let grad_norm = match self.config.grad_norm {
            Some(max_norm) => clip_by_global_norm(&mut grads, max_norm),
            None => global_norm(&grads),
        };
        apply_gradients(&mut self.optimizer, &params, &grads);

        UpdateStats {
            loss: loss.double_value(&[]),
            grad_norm,
        }
    }
}

impl<S: ToTensor, A: From<i64>, M: ActorCritic> Policy<S, A> for PpoAgent<M> {
    fn select_action(&self, state: &S) -> A {
        let _no_grad_guard = tch::no_grad_guard();
        let logits = self.model.forward(&state.to_tensor().to(self.device)).logits;
        A::from(logits.argmax(-1, false).int64_value(&[0]))
    }

    fn action_probabilities(&self, state: &S) -> Vec<f32> {
        let _no_grad_guard = tch::no_grad_guard();
        let logits = self.model.forward(&state.to_tensor().to(self.device)).logits;
        to_f32_vec(&logits.softmax(-1, Kind::Float))
    }
}

impl<E: Environment, M: ActorCritic> Agent<E> for PpoAgent<M> {
    fn train_step(&mut self, collector: &mut RolloutCollector<E>) -> Result<StepStats> {
        let batch = self.collect_batch(collector);
        let batch = self.prepare_batch(&batch);
        let updates = self.run_ppo_epochs(&batch);
        Ok(StepStats::from_updates(&updates))
    }
}

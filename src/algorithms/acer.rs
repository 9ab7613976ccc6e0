//! Actor-critic with experience replay and an optional trust-region update.

use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use tch::nn::OptimizerConfig;
use tch::{Device, Kind, Tensor, nn};

use crate::agent::{Agent, StepStats, UpdateStats};
use crate::batch::{
    ActorSegment, FlatBatch, clip_last_step, concat_segments, flat_to_steps, steps_to_flat,
    to_f32_vec, to_i64_vec, to_rows,
};
use crate::collector::RolloutCollector;
use crate::config::{AcerConfig, TrainerConfig};
use crate::environment::Environment;
use crate::gradients::{
    MovingAverage, apply_gradients, clip_by_global_norm, global_norm, grad_wrt, merge_grads,
    parameter_grads, require_grads,
};
use crate::losses::{AcerInputs, acer_losses, check_probabilities};
use crate::networks::ActorCritic;
use crate::policy::Policy;
use crate::replay_buffer::ReplayBuffer;
use crate::returns::retrace_returns;
use crate::trust_region;
use crate::utils::ToTensor;

pub struct AcerAgent<M: ActorCritic> {
    model: M,
    avg_model: M,
    moving_average: MovingAverage,
    optimizer: nn::Optimizer,
    buffers: Vec<ReplayBuffer<ActorSegment>>,
    config: AcerConfig,
    gamma: f64,
    entropy_coef: f64,
    value_loss_coef: f64,
    rng: StdRng,
    device: Device,
}

impl<M: ActorCritic> AcerAgent<M> {
    /// `avg_model` must be built like `model`; its weights are overwritten.
    pub fn new(model: M, mut avg_model: M, trainer: &TrainerConfig, config: AcerConfig) -> Result<Self> {
        assert_eq!(
            model.critic_dim(),
            model.n_actions(),
            "ACER needs one critic output (Q value) per action"
        );
        assert_eq!(
            avg_model.n_actions(),
            model.n_actions(),
            "average network has a different action space"
        );
        avg_model.var_store_mut().copy(model.var_store())?;
        let moving_average = MovingAverage::new(model.var_store(), config.ema_alpha);
        let optimizer = nn::Adam::default().build(model.var_store(), trainer.learning_rate)?;
        let buffers = (0..trainer.n_envs)
            .map(|_| {
                ReplayBuffer::new(
                    config.buffer_max_size / trainer.n_envs,
                    config.buffer_initial_size / trainer.n_envs,
                )
            })
            .collect();
        let device = model.var_store().device();

        Ok(AcerAgent {
            model,
            avg_model,
            moving_average,
            optimizer,
            buffers,
            config,
            gamma: trainer.gamma,
            entropy_coef: trainer.entropy_coef,
            value_loss_coef: trainer.value_loss_coef,
            rng: StdRng::seed_from_u64(trainer.seed),
            device,
        })
    }

    pub fn buffers(&self) -> &[ReplayBuffer<ActorSegment>] {
        &self.buffers
    }

    pub fn avg_model(&self) -> &M {
        &self.avg_model
    }

    /// Samples actions and keeps the full probability vectors as behaviour output.
    fn behave(model: &M, states: &Tensor) -> (Vec<i64>, Vec<Vec<f32>>) {
        let probs = tch::no_grad(|| model.forward(states).logits.softmax(-1, Kind::Float));
        let actions = probs.multinomial(1, true).squeeze_dim(1);
        (to_i64_vec(&actions), to_rows(&probs))
    }

    /// Collects `n_steps` per actor, appends each actor's segment to its own
    /// replay buffer and returns the flattened batch.
    pub fn collect_and_store_batch<E: Environment>(
        &mut self,
        collector: &mut RolloutCollector<E>,
    ) -> FlatBatch {
        assert_eq!(
            collector.n_envs(),
            self.buffers.len(),
            "collector and agent disagree on the number of actors"
        );
        let model = &self.model;
        let batch = collector.collect(self.config.n_steps, |states| Self::behave(model, states));
        for (buffer, segment) in self.buffers.iter_mut().zip(&batch.segments) {
            buffer.append(segment.clone());
        }
        batch.flatten(self.device)
    }

    /// One gradient step on `batch`, followed by the moving-average update.
    pub fn update_gradients(&mut self, batch: &FlatBatch) -> UpdateStats {
        let (mut grads, loss) = self.batch_gradients(batch, self.config.trust_region);
        let grad_norm = match self.config.grad_norm {
            Some(max_norm) => clip_by_global_norm(&mut grads, max_norm),
            None => global_norm(&grads),
        };
        let params = self.model.var_store().trainable_variables();
        apply_gradients(&mut self.optimizer, &params, &grads);
        self.moving_average.update(self.model.var_store());
        self.moving_average.sync_into(self.avg_model.var_store_mut());

        UpdateStats { loss, grad_norm }
    }

    /// Unclipped gradients of the ACER loss on `batch`, one per trainable
    /// parameter, plus the combined loss value.
    ///
    /// With `trust_region` the actor part is projected against the average
    /// policy before being pushed through the network.
    fn batch_gradients(&self, batch: &FlatBatch, trust_region: bool) -> (Vec<Tensor>, f64) {
        let (n_envs, n_steps) = (batch.n_envs, batch.n_steps);
        let batch_size = n_envs * n_steps;
        let eps = self.config.epsilon;
        check_probabilities(&batch.behavior, "behaviour policy outputs");

        let out = self.model.forward(&batch.states);
        let probs_all = out.logits.softmax(-1, Kind::Float);
        let avg_probs_all = tch::no_grad(|| {
            self.avg_model
                .forward(&batch.states)
                .logits
                .softmax(-1, Kind::Float)
        });
        let values_all = (&probs_all * &out.critic).sum_dim_intlist(-1, false, Kind::Float);

        let probs = clip_last_step(&probs_all, n_envs, n_steps);
        let avg_probs = clip_last_step(&avg_probs_all, n_envs, n_steps);
        let critic = clip_last_step(&out.critic, n_envs, n_steps);
        let values = clip_last_step(&values_all, n_envs, n_steps);

        let actions = batch.actions.unsqueeze(1);
        let selected_probs = probs.gather(1, &actions, false).squeeze_dim(1);
        let selected_critic = critic.gather(1, &actions, false).squeeze_dim(1);
        let importance = &probs / (&batch.behavior + eps);
        let selected_importance = importance.gather(1, &actions, false).squeeze_dim(1);

        let returns = tch::no_grad(|| {
            let steps = |t: &Tensor| flat_to_steps(&t.detach(), n_envs, n_steps);
            steps_to_flat(&retrace_returns(
                &steps(&batch.rewards),
                &steps(&batch.dones),
                &steps(&selected_critic),
                &flat_to_steps(&values_all.detach(), n_envs, n_steps + 1),
                &steps(&selected_importance),
                self.gamma,
            ))
        });

        let losses = acer_losses(
            &AcerInputs {
                probs: &probs,
                selected_probs: &selected_probs,
                selected_importance: &selected_importance,
                selected_critic: &selected_critic,
                values: &values,
                returns: &returns,
            },
            self.config.importance_c,
            eps,
        );
        let loss_value = losses
            .combined(self.value_loss_coef, self.entropy_coef)
            .double_value(&[]);

        let params = self.model.var_store().trainable_variables();
        let grads = if trust_region {
            let objective = losses.trust_region_objective(self.entropy_coef, batch_size);
            let g = grad_wrt(&objective, &probs, true);
            let g = trust_region::project(&g, &probs.detach(), &avg_probs, self.config.delta, eps);
            let seed = -g / batch_size as f64;
            let actor_grads =
                parameter_grads(&(&probs * seed.detach()).sum(Kind::Float), &params, true);
            let value_loss = &losses.critic * self.value_loss_coef;
            let value_grads = parameter_grads(&value_loss, &params, false);
            merge_grads(actor_grads, value_grads)
        } else {
            let loss = losses.combined(self.value_loss_coef, self.entropy_coef);
            require_grads(parameter_grads(&loss, &params, false), &params)
        };
        (grads, loss_value)
    }

    /// Runs `k ~ Poisson(replay_ratio)` extra updates, each on one freshly
    /// sampled segment per actor. Nothing happens until every buffer is ready.
    pub fn replay_updates(&mut self) -> Result<Vec<UpdateStats>> {
        if self.config.replay_ratio <= 0.0 || !self.buffers.iter().all(ReplayBuffer::is_ready) {
            return Ok(Vec::new());
        }
        let k = Poisson::new(self.config.replay_ratio)?.sample(&mut self.rng) as usize;
        let mut stats = Vec::with_capacity(k);
        for _ in 0..k {
            let mut segments = Vec::with_capacity(self.buffers.len());
            for buffer in &self.buffers {
                segments.extend(buffer.sample(1, &mut self.rng)?);
            }
            let batch = concat_segments(segments).flatten(self.device);
            stats.push(self.update_gradients(&batch));
        }
        log::debug!("ran {k} replay updates");
        Ok(stats)
    }
}

impl<S: ToTensor, A: From<i64>, M: ActorCritic> Policy<S, A> for AcerAgent<M> {
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

impl<E: Environment, M: ActorCritic> Agent<E> for AcerAgent<M> {
    fn train_step(&mut self, collector: &mut RolloutCollector<E>) -> Result<StepStats> {
        let batch = self.collect_and_store_batch(collector);
        let mut updates = vec![self.update_gradients(&batch)];
        updates.extend(self.replay_updates()?);
        Ok(StepStats::from_updates(&updates))
    }
}

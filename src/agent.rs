use anyhow::Result;

use crate::collector::RolloutCollector;
use crate::config::FitConfig;
use crate::environment::Environment;
use crate::policy::Policy;

/// Outcome of a single gradient update.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateStats {
    pub loss: f64,
    /// Global gradient norm before clipping.
    pub grad_norm: f64,
}

/// Outcome of one training iteration (collection plus all its updates).
#[derive(Debug, Clone, Copy, Default)]
pub struct StepStats {
    pub updates: usize,
    pub mean_loss: f64,
    pub last_grad_norm: f64,
}

impl StepStats {
    pub fn from_updates(updates: &[UpdateStats]) -> Self {
        if updates.is_empty() {
            return StepStats::default();
        }
        StepStats {
            updates: updates.len(),
            mean_loss: updates.iter().map(|u| u.loss).sum::<f64>() / updates.len() as f64,
            last_grad_norm: updates[updates.len() - 1].grad_norm,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    pub episode_rewards: Vec<f32>,
    pub iterations: usize,
    pub steps: usize,
    pub reached_target: bool,
}

impl TrainingHistory {
    /// Mean return of the last `window` finished episodes.
    pub fn mean_recent(&self, window: usize) -> Option<f32> {
        if self.episode_rewards.is_empty() || window == 0 {
            return None;
        }
        let start = self.episode_rewards.len().saturating_sub(window);
        let recent = &self.episode_rewards[start..];
        Some(recent.iter().sum::<f32>() / recent.len() as f32)
    }
}

pub trait Agent<E: Environment>: Policy<E::State, E::Action> {
    /// Collects one batch from `collector` and runs every gradient update that
    /// batch triggers.
    fn train_step(&mut self, collector: &mut RolloutCollector<E>) -> Result<StepStats>;

    /// Trains until `config.target_reward` or `config.max_steps` is reached.
    fn fit(&mut self, collector: &mut RolloutCollector<E>, config: &FitConfig) -> Result<TrainingHistory> {
        config.validate()?;
        let mut history = TrainingHistory::default();

        loop {
            let stats = self.train_step(collector)?;
            history.iterations += 1;
            history.steps = collector.total_steps();
            history
                .episode_rewards
                .extend(collector.take_completed_episodes());
            let mean_reward = history.mean_recent(config.reward_window);

            if config.log_every > 0 && history.iterations % config.log_every == 0 {
                log::info!(
                    "iteration {} | steps {} | episodes {} | mean reward {} | loss {:.4} | grad norm {:.4} | updates {}",
                    history.iterations,
                    history.steps,
                    history.episode_rewards.len(),
                    mean_reward.map_or_else(|| "n/a".to_string(), |r| format!("{r:.2}")),
                    stats.mean_loss,
                    stats.last_grad_norm,
                    stats.updates,
                );
            }

            if let (Some(target), Some(mean)) = (config.target_reward, mean_reward) {
                if history.episode_rewards.len() >= config.reward_window && mean >= target {
                    log::info!("reward target {target} reached after {} steps", history.steps);
                    history.reached_target = true;
                    break;
                }
            }
            if config.max_steps.is_some_and(|max| history.steps >= max) {
                log::info!("step budget exhausted after {} iterations", history.iterations);
                break;
            }
        }

        if let Some(path) = &config.plot_path {
            crate::utils::plot_rewards(&history.episode_rewards, path, "Training Reward")?;
        }
        Ok(history)
    }
}

/// Mean undiscounted return of `policy` over `episodes` fresh episodes,
/// each cut off after `max_steps`.
pub fn evaluate<E, P>(env: &mut E, policy: &P, episodes: usize, max_steps: usize) -> f32
where
    E: Environment,
    P: Policy<E::State, E::Action> + ?Sized,
{
    if episodes == 0 {
        return 0.0;
    }
    let mut total = 0.0;
    for _ in 0..episodes {
        let mut state = env.reset();
        for _ in 0..max_steps {
            let action = policy.select_action(&state);
            let result = env.step(&action);
            total += result.reward.into();
            if result.done {
                break;
            }
            state = result.next_state;
        }
    }
    total / episodes as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_recent_uses_the_tail() {
        let history = TrainingHistory {
            episode_rewards: vec![1.0, 2.0, 3.0, 5.0],
            ..Default::default()
        };
        assert_eq!(history.mean_recent(2), Some(4.0));
        assert_eq!(history.mean_recent(10), Some(2.75));
        assert_eq!(TrainingHistory::default().mean_recent(5), None);
    }

    #[test]
    fn step_stats_average_losses() {
        let stats = StepStats::from_updates(&[
            UpdateStats {
                loss: 1.0,
                grad_norm: 3.0,
            },
            UpdateStats {
                loss: 3.0,
                grad_norm: 0.5,
            },
        ]);
        assert_eq!(stats.updates, 2);
        assert_eq!(stats.mean_loss, 2.0);
        assert_eq!(stats.last_grad_norm, 0.5);
    }
}

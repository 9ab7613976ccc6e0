//! Training configuration, loadable from JSON. Missing fields take their defaults.
//!
//! ```json
//! {
//!   "n_envs": 8,
//!   "gamma": 0.99,
//!   "algorithm": { "kind": "ppo", "n_steps": 64 },
//!   "fit": { "max_steps": 200000 }
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tch::Device;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub seed: u64,
    pub n_envs: usize,
    pub gamma: f64,
    pub learning_rate: f64,
    pub hidden: Vec<usize>,
    pub entropy_coef: f64,
    pub value_loss_coef: f64,
    /// Train on CUDA when available.
    pub cuda: bool,
    pub algorithm: AlgorithmConfig,
    pub fit: FitConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        TrainerConfig {
            seed: 0,
            n_envs: 16,
            gamma: 0.99,
            learning_rate: 7e-4,
            hidden: vec![64, 64],
            entropy_coef: 0.01,
            value_loss_coef: 0.5,
            cuda: false,
            algorithm: AlgorithmConfig::default(),
            fit: FitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AlgorithmConfig {
    Acer(AcerConfig),
    Ppo(PpoConfig),
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        AlgorithmConfig::Acer(AcerConfig::default())
    }
}

impl AlgorithmConfig {
    pub fn n_steps(&self) -> usize {
        match self {
            AlgorithmConfig::Acer(c) => c.n_steps,
            AlgorithmConfig::Ppo(c) => c.n_steps,
        }
    }
}

/// Actor-critic with experience replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcerConfig {
    pub n_steps: usize,
    /// Decay of the moving-average policy weights.
    pub ema_alpha: f64,
    /// Total replay capacity, split evenly across actors.
    pub buffer_max_size: usize,
    /// Total occupancy required before replay starts, split evenly across actors.
    pub buffer_initial_size: usize,
    /// Mean of the Poisson draw for extra replay updates per iteration.
    pub replay_ratio: f64,
    pub epsilon: f64,
    /// Truncation of the importance weight in the actor gain.
    pub importance_c: f64,
    /// Trust-region bound.
    pub delta: f64,
    pub trust_region: bool,
    pub grad_norm: Option<f64>,
}

impl Default for AcerConfig {
    fn default() -> Self {
        AcerConfig {
            n_steps: 20,
            ema_alpha: 0.99,
            buffer_max_size: 5000,
            buffer_initial_size: 500,
            replay_ratio: 4.0,
            epsilon: 1e-6,
            importance_c: 10.0,
            delta: 1.0,
            trust_region: true,
            grad_norm: Some(10.0),
        }
    }
}

/// Clipped-surrogate policy optimisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    pub n_steps: usize,
    pub lambda: f64,
    pub ppo_epochs: usize,
    pub mini_batches: usize,
    pub advantage_epsilon: f64,
    /// Clip range for both the probability ratio and the value update.
    pub clip_norm: f64,
    pub normalize_advantages: bool,
    pub grad_norm: Option<f64>,
}

impl Default for PpoConfig {
    fn default() -> Self {
        PpoConfig {
            n_steps: 128,
            lambda: 0.95,
            ppo_epochs: 4,
            mini_batches: 4,
            advantage_epsilon: 1e-8,
            clip_norm: 0.1,
            normalize_advantages: true,
            grad_norm: Some(0.5),
        }
    }
}

/// Stop conditions and reporting for [`crate::agent::Agent::fit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Stop once the mean of the last `reward_window` episode returns reaches this.
    pub target_reward: Option<f32>,
    /// Stop after this many environment steps (summed over actors).
    pub max_steps: Option<usize>,
    pub reward_window: usize,
    /// Log progress every this many iterations.
    pub log_every: usize,
    pub plot_path: Option<String>,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            target_reward: None,
            max_steps: None,
            reward_window: 100,
            log_every: 10,
            plot_path: None,
        }
    }
}

impl FitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_reward.is_none() && self.max_steps.is_none() {
            bail!("training requires target_reward or max_steps");
        }
        ensure!(self.reward_window > 0, "reward_window must be positive");
        Ok(())
    }
}

impl TrainerConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: TrainerConfig = serde_json::from_str(s).context("invalid trainer config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn device(&self) -> Device {
        if self.cuda {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        }
    }

    pub fn batch_size(&self) -> usize {
        self.n_envs * self.algorithm.n_steps()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_envs > 0, "n_envs must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.gamma),
            "gamma must lie in [0, 1], got {}",
            self.gamma
        );
        ensure!(self.learning_rate > 0.0, "learning_rate must be positive");
        ensure!(!self.hidden.is_empty(), "at least one hidden layer is required");
        ensure!(self.algorithm.n_steps() > 0, "n_steps must be positive");

        match &self.algorithm {
            AlgorithmConfig::Acer(acer) => {
                ensure!(
                    acer.buffer_initial_size <= acer.buffer_max_size,
                    "buffer_initial_size ({}) exceeds buffer_max_size ({})",
                    acer.buffer_initial_size,
                    acer.buffer_max_size
                );
                ensure!(
                    acer.buffer_max_size >= self.n_envs,
                    "buffer_max_size must hold at least one segment per actor"
                );
                ensure!(
                    (0.0..=1.0).contains(&acer.ema_alpha),
                    "ema_alpha must lie in [0, 1]"
                );
                ensure!(acer.replay_ratio >= 0.0, "replay_ratio must be non-negative");
                ensure!(acer.epsilon >= 0.0, "epsilon must be non-negative");
            }
            AlgorithmConfig::Ppo(ppo) => {
                ensure!(ppo.mini_batches > 0, "mini_batches must be positive");
                ensure!(ppo.ppo_epochs > 0, "ppo_epochs must be positive");
                ensure!(
                    self.batch_size() % ppo.mini_batches == 0,
                    "batch of {} transitions cannot be split into {} equal mini-batches",
                    self.batch_size(),
                    ppo.mini_batches
                );
                ensure!((0.0..=1.0).contains(&ppo.lambda), "lambda must lie in [0, 1]");
                ensure!(ppo.clip_norm > 0.0, "clip_norm must be positive");
            }
        }
        if let Some(max) = match &self.algorithm {
            AlgorithmConfig::Acer(c) => c.grad_norm,
            AlgorithmConfig::Ppo(c) => c.grad_norm,
        } {
            ensure!(max > 0.0, "grad_norm must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrainerConfig::default().validate().unwrap();
        let ppo = TrainerConfig {
            algorithm: AlgorithmConfig::Ppo(PpoConfig::default()),
            ..Default::default()
        };
        ppo.validate().unwrap();
    }

    #[test]
    fn parses_tagged_algorithm_section() {
        let config = TrainerConfig::from_json_str(
            r#"{
                "n_envs": 4,
                "seed": 3,
                "algorithm": { "kind": "ppo", "n_steps": 32, "mini_batches": 8 },
                "fit": { "max_steps": 1000 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.n_envs, 4);
        assert_eq!(config.batch_size(), 128);
        match config.algorithm {
            AlgorithmConfig::Ppo(ppo) => {
                assert_eq!(ppo.mini_batches, 8);
                assert_eq!(ppo.ppo_epochs, 4);
            }
            other => panic!("expected ppo, got {other:?}"),
        }
        assert_eq!(config.fit.max_steps, Some(1000));
        assert_eq!(config.fit.reward_window, 100);
    }

    #[test]
    fn acer_buffer_sizes_are_checked() {
        let err = TrainerConfig::from_json_str(
            r#"{
                "algorithm": { "kind": "acer", "buffer_max_size": 100, "buffer_initial_size": 200 }
            }"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("exceeds buffer_max_size"));
    }

    #[test]
    fn unknown_algorithm_kind_fails_to_parse() {
        let err = TrainerConfig::from_json_str(r#"{ "algorithm": { "kind": "dqn" } }"#).unwrap_err();
        assert!(format!("{err:#}").contains("invalid trainer config"));
    }

    #[test]
    fn uneven_mini_batches_are_rejected() {
        let config = TrainerConfig {
            n_envs: 3,
            algorithm: AlgorithmConfig::Ppo(PpoConfig {
                n_steps: 5,
                mini_batches: 4,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn fit_requires_a_stop_condition() {
        assert!(FitConfig::default().validate().is_err());
        let fit = FitConfig {
            max_steps: Some(10),
            ..Default::default()
        };
        fit.validate().unwrap();
    }
}

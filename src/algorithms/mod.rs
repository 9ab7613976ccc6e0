pub mod acer;
pub mod ppo;

use anyhow::Result;
use tch::nn;

use crate::agent::Agent;
use crate::config::{AlgorithmConfig, TrainerConfig};
use crate::environment::Environment;
use crate::networks::mlp::ActorCriticMlp;

use self::acer::AcerAgent;
use self::ppo::PpoAgent;

/// Builds the learner named by `config.algorithm` on top of fresh MLP networks.
pub fn build_agent<E: Environment + 'static>(
    config: &TrainerConfig,
    state_dim: usize,
    n_actions: usize,
) -> Result<Box<dyn Agent<E>>> {
    config.validate()?;
    tch::manual_seed(config.seed as i64);
    let device = config.device();
    let network = |critic_dim: usize| {
        ActorCriticMlp::new(
            nn::VarStore::new(device),
            state_dim,
            &config.hidden,
            n_actions,
            critic_dim,
        )
    };

    let agent: Box<dyn Agent<E>> = match &config.algorithm {
        AlgorithmConfig::Acer(acer) => {
            log::info!("building ACER agent on {device:?}");
            Box::new(AcerAgent::new(
                network(n_actions),
                network(n_actions),
                config,
                acer.clone(),
            )?)
        }
        AlgorithmConfig::Ppo(ppo) => {
            log::info!("building PPO agent on {device:?}");
            Box::new(PpoAgent::new(network(1), config, ppo.clone())?)
        }
    };
    Ok(agent)
}

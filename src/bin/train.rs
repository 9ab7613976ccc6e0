use anyhow::{Context, Result};

use acrl::agent::evaluate;
use acrl::algorithms::build_agent;
use acrl::collector::RolloutCollector;
use acrl::config::TrainerConfig;
use acrl::environments::cartpole::CartPole;

// 用法: train <config.json>
fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: train <config.json>")?;
    let config = TrainerConfig::from_file(&path)?;

    let envs: Vec<CartPole> = (0..config.n_envs).map(|_| CartPole::new()).collect();
    let mut collector = RolloutCollector::new(envs, config.device());
    let mut agent =
        build_agent::<CartPole>(&config, collector.state_dim(), collector.action_space())?;

    let history = agent.fit(&mut collector, &config.fit)?;
    println!(
        "finished after {} iterations / {} steps, {} episodes, target reached: {}",
        history.iterations,
        history.steps,
        history.episode_rewards.len(),
        history.reached_target
    );
    if let Some(mean) = history.mean_recent(config.fit.reward_window) {
        println!("mean reward over the last {} episodes: {mean:.2}", config.fit.reward_window);
    }

    let score = evaluate(&mut CartPole::new(), agent.as_ref(), 10, 500);
    println!("greedy evaluation over 10 episodes: {score:.2}");
    Ok(())
}

//! Return and advantage estimation.
//!
//! Both estimators run a backward recursion over `(n_steps, n_envs)` tensors.
//! `dones[t]` is 1 when the episode ended after transition `t`, which cuts the
//! bootstrap from step `t + 1`.

use tch::{Kind, Tensor};

fn check_shapes(rewards: &Tensor, others: &[(&str, &Tensor)], values: &Tensor) -> i64 {
    let shape = rewards.size();
    assert_eq!(shape.len(), 2, "rewards must be (n_steps, n_envs)");
    for (name, t) in others {
        assert_eq!(t.size(), shape, "{name} shape does not match rewards");
    }
    assert_eq!(
        values.size(),
        vec![shape[0] + 1, shape[1]],
        "values must be (n_steps + 1, n_envs)"
    );
    shape[0]
}

/// Retrace(λ = 1) corrected n-step returns for the off-policy learner.
///
/// The importance weight inside the recursion is truncated at 1; this is a
/// different constant from the `importance_c` bound used by the actor loss.
pub fn retrace_returns(
    rewards: &Tensor,
    dones: &Tensor,
    selected_critic: &Tensor,
    values: &Tensor,
    selected_importance: &Tensor,
    gamma: f64,
) -> Tensor {
    let n_steps = check_shapes(
        rewards,
        &[
            ("dones", dones),
            ("selected_critic", selected_critic),
            ("selected_importance", selected_importance),
        ],
        values,
    );
    let importance_bar = selected_importance.clamp_max(1.0);
    let mut next_return = values.get(n_steps);
    let mut returns = Vec::with_capacity(n_steps as usize);
    for t in (0..n_steps).rev() {
        let td_target = rewards.get(t) + gamma * &next_return * (1.0 - dones.get(t));
        next_return = importance_bar.get(t) * (&td_target - selected_critic.get(t)) + values.get(t);
        returns.push(td_target);
    }
    returns.reverse();
    Tensor::stack(&returns, 0)
}

#[derive(Debug)]
pub struct Gae {
    pub advantages: Tensor,
    pub returns: Tensor,
}

/// Generalized advantage estimate. `values` carries the bootstrap value as
/// its last row.
pub fn gae(rewards: &Tensor, dones: &Tensor, values: &Tensor, gamma: f64, lambda: f64) -> Gae {
    let n_steps = check_shapes(rewards, &[("dones", dones)], values);
    let mut last_advantage = rewards.get(0).zeros_like();
    let mut advantages = Vec::with_capacity(n_steps as usize);
    for t in (0..n_steps).rev() {
        let non_terminal = 1.0 - dones.get(t);
        let delta = rewards.get(t) + gamma * values.get(t + 1) * &non_terminal - values.get(t);
        last_advantage = delta + gamma * lambda * &non_terminal * last_advantage;
        advantages.push(last_advantage.shallow_clone());
    }
    advantages.reverse();
    let advantages = Tensor::stack(&advantages, 0);
    let returns = &advantages + values.narrow(0, 0, n_steps);
    Gae {
        advantages,
        returns,
    }
}

/// Zero mean, unit (population) standard deviation.
pub fn standardize(advantages: &Tensor, eps: f64) -> Tensor {
    let mean = advantages.mean(Kind::Float);
    let std = advantages.std(false);
    (advantages - mean) / (std + eps)
}

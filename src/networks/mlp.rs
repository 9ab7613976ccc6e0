use tch::nn::Module;
use tch::{Tensor, nn};

use super::{ActorCritic, ModelOutput};

/// Fully connected actor-critic: shared ReLU torso, a policy head and a critic head.
pub struct ActorCriticMlp {
    torso: nn::Sequential,
    policy_head: nn::Linear,
    critic_head: nn::Linear,
    n_actions: usize,
    critic_dim: usize,
    var_store: nn::VarStore, // 👈 保存 VarStore 的所有权
}

impl ActorCriticMlp {
    pub fn new(
        vs: nn::VarStore,
        input_dim: usize,
        hidden: &[usize],
        n_actions: usize,
        critic_dim: usize,
    ) -> Self {
        assert!(!hidden.is_empty(), "actor-critic torso needs at least one hidden layer");
        let root = vs.root();
        let mut torso = nn::seq();
        let mut in_dim = input_dim as i64;
        for (i, &units) in hidden.iter().enumerate() {
            torso = torso
                .add(nn::linear(
                    &root / format!("layer{}", i + 1),
                    in_dim,
                    units as i64,
                    Default::default(),
                ))
                .add_fn(|xs| xs.relu());
            in_dim = units as i64;
        }
        let policy_head = nn::linear(&root / "policy", in_dim, n_actions as i64, Default::default());
        let critic_head = nn::linear(&root / "critic", in_dim, critic_dim as i64, Default::default());
        ActorCriticMlp {
            torso,
            policy_head,
            critic_head,
            n_actions,
            critic_dim,
            var_store: vs,
        }
    }
}

impl ActorCritic for ActorCriticMlp {
    fn forward(&self, states: &Tensor) -> ModelOutput {
        let features = self.torso.forward(states);
        ModelOutput {
            logits: self.policy_head.forward(&features),
            critic: self.critic_head.forward(&features),
        }
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.var_store
    }

    fn n_actions(&self) -> usize {
        self.n_actions
    }

    fn critic_dim(&self) -> usize {
        self.critic_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn heads_have_configured_widths() {
        let model = ActorCriticMlp::new(nn::VarStore::new(Device::Cpu), 4, &[16, 8], 3, 1);
        let states = Tensor::zeros([5, 4], (Kind::Float, Device::Cpu));
        let out = model.forward(&states);
        assert_eq!(out.logits.size(), vec![5, 3]);
        assert_eq!(out.critic.size(), vec![5, 1]);
        // two torso layers plus two heads, weight and bias each
        assert_eq!(model.var_store().trainable_variables().len(), 8);
    }
}

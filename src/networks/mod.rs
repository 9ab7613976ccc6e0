pub mod mlp;

use tch::{Tensor, nn};

/// Raw network heads for a batch of states.
#[derive(Debug)]
pub struct ModelOutput {
    /// Policy logits, `(batch, n_actions)`.
    pub logits: Tensor,
    /// Critic head, `(batch, critic_dim)`: per-action Q values or a single state value.
    pub critic: Tensor,
}

/// Network abstraction shared by the learners.
pub trait ActorCritic {
    fn forward(&self, states: &Tensor) -> ModelOutput;

    fn var_store(&self) -> &nn::VarStore;

    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    fn n_actions(&self) -> usize;

    fn critic_dim(&self) -> usize;
}

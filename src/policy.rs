/// Greedy view of a trained agent, used for evaluation.
pub trait Policy<S, A> {
    // 根据状态选择概率最大的动作
    fn select_action(&self, state: &S) -> A;

    /// Probability of each discrete action in `state`.
    fn action_probabilities(&self, state: &S) -> Vec<f32>;
}

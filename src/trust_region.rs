use tch::{Kind, Tensor};

use crate::losses::check_probabilities;

/// Projects the actor gradient `g` (w.r.t. the action probabilities) so the
/// update stays within `delta` of the moving-average policy.
///
/// All three tensors are `(batch, n_actions)`. Rows whose linearised
/// divergence is already below `delta` are returned unchanged.
pub fn project(g: &Tensor, probs: &Tensor, avg_probs: &Tensor, delta: f64, eps: f64) -> Tensor {
    assert_eq!(g.size(), probs.size(), "gradient/probability shape mismatch");
    assert_eq!(
        avg_probs.size(),
        probs.size(),
        "average policy probabilities shape mismatch"
    );
    check_probabilities(probs, "policy probabilities");
    check_probabilities(avg_probs, "average policy probabilities");
    let k = -avg_probs / (probs + eps);
    let k_dot_g = (&k * g).sum_dim_intlist(-1, true, Kind::Float);
    let k_norm = k.square().sum_dim_intlist(-1, true, Kind::Float);
    let z = ((k_dot_g - delta) / (k_norm + eps)).clamp_min(0.0);
    g - z * k
}

//! Gradient bookkeeping: per-parameter gradients, global-norm clipping,
//! application through a `tch` optimizer and the moving-average weights.

use std::collections::BTreeMap;

use tch::{Kind, Tensor, nn};

/// Gradients of `loss` w.r.t. each of `params`. Parameters the loss does not
/// depend on come back as `None`.
pub fn parameter_grads(loss: &Tensor, params: &[Tensor], keep_graph: bool) -> Vec<Option<Tensor>> {
    Tensor::run_backward(&[loss], params, keep_graph, false)
        .into_iter()
        .map(|g| if g.defined() { Some(g) } else { None })
        .collect()
}

/// Gradient of `loss` w.r.t. an intermediate tensor of the graph.
pub fn grad_wrt(loss: &Tensor, input: &Tensor, keep_graph: bool) -> Tensor {
    let mut grads = Tensor::run_backward(&[loss], &[input], keep_graph, false);
    let g = grads.swap_remove(0);
    assert!(g.defined(), "loss does not depend on the requested tensor");
    g
}

pub fn add_grads(a: Option<Tensor>, b: Option<Tensor>) -> Tensor {
    match (a, b) {
        (Some(a), Some(b)) => a + b,
        (Some(g), None) | (None, Some(g)) => g,
        (None, None) => panic!("both gradients are None for a trainable parameter"),
    }
}

/// Element-wise [`add_grads`] over two gradient lists for the same parameters.
pub fn merge_grads(a: Vec<Option<Tensor>>, b: Vec<Option<Tensor>>) -> Vec<Tensor> {
    assert_eq!(a.len(), b.len(), "gradient lists cover different parameters");
    a.into_iter().zip(b).map(|(a, b)| add_grads(a, b)).collect()
}

/// Replaces missing gradients, panicking if the loss reached no parameter at all.
pub fn require_grads(grads: Vec<Option<Tensor>>, params: &[Tensor]) -> Vec<Tensor> {
    assert!(
        grads.iter().any(Option::is_some),
        "loss produced no gradient for any trainable parameter"
    );
    grads
        .into_iter()
        .zip(params)
        .map(|(g, p)| g.unwrap_or_else(|| p.zeros_like()))
        .collect()
}

/// Joint L2 norm of all gradients.
pub fn global_norm(grads: &[Tensor]) -> f64 {
    assert!(!grads.is_empty(), "empty gradient list");
    tch::no_grad(|| {
        grads
            .iter()
            .map(|g| g.square().sum(Kind::Double).double_value(&[]))
            .sum::<f64>()
            .sqrt()
    })
}

/// Rescales `grads` in place so their joint L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_by_global_norm(grads: &mut [Tensor], max_norm: f64) -> f64 {
    let norm = global_norm(grads);
    if norm > max_norm {
        let scale = max_norm / norm;
        for g in grads.iter_mut() {
            *g = &*g * scale;
        }
    }
    norm
}

/// Steps `optimizer` as if `grads[i]` were the gradient of `params[i]`.
///
/// The scalar `sum_i <params[i], grads[i]>` has exactly these gradients, so a
/// regular `backward_step` on it hands them to the optimizer.
pub fn apply_gradients(optimizer: &mut nn::Optimizer, params: &[Tensor], grads: &[Tensor]) {
    assert_eq!(params.len(), grads.len(), "one gradient per parameter expected");
    assert!(!params.is_empty(), "no trainable parameters");
    let terms: Vec<Tensor> = params
        .iter()
        .zip(grads)
        .map(|(p, g)| (p * g.detach()).sum(Kind::Float))
        .collect();
    let surrogate = Tensor::stack(&terms, 0).sum(Kind::Float);
    optimizer.backward_step(&surrogate);
}

/// Exponential moving average of a network's weights, keyed by variable name.
pub struct MovingAverage {
    alpha: f64,
    shadow: BTreeMap<String, Tensor>,
}

impl MovingAverage {
    pub fn new(vs: &nn::VarStore, alpha: f64) -> Self {
        assert!((0.0..=1.0).contains(&alpha), "moving average decay must lie in [0, 1]");
        let shadow = vs
            .variables()
            .into_iter()
            .map(|(name, var)| (name, var.detach().copy()))
            .collect();
        MovingAverage { alpha, shadow }
    }

    /// `avg = alpha * avg + (1 - alpha) * current` for every variable.
    pub fn update(&mut self, vs: &nn::VarStore) {
        let alpha = self.alpha;
        tch::no_grad(|| {
            for (name, var) in vs.variables() {
                let avg = self
                    .shadow
                    .get_mut(&name)
                    .unwrap_or_else(|| panic!("variable {name} has no moving average"));
                let updated = &*avg * alpha + var * (1.0 - alpha);
                avg.copy_(&updated);
            }
        });
    }

    /// Copies the averaged values into a network built like the tracked one.
    pub fn sync_into(&self, vs: &mut nn::VarStore) {
        tch::no_grad(|| {
            for (name, mut var) in vs.variables() {
                let avg = self
                    .shadow
                    .get(&name)
                    .unwrap_or_else(|| panic!("variable {name} has no moving average"));
                var.copy_(avg);
            }
        });
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.shadow.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::to_f32_vec;
    use tch::Device;
    use tch::nn::OptimizerConfig;

    #[test]
    fn parameter_grads_marks_unused_parameters() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var_copy("w", &Tensor::from_slice(&[1.0f32, -2.0]));
        let unused = vs.root().var_copy("unused", &Tensor::from_slice(&[3.0f32]));
        let loss = (&w * &w).sum(Kind::Float);
        let grads = parameter_grads(&loss, &[w.shallow_clone(), unused.shallow_clone()], false);
        assert_eq!(to_f32_vec(grads[0].as_ref().unwrap()), vec![2.0, -4.0]);
        assert!(grads[1].is_none());
    }

    #[test]
    fn grad_wrt_reaches_intermediate_tensors() {
        let x = Tensor::from_slice(&[1.0f32, 2.0]).set_requires_grad(true);
        let hidden = &x * 3.0;
        let loss = hidden.square().sum(Kind::Float);
        let g = grad_wrt(&loss, &hidden, true);
        assert_eq!(to_f32_vec(&g), vec![6.0, 12.0]);
        // re-inject a custom seed through the rest of the graph
        let seed = Tensor::from_slice(&[1.0f32, -1.0]);
        let vjp = grad_wrt(&(&hidden * seed).sum(Kind::Float), &x, false);
        assert_eq!(to_f32_vec(&vjp), vec![3.0, -3.0]);
    }

    #[test]
    fn add_grads_sums_or_passes_through() {
        let a = Tensor::from_slice(&[1.0f32]);
        let b = Tensor::from_slice(&[2.0f32]);
        assert_eq!(to_f32_vec(&add_grads(Some(a.shallow_clone()), Some(b))), vec![3.0]);
        assert_eq!(to_f32_vec(&add_grads(None, Some(a))), vec![1.0]);
    }

    #[test]
    #[should_panic(expected = "both gradients are None")]
    fn add_grads_rejects_two_missing_gradients() {
        let _ = add_grads(None, None);
    }

    #[test]
    #[should_panic(expected = "no gradient for any")]
    fn require_grads_rejects_all_missing() {
        let _ = require_grads(vec![None], &[Tensor::from_slice(&[1.0f32])]);
    }

    #[test]
    fn clipping_rescales_only_above_the_bound() {
        let mut grads = vec![Tensor::from_slice(&[3.0f32]), Tensor::from_slice(&[4.0f32])];
        let norm = clip_by_global_norm(&mut grads, 10.0);
        assert!((norm - 5.0).abs() < 1e-9);
        assert_eq!(to_f32_vec(&grads[0]), vec![3.0]);

        let norm = clip_by_global_norm(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-9);
        assert!((to_f32_vec(&grads[0])[0] - 0.6).abs() < 1e-6);
        assert!((to_f32_vec(&grads[1])[0] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn apply_gradients_steps_with_the_given_gradients() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().var_copy("w", &Tensor::from_slice(&[1.0f32, 2.0]));
        let mut opt = nn::Sgd::default().build(&vs, 1.0).unwrap();
        let params = vs.trainable_variables();
        apply_gradients(&mut opt, &params, &[Tensor::from_slice(&[0.5f32, -0.5])]);
        assert_eq!(to_f32_vec(&w), vec![0.5, 2.5]);
    }

    #[test]
    fn moving_average_decays_and_syncs() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut w = vs.root().var_copy("w", &Tensor::from_slice(&[1.0f32]));
        let mut avg = MovingAverage::new(&vs, 0.9);

        tch::no_grad(|| w.copy_(&Tensor::from_slice(&[2.0f32])));
        avg.update(&vs);
        assert!((to_f32_vec(avg.get("w").unwrap())[0] - 1.1).abs() < 1e-6);

        let mut shadow_vs = nn::VarStore::new(Device::Cpu);
        let shadow_w = shadow_vs.root().var_copy("w", &Tensor::from_slice(&[0.0f32]));
        avg.sync_into(&mut shadow_vs);
        assert!((to_f32_vec(&shadow_w)[0] - 1.1).abs() < 1e-6);
        // the tracked network is untouched
        assert_eq!(to_f32_vec(&w), vec![2.0]);
    }
}

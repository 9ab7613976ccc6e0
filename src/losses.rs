//! Scalar actor/critic loss terms for both learners.

use tch::{Kind, Tensor};

const PROBABILITY_TOLERANCE: f64 = 1e-4;

/// Panics unless every row of `probs` is a probability vector: no negative
/// entry and a sum of 1 up to float rounding. NaN entries fail too.
pub fn check_probabilities(probs: &Tensor, what: &str) {
    tch::no_grad(|| {
        let min = probs.min().double_value(&[]);
        assert!(min >= 0.0, "{what} contain a negative probability ({min})");
        let drift = (probs.sum_dim_intlist(-1, false, Kind::Double) - 1.0)
            .abs()
            .max()
            .double_value(&[]);
        assert!(
            drift <= PROBABILITY_TOLERANCE,
            "{what} do not sum to 1 (off by {drift})"
        );
    });
}

/// `-mean(sum(p * log(p + eps)))` over `(batch, n_actions)` probabilities.
pub fn entropy(probs: &Tensor, eps: f64) -> Tensor {
    -(probs * (probs + eps).log())
        .sum_dim_intlist(-1, false, Kind::Float)
        .mean(Kind::Float)
}

/// Mean entropy of the categorical distributions given by `logits`.
pub fn categorical_entropy(logits: &Tensor) -> Tensor {
    let log_probs = logits.log_softmax(-1, Kind::Float);
    -(log_probs.exp() * &log_probs)
        .sum_dim_intlist(-1, false, Kind::Float)
        .mean(Kind::Float)
}

#[derive(Debug)]
pub struct AcerLosses {
    pub actor: Tensor,
    pub critic: Tensor,
    pub entropy: Tensor,
}

impl AcerLosses {
    pub fn combined(&self, value_coef: f64, entropy_coef: f64) -> Tensor {
        &self.actor + value_coef * &self.critic - entropy_coef * &self.entropy
    }

    /// Policy objective (to maximise) differentiated w.r.t. the probabilities
    /// before the trust-region projection, scaled by the batch size.
    pub fn trust_region_objective(&self, entropy_coef: f64, batch_size: usize) -> Tensor {
        -(&self.actor - entropy_coef * &self.entropy) * batch_size as f64
    }
}

pub struct AcerInputs<'a> {
    /// `(batch, n_actions)`
    pub probs: &'a Tensor,
    pub selected_probs: &'a Tensor,
    pub selected_importance: &'a Tensor,
    pub selected_critic: &'a Tensor,
    /// State values without the bootstrap step.
    pub values: &'a Tensor,
    pub returns: &'a Tensor,
}

pub fn acer_losses(inputs: &AcerInputs, importance_c: f64, eps: f64) -> AcerLosses {
    let batch = inputs.selected_probs.size();
    for t in [
        inputs.selected_importance,
        inputs.selected_critic,
        inputs.values,
        inputs.returns,
    ] {
        assert_eq!(t.size(), batch, "loss inputs disagree on batch shape");
    }
    check_probabilities(inputs.probs, "policy probabilities");
    let entropy = entropy(inputs.probs, eps);
    let advantages = inputs.returns - inputs.values;
    let log_probs = (inputs.selected_probs + eps).log();
    let weight = (advantages * inputs.selected_importance.clamp_max(importance_c)).detach();
    let actor = -(log_probs * weight).mean(Kind::Float);
    let critic = (inputs.returns.detach() - inputs.selected_critic)
        .square()
        .mean(Kind::Float)
        * 0.5;
    AcerLosses {
        actor,
        critic,
        entropy,
    }
}

#[derive(Debug)]
pub struct PpoLosses {
    pub policy: Tensor,
    pub value: Tensor,
    pub entropy: Tensor,
}

impl PpoLosses {
    pub fn combined(&self, value_coef: f64, entropy_coef: f64) -> Tensor {
        &self.policy - entropy_coef * &self.entropy + value_coef * &self.value
    }
}

pub struct PpoInputs<'a> {
    pub log_probs: &'a Tensor,
    pub old_log_probs: &'a Tensor,
    pub advantages: &'a Tensor,
    pub values: &'a Tensor,
    pub old_values: &'a Tensor,
    pub returns: &'a Tensor,
    /// Mean entropy of the current policy on the mini-batch.
    pub entropy: Tensor,
}

pub fn ppo_losses(inputs: PpoInputs, clip: f64) -> PpoLosses {
    let batch = inputs.log_probs.size();
    for t in [
        inputs.old_log_probs,
        inputs.advantages,
        inputs.values,
        inputs.old_values,
        inputs.returns,
    ] {
        assert_eq!(t.size(), batch, "loss inputs disagree on batch shape");
    }
    let ratio = (inputs.log_probs - inputs.old_log_probs).exp();
    let pg_loss1 = -inputs.advantages * &ratio;
    let pg_loss2 = -inputs.advantages * ratio.clamp(1.0 - clip, 1.0 + clip);
    let policy = pg_loss1.max_other(&pg_loss2).mean(Kind::Float);

    let clipped_values =
        inputs.old_values + (inputs.values - inputs.old_values).clamp(-clip, clip);
    let value_loss1 = (inputs.values - inputs.returns).square();
    let value_loss2 = (clipped_values - inputs.returns).square();
    let value = value_loss1.max_other(&value_loss2).mean(Kind::Float) * 0.5;

    PpoLosses {
        policy,
        value,
        entropy: inputs.entropy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(values: &[f32]) -> Tensor {
        Tensor::from_slice(values)
    }

    fn scalar(t: &Tensor) -> f64 {
        t.double_value(&[])
    }

    #[test]
    fn entropy_of_uniform_distribution() {
        let probs = Tensor::from_slice(&[0.25f32; 8]).view([2, 4]);
        assert!((scalar(&entropy(&probs, 0.0)) - 4f64.ln()).abs() < 1e-5);
        let logits = Tensor::zeros([3, 4], (Kind::Float, tch::Device::Cpu));
        assert!((scalar(&categorical_entropy(&logits)) - 4f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn valid_probability_rows_pass_the_check() {
        check_probabilities(&Tensor::from_slice(&[0.0f32, 1.0, 0.3, 0.7]).view([2, 2]), "rows");
    }

    #[test]
    #[should_panic(expected = "negative probability")]
    fn negative_probability_is_rejected() {
        check_probabilities(&Tensor::from_slice(&[-0.1f32, 1.1]).view([1, 2]), "rows");
    }

    #[test]
    #[should_panic(expected = "do not sum to 1")]
    fn unnormalized_row_is_rejected() {
        check_probabilities(&Tensor::from_slice(&[0.5f32, 0.5, 0.5, 0.6]).view([2, 2]), "rows");
    }

    #[test]
    #[should_panic(expected = "negative probability")]
    fn acer_losses_reject_negative_probabilities() {
        let probs = Tensor::from_slice(&[-0.2f32, 1.2]).view([1, 2]);
        let one = t(&[1.0]);
        let _ = acer_losses(
            &AcerInputs {
                probs: &probs,
                selected_probs: &t(&[1.2]),
                selected_importance: &one,
                selected_critic: &one,
                values: &one,
                returns: &one,
            },
            10.0,
            1e-6,
        );
    }

    #[test]
    fn acer_terms_match_hand_computation() {
        let probs = Tensor::from_slice(&[0.5f32, 0.5, 0.8, 0.2]).view([2, 2]);
        let selected_probs = t(&[0.5, 0.2]);
        let importance = t(&[20.0, 0.5]);
        let critic = t(&[1.0, 0.0]);
        let values = t(&[0.5, 1.0]);
        let returns = t(&[1.5, 2.0]);
        let losses = acer_losses(
            &AcerInputs {
                probs: &probs,
                selected_probs: &selected_probs,
                selected_importance: &importance,
                selected_critic: &critic,
                values: &values,
                returns: &returns,
            },
            10.0,
            0.0,
        );
        // advantages [1, 1], truncated weights [10, 0.5]
        let actor = -(0.5f64.ln() * 10.0 + 0.2f64.ln() * 0.5) / 2.0;
        assert!((scalar(&losses.actor) - actor).abs() < 1e-5);
        // 0.5 * mean([0.25, 4])
        assert!((scalar(&losses.critic) - 1.0625).abs() < 1e-6);
        let combined = losses.combined(0.5, 0.01);
        let expected = actor + 0.5 * 1.0625 - 0.01 * scalar(&losses.entropy);
        assert!((scalar(&combined) - expected).abs() < 1e-5);
        let objective = losses.trust_region_objective(0.01, 2);
        let expected = -(actor - 0.01 * scalar(&losses.entropy)) * 2.0;
        assert!((scalar(&objective) - expected).abs() < 1e-5);
    }

    #[test]
    fn acer_actor_gain_does_not_flow_into_values() {
        let probs = Tensor::from_slice(&[0.5f32, 0.5]).view([1, 2]);
        let values = t(&[0.3]).set_requires_grad(true);
        let returns = t(&[1.0]);
        let critic = t(&[0.2]).set_requires_grad(true);
        let losses = acer_losses(
            &AcerInputs {
                probs: &probs,
                selected_probs: &t(&[0.5]),
                selected_importance: &t(&[1.0]),
                selected_critic: &critic,
                values: &values,
                returns: &returns,
            },
            10.0,
            1e-6,
        );
        assert!(losses.critic.requires_grad());
        assert!(!losses.actor.requires_grad());
    }

    #[test]
    fn unbounded_clip_reduces_to_plain_surrogate() {
        let log_probs = t(&[-0.1, -2.0, -0.7]);
        let old_log_probs = t(&[-0.9, -0.5, -0.7]);
        let advantages = t(&[1.5, -0.3, 2.0]);
        let values = t(&[0.0, 0.0, 0.0]);
        let losses = ppo_losses(
            PpoInputs {
                log_probs: &log_probs,
                old_log_probs: &old_log_probs,
                advantages: &advantages,
                values: &values,
                old_values: &values,
                returns: &values,
                entropy: Tensor::from(0.0f32),
            },
            1e9,
        );
        let plain = (-&advantages * (&log_probs - &old_log_probs).exp()).mean(Kind::Float);
        assert!((scalar(&losses.policy) - scalar(&plain)).abs() < 1e-6);
    }

    #[test]
    fn clipped_surrogate_caps_the_ratio() {
        // ratio = e^1, positive advantage: the clipped branch (1.1) wins the max
        let losses = ppo_losses(
            PpoInputs {
                log_probs: &t(&[0.0]),
                old_log_probs: &t(&[-1.0]),
                advantages: &t(&[2.0]),
                values: &t(&[0.0]),
                old_values: &t(&[0.0]),
                returns: &t(&[0.0]),
                entropy: Tensor::from(0.0f32),
            },
            0.1,
        );
        assert!((scalar(&losses.policy) + 2.2).abs() < 1e-5);
    }

    #[test]
    fn value_loss_takes_pessimistic_branch() {
        // v moved from 0 to 1 toward returns 2; clipped v = 0.1
        let losses = ppo_losses(
            PpoInputs {
                log_probs: &t(&[0.0]),
                old_log_probs: &t(&[0.0]),
                advantages: &t(&[0.0]),
                values: &t(&[1.0]),
                old_values: &t(&[0.0]),
                returns: &t(&[2.0]),
                entropy: Tensor::from(0.5f32),
            },
            0.1,
        );
        assert!((scalar(&losses.value) - 0.5 * 1.9f64.powi(2)).abs() < 1e-5);
        let combined = losses.combined(0.5, 0.01);
        let expected = scalar(&losses.policy) - 0.005 + 0.5 * scalar(&losses.value);
        assert!((scalar(&combined) - expected).abs() < 1e-5);
    }
}

//! PPO with generalized advantage estimation.
//!
//! A training step that produces a non-finite loss or gradient is discarded
//! outright: the network is left untouched and the caller bumps a diagnostic
//! counter instead of the version number.

use crate::buffer::Experience;
use crate::policy::network::{AdamState, Gradients, Network};
use ndarray::Array1;

#[derive(Debug, Clone, Copy)]
pub struct PpoConfig {
    pub learning_rate: f32,
    pub gamma: f32,
    pub gae_lambda: f32,
    pub clip: f32,
    pub entropy_coef: f32,
    pub value_coef: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PpoOutcome {
    pub applied: bool,
    pub loss: f32,
    pub policy_loss: f32,
    pub value_loss: f32,
    pub entropy: f32,
}

/// GAE over one contiguous batch. Episode boundaries inside the batch are
/// respected through the `done` flags; the final step bootstraps from its
/// stored value estimate unless terminal.
pub fn compute_advantages(
    steps: &[Experience],
    gamma: f32,
    lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let n = steps.len();
    let mut advantages = vec![0.0f32; n];
    let mut returns = vec![0.0f32; n];
    let mut gae = 0.0f32;
    for i in (0..n).rev() {
        let step = &steps[i];
        let next_value = if step.done {
            0.0
        } else if i + 1 < n {
            steps[i + 1].value
        } else {
            step.value
        };
        let not_done = if step.done { 0.0 } else { 1.0 };
        let delta = step.reward + gamma * next_value * not_done - step.value;
        gae = delta + gamma * lambda * not_done * gae;
        advantages[i] = gae;
        returns[i] = gae + step.value;
    }
    (advantages, returns)
}

fn normalize(values: &mut [f32]) {
    let n = values.len() as f32;
    if n < 2.0 {
        return;
    }
    let mean: f32 = values.iter().sum::<f32>() / n;
    let var: f32 = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let std = var.sqrt().max(1e-6);
    for v in values.iter_mut() {
        *v = (*v - mean) / std;
    }
}

/// One clipped-surrogate update over `batch`. Returns whether parameters
/// were actually mutated.
pub fn ppo_update(
    net: &mut Network,
    adam: &mut AdamState,
    cfg: &PpoConfig,
    batch: &[Experience],
) -> PpoOutcome {
    if batch.is_empty() {
        return PpoOutcome::default();
    }
    let (mut advantages, returns) = compute_advantages(batch, cfg.gamma, cfg.gae_lambda);
    normalize(&mut advantages);

    let mut grads = Gradients::zeros_like(net);
    let mut policy_loss = 0.0f32;
    let mut value_loss = 0.0f32;
    let mut entropy_sum = 0.0f32;

    for (i, step) in batch.iter().enumerate() {
        let pass = net.forward(&step.state);
        if step.action >= net.action_dim {
            continue;
        }
        let advantage = advantages[i];
        let ret = returns[i];

        let prob_a = pass.probs[step.action].max(1e-8);
        let log_prob_new = prob_a.ln();
        let ratio = (log_prob_new - step.log_prob).exp();
        let clipped = ratio.clamp(1.0 - cfg.clip, 1.0 + cfg.clip);
        let surrogate = (ratio * advantage).min(clipped * advantage);
        policy_loss -= surrogate;

        let value_err = pass.value - ret;
        value_loss += 0.5 * value_err * value_err;

        let entropy: f32 = -pass
            .probs
            .iter()
            .map(|p| if *p > 0.0 { p * p.ln() } else { 0.0 })
            .sum::<f32>();
        entropy_sum += entropy;

        // Gradient of the per-sample loss wrt the policy logits. The clipped
        // branch has zero policy gradient when it is the active minimum and
        // the ratio sits outside the clip range.
        let clip_active = (ratio * advantage) > (clipped * advantage);
        let mut dlogits: Array1<f32> = Array1::zeros(net.action_dim);
        if !clip_active {
            // d(-ratio*A)/dlogit_j = -A*ratio*(1{j==a} - p_j)
            for j in 0..net.action_dim {
                let indicator = if j == step.action { 1.0 } else { 0.0 };
                dlogits[j] = -advantage * ratio * (indicator - pass.probs[j]);
            }
        }
        // Entropy bonus: loss += -c_e * H, dH/dlogit_j = -p_j (ln p_j + H)
        for j in 0..net.action_dim {
            let p = pass.probs[j].max(1e-8);
            let dh = -p * (p.ln() + entropy);
            dlogits[j] += -cfg.entropy_coef * dh;
        }
        let dvalue = cfg.value_coef * value_err;

        accumulate(net, &mut grads, &step.state, &pass, &dlogits, dvalue);
    }

    let n = batch.len() as f32;
    grads.scale(1.0 / n);
    let total_loss =
        (policy_loss + cfg.value_coef * value_loss - cfg.entropy_coef * entropy_sum) / n;

    if !total_loss.is_finite() || !grads.is_finite() {
        return PpoOutcome {
            applied: false,
            loss: total_loss,
            policy_loss: policy_loss / n,
            value_loss: value_loss / n,
            entropy: entropy_sum / n,
        };
    }

    adam.step(net, &grads, cfg.learning_rate);
    PpoOutcome {
        applied: true,
        loss: total_loss,
        policy_loss: policy_loss / n,
        value_loss: value_loss / n,
        entropy: entropy_sum / n,
    }
}

/// Backprop one sample through the cached activations.
fn accumulate(
    net: &Network,
    grads: &mut Gradients,
    state: &[f32],
    pass: &crate::policy::network::ForwardPass,
    dlogits: &Array1<f32>,
    dvalue: f32,
) {
    let x = Array1::from_iter(state.iter().copied());

    // policy head
    for j in 0..net.action_dim {
        let d = dlogits[j];
        if d != 0.0 {
            for k in 0..pass.h2.len() {
                grads.wp[(j, k)] += d * pass.h2[k];
            }
            grads.bp[j] += d;
        }
    }
    // value head
    for k in 0..pass.h2.len() {
        grads.wv[(0, k)] += dvalue * pass.h2[k];
    }
    grads.bv[0] += dvalue;

    // back through h2
    let mut dh2: Array1<f32> = net.wp.t().dot(dlogits);
    for k in 0..dh2.len() {
        dh2[k] += net.wv[(0, k)] * dvalue;
        if pass.h2[k] <= 0.0 {
            dh2[k] = 0.0;
        }
    }
    for k in 0..dh2.len() {
        let d = dh2[k];
        if d != 0.0 {
            for j in 0..pass.h1.len() {
                grads.w2[(k, j)] += d * pass.h1[j];
            }
            grads.b2[k] += d;
        }
    }

    // back through h1
    let mut dh1: Array1<f32> = net.w2.t().dot(&dh2);
    for k in 0..dh1.len() {
        if pass.h1[k] <= 0.0 {
            dh1[k] = 0.0;
        }
    }
    for k in 0..dh1.len() {
        let d = dh1[k];
        if d != 0.0 {
            for j in 0..x.len() {
                grads.w1[(k, j)] += d * x[j];
            }
            grads.b1[k] += d;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn cfg() -> PpoConfig {
        PpoConfig {
            learning_rate: 1e-3,
            gamma: 0.99,
            gae_lambda: 0.95,
            clip: 0.2,
            entropy_coef: 0.01,
            value_coef: 0.5,
        }
    }

    fn episode(net: &Network, len: usize) -> Vec<Experience> {
        (0..len)
            .map(|i| {
                let state = vec![(i as f32) / len as f32; net.state_dim];
                let pass = net.forward(&state);
                Experience {
                    state,
                    action: i % net.action_dim,
                    log_prob: pass.probs[i % net.action_dim].max(1e-8).ln(),
                    value: pass.value,
                    reward: if i % 2 == 0 { 1.0 } else { -0.5 },
                    done: i == len - 1,
                }
            })
            .collect()
    }

    #[test]
    fn advantages_propagate_backwards() {
        let steps: Vec<Experience> = (0..4)
            .map(|i| Experience {
                state: vec![0.0; 4],
                action: 0,
                log_prob: -1.0,
                value: 0.0,
                reward: 1.0,
                done: i == 3,
            })
            .collect();
        let (adv, ret) = compute_advantages(&steps, 0.99, 0.95);
        assert_eq!(adv.len(), 4);
        // Earlier steps see more discounted future reward.
        assert!(ret[0] > ret[3]);
        assert!(adv.iter().all(|a| a.is_finite()));
    }

    #[test]
    fn terminal_cuts_the_credit_chain() {
        let mut steps: Vec<Experience> = (0..4)
            .map(|i| Experience {
                state: vec![0.0; 4],
                action: 0,
                log_prob: -1.0,
                value: 0.0,
                reward: 0.0,
                done: i == 1 || i == 3,
            })
            .collect();
        steps[3].reward = 100.0;
        let (_, ret) = compute_advantages(&steps, 0.99, 0.95);
        // The big terminal reward must not leak across the episode boundary.
        assert_eq!(ret[0], 0.0);
        assert_eq!(ret[1], 0.0);
        assert!(ret[3] > 90.0);
    }

    #[test]
    fn update_moves_parameters_and_reports_applied() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut net = Network::init(8, 4, &mut rng);
        let mut adam = AdamState::new(&net);
        let batch = episode(&net, 16);
        let before = net.to_flat();
        let outcome = ppo_update(&mut net, &mut adam, &cfg(), &batch);
        assert!(outcome.applied);
        assert!(outcome.loss.is_finite());
        assert_ne!(before, net.to_flat());
    }

    #[test]
    fn non_finite_rollout_does_not_mutate_parameters() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut net = Network::init(8, 4, &mut rng);
        let mut adam = AdamState::new(&net);
        let mut batch = episode(&net, 8);
        batch[2].reward = f32::NAN;
        let before = net.to_flat();
        let outcome = ppo_update(&mut net, &mut adam, &cfg(), &batch);
        assert!(!outcome.applied);
        assert_eq!(before, net.to_flat());
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut net = Network::init(8, 4, &mut rng);
        let mut adam = AdamState::new(&net);
        let outcome = ppo_update(&mut net, &mut adam, &cfg(), &[]);
        assert!(!outcome.applied);
    }
}

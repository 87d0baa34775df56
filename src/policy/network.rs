//! The actor-critic MLP and its optimizer state.
//!
//! Two shared hidden layers feed a policy head (action logits) and a value
//! head. The layer widths are run constants recorded in the persisted schema
//! header; inheritance requires architecture equality.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};

pub const HIDDEN1: usize = 256;
pub const HIDDEN2: usize = 128;

#[derive(Debug, Clone)]
pub struct Network {
    pub state_dim: usize,
    pub action_dim: usize,
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,
    pub wp: Array2<f32>,
    pub bp: Array1<f32>,
    pub wv: Array2<f32>,
    pub bv: Array1<f32>,
}

/// Activations cached by a forward pass, enough to run backward.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub h1: Array1<f32>,
    pub h2: Array1<f32>,
    pub logits: Array1<f32>,
    pub probs: Array1<f32>,
    pub value: f32,
}

impl Network {
    /// He-initialized fresh network.
    pub fn init(state_dim: usize, action_dim: usize, rng: &mut StdRng) -> Self {
        let layer = |rows: usize, cols: usize, rng: &mut StdRng| -> Array2<f32> {
            let std = (2.0 / cols as f32).sqrt();
            let normal = Normal::new(0.0, std).expect("stddev is positive");
            Array2::from_shape_fn((rows, cols), |_| normal.sample(rng))
        };
        Self {
            state_dim,
            action_dim,
            w1: layer(HIDDEN1, state_dim, rng),
            b1: Array1::zeros(HIDDEN1),
            w2: layer(HIDDEN2, HIDDEN1, rng),
            b2: Array1::zeros(HIDDEN2),
            wp: layer(action_dim, HIDDEN2, rng),
            bp: Array1::zeros(action_dim),
            wv: layer(1, HIDDEN2, rng),
            bv: Array1::zeros(1),
        }
    }

    pub fn layer_shapes(&self) -> Vec<(usize, usize)> {
        vec![
            (HIDDEN1, self.state_dim),
            (HIDDEN2, HIDDEN1),
            (self.action_dim, HIDDEN2),
            (1, HIDDEN2),
        ]
    }

    pub fn param_count(&self) -> usize {
        self.w1.len()
            + self.b1.len()
            + self.w2.len()
            + self.b2.len()
            + self.wp.len()
            + self.bp.len()
            + self.wv.len()
            + self.bv.len()
    }

    /// Forward pass. A malformed input (wrong width or non-finite values)
    /// yields the uniform distribution with value 0 — logged by the caller,
    /// never fatal.
    pub fn forward(&self, state: &[f32]) -> ForwardPass {
        if state.len() != self.state_dim || state.iter().any(|v| !v.is_finite()) {
            return self.uniform_pass();
        }
        let x = Array1::from_iter(state.iter().copied());
        let mut h1 = self.w1.dot(&x) + &self.b1;
        h1.mapv_inplace(|v| v.max(0.0));
        let mut h2 = self.w2.dot(&h1) + &self.b2;
        h2.mapv_inplace(|v| v.max(0.0));
        let logits = self.wp.dot(&h2) + &self.bp;
        let value = self.wv.dot(&h2)[0] + self.bv[0];
        let probs = softmax(&logits);
        if probs.iter().any(|p| !p.is_finite()) || !value.is_finite() {
            return self.uniform_pass();
        }
        ForwardPass {
            h1,
            h2,
            logits,
            probs,
            value,
        }
    }

    fn uniform_pass(&self) -> ForwardPass {
        let uniform = 1.0 / self.action_dim as f32;
        ForwardPass {
            h1: Array1::zeros(HIDDEN1),
            h2: Array1::zeros(HIDDEN2),
            logits: Array1::zeros(self.action_dim),
            probs: Array1::from_elem(self.action_dim, uniform),
            value: 0.0,
        }
    }

    /// Flat weight view in a fixed tensor order, for persistence and
    /// mutation.
    pub fn to_flat(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.param_count());
        for tensor in [
            self.w1.as_slice(),
            self.b1.as_slice(),
            self.w2.as_slice(),
            self.b2.as_slice(),
            self.wp.as_slice(),
            self.bp.as_slice(),
            self.wv.as_slice(),
            self.bv.as_slice(),
        ] {
            if let Some(slice) = tensor {
                out.extend_from_slice(slice);
            }
        }
        out
    }

    pub fn from_flat(state_dim: usize, action_dim: usize, flat: &[f32]) -> anyhow::Result<Self> {
        let mut rng = <StdRng as rand::SeedableRng>::seed_from_u64(0);
        let mut net = Self::init(state_dim, action_dim, &mut rng);
        if flat.len() != net.param_count() {
            anyhow::bail!(
                "flat weight count {} does not match architecture ({} expected)",
                flat.len(),
                net.param_count()
            );
        }
        let mut offset = 0;
        let fill2 = |arr: &mut Array2<f32>, offset: &mut usize| {
            let n = arr.len();
            let shape = (arr.nrows(), arr.ncols());
            *arr = Array2::from_shape_vec(shape, flat[*offset..*offset + n].to_vec())
                .unwrap_or_else(|_| Array2::zeros(shape));
            *offset += n;
        };
        let fill1 = |arr: &mut Array1<f32>, offset: &mut usize| {
            let n = arr.len();
            *arr = Array1::from_vec(flat[*offset..*offset + n].to_vec());
            *offset += n;
        };
        fill2(&mut net.w1, &mut offset);
        fill1(&mut net.b1, &mut offset);
        fill2(&mut net.w2, &mut offset);
        fill1(&mut net.b2, &mut offset);
        fill2(&mut net.wp, &mut offset);
        fill1(&mut net.bp, &mut offset);
        fill2(&mut net.wv, &mut offset);
        fill1(&mut net.bv, &mut offset);
        Ok(net)
    }

    /// Gaussian weight mutation for inheritance: each element independently
    /// perturbed with probability `rate` by noise scaled to its magnitude.
    pub fn mutate(&mut self, rate: f32, sigma: f32, rng: &mut StdRng) {
        let mut flat = self.to_flat();
        let Ok(unit) = Normal::new(0.0f32, 1.0) else {
            return;
        };
        for w in flat.iter_mut() {
            if rng.random::<f32>() < rate {
                let scale = sigma * w.abs().max(1e-3);
                *w += unit.sample(rng) * scale;
            }
        }
        if let Ok(mutated) = Self::from_flat(self.state_dim, self.action_dim, &flat) {
            *self = mutated;
        }
    }
}

pub fn softmax(logits: &Array1<f32>) -> Array1<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut exps = logits.mapv(|v| (v - max).exp());
    let sum: f32 = exps.sum();
    if sum > 0.0 && sum.is_finite() {
        exps.mapv_inplace(|v| v / sum);
        exps
    } else {
        Array1::from_elem(logits.len(), 1.0 / logits.len() as f32)
    }
}

/// Gradient accumulator shaped like the network.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub w1: Array2<f32>,
    pub b1: Array1<f32>,
    pub w2: Array2<f32>,
    pub b2: Array1<f32>,
    pub wp: Array2<f32>,
    pub bp: Array1<f32>,
    pub wv: Array2<f32>,
    pub bv: Array1<f32>,
}

impl Gradients {
    pub fn zeros_like(net: &Network) -> Self {
        Self {
            w1: Array2::zeros(net.w1.raw_dim()),
            b1: Array1::zeros(net.b1.raw_dim()),
            w2: Array2::zeros(net.w2.raw_dim()),
            b2: Array1::zeros(net.b2.raw_dim()),
            wp: Array2::zeros(net.wp.raw_dim()),
            bp: Array1::zeros(net.bp.raw_dim()),
            wv: Array2::zeros(net.wv.raw_dim()),
            bv: Array1::zeros(net.bv.raw_dim()),
        }
    }

    pub fn scale(&mut self, factor: f32) {
        for tensor in [&mut self.w1, &mut self.w2, &mut self.wp, &mut self.wv] {
            tensor.mapv_inplace(|v| v * factor);
        }
        for tensor in [&mut self.b1, &mut self.b2, &mut self.bp, &mut self.bv] {
            tensor.mapv_inplace(|v| v * factor);
        }
    }

    pub fn is_finite(&self) -> bool {
        self.w1.iter().all(|v| v.is_finite())
            && self.b1.iter().all(|v| v.is_finite())
            && self.w2.iter().all(|v| v.is_finite())
            && self.b2.iter().all(|v| v.is_finite())
            && self.wp.iter().all(|v| v.is_finite())
            && self.bp.iter().all(|v| v.is_finite())
            && self.wv.iter().all(|v| v.is_finite())
            && self.bv.iter().all(|v| v.is_finite())
    }
}

/// Adam with bias correction, one moment pair per tensor.
pub struct AdamState {
    m: Gradients,
    v: Gradients,
    t: u64,
    beta1: f32,
    beta2: f32,
    eps: f32,
}

impl AdamState {
    pub fn new(net: &Network) -> Self {
        Self {
            m: Gradients::zeros_like(net),
            v: Gradients::zeros_like(net),
            t: 0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    pub fn step(&mut self, net: &mut Network, grads: &Gradients, lr: f32) {
        self.t += 1;
        let t = self.t as f32;
        let correction1 = 1.0 - self.beta1.powf(t);
        let correction2 = 1.0 - self.beta2.powf(t);
        let (beta1, beta2, eps) = (self.beta1, self.beta2, self.eps);

        azip_update(&mut net.w1, &mut self.m.w1, &mut self.v.w1, &grads.w1, beta1, beta2, eps, lr, correction1, correction2);
        azip_update(&mut net.w2, &mut self.m.w2, &mut self.v.w2, &grads.w2, beta1, beta2, eps, lr, correction1, correction2);
        azip_update(&mut net.wp, &mut self.m.wp, &mut self.v.wp, &grads.wp, beta1, beta2, eps, lr, correction1, correction2);
        azip_update(&mut net.wv, &mut self.m.wv, &mut self.v.wv, &grads.wv, beta1, beta2, eps, lr, correction1, correction2);
        azip_update1(&mut net.b1, &mut self.m.b1, &mut self.v.b1, &grads.b1, beta1, beta2, eps, lr, correction1, correction2);
        azip_update1(&mut net.b2, &mut self.m.b2, &mut self.v.b2, &grads.b2, beta1, beta2, eps, lr, correction1, correction2);
        azip_update1(&mut net.bp, &mut self.m.bp, &mut self.v.bp, &grads.bp, beta1, beta2, eps, lr, correction1, correction2);
        azip_update1(&mut net.bv, &mut self.m.bv, &mut self.v.bv, &grads.bv, beta1, beta2, eps, lr, correction1, correction2);
    }
}

#[allow(clippy::too_many_arguments)]
fn azip_update(
    param: &mut Array2<f32>,
    m: &mut Array2<f32>,
    v: &mut Array2<f32>,
    g: &Array2<f32>,
    beta1: f32,
    beta2: f32,
    eps: f32,
    lr: f32,
    correction1: f32,
    correction2: f32,
) {
    ndarray::Zip::from(param)
        .and(m)
        .and(v)
        .and(g)
        .for_each(|p, m, v, g| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        });
}

#[allow(clippy::too_many_arguments)]
fn azip_update1(
    param: &mut Array1<f32>,
    m: &mut Array1<f32>,
    v: &mut Array1<f32>,
    g: &Array1<f32>,
    beta1: f32,
    beta2: f32,
    eps: f32,
    lr: f32,
    correction1: f32,
    correction2: f32,
) {
    ndarray::Zip::from(param)
        .and(m)
        .and(v)
        .and(g)
        .for_each(|p, m, v, g| {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn small_net() -> Network {
        let mut rng = StdRng::seed_from_u64(7);
        Network::init(16, 6, &mut rng)
    }

    #[test]
    fn forward_is_a_probability_distribution() {
        let net = small_net();
        let state = vec![0.5; 16];
        let pass = net.forward(&state);
        let sum: f32 = pass.probs.sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(pass.probs.iter().all(|p| *p >= 0.0));
    }

    #[test]
    fn invalid_state_yields_uniform_and_zero_value() {
        let net = small_net();
        let bad = vec![f32::NAN; 16];
        let pass = net.forward(&bad);
        let uniform = 1.0 / 6.0;
        assert!(pass.probs.iter().all(|p| (*p - uniform).abs() < 1e-6));
        assert_eq!(pass.value, 0.0);

        let wrong_width = vec![0.0; 3];
        let pass = net.forward(&wrong_width);
        assert!(pass.probs.iter().all(|p| (*p - uniform).abs() < 1e-6));
    }

    #[test]
    fn flat_round_trip_preserves_weights() {
        let net = small_net();
        let flat = net.to_flat();
        let rebuilt = Network::from_flat(16, 6, &flat).expect("rebuild");
        assert_eq!(net.to_flat(), rebuilt.to_flat());
    }

    #[test]
    fn from_flat_rejects_wrong_length() {
        assert!(Network::from_flat(16, 6, &[0.0; 10]).is_err());
    }

    #[test]
    fn mutation_changes_some_weights_but_keeps_architecture() {
        let mut rng = StdRng::seed_from_u64(9);
        let original = small_net();
        let mut mutated = original.clone();
        mutated.mutate(0.5, 0.1, &mut rng);
        assert_eq!(original.param_count(), mutated.param_count());
        let before = original.to_flat();
        let after = mutated.to_flat();
        let changed = before
            .iter()
            .zip(after.iter())
            .filter(|(a, b)| a != b)
            .count();
        assert!(changed > 0);
        assert!(changed < before.len());
        assert!(after.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn adam_step_moves_parameters() {
        let mut net = small_net();
        let before = net.to_flat();
        let mut adam = AdamState::new(&net);
        let mut grads = Gradients::zeros_like(&net);
        grads.w1.fill(0.1);
        adam.step(&mut net, &grads, 1e-3);
        assert_ne!(before, net.to_flat());
    }
}

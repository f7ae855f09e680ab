use rand::Rng;
use serde::{Deserialize, Serialize};

/// Additive noise applied to decisions and to imitated confidences.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseKind {
    None,
    Uniform { lower: f64, upper: f64 },
    Normal { mean: f64, std_dev: f64 },
}

impl NoiseKind {
    /// Symmetric uniform noise in `[-range, range]`.
    pub fn symmetric(range: f64) -> Self {
        NoiseKind::Uniform {
            lower: -range,
            upper: range,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            NoiseKind::None => 0.0,
            NoiseKind::Uniform { lower, upper } => {
                if upper > lower {
                    rng.gen_range(lower..=upper)
                } else {
                    lower
                }
            }
            NoiseKind::Normal { mean, std_dev } => {
                if std_dev <= 0.0 {
                    return mean;
                }
                // Box-Muller
                let u1: f64 = rng.gen::<f64>().max(f64::EPSILON);
                let u2: f64 = rng.gen::<f64>();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                mean + z * std_dev
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseKind::None => "none",
            NoiseKind::Uniform { .. } => "uniform",
            NoiseKind::Normal { .. } => "normal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn uniform_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let noise = NoiseKind::symmetric(0.1);
        for _ in 0..10_000 {
            let x = noise.sample(&mut rng);
            assert!((-0.1..=0.1).contains(&x));
        }
    }

    #[test]
    fn degenerate_uniform_returns_lower() {
        let mut rng = StdRng::seed_from_u64(1);
        let noise = NoiseKind::Uniform { lower: 0.2, upper: 0.2 };
        assert_eq!(noise.sample(&mut rng), 0.2);
    }

    #[test]
    fn normal_moments_are_plausible() {
        let mut rng = StdRng::seed_from_u64(99);
        let noise = NoiseKind::Normal { mean: 0.5, std_dev: 0.1 };
        let n = 20_000;
        let xs: Vec<f64> = (0..n).map(|_| noise.sample(&mut rng)).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        assert!((mean - 0.5).abs() < 0.01, "mean {}", mean);
        assert!((var.sqrt() - 0.1).abs() < 0.01, "sd {}", var.sqrt());
    }

    #[test]
    fn none_is_zero() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(NoiseKind::None.sample(&mut rng), 0.0);
    }
}

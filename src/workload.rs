//! Request length distributions.
//!
//! A workload is named on the command line:
//!
//! - `N`: every request is `N` bytes
//! - `uniform:MIN:MAX`: lengths uniform over `MIN..=MAX`
//! - `exp:MEAN`: exponentially distributed lengths with the given mean,
//!   rounded up to whole bytes

use rand::Rng;
use rand_distr::Exp1;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("unknown workload '{0}'")]
    Unknown(String),

    #[error("invalid workload '{name}': {reason}")]
    Invalid { name: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Workload {
    Fixed(i32),
    Uniform { min: i32, max: i32 },
    Exponential { mean: f64 },
}

impl FromStr for Workload {
    type Err = WorkloadError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| WorkloadError::Invalid {
            name: name.to_string(),
            reason,
        };

        if let Ok(length) = name.parse::<i32>() {
            if length <= 0 {
                return Err(invalid("length must be positive"));
            }
            return Ok(Workload::Fixed(length));
        }

        let mut parts = name.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("uniform"), Some(min), Some(max), None) => {
                let min: i32 = min.parse().map_err(|_| invalid("bad minimum"))?;
                let max: i32 = max.parse().map_err(|_| invalid("bad maximum"))?;
                if min <= 0 || max < min {
                    return Err(invalid("need 0 < MIN <= MAX"));
                }
                Ok(Workload::Uniform { min, max })
            }
            (Some("exp"), Some(mean), None, None) => {
                let mean: f64 = mean.parse().map_err(|_| invalid("bad mean"))?;
                if !(mean.is_finite() && mean > 0.0) {
                    return Err(invalid("mean must be positive"));
                }
                Ok(Workload::Exponential { mean })
            }
            _ => Err(WorkloadError::Unknown(name.to_string())),
        }
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workload::Fixed(length) => write!(f, "{length}"),
            Workload::Uniform { min, max } => write!(f, "uniform:{min}:{max}"),
            Workload::Exponential { mean } => write!(f, "exp:{mean}"),
        }
    }
}

impl Workload {
    /// Draw `count` request lengths.
    pub fn sample<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<i32> {
        (0..count)
            .map(|_| match *self {
                Workload::Fixed(length) => length,
                Workload::Uniform { min, max } => rng.gen_range(min..=max),
                Workload::Exponential { mean } => {
                    let x: f64 = rng.sample(Exp1);
                    (x * mean).ceil().clamp(1.0, i32::MAX as f64) as i32
                }
            })
            .collect()
    }

    /// Mean request length when lengths above `cap` are truncated to `cap`.
    pub fn mean(&self, cap: i32) -> f64 {
        let cap = cap.max(1);
        match *self {
            Workload::Fixed(length) => length.min(cap) as f64,
            Workload::Uniform { min, max } => {
                let (min, max, cap) = (min as f64, max as f64, cap as f64);
                if cap >= max {
                    (min + max) / 2.0
                } else if cap <= min {
                    cap
                } else {
                    let below = (min + cap) * (cap - min + 1.0) / 2.0;
                    let above = (max - cap) * cap;
                    (below + above) / (max - min + 1.0)
                }
            }
            Workload::Exponential { mean } => mean * (1.0 - (-(cap as f64) / mean).exp()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn workload(name: &str) -> Workload {
        name.parse().unwrap()
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("500".parse::<Workload>().unwrap(), Workload::Fixed(500));
        assert_eq!(
            "uniform:100:200".parse::<Workload>().unwrap(),
            Workload::Uniform { min: 100, max: 200 }
        );
        assert_eq!(
            "exp:1000".parse::<Workload>().unwrap(),
            Workload::Exponential { mean: 1000.0 }
        );
        assert_eq!(
            "w4".parse::<Workload>(),
            Err(WorkloadError::Unknown("w4".into()))
        );
        assert!(matches!(
            "uniform:9:3".parse::<Workload>(),
            Err(WorkloadError::Invalid { .. })
        ));
        assert!("0".parse::<Workload>().is_err());
        assert!("exp:-4".parse::<Workload>().is_err());
    }

    #[test]
    fn test_display_roundtrips_name() {
        for name in ["500", "uniform:100:200", "exp:1000"] {
            assert_eq!(name.parse::<Workload>().unwrap().to_string(), name);
        }
    }

    #[test]
    fn test_sample_is_repeatable_per_seed() {
        let a = workload("uniform:1:1000").sample(100, &mut StdRng::seed_from_u64(7));
        let b = workload("uniform:1:1000").sample(100, &mut StdRng::seed_from_u64(7));
        let c = workload("uniform:1:1000").sample(100, &mut StdRng::seed_from_u64(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().all(|&len| (1..=1000).contains(&len)));
    }

    #[test]
    fn test_exponential_sample_mean() {
        let lengths = workload("exp:2000").sample(50_000, &mut StdRng::seed_from_u64(1));
        assert!(lengths.iter().all(|&len| len >= 1));
        let avg = lengths.iter().map(|&l| l as f64).sum::<f64>() / lengths.len() as f64;
        assert!((avg - 2000.0).abs() < 100.0, "average {avg}");
    }

    #[test]
    fn test_truncated_means() {
        assert_eq!(workload("500").mean(100), 100.0);
        assert_eq!(workload("500").mean(1000), 500.0);
        assert_eq!(workload("uniform:1:3").mean(100), 2.0);
        // Values 1..=4 capped at 2: (1 + 2 + 2 + 2) / 4.
        assert_eq!(workload("uniform:1:4").mean(2), 1.75);
        let exp = workload("exp:1000").mean(i32::MAX);
        assert!((exp - 1000.0).abs() < 1e-6);
        assert!(workload("exp:1000").mean(1000) < 700.0);
        assert!("bogus".parse::<Workload>().is_err());
    }
}

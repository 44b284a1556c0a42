use std::ops::RangeInclusive;

use crate::error::{CareError, CareResult};

#[derive(Debug, Clone, PartialEq)]
pub struct SignalStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: i32,
    pub max: i32,
    pub deltas: Vec<u32>,
    /// Samples outside the physiological bounds. They still count toward the statistics.
    pub out_of_range: usize,
}

impl SignalStats {
    pub fn compute(samples: &[i32], bounds: &RangeInclusive<i32>) -> CareResult<Self> {
        let (min, max) = match (samples.iter().min(), samples.iter().max()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => return Err(CareError::invalid("fhr_data must contain at least one sample")),
        };

        Ok(Self {
            count: samples.len(),
            mean: mean(samples),
            std_dev: std_dev(samples),
            min,
            max,
            deltas: deltas(samples),
            out_of_range: samples
                .iter()
                .filter(|&&bpm| !bounds.contains(&bpm))
                .count(),
        })
    }

    pub fn max_delta(&self) -> u32 {
        self.deltas.iter().copied().max().unwrap_or(0)
    }
}

pub fn mean(samples: &[i32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|&bpm| bpm as f64).sum::<f64>() / samples.len() as f64
}

/// Sample standard deviation (n - 1 denominator); 0 below two samples.
pub fn std_dev(samples: &[i32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let avg = mean(samples);
    let sum_sq: f64 = samples
        .iter()
        .map(|&bpm| {
            let diff = bpm as f64 - avg;
            diff * diff
        })
        .sum();
    (sum_sq / (samples.len() - 1) as f64).sqrt()
}

pub fn deltas(samples: &[i32]) -> Vec<u32> {
    samples
        .windows(2)
        .map(|pair| pair[1].abs_diff(pair[0]))
        .collect()
}

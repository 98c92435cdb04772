// src/reports/stats.rs

use serde::Serialize;

pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

pub fn median(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut v = xs.to_vec();
    v.sort_by(|a, b| a.total_cmp(b));
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        Some((v[mid - 1] + v[mid]) / 2.0)
    } else {
        Some(v[mid])
    }
}

fn std_with_ddof(xs: &[f64], ddof: usize) -> Option<f64> {
    if xs.len() <= ddof {
        return None;
    }
    let m = mean(xs)?;
    let ss: f64 = xs.iter().map(|x| (x - m).powi(2)).sum();
    Some((ss / (xs.len() - ddof) as f64).sqrt())
}

/// Sample standard deviation (n - 1 denominator); `None` below two values.
pub fn sample_std(xs: &[f64]) -> Option<f64> {
    std_with_ddof(xs, 1)
}

/// Population standard deviation (n denominator).
pub fn population_std(xs: &[f64]) -> Option<f64> {
    std_with_ddof(xs, 0)
}

/// Z-scores against the population std. All `None` when the std is zero or undefined.
pub fn zscores(xs: &[f64]) -> Vec<Option<f64>> {
    match (mean(xs), population_std(xs)) {
        (Some(m), Some(sd)) if sd > 0.0 && sd.is_finite() => {
            xs.iter().map(|x| Some((x - m) / sd)).collect()
        }
        _ => vec![None; xs.len()],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    High,
    Low,
    Both,
}

/// Indices whose z-score passes `threshold` on the requested tail.
pub fn outlier_indices(z: &[Option<f64>], threshold: f64, tail: Tail) -> Vec<usize> {
    z.iter()
        .enumerate()
        .filter_map(|(i, z)| {
            let z = (*z)?;
            let hit = match tail {
                Tail::High => z > threshold,
                Tail::Low => z < -threshold,
                Tail::Both => z.abs() > threshold,
            };
            hit.then_some(i)
        })
        .collect()
}

/// Descriptive statistics of one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub metric: String,
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

pub fn summarize(metric: &str, xs: &[f64]) -> Summary {
    Summary {
        metric: metric.to_string(),
        count: xs.len(),
        mean: mean(xs),
        median: median(xs),
        std: sample_std(xs),
        min: xs.iter().copied().reduce(f64::min),
        max: xs.iter().copied().reduce(f64::max),
    }
}

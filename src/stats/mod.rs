//! Module `stats` implement streaming descriptive statistics.
//!
//! All estimators accept one sample at a time and never buffer the sample
//! set, so that an index or extent can be summarised in a single pass:
//!
//! * [BasicEstimators], count, mean, standard deviation, min and max, using
//!   Welford's online algorithm for the variance.
//! * [DistributionEstimators], quantile estimates using the P-square
//!   algorithm, with `2 * N + 3` markers for `N` quantiles.
//! * [SummaryEstimators], both of the above.

use serde_json::{json, Value};

use std::{fmt, result};

/// Number of quantiles estimated by [SummaryEstimators], this yields
/// percentiles 1..99 in addition to the minimum and maximum.
pub const NUM_QUANTILES: usize = 99;

/// Count, mean, standard deviation, minimum and maximum of a sample set.
#[derive(Clone, Debug)]
pub struct BasicEstimators {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for BasicEstimators {
    fn default() -> Self {
        BasicEstimators {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl BasicEstimators {
    pub fn sample(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.count as f64);
        self.m2 += delta * (x - self.mean);
        self.min = f64::min(self.min, x);
        self.max = f64::max(self.max, x);
    }

    pub fn to_count(&self) -> u64 {
        self.count
    }

    pub fn to_mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation, ZERO for less than two samples.
    pub fn to_stddev(&self) -> f64 {
        match self.count {
            0 | 1 => 0.0,
            n => (self.m2 / (n as f64)).sqrt(),
        }
    }

    /// Minimum sample, ZERO when no samples were recorded.
    pub fn to_min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    /// Maximum sample, ZERO when no samples were recorded.
    pub fn to_max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }
}

/// P-square estimator for `n_quantiles` equally spaced quantiles.
///
/// Quantile `i`, for `i` in `0..=n_quantiles+1`, is the `i / (n_quantiles+1)`
/// quantile, hence `0` is the minimum and `n_quantiles+1` is the maximum.
/// Estimates are available only after `2 * n_quantiles + 3` samples.
#[derive(Clone, Debug)]
pub struct DistributionEstimators {
    n_quantiles: usize,
    count: usize,
    heights: Vec<f64>,
    actual: Vec<f64>,
    desired: Vec<f64>,
}

impl DistributionEstimators {
    pub fn new(n_quantiles: usize) -> DistributionEstimators {
        let n_markers = 2 * n_quantiles + 3;
        let mut val = DistributionEstimators {
            n_quantiles,
            count: 0,
            heights: vec![0.0; n_markers],
            actual: (0..n_markers).map(|i| (i + 1) as f64).collect(),
            desired: vec![0.0; n_markers],
        };
        for i in 0..n_markers {
            val.desired[i] = 1.0 + 2.0 * ((n_quantiles + 1) as f64) * val.increment(i);
        }
        val
    }

    #[inline]
    fn n_markers(&self) -> usize {
        self.heights.len()
    }

    #[inline]
    fn increment(&self, i: usize) -> f64 {
        (i as f64) / ((2 * (self.n_quantiles + 1)) as f64)
    }

    pub fn sample(&mut self, x: f64) {
        let n = self.n_markers();

        if self.count < n {
            self.heights[self.count] = x;
            self.count += 1;
            if self.count == n {
                self.heights
                    .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            }
            return;
        }
        self.count += 1;

        // locate cell k such that heights[k-1] <= x < heights[k]
        let cell = if x < self.heights[0] {
            self.heights[0] = x;
            1
        } else if x >= self.heights[n - 1] {
            self.heights[n - 1] = x;
            n - 1
        } else {
            self.heights.partition_point(|h| *h <= x)
        };

        for i in cell..n {
            self.actual[i] += 1.0;
        }
        for i in 0..n {
            self.desired[i] += self.increment(i);
        }

        for i in 1..(n - 1) {
            let d = self.desired[i] - self.actual[i];
            let dp = self.actual[i + 1] - self.actual[i];
            let dm = self.actual[i - 1] - self.actual[i];

            if (d >= 1.0 && dp > 1.0) || (d <= -1.0 && dm < -1.0) {
                let hp = (self.heights[i + 1] - self.heights[i]) / dp;
                let hm = (self.heights[i - 1] - self.heights[i]) / dm;
                let sign = d.signum();

                let h = self.heights[i]
                    + sign / (dp - dm) * ((sign - dm) * hp + (dp - sign) * hm);

                if self.heights[i - 1] < h && h < self.heights[i + 1] {
                    self.heights[i] = h;
                } else if d > 0.0 {
                    self.heights[i] += hp;
                } else {
                    self.heights[i] -= hm;
                }
                self.actual[i] += sign;
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.n_markers()
    }

    pub fn to_n_quantiles(&self) -> usize {
        self.n_quantiles
    }

    /// Return the estimate for quantile `i`, None if estimates are not yet
    /// available or `i` is out of bounds.
    pub fn to_quantile(&self, i: usize) -> Option<f64> {
        if self.is_ready() && i <= self.n_quantiles + 1 {
            Some(self.heights[2 * i])
        } else {
            None
        }
    }

    /// Inverse cumulative distribution, `prob` in `[0, 1]`.
    pub fn to_icdf(&self, prob: f64) -> Option<f64> {
        let i = (prob * ((self.n_quantiles + 1) as f64)) as usize;
        self.to_quantile(i)
    }

    pub fn to_median(&self) -> Option<f64> {
        self.to_icdf(0.5)
    }

    /// All quantiles, minimum first and maximum last.
    pub fn to_quantiles(&self) -> Option<Vec<f64>> {
        if self.is_ready() {
            Some((0..=(self.n_quantiles + 1)).map(|i| self.heights[2 * i]).collect())
        } else {
            None
        }
    }
}

/// Basic estimators along with [NUM_QUANTILES] quantile estimates.
#[derive(Clone, Debug)]
pub struct SummaryEstimators {
    basic: BasicEstimators,
    dist: DistributionEstimators,
}

impl Default for SummaryEstimators {
    fn default() -> Self {
        SummaryEstimators {
            basic: BasicEstimators::default(),
            dist: DistributionEstimators::new(NUM_QUANTILES),
        }
    }
}

impl SummaryEstimators {
    pub fn sample(&mut self, x: f64) {
        self.basic.sample(x);
        self.dist.sample(x);
    }

    pub fn as_basic(&self) -> &BasicEstimators {
        &self.basic
    }

    pub fn as_distribution(&self) -> &DistributionEstimators {
        &self.dist
    }

    /// Return `{count, mean, stddev, min, max}`, along with `quantiles`
    /// once enough samples are recorded.
    pub fn to_json(&self) -> Value {
        let mut val = json!({
            "count": self.basic.to_count(),
            "mean": self.basic.to_mean(),
            "stddev": self.basic.to_stddev(),
            "min": self.basic.to_min(),
            "max": self.basic.to_max(),
        });
        if let Some(qs) = self.dist.to_quantiles() {
            val["quantiles"] = json!(qs);
        }
        val
    }
}

impl fmt::Display for SummaryEstimators {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        let b = &self.basic;
        write!(
            f,
            "{{ count={}, mean={:.3}, stddev={:.3}, min={}, max={} }}",
            b.to_count(),
            b.to_mean(),
            b.to_stddev(),
            b.to_min(),
            b.to_max()
        )
    }
}

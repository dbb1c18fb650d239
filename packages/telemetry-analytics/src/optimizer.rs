//! Efficiency-optimal cruising speed estimation.
//!
//! Buffers recent (speed, power) pairs and periodically fits a degree-3
//! polynomial `power = f(speed)` by least squares, then sweeps the observed
//! speed range for the argmin of energy-per-meter `f(s)/s`.

use serde::Serialize;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub buffer_size: usize,
    /// Minimum buffered pairs before any fit is attempted.
    pub min_samples: usize,
    /// Re-fit at most every this many accepted pairs.
    pub refit_every: usize,
    /// Accepted speed range, m/s.
    pub speed_min: f64,
    pub speed_max: f64,
    /// Accepted power upper bound, watts (non-positive power is rejected).
    pub power_max: f64,
    pub sweep_step: f64,
    /// Estimates below this confidence are not reported.
    pub min_confidence: f64,
    /// Efficiencies at or above this are nonsensical and reported as absent.
    pub max_efficiency_km_kwh: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 500,
            min_samples: 30,
            refit_every: 10,
            speed_min: 2.0,
            speed_max: 30.0,
            power_max: 10_000.0,
            sweep_step: 0.5,
            min_confidence: 0.3,
            max_efficiency_km_kwh: 500.0,
        }
    }
}

// ── Result ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimalSpeedEstimate {
    pub speed_ms: f64,
    pub confidence: f64,
    /// `3600 · speed / power` at the optimum, km/kWh. Absent when the model
    /// produced a nonsensical value.
    pub efficiency_km_kwh: Option<f64>,
}

// ── Optimizer ─────────────────────────────────────────────────────────────────

pub struct OptimalSpeedOptimizer {
    config: OptimizerConfig,
    speeds: Vec<f64>,
    powers: Vec<f64>,
    index: usize,
    count: usize,
    added_since_fit: usize,
    estimate: Option<OptimalSpeedEstimate>,
}

impl OptimalSpeedOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        let cap = config.buffer_size;
        Self {
            config,
            speeds: vec![0.0; cap],
            powers: vec![0.0; cap],
            index: 0,
            count: 0,
            added_since_fit: 0,
            estimate: None,
        }
    }

    /// Offer one (speed, power) pair. Pairs outside the accepted cruising
    /// envelope are ignored.
    pub fn add_sample(&mut self, speed_ms: f64, power_w: f64) {
        let cfg = &self.config;
        if speed_ms < cfg.speed_min
            || speed_ms > cfg.speed_max
            || power_w <= 0.0
            || power_w > cfg.power_max
        {
            return;
        }

        self.speeds[self.index] = speed_ms;
        self.powers[self.index] = power_w;
        self.index = (self.index + 1) % self.speeds.len();
        self.count = (self.count + 1).min(self.speeds.len());
        self.added_since_fit += 1;

        if self.count >= cfg.min_samples && self.added_since_fit >= cfg.refit_every {
            self.added_since_fit = 0;
            self.refit();
        }
    }

    /// The current estimate, present only when confidence cleared the bar.
    pub fn estimate(&self) -> Option<&OptimalSpeedEstimate> {
        self.estimate.as_ref()
    }

    pub fn sample_count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.count = 0;
        self.added_since_fit = 0;
        self.estimate = None;
    }

    fn refit(&mut self) {
        let speeds = &self.speeds[..self.count];
        let powers = &self.powers[..self.count];

        let Some(coeffs) = polyfit3(speeds, powers) else {
            self.estimate = None;
            return;
        };
        let r_squared = r_squared(&coeffs, speeds, powers);

        let lo = speeds.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = speeds.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let lo = lo.max(self.config.speed_min);
        let hi = hi.min(self.config.speed_max);

        // Sweep the observed envelope for the energy-per-meter minimum.
        let mut best: Option<(f64, f64)> = None; // (speed, power at speed)
        let mut s = lo;
        while s <= hi + 1e-9 {
            let p = eval_poly(&coeffs, s);
            if p > 0.0 {
                let energy_per_meter = p / s;
                if best.map_or(true, |(bs, bp)| energy_per_meter < bp / bs) {
                    best = Some((s, p));
                }
            }
            s += self.config.sweep_step;
        }

        let data_half = 0.5 * (self.count as f64 / 100.0).min(1.0);
        let confidence = if r_squared > 0.5 {
            data_half + 0.5 * r_squared.max(0.0)
        } else {
            data_half
        };

        self.estimate = match best {
            Some((speed, power)) if confidence >= self.config.min_confidence => {
                let efficiency = 3600.0 * speed / power;
                Some(OptimalSpeedEstimate {
                    speed_ms: speed,
                    confidence,
                    efficiency_km_kwh: (efficiency < self.config.max_efficiency_km_kwh)
                        .then_some(efficiency),
                })
            }
            _ => None,
        };
    }
}

impl Default for OptimalSpeedOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

// ── Polynomial least squares ──────────────────────────────────────────────────

fn eval_poly(c: &[f64; 4], x: f64) -> f64 {
    c[0] + c[1] * x + c[2] * x * x + c[3] * x * x * x
}

/// Degree-3 least-squares fit via the normal equations.
/// Returns `None` when the system is singular (e.g. all speeds identical).
fn polyfit3(xs: &[f64], ys: &[f64]) -> Option<[f64; 4]> {
    if xs.len() < 4 {
        return None;
    }

    // Power sums Σx^k for k = 0..=6 and moment sums Σx^k·y for k = 0..=3.
    let mut sx = [0.0f64; 7];
    let mut sxy = [0.0f64; 4];
    for (&x, &y) in xs.iter().zip(ys) {
        let mut xp = 1.0;
        for k in 0..7 {
            sx[k] += xp;
            if k < 4 {
                sxy[k] += xp * y;
            }
            xp *= x;
        }
    }

    let mut a = [[0.0f64; 5]; 4];
    for (i, row) in a.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().take(4).enumerate() {
            *cell = sx[i + j];
        }
        row[4] = sxy[i];
    }

    solve4(&mut a)
}

/// Gaussian elimination with partial pivoting on a 4×5 augmented matrix.
fn solve4(a: &mut [[f64; 5]; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot = (col..4).max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        for row in col + 1..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..5 {
                a[row][k] -= factor * a[col][k];
            }
        }
    }

    let mut out = [0.0f64; 4];
    for row in (0..4).rev() {
        let mut acc = a[row][4];
        for k in row + 1..4 {
            acc -= a[row][k] * out[k];
        }
        out[row] = acc / a[row][row];
    }
    Some(out)
}

fn r_squared(c: &[f64; 4], xs: &[f64], ys: &[f64]) -> f64 {
    let n = ys.len() as f64;
    let mean = ys.iter().sum::<f64>() / n;
    let ss_tot: f64 = ys.iter().map(|y| (y - mean).powi(2)).sum();
    if ss_tot < 1e-12 {
        return 0.0;
    }
    let ss_res: f64 = xs
        .iter()
        .zip(ys)
        .map(|(&x, &y)| (y - eval_poly(c, x)).powi(2))
        .sum();
    1.0 - ss_res / ss_tot
}

// ── Tests ─────────────────────────────────────────────────────────────────────

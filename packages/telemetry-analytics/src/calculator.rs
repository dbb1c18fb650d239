//! Derived-metric calculation: rolling efficiency, session extremes, motion
//! and driver state, peak detection, speed-bucket accumulation and GPS
//! cumulatives. Hosts the optimal-speed optimizer.

use std::collections::VecDeque;

use telemetry_types::{
    DerivedMetrics, DriverMode, MotionState, PeakEvent, PeakSeverity, PedalIntensity,
    TelemetrySample,
};

use crate::optimizer::{OptimalSpeedOptimizer, OptimizerConfig};
use crate::window::RollingWindow;

const GRAVITY: f64 = 9.81;
const EARTH_RADIUS_M: f64 = 6_371_000.0;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CalculatorConfig {
    pub window_size: usize,
    pub sample_interval: f64,

    // Pedal intensity bands, percent.
    pub pedal_idle_below: f64,
    pub pedal_light_below: f64,
    pub pedal_moderate_below: f64,

    // Driver mode thresholds, percent.
    pub brake_mode_min: f64,
    pub coasting_throttle_max: f64,
    pub eco_throttle_max: f64,
    pub normal_throttle_max: f64,

    /// Current peaks require the rolling mean to be at least this, amps.
    pub peak_min_mean_current: f64,
    /// Acceleration peaks require at least this magnitude, m/s².
    pub accel_peak_min: f64,
    /// Peaks retained in memory; the wire surface carries the last 10.
    pub peak_history: usize,
    pub peak_wire_count: usize,

    /// GPS segments at or beyond this are treated as fix glitches, meters.
    pub gps_segment_max_m: f64,
    /// Largest single-step climb credited to elevation gain, meters.
    pub elevation_step_max_m: f64,

    /// Efficiencies outside (0, this) are suppressed, km/kWh.
    pub max_efficiency_km_kwh: f64,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            window_size: 50,
            sample_interval: 0.2,
            pedal_idle_below: 5.0,
            pedal_light_below: 35.0,
            pedal_moderate_below: 70.0,
            brake_mode_min: 20.0,
            coasting_throttle_max: 10.0,
            eco_throttle_max: 40.0,
            normal_throttle_max: 70.0,
            peak_min_mean_current: 0.5,
            accel_peak_min: 2.0,
            peak_history: 50,
            peak_wire_count: 10,
            gps_segment_max_m: 1000.0,
            elevation_step_max_m: 50.0,
            max_efficiency_km_kwh: 500.0,
        }
    }
}

// ── Speed buckets ─────────────────────────────────────────────────────────────

/// Half-open 5 m/s interval accumulating integrated distance and energy for
/// the whole session.
#[derive(Debug, Clone, Copy, Default)]
struct SpeedBucket {
    distance_m: f64,
    energy_j: f64,
}

const BUCKET_WIDTH_MS: f64 = 5.0;
const BUCKET_COUNT: usize = 6; // [0,5) .. [25,30)

fn bucket_label(index: usize) -> String {
    let lo = index as f64 * BUCKET_WIDTH_MS;
    format!("{:.0}-{:.0} m/s", lo, lo + BUCKET_WIDTH_MS)
}

// ── Calculator ────────────────────────────────────────────────────────────────

pub struct TelemetryCalculator {
    config: CalculatorConfig,

    speed_window: RollingWindow,
    voltage_window: RollingWindow,
    current_window: RollingWindow,
    power_window: RollingWindow,
    accel_window: RollingWindow,

    distance_deltas: RollingWindow,
    energy_deltas: RollingWindow,

    last_speed: Option<f64>,
    last_energy: Option<f64>,
    last_distance: Option<f64>,
    last_gps: Option<(f64, f64, f64)>,

    max_speed_kmh: f64,
    max_power_w: f64,
    max_current_a: f64,
    max_g_force: f64,

    cumulative_energy_kwh: f64,
    gps_distance_m: f64,
    elevation_gain_m: f64,

    buckets: [SpeedBucket; BUCKET_COUNT],
    optimizer: OptimalSpeedOptimizer,

    current_peaks: VecDeque<PeakEvent>,
    current_peak_count: u64,
    accel_peaks: VecDeque<PeakEvent>,
    accel_peak_count: u64,
}

impl TelemetryCalculator {
    pub fn new(config: CalculatorConfig, optimizer_config: OptimizerConfig) -> Self {
        let n = config.window_size;
        Self {
            speed_window: RollingWindow::new(n),
            voltage_window: RollingWindow::new(n),
            current_window: RollingWindow::new(n),
            power_window: RollingWindow::new(n),
            accel_window: RollingWindow::new(n),
            distance_deltas: RollingWindow::new(n),
            energy_deltas: RollingWindow::new(n),
            last_speed: None,
            last_energy: None,
            last_distance: None,
            last_gps: None,
            max_speed_kmh: 0.0,
            max_power_w: 0.0,
            max_current_a: 0.0,
            max_g_force: 0.0,
            cumulative_energy_kwh: 0.0,
            gps_distance_m: 0.0,
            elevation_gain_m: 0.0,
            buckets: [SpeedBucket::default(); BUCKET_COUNT],
            optimizer: OptimalSpeedOptimizer::new(optimizer_config),
            current_peaks: VecDeque::new(),
            current_peak_count: 0,
            accel_peaks: VecDeque::new(),
            accel_peak_count: 0,
            config,
        }
    }

    /// Fold one sample into the session state and return the derived fields.
    pub fn update(&mut self, s: &TelemetrySample) -> DerivedMetrics {
        let cfg = self.config.clone();

        // Gravity-compensated acceleration magnitude.
        let accel_magnitude =
            (s.accel_x.powi(2) + s.accel_y.powi(2) + (s.accel_z - GRAVITY).powi(2)).sqrt();
        let g_force = accel_magnitude / GRAVITY;

        let motion_state = self.motion_state(s);
        let driver_mode = Self::driver_mode(&cfg, s);
        let throttle_intensity = Self::pedal_intensity(&cfg, s.throttle_pct);
        let brake_intensity = Self::pedal_intensity(&cfg, s.brake_pct);

        // Peak thresholds come from the windows before this sample lands.
        self.check_current_peak(s, motion_state, accel_magnitude);
        self.check_accel_peak(s, motion_state, accel_magnitude, g_force);

        // Integrated deltas for the rolling efficiency window and buckets.
        let d_dist = (s.distance_m - self.last_distance.unwrap_or(s.distance_m)).max(0.0);
        let d_energy = (s.energy_j - self.last_energy.unwrap_or(s.energy_j)).max(0.0);
        self.distance_deltas.push(d_dist);
        self.energy_deltas.push(d_energy);

        let efficiency_km_kwh = efficiency(
            self.distance_deltas.sum(),
            self.energy_deltas.sum(),
            cfg.max_efficiency_km_kwh,
        );

        // Session extremes.
        self.max_speed_kmh = self.max_speed_kmh.max(s.speed_ms * 3.6);
        self.max_power_w = self.max_power_w.max(s.power_w);
        self.max_current_a = self.max_current_a.max(s.current_a);
        self.max_g_force = self.max_g_force.max(g_force);

        // Rolling averages.
        self.speed_window.push(s.speed_ms);
        self.voltage_window.push(s.voltage_v);
        self.current_window.push(s.current_a);
        self.power_window.push(s.power_w);
        self.accel_window.push(accel_magnitude);

        self.cumulative_energy_kwh += s.power_w * cfg.sample_interval / 3.6e6;

        // Speed buckets.
        if s.speed_ms >= 0.0 {
            let idx = (s.speed_ms / BUCKET_WIDTH_MS) as usize;
            if idx < BUCKET_COUNT {
                self.buckets[idx].distance_m += d_dist;
                self.buckets[idx].energy_j += d_energy;
            }
        }
        let optimal_speed_range = self.best_bucket(cfg.max_efficiency_km_kwh);

        self.optimizer.add_sample(s.speed_ms, s.power_w);
        let (optimal_speed_ms, optimal_speed_confidence, optimal_efficiency_km_kwh) =
            match self.optimizer.estimate() {
                Some(e) => (Some(e.speed_ms), Some(e.confidence), e.efficiency_km_kwh),
                None => (None, None, None),
            };

        self.update_gps(s, &cfg);

        self.last_speed = Some(s.speed_ms);
        self.last_energy = Some(s.energy_j);
        self.last_distance = Some(s.distance_m);

        DerivedMetrics {
            efficiency_km_kwh,
            max_speed_kmh: self.max_speed_kmh,
            max_power_w: self.max_power_w,
            max_current_a: self.max_current_a,
            max_g_force: self.max_g_force,
            avg_speed_ms: self.speed_window.mean(),
            avg_voltage_v: self.voltage_window.mean(),
            avg_current_a: self.current_window.mean(),
            avg_power_w: self.power_window.mean(),
            avg_acceleration: self.accel_window.mean(),
            cumulative_energy_kwh: self.cumulative_energy_kwh,
            optimal_speed_range,
            optimal_speed_ms,
            optimal_speed_confidence,
            optimal_efficiency_km_kwh,
            motion_state,
            driver_mode,
            throttle_intensity,
            brake_intensity,
            accel_magnitude,
            g_force,
            current_peaks: self.recent_peaks(&self.current_peaks),
            current_peak_count: self.current_peak_count,
            accel_peaks: self.recent_peaks(&self.accel_peaks),
            accel_peak_count: self.accel_peak_count,
            gps_distance_m: self.gps_distance_m,
            elevation_gain_m: self.elevation_gain_m,
        }
    }

    pub fn reset(&mut self) {
        self.speed_window.reset();
        self.voltage_window.reset();
        self.current_window.reset();
        self.power_window.reset();
        self.accel_window.reset();
        self.distance_deltas.reset();
        self.energy_deltas.reset();
        self.last_speed = None;
        self.last_energy = None;
        self.last_distance = None;
        self.last_gps = None;
        self.max_speed_kmh = 0.0;
        self.max_power_w = 0.0;
        self.max_current_a = 0.0;
        self.max_g_force = 0.0;
        self.cumulative_energy_kwh = 0.0;
        self.gps_distance_m = 0.0;
        self.elevation_gain_m = 0.0;
        self.buckets = [SpeedBucket::default(); BUCKET_COUNT];
        self.optimizer.reset();
        self.current_peaks.clear();
        self.current_peak_count = 0;
        self.accel_peaks.clear();
        self.accel_peak_count = 0;
    }

    // ── State classification ──────────────────────────────────────────────────

    fn motion_state(&self, s: &TelemetrySample) -> MotionState {
        if s.speed_ms < 0.5 {
            return MotionState::Stationary;
        }
        if s.gyro_z.abs() > 15.0 {
            return MotionState::Turning;
        }
        let dv = s.speed_ms - self.last_speed.unwrap_or(s.speed_ms);
        let accel = dv / self.config.sample_interval;
        if accel < -2.0 {
            MotionState::Braking
        } else if accel > 2.0 {
            MotionState::Accelerating
        } else {
            MotionState::Cruising
        }
    }

    fn driver_mode(cfg: &CalculatorConfig, s: &TelemetrySample) -> DriverMode {
        if s.brake_pct > cfg.brake_mode_min {
            DriverMode::Braking
        } else if s.throttle_pct < cfg.coasting_throttle_max && s.speed_ms > 1.0 {
            DriverMode::Coasting
        } else if s.throttle_pct < cfg.eco_throttle_max {
            DriverMode::Eco
        } else if s.throttle_pct < cfg.normal_throttle_max {
            DriverMode::Normal
        } else {
            DriverMode::Aggressive
        }
    }

    fn pedal_intensity(cfg: &CalculatorConfig, pct: f64) -> PedalIntensity {
        if pct < cfg.pedal_idle_below {
            PedalIntensity::Idle
        } else if pct < cfg.pedal_light_below {
            PedalIntensity::Light
        } else if pct < cfg.pedal_moderate_below {
            PedalIntensity::Moderate
        } else {
            PedalIntensity::Heavy
        }
    }

    // ── Peaks ─────────────────────────────────────────────────────────────────

    fn check_current_peak(&mut self, s: &TelemetrySample, motion: MotionState, accel_mag: f64) {
        if self.current_window.is_empty() {
            return;
        }
        let (mean, std) = (self.current_window.mean(), self.current_window.std());
        if mean <= self.config.peak_min_mean_current {
            return;
        }
        let threshold = (mean + 2.0 * std).max(mean * 1.5);
        if s.current_a <= threshold {
            return;
        }
        let severity = if s.current_a > threshold * 1.5 {
            PeakSeverity::High
        } else if s.current_a > threshold * 1.2 {
            PeakSeverity::Medium
        } else {
            PeakSeverity::Low
        };
        self.current_peak_count += 1;
        push_peak(
            &mut self.current_peaks,
            self.config.peak_history,
            PeakEvent {
                timestamp: s.timestamp.clone(),
                value: s.current_a,
                threshold,
                motion_state: motion,
                accel_magnitude: accel_mag,
                severity,
            },
        );
    }

    fn check_accel_peak(
        &mut self,
        s: &TelemetrySample,
        motion: MotionState,
        accel_mag: f64,
        g_force: f64,
    ) {
        if self.accel_window.is_empty() {
            return;
        }
        let (mean, std) = (self.accel_window.mean(), self.accel_window.std());
        let threshold = (mean + 2.0 * std)
            .max(mean * 1.5)
            .max(self.config.accel_peak_min);
        if accel_mag <= threshold {
            return;
        }
        let severity = if g_force > 2.0 {
            PeakSeverity::High
        } else if g_force > 1.0 {
            PeakSeverity::Medium
        } else {
            PeakSeverity::Low
        };
        self.accel_peak_count += 1;
        push_peak(
            &mut self.accel_peaks,
            self.config.peak_history,
            PeakEvent {
                timestamp: s.timestamp.clone(),
                value: accel_mag,
                threshold,
                motion_state: motion,
                accel_magnitude: accel_mag,
                severity,
            },
        );
    }

    fn recent_peaks(&self, peaks: &VecDeque<PeakEvent>) -> Vec<PeakEvent> {
        let skip = peaks.len().saturating_sub(self.config.peak_wire_count);
        peaks.iter().skip(skip).cloned().collect()
    }

    // ── GPS cumulatives ───────────────────────────────────────────────────────

    fn update_gps(&mut self, s: &TelemetrySample, cfg: &CalculatorConfig) {
        if let Some((lat, lon, alt)) = self.last_gps {
            let segment = haversine_m(lat, lon, s.latitude, s.longitude);
            if segment < cfg.gps_segment_max_m {
                self.gps_distance_m += segment;
            }
            let climb = s.altitude - alt;
            if climb > 0.0 && climb <= cfg.elevation_step_max_m {
                self.elevation_gain_m += climb;
            }
        }
        self.last_gps = Some((s.latitude, s.longitude, s.altitude));
    }

    fn best_bucket(&self, max_efficiency: f64) -> Option<String> {
        let mut best: Option<(usize, f64)> = None;
        for (i, b) in self.buckets.iter().enumerate() {
            if b.energy_j <= 0.0 {
                continue;
            }
            let eff = 3600.0 * b.distance_m / b.energy_j;
            if eff >= max_efficiency {
                continue;
            }
            if best.map_or(true, |(_, be)| eff > be) {
                best = Some((i, eff));
            }
        }
        best.map(|(i, _)| bucket_label(i))
    }
}

impl Default for TelemetryCalculator {
    fn default() -> Self {
        Self::new(CalculatorConfig::default(), OptimizerConfig::default())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn push_peak(peaks: &mut VecDeque<PeakEvent>, cap: usize, peak: PeakEvent) {
    if peaks.len() == cap {
        peaks.pop_front();
    }
    peaks.push_back(peak);
}

fn efficiency(distance_m: f64, energy_j: f64, cap: f64) -> Option<f64> {
    if energy_j <= 0.0 {
        return None;
    }
    // km/kWh: (d/1000) / (e/3.6e6) = 3600·d/e
    let eff = 3600.0 * distance_m / energy_j;
    (eff > 0.0 && eff < cap).then_some(eff)
}

fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

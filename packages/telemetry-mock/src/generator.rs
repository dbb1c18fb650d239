//! Synthetic telemetry generation with fault injection.

use chrono::{SecondsFormat, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use tracing::{info, warn};

use telemetry_types::RawSample;

use crate::scenario::{MockModeConfig, MockScenario};

/// Sensors eligible for failure injection.
const FAILABLE_SENSORS: [&str; 8] = [
    "voltage_v", "current_a",
    "gyro_x", "gyro_y", "gyro_z",
    "accel_x", "accel_y", "accel_z",
];

/// Counters for generated/suppressed samples and injected faults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub messages_generated: u64,
    pub messages_dropped: u64,
    pub sensor_failures: u64,
    pub gps_jumps: u64,
    pub stalls: u64,
}

/// Scenario-parameterized synthetic sample source.
///
/// `generate()` returns `None` during stalls and drops so the caller can
/// time-skip; everything else is one complete sample per tick.
pub struct MockDataGenerator {
    config: MockModeConfig,
    session_id: String,
    session_name: String,
    data_interval: f64,
    rng: StdRng,

    // Simulation state
    cumulative_distance: f64,
    cumulative_energy: f64,
    simulation_time: u64,
    prev_speed: f64,
    message_count: u64,
    base_altitude: f64,
    base_lat: f64,
    base_lon: f64,

    // Fault state
    stall_ticks_remaining: u32,
    burst_drop_remaining: u32,
    sensor_failure_remaining: u32,
    failed_sensors: Vec<&'static str>,
    gps_drift_offset: (f64, f64),

    stats: GeneratorStats,
}

impl MockDataGenerator {
    pub fn new(
        config: MockModeConfig,
        session_id: impl Into<String>,
        session_name: impl Into<String>,
        data_interval: f64,
    ) -> Self {
        Self::with_rng(config, session_id, session_name, data_interval, StdRng::from_entropy())
    }

    /// Deterministic construction for tests and replayable runs.
    pub fn with_seed(
        config: MockModeConfig,
        session_id: impl Into<String>,
        session_name: impl Into<String>,
        data_interval: f64,
        seed: u64,
    ) -> Self {
        Self::with_rng(config, session_id, session_name, data_interval, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        config: MockModeConfig,
        session_id: impl Into<String>,
        session_name: impl Into<String>,
        data_interval: f64,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            session_id: session_id.into(),
            session_name: session_name.into(),
            data_interval,
            rng,
            cumulative_distance: 0.0,
            cumulative_energy: 0.0,
            simulation_time: 0,
            prev_speed: 0.0,
            message_count: 0,
            base_altitude: 100.0,
            base_lat: 40.7128,
            base_lon: -74.0060,
            stall_ticks_remaining: 0,
            burst_drop_remaining: 0,
            sensor_failure_remaining: 0,
            failed_sensors: Vec::new(),
            gps_drift_offset: (0.0, 0.0),
            stats: GeneratorStats::default(),
        }
    }

    pub fn stats(&self) -> &GeneratorStats {
        &self.stats
    }

    pub fn scenario(&self) -> MockScenario {
        self.config.scenario
    }

    /// Reset all simulation and fault state for a new session.
    pub fn reset(&mut self) {
        self.cumulative_distance = 0.0;
        self.cumulative_energy = 0.0;
        self.simulation_time = 0;
        self.prev_speed = 0.0;
        self.message_count = 0;
        self.stall_ticks_remaining = 0;
        self.burst_drop_remaining = 0;
        self.sensor_failure_remaining = 0;
        self.failed_sensors.clear();
        self.gps_drift_offset = (0.0, 0.0);
        self.stats = GeneratorStats::default();
    }

    /// One tick. Returns `None` when the tick is consumed by a stall or a
    /// dropped message.
    pub fn generate(&mut self) -> Option<RawSample> {
        if self.should_stall() {
            return None;
        }
        if self.should_drop_message() {
            self.stats.messages_dropped += 1;
            return None;
        }

        let t = self.simulation_time as f64;
        let dt = self.data_interval;

        // Speed: sinusoidal base with Gaussian noise, clamped to the track.
        let base_speed = 15.0 + 5.0 * (t * 0.1).sin();
        let speed = (base_speed + self.gauss(1.4)).clamp(0.0, 25.0);

        // Electrical tracks follow speed.
        let voltage = (48.0 + self.gauss(1.4)).clamp(40.0, 55.0);
        let current = (7.5 + speed * 0.2 + self.gauss(0.9)).clamp(0.0, 15.0);
        let power = voltage * current;

        self.cumulative_energy += power * dt;
        self.cumulative_distance += speed * dt;

        // GPS: circular path around the base point.
        let lat_offset = 0.001 * (t * 0.05).sin();
        let lon_offset = 0.001 * (t * 0.05).cos();
        let latitude = self.base_lat + lat_offset + self.gauss(0.0001);
        let longitude = self.base_lon + lon_offset + self.gauss(0.0001);
        let altitude = self.base_altitude + 10.0 * (t * 0.03).sin() + self.gauss(1.0);

        // IMU: turning-rate sinusoid on gyro_z, accel from kinematics plus
        // speed-proportional vibration.
        let turning_rate = 2.0 * (t * 0.08).sin();
        let gyro_x = self.gauss(0.5);
        let gyro_y = self.gauss(0.3);
        let gyro_z = turning_rate + self.gauss(0.8);

        let speed_acc = (speed - self.prev_speed) / dt;
        self.prev_speed = speed;
        let vib = speed * 0.02;
        let accel_x = speed_acc + self.gauss(0.2) + self.gauss(vib);
        let accel_y = turning_rate * speed * 0.1 + self.gauss(0.1) + self.gauss(vib);
        let accel_z = 9.81 + self.gauss(0.05) + self.gauss(vib);
        let total_acc = (accel_x.powi(2) + accel_y.powi(2) + accel_z.powi(2)).sqrt();

        // Driver inputs: slow throttle phase with periodic brake events.
        let phase = ((t * 0.06).sin() + 1.0) / 2.0;
        let throttle_base = 20.0 + 70.0 * phase;
        let brake_event =
            self.simulation_time % 120 < 12 || self.rng.gen_bool(0.03);
        let (throttle_pct, brake_pct) = if brake_event {
            let brake = (60.0 + self.gauss(15.0)).clamp(15.0, 100.0);
            ((throttle_base - brake * 0.6).max(0.0), brake)
        } else {
            let brake = (2.0 + self.gauss(1.0)).max(0.0);
            ((throttle_base + self.gauss(5.0)).clamp(5.0, 100.0), brake)
        };

        self.simulation_time += 1;
        self.message_count += 1;
        self.stats.messages_generated += 1;

        let mut sample = RawSample {
            session_id: Some(self.session_id.clone()),
            session_name: Some(self.session_name.clone()),
            timestamp: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
            speed_ms: Some(round2(speed)),
            voltage_v: Some(round2(voltage)),
            current_a: Some(round2(current)),
            power_w: Some(round2(power)),
            energy_j: Some(round2(self.cumulative_energy)),
            distance_m: Some(round2(self.cumulative_distance)),
            latitude: Some(round6(latitude)),
            longitude: Some(round6(longitude)),
            altitude: Some(round2(altitude)),
            gyro_x: Some(round3(gyro_x)),
            gyro_y: Some(round3(gyro_y)),
            gyro_z: Some(round3(gyro_z)),
            accel_x: Some(round3(accel_x)),
            accel_y: Some(round3(accel_y)),
            accel_z: Some(round3(accel_z)),
            total_acceleration: Some(round3(total_acc)),
            message_id: Some(self.message_count),
            uptime_seconds: Some(self.simulation_time as f64 * dt),
            data_source: Some(self.config.scenario.source_tag()),
            throttle_pct: Some((throttle_pct * 10.0).round() / 10.0),
            brake_pct: Some((brake_pct * 10.0).round() / 10.0),
            throttle: Some(round3(throttle_pct / 100.0)),
            brake: Some(round3(brake_pct / 100.0)),
        };

        if matches!(
            self.config.scenario,
            MockScenario::SensorFailures | MockScenario::Chaos
        ) {
            self.apply_sensor_failures(&mut sample);
        }
        if matches!(self.config.scenario, MockScenario::GpsIssues | MockScenario::Chaos) {
            self.apply_gps_issues(&mut sample);
        }

        Some(sample)
    }

    /// Generate many ticks at once; suppressed ticks are skipped unless
    /// `include_gaps` is set (then they appear as `None`).
    pub fn generate_batch(&mut self, count: usize, include_gaps: bool) -> Vec<Option<RawSample>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let sample = self.generate();
            if sample.is_some() || include_gaps {
                out.push(sample);
            }
        }
        out
    }

    // ── Fault injection ───────────────────────────────────────────────────────

    fn should_stall(&mut self) -> bool {
        if self.stall_ticks_remaining > 0 {
            self.stall_ticks_remaining -= 1;
            if self.stall_ticks_remaining == 0 {
                info!("simulated stall ended, resuming");
            }
            return true;
        }
        if self.config.stall_probability > 0.0 && self.rng.gen_bool(self.config.stall_probability) {
            let duration_s = Uniform::new_inclusive(
                self.config.stall_duration_min_s,
                self.config.stall_duration_max_s,
            )
            .sample(&mut self.rng);
            // Accounted in ticks so a stall consumes the same samples no
            // matter how fast the loop is driven.
            self.stall_ticks_remaining = (duration_s / self.data_interval).round().max(1.0) as u32;
            self.stats.stalls += 1;
            warn!("simulated data stall started ({duration_s:.1} s)");
            return true;
        }
        false
    }

    fn should_drop_message(&mut self) -> bool {
        if self.burst_drop_remaining > 0 {
            self.burst_drop_remaining -= 1;
            return true;
        }
        if self.config.burst_drop_probability > 0.0
            && self.rng.gen_bool(self.config.burst_drop_probability)
        {
            self.burst_drop_remaining = self.rng.gen_range(3..=10);
            warn!("simulated burst drop started ({} messages)", self.burst_drop_remaining);
            return true;
        }
        self.config.drop_probability > 0.0 && self.rng.gen_bool(self.config.drop_probability)
    }

    fn apply_sensor_failures(&mut self, sample: &mut RawSample) {
        if self.sensor_failure_remaining == 0
            && self.config.sensor_failure_probability > 0.0
            && self.rng.gen_bool(self.config.sensor_failure_probability)
        {
            self.sensor_failure_remaining = self.config.sensor_failure_duration;
            let fail_count = self.rng.gen_range(1..=4);
            self.failed_sensors = pick_sensors(&mut self.rng, fail_count);
            self.stats.sensor_failures += 1;
            warn!("simulated sensor failure started for {:?}", self.failed_sensors);
        }

        if self.sensor_failure_remaining > 0 {
            for &sensor in &self.failed_sensors.clone() {
                // Frozen at zero most of the time, corrupted otherwise.
                let value = if self.rng.gen_bool(0.7) {
                    0.0
                } else {
                    self.rng.gen_range(-999.0..999.0)
                };
                set_field(sample, sensor, value);
            }
            self.sensor_failure_remaining -= 1;
            if self.sensor_failure_remaining == 0 {
                info!("simulated sensor failure recovered");
            }
        }
    }

    fn apply_gps_issues(&mut self, sample: &mut RawSample) {
        let gps_drift_active = self.config.gps_drift_active;
        let gps_accuracy_degraded = self.config.gps_accuracy_degraded;
        let gps_jump_probability = self.config.gps_jump_probability;

        if gps_drift_active {
            self.gps_drift_offset.0 += self.gauss(0.00002);
            self.gps_drift_offset.1 += self.gauss(0.00002);
            // Occasional recalibration pulls the drift halfway back.
            if self.rng.gen_bool(0.005) {
                self.gps_drift_offset.0 *= 0.5;
                self.gps_drift_offset.1 *= 0.5;
            }
            add_to(&mut sample.latitude, self.gps_drift_offset.0);
            add_to(&mut sample.longitude, self.gps_drift_offset.1);
        }

        if gps_accuracy_degraded {
            let dlat = self.gauss(0.0005);
            let dlon = self.gauss(0.0005);
            let dalt = self.gauss(5.0);
            add_to(&mut sample.latitude, dlat);
            add_to(&mut sample.longitude, dlon);
            add_to(&mut sample.altitude, dalt);
        }

        if gps_jump_probability > 0.0 && self.rng.gen_bool(gps_jump_probability) {
            let jump_lat = self.rng.gen_range(-0.01..0.01);
            let jump_lon = self.rng.gen_range(-0.01..0.01);
            add_to(&mut sample.latitude, jump_lat);
            add_to(&mut sample.longitude, jump_lon);
            self.stats.gps_jumps += 1;
            warn!("simulated GPS position jump ({jump_lat:.4}, {jump_lon:.4})");
        }
    }

    fn gauss(&mut self, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return 0.0;
        }
        Normal::new(0.0, sigma).unwrap().sample(&mut self.rng)
    }
}

fn pick_sensors(rng: &mut StdRng, count: usize) -> Vec<&'static str> {
    let mut pool: Vec<&'static str> = FAILABLE_SENSORS.to_vec();
    let mut picked = Vec::with_capacity(count);
    for _ in 0..count.min(pool.len()) {
        let idx = rng.gen_range(0..pool.len());
        picked.push(pool.swap_remove(idx));
    }
    picked
}

fn set_field(sample: &mut RawSample, field: &str, value: f64) {
    let slot = match field {
        "voltage_v" => &mut sample.voltage_v,
        "current_a" => &mut sample.current_a,
        "gyro_x" => &mut sample.gyro_x,
        "gyro_y" => &mut sample.gyro_y,
        "gyro_z" => &mut sample.gyro_z,
        "accel_x" => &mut sample.accel_x,
        "accel_y" => &mut sample.accel_y,
        "accel_z" => &mut sample.accel_z,
        _ => return,
    };
    *slot = Some(value);
}

fn add_to(slot: &mut Option<f64>, delta: f64) {
    *slot = Some(slot.unwrap_or(0.0) + delta);
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(scenario: MockScenario, seed: u64) -> MockDataGenerator {
        MockDataGenerator::with_seed(
            MockModeConfig::from_scenario(scenario),
            "mock-session",
            "Mock Session",
            0.2,
            seed,
        )
    }

    #[test]
    fn normal_scenario_never_suppresses() {
        let mut gen = generator(MockScenario::Normal, 7);
        for _ in 0..500 {
            assert!(gen.generate().is_some());
        }
        assert_eq!(gen.stats().messages_generated, 500);
        assert_eq!(gen.stats().messages_dropped, 0);
        assert_eq!(gen.stats().stalls, 0);
    }

    #[test]
    fn samples_are_physically_coherent() {
        let mut gen = generator(MockScenario::Normal, 11);
        let mut last_energy = 0.0;
        let mut last_distance = 0.0;
        for i in 1..=300 {
            let s = gen.generate().unwrap();
            let speed = s.speed_ms.unwrap();
            assert!((0.0..=25.0).contains(&speed));
            assert!((40.0..=55.0).contains(&s.voltage_v.unwrap()));
            assert!((0.0..=15.0).contains(&s.current_a.unwrap()));

            let energy = s.energy_j.unwrap();
            let distance = s.distance_m.unwrap();
            assert!(energy >= last_energy, "energy must be non-decreasing");
            assert!(distance >= last_distance, "distance must be non-decreasing");
            last_energy = energy;
            last_distance = distance;

            assert_eq!(s.message_id, Some(i));
            assert_eq!(s.data_source.as_deref(), Some("MOCK_NORMAL"));

            let (t_pct, t) = (s.throttle_pct.unwrap(), s.throttle.unwrap());
            assert!((t_pct / 100.0 - t).abs() < 0.01);
        }
    }

    #[test]
    fn stall_consumes_a_run_of_ticks() {
        let mut config = MockModeConfig::from_scenario(MockScenario::DataStalls);
        config.stall_probability = 1.0; // stall immediately
        config.stall_duration_min_s = 1.0;
        config.stall_duration_max_s = 1.0;
        let mut gen = MockDataGenerator::with_seed(config, "s", "n", 0.2, 3);

        // 1 s at 0.2 s/tick = 5 suppressed ticks.
        for _ in 0..5 {
            assert!(gen.generate().is_none());
        }
        assert_eq!(gen.stats().stalls, 1);
    }

    #[test]
    fn chaos_injects_every_fault_class() {
        let mut gen = generator(MockScenario::Chaos, 42);
        let mut emitted = 0usize;
        const TICKS: usize = 2000;
        for _ in 0..TICKS {
            if gen.generate().is_some() {
                emitted += 1;
            }
        }

        let stats = gen.stats().clone();
        assert!(stats.stalls > 0, "expected stalls, got {stats:?}");
        assert!(stats.messages_dropped > 0, "expected drops, got {stats:?}");
        assert!(stats.sensor_failures > 0, "expected sensor failures, got {stats:?}");
        assert!(stats.gps_jumps > 0, "expected gps jumps, got {stats:?}");

        let ratio = emitted as f64 / TICKS as f64;
        assert!(
            (0.80..0.98).contains(&ratio),
            "emitted ratio {ratio} outside expected band"
        );
    }

    #[test]
    fn reset_clears_counters_and_cumulatives() {
        let mut gen = generator(MockScenario::Normal, 9);
        for _ in 0..50 {
            gen.generate();
        }
        gen.reset();
        assert_eq!(gen.stats(), &GeneratorStats::default());
        let s = gen.generate().unwrap();
        assert_eq!(s.message_id, Some(1));
        assert!(s.distance_m.unwrap() < 6.0); // one tick of travel
    }

    #[test]
    fn batch_generation_skips_gaps_by_default() {
        let mut gen = generator(MockScenario::Intermittent, 5);
        let batch = gen.generate_batch(200, false);
        assert!(batch.iter().all(|s| s.is_some()));
        assert!(batch.len() < 200); // some ticks dropped

        let mut gen = generator(MockScenario::Intermittent, 5);
        let with_gaps = gen.generate_batch(200, true);
        assert_eq!(with_gaps.len(), 200);
        assert!(with_gaps.iter().any(|s| s.is_none()));
    }
}

//! Pacing of simulated time against wall-clock time.
//!
//! The scheduler runs one slice, then asks the [`Throttle`] what to do. All
//! methods take the current instant so the pacing is testable without
//! sleeping.

use crate::system::SimulationTime;
use std::time::{Duration, Instant};

/// Simulated time executed between throttle checks.
pub const SLICE_TIME: SimulationTime = 10_000_000;
/// How far real time may run ahead of simulated time before it is written off.
pub const MAX_VARIANCE: Duration = Duration::from_millis(100);
/// Real time over which the simulation speed is measured.
pub const SPEED_WINDOW: Duration = Duration::from_secs(1);

const LOST_TIME_WARNING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleAction {
    /// Simulation is ahead; sleep this long.
    Sleep(Duration),
    OnTime,
    /// Simulation fell behind by more than the allowed variance. The deficit
    /// has been added to lost time and the epoch rebased.
    LostTime(Duration),
}

/// A closed speed measurement window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedSample {
    pub real_time: Duration,
    pub simulated_time: SimulationTime,
    /// Simulated over real time, in percent.
    pub speed: f32,
}

#[derive(Debug)]
pub struct Throttle {
    epoch_real: Instant,
    epoch_simulated: SimulationTime,
    max_variance: Duration,
    lost_time: Duration,
    last_lost_warning: Option<Instant>,
    window_real: Instant,
    window_simulated: SimulationTime,
}

fn simulated_duration(ns: SimulationTime) -> Duration {
    Duration::from_nanos(ns.max(0) as u64)
}

impl Throttle {
    pub fn new(simulation_time: SimulationTime, now: Instant) -> Self {
        Self::with_max_variance(simulation_time, now, MAX_VARIANCE)
    }

    pub fn with_max_variance(simulation_time: SimulationTime, now: Instant, max_variance: Duration) -> Self {
        Self {
            epoch_real: now,
            epoch_simulated: simulation_time,
            max_variance,
            lost_time: Duration::ZERO,
            last_lost_warning: None,
            window_real: now,
            window_simulated: simulation_time,
        }
    }

    /// Rebase the epoch and restart the speed window, e.g. after a pause or
    /// a state load.
    pub fn reset(&mut self, simulation_time: SimulationTime, now: Instant) {
        self.rebase(simulation_time, now);
        self.window_real = now;
        self.window_simulated = simulation_time;
    }

    /// Move the pacing epoch without touching the speed window.
    pub fn rebase(&mut self, simulation_time: SimulationTime, now: Instant) {
        self.epoch_real = now;
        self.epoch_simulated = simulation_time;
    }

    pub fn throttle(&mut self, simulation_time: SimulationTime, now: Instant) -> ThrottleAction {
        let simulated = simulated_duration(simulation_time - self.epoch_simulated);
        let real = now.saturating_duration_since(self.epoch_real);

        if simulated > real {
            let ahead = simulated - real;
            if ahead > self.max_variance {
                // Clock jumped; don't stall for the whole gap.
                log::debug!("[Throttle] {:?} ahead, rebasing", ahead);
                self.rebase(simulation_time, now);
                return ThrottleAction::Sleep(self.max_variance);
            }
            return ThrottleAction::Sleep(ahead);
        }

        let behind = real - simulated;
        if behind <= self.max_variance {
            return ThrottleAction::OnTime;
        }

        self.lost_time += behind;
        let warn = self
            .last_lost_warning
            .is_none_or(|last| now.saturating_duration_since(last) >= LOST_TIME_WARNING_INTERVAL);
        if warn {
            log::warn!(
                "[Throttle] Simulation behind by {:.2} ms, {:.2} ms lost in total",
                behind.as_secs_f64() * 1000.0,
                self.lost_time.as_secs_f64() * 1000.0
            );
            self.last_lost_warning = Some(now);
        }
        self.rebase(simulation_time, now);
        ThrottleAction::LostTime(behind)
    }

    /// Close the speed window if it has lasted [`SPEED_WINDOW`].
    pub fn update_speed(&mut self, simulation_time: SimulationTime, now: Instant) -> Option<SpeedSample> {
        let real_time = now.saturating_duration_since(self.window_real);
        if real_time < SPEED_WINDOW {
            return None;
        }

        let simulated_time = simulation_time - self.window_simulated;
        let speed = (simulated_duration(simulated_time).as_secs_f64() / real_time.as_secs_f64() * 100.0) as f32;
        self.window_real = now;
        self.window_simulated = simulation_time;
        Some(SpeedSample {
            real_time,
            simulated_time,
            speed,
        })
    }

    /// Total real time written off because the simulation could not keep up.
    pub fn lost_time(&self) -> Duration {
        self.lost_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: SimulationTime = 1_000_000;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn sleeps_when_ahead() {
        let start = Instant::now();
        let mut throttle = Throttle::new(0, start);
        assert_eq!(throttle.throttle(10 * MS, start + ms(4)), ThrottleAction::Sleep(ms(6)));
        assert_eq!(throttle.throttle(20 * MS, start + ms(20)), ThrottleAction::OnTime);
        assert_eq!(throttle.lost_time(), Duration::ZERO);
    }

    #[test]
    fn small_lag_is_tolerated() {
        let start = Instant::now();
        let mut throttle = Throttle::new(0, start);
        assert_eq!(throttle.throttle(10 * MS, start + ms(100)), ThrottleAction::OnTime);
        assert_eq!(throttle.lost_time(), Duration::ZERO);
    }

    #[test]
    fn large_lag_is_lost_without_catch_up() {
        let start = Instant::now();
        let mut throttle = Throttle::new(0, start);

        assert_eq!(throttle.throttle(10 * MS, start + ms(260)), ThrottleAction::LostTime(ms(250)));
        assert_eq!(throttle.lost_time(), ms(250));

        // The epoch moved to (260ms, 10ms): the next slice is paced from there.
        assert_eq!(throttle.throttle(20 * MS, start + ms(262)), ThrottleAction::Sleep(ms(8)));

        assert_eq!(throttle.throttle(30 * MS, start + ms(500)), ThrottleAction::LostTime(ms(220)));
        assert_eq!(throttle.lost_time(), ms(470));
    }

    #[test]
    fn large_lead_is_clamped() {
        let start = Instant::now();
        let mut throttle = Throttle::new(0, start);
        assert_eq!(throttle.throttle(1_000 * MS, start), ThrottleAction::Sleep(MAX_VARIANCE));
        assert_eq!(throttle.throttle(1_010 * MS, start + ms(10)), ThrottleAction::OnTime);
    }

    #[test]
    fn reset_rebases_epoch() {
        let start = Instant::now();
        let mut throttle = Throttle::new(0, start);
        // Paused for five seconds.
        throttle.reset(50 * MS, start + ms(5_000));
        assert_eq!(throttle.throttle(60 * MS, start + ms(5_002)), ThrottleAction::Sleep(ms(8)));
        assert_eq!(throttle.lost_time(), Duration::ZERO);
    }

    #[test]
    fn speed_window_closes_after_one_second() {
        let start = Instant::now();
        let mut throttle = Throttle::new(0, start);
        assert_eq!(throttle.update_speed(500 * MS, start + ms(999)), None);

        let sample = throttle.update_speed(500 * MS, start + ms(1_000)).unwrap();
        assert_eq!(sample.simulated_time, 500 * MS);
        assert_eq!(sample.real_time, ms(1_000));
        assert!((sample.speed - 50.0).abs() < 0.01);

        // A new window starts at the close.
        assert_eq!(throttle.update_speed(900 * MS, start + ms(1_500)), None);
        let sample = throttle.update_speed(1_500 * MS, start + ms(2_000)).unwrap();
        assert!((sample.speed - 100.0).abs() < 0.01);
    }
}

//! Host-side control of the simulation thread.
//!
//! [`HostInterface::create_system`] spawns a thread that owns the [`Machine`]
//! for its whole life. Everything the host wants done to the machine is sent
//! as an external event and runs on that thread between two slices.

use crate::config::SystemConfig;
use crate::cpu::{CpuBackendKind, ExecutionStats};
use crate::error::SystemError;
use crate::events::{ComponentId, DEFAULT_OSD_DURATION, HostEvents, ScanCode};
use crate::sync::Semaphore;
use crate::system::Machine;
use crate::throttle::{SLICE_TIME, Throttle, ThrottleAction};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// How long a waiting caller blocks before yielding to the UI.
const YIELD_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutionState {
    Stopped = 0,
    Running = 1,
    Paused = 2,
}

impl ExecutionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ExecutionState::Running,
            2 => ExecutionState::Paused,
            _ => ExecutionState::Stopped,
        }
    }
}

/// Statistics published by the simulation thread.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimulationStats {
    /// Simulated over real time during the last speed window, in percent.
    pub simulation_speed: f32,
    /// Simulation thread CPU time over real time during the last window.
    pub host_cpu_usage: f32,
    /// Nanoseconds.
    pub total_time_simulated: u64,
    /// Nanoseconds simulated during the last window.
    pub delta_time_simulated: u64,
    pub lost_time: Duration,
    pub cpu_stats: ExecutionStats,
    /// Counter increase during the last window.
    pub cpu_delta: ExecutionStats,
}

/// Notifications from the scheduler. Most are called on the simulation
/// thread; `yield_to_ui` is called on a host thread blocked on a waiting
/// event.
pub trait HostCallbacks: Send + Sync {
    fn on_system_initialized(&self) {
        log::info!("[Host] System initialized");
    }

    fn on_system_reset(&self) {
        log::info!("[Host] System reset");
    }

    fn on_system_state_loaded(&self) {
        log::info!("[Host] System state loaded");
    }

    fn on_system_destroy(&self) {
        log::info!("[Host] System destroyed");
    }

    fn on_simulation_stats_update(&self, stats: &SimulationStats) {
        log::debug!(
            "[Host] Speed {:.1}%, host CPU {:.1}%, {} instructions",
            stats.simulation_speed,
            stats.host_cpu_usage,
            stats.cpu_delta.instructions()
        );
    }

    fn on_simulation_paused(&self) {
        log::info!("[Host] Simulation paused");
    }

    fn on_simulation_resumed(&self) {
        log::info!("[Host] Simulation resumed");
    }

    fn yield_to_ui(&self) {}

    fn report_error(&self, message: &str) {
        log::error!("[Host] {}", message);
    }

    fn report_message(&self, message: &str) {
        log::info!("[Host] {}", message);
    }
}

/// Callbacks that only log.
#[derive(Debug, Default)]
pub struct LogCallbacks;

impl HostCallbacks for LogCallbacks {}

type ExternalEventCallback = Box<dyn FnOnce(&mut Machine) + Send>;

struct ExternalEvent {
    callback: ExternalEventCallback,
    completion: Option<mpsc::SyncSender<()>>,
}

struct Shared {
    state: AtomicU8,
    thread_running: AtomicBool,
    semaphore: Semaphore,
    external_events: Mutex<VecDeque<ExternalEvent>>,
    simulation_thread: Mutex<Option<ThreadId>>,
    stats: Mutex<SimulationStats>,
    cpu_backend: AtomicU8,
    cpu_frequency: AtomicU32,
    speed_limiter: AtomicBool,
    /// Set when simulated time jumped or pacing changed.
    throttle_reset: AtomicBool,
    /// A state load failed partway; resuming is refused until a reset.
    load_failed: AtomicBool,
    /// The failed load paused a running system; reset resumes it.
    resume_after_reset: AtomicBool,
    events: Arc<HostEvents>,
    callbacks: Arc<dyn HostCallbacks>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ExecutionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn execute_external_events(&self, machine: &mut Machine) {
        // Pop one at a time: callbacks may queue further events.
        while let Some(event) = lock(&self.external_events).pop_front() {
            (event.callback)(machine);
            if let Some(done) = event.completion {
                let _ = done.send(());
            }
        }
    }
}

/// Clears the queue and marks the system stopped when the simulation thread
/// exits, including by panic.
struct ThreadExitGuard(Arc<Shared>);

impl Drop for ThreadExitGuard {
    fn drop(&mut self) {
        let mut queue = lock(&self.0.external_events);
        if !queue.is_empty() {
            log::debug!("[Host] Dropping {} pending external events", queue.len());
        }
        queue.clear();
        self.0.set_state(ExecutionState::Stopped);
        drop(queue);
        *lock(&self.0.simulation_thread) = None;
    }
}

/// Cloneable handle for queueing events, usable from any thread including
/// from inside an event.
#[derive(Clone)]
pub struct HostHandle {
    shared: Arc<Shared>,
}

impl HostHandle {
    pub fn execution_state(&self) -> ExecutionState {
        self.shared.state()
    }

    pub fn is_on_simulation_thread(&self) -> bool {
        *lock(&self.shared.simulation_thread) == Some(thread::current().id())
    }

    /// Queue `callback` to run on the simulation thread between slices.
    ///
    /// With `wait`, blocks until the callback has run. Waiting from the
    /// simulation thread would deadlock; it asserts in debug builds and
    /// queues without waiting otherwise.
    pub fn queue_external_event<F>(&self, callback: F, wait: bool) -> Result<(), SystemError>
    where
        F: FnOnce(&mut Machine) + Send + 'static,
    {
        let on_simulation_thread = self.is_on_simulation_thread();
        debug_assert!(
            !(wait && on_simulation_thread),
            "waiting external event queued from the simulation thread"
        );
        let wait = if wait && on_simulation_thread {
            log::error!("[Host] Waiting external event queued from the simulation thread; not waiting");
            false
        } else {
            wait
        };

        let (completion, done) = if wait {
            let (tx, rx) = mpsc::sync_channel(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        {
            let mut queue = lock(&self.shared.external_events);
            if self.shared.state() == ExecutionState::Stopped {
                return Err(SystemError::NotRunning);
            }
            queue.push_back(ExternalEvent {
                callback: Box::new(callback),
                completion,
            });
        }
        if self.shared.state() != ExecutionState::Running {
            self.shared.semaphore.post();
        }

        let Some(done) = done else {
            return Ok(());
        };
        loop {
            match done.recv_timeout(YIELD_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(RecvTimeoutError::Timeout) => self.shared.callbacks.yield_to_ui(),
                // Dropped unexecuted: the thread stopped.
                Err(RecvTimeoutError::Disconnected) => return Err(SystemError::NotRunning),
            }
        }
    }

    /// Run `f` on the simulation thread and return its result.
    pub fn with_machine<R, F>(&self, f: F) -> Result<R, SystemError>
    where
        F: FnOnce(&mut Machine) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.queue_external_event(
            move |machine| {
                let _ = tx.send(f(machine));
            },
            true,
        )?;
        rx.try_recv().map_err(|_| SystemError::NotRunning)
    }

    pub fn events(&self) -> &Arc<HostEvents> {
        &self.shared.events
    }
}

/// Owns the simulation thread.
pub struct HostInterface {
    handle: HostHandle,
    thread: Option<JoinHandle<()>>,
}

impl Default for HostInterface {
    fn default() -> Self {
        Self::new(Arc::new(LogCallbacks))
    }
}

impl HostInterface {
    pub fn new(callbacks: Arc<dyn HostCallbacks>) -> Self {
        let shared = Shared {
            state: AtomicU8::new(ExecutionState::Stopped as u8),
            thread_running: AtomicBool::new(false),
            semaphore: Semaphore::new(0),
            external_events: Mutex::new(VecDeque::new()),
            simulation_thread: Mutex::new(None),
            stats: Mutex::new(SimulationStats::default()),
            cpu_backend: AtomicU8::new(CpuBackendKind::Interpreter.to_u8()),
            cpu_frequency: AtomicU32::new(0),
            speed_limiter: AtomicBool::new(true),
            throttle_reset: AtomicBool::new(false),
            load_failed: AtomicBool::new(false),
            resume_after_reset: AtomicBool::new(false),
            events: Arc::new(HostEvents::new()),
            callbacks,
        };
        Self {
            handle: HostHandle {
                shared: Arc::new(shared),
            },
            thread: None,
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    pub fn handle(&self) -> HostHandle {
        self.handle.clone()
    }

    // ========== Lifecycle ==========

    /// Build the machine on a new simulation thread and start it running.
    ///
    /// Returns once the thread is executing. Configuration and device errors
    /// are returned here; the thread has been joined in that case.
    pub fn create_system(&mut self, mut config: SystemConfig) -> Result<(), SystemError> {
        if self.thread.is_some() {
            return Err(SystemError::AlreadyCreated);
        }
        config.validate()?;

        let shared = self.shared().clone();
        shared.cpu_backend.store(config.cpu_backend.to_u8(), Ordering::SeqCst);
        shared.cpu_frequency.store(config.cpu_frequency.to_bits(), Ordering::SeqCst);
        shared.speed_limiter.store(config.speed_limiter, Ordering::SeqCst);
        shared.throttle_reset.store(false, Ordering::SeqCst);
        shared.load_failed.store(false, Ordering::SeqCst);
        shared.resume_after_reset.store(false, Ordering::SeqCst);
        *lock(&shared.stats) = SimulationStats::default();
        shared.thread_running.store(true, Ordering::SeqCst);

        let barrier = Arc::new(Barrier::new(2));
        let (init_tx, init_rx) = mpsc::channel();
        let thread_barrier = barrier.clone();
        let thread = thread::Builder::new()
            .name("pce-simulation".to_string())
            .spawn(move || simulation_thread(shared, config, thread_barrier, init_tx))
            .map_err(|e| {
                self.shared().thread_running.store(false, Ordering::SeqCst);
                SystemError::Spawn(e)
            })?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                barrier.wait();
                self.thread = Some(thread);
                log::info!("[Host] Simulation thread started");
                Ok(())
            }
            Ok(Err(e)) => {
                self.shared().thread_running.store(false, Ordering::SeqCst);
                if thread.join().is_err() {
                    log::error!("[Host] Simulation thread panicked");
                }
                log::error!("[Host] Failed to create system: {}", e);
                Err(e)
            }
            Err(_) => {
                self.shared().thread_running.store(false, Ordering::SeqCst);
                let _ = thread.join();
                Err(SystemError::Spawn(std::io::Error::other(
                    "simulation thread exited during startup",
                )))
            }
        }
    }

    /// Reset the machine. This also clears the hold left by a failed state
    /// load, resuming the simulation if that load paused it.
    pub fn reset_system(&self) -> Result<(), SystemError> {
        let shared = self.shared().clone();
        self.queue_external_event(
            move |machine| {
                machine.reset();
                shared.throttle_reset.store(true, Ordering::SeqCst);
                shared.callbacks.on_system_reset();
                if shared.load_failed.swap(false, Ordering::SeqCst)
                    && shared.resume_after_reset.swap(false, Ordering::SeqCst)
                    && shared.state() == ExecutionState::Paused
                {
                    shared.set_state(ExecutionState::Running);
                    shared.callbacks.on_simulation_resumed();
                }
            },
            false,
        )
    }

    /// Returns after the simulation thread has stopped executing.
    pub fn pause_simulation(&self) -> Result<(), SystemError> {
        let shared = self.shared().clone();
        self.queue_external_event(
            move |_| {
                if shared.state() == ExecutionState::Running {
                    shared.set_state(ExecutionState::Paused);
                    shared.callbacks.on_simulation_paused();
                }
            },
            true,
        )
    }

    pub fn resume_simulation(&self) -> Result<(), SystemError> {
        let shared = self.shared().clone();
        self.queue_external_event(
            move |_| {
                if shared.load_failed.load(Ordering::SeqCst) {
                    shared
                        .callbacks
                        .report_error("Cannot resume: the system must be reset after a failed state load");
                    return;
                }
                if shared.state() == ExecutionState::Paused {
                    shared.set_state(ExecutionState::Running);
                    shared.throttle_reset.store(true, Ordering::SeqCst);
                    shared.callbacks.on_simulation_resumed();
                }
            },
            false,
        )
    }

    /// Stop and join the simulation thread. Does nothing if none is running.
    pub fn stop_simulation(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        log::info!("[Host] Stopping simulation");
        self.shared().thread_running.store(false, Ordering::SeqCst);
        self.shared().semaphore.post();
        if thread.join().is_err() {
            log::error!("[Host] Simulation thread panicked");
        }
    }

    pub fn execution_state(&self) -> ExecutionState {
        self.handle.execution_state()
    }

    pub fn is_on_simulation_thread(&self) -> bool {
        self.handle.is_on_simulation_thread()
    }

    // ========== External events ==========

    pub fn queue_external_event<F>(&self, callback: F, wait: bool) -> Result<(), SystemError>
    where
        F: FnOnce(&mut Machine) + Send + 'static,
    {
        self.handle.queue_external_event(callback, wait)
    }

    pub fn with_machine<R, F>(&self, f: F) -> Result<R, SystemError>
    where
        F: FnOnce(&mut Machine) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.with_machine(f)
    }

    // ========== CPU control ==========

    pub fn cpu_backend(&self) -> CpuBackendKind {
        CpuBackendKind::from_u8(self.shared().cpu_backend.load(Ordering::SeqCst))
            .unwrap_or(CpuBackendKind::Interpreter)
    }

    pub fn cpu_frequency(&self) -> f32 {
        f32::from_bits(self.shared().cpu_frequency.load(Ordering::SeqCst))
    }

    /// Switch backend between slices. An unsupported backend is reported
    /// through [`HostCallbacks::report_error`].
    pub fn set_cpu_backend(&self, backend: CpuBackendKind) -> Result<(), SystemError> {
        let shared = self.shared().clone();
        self.queue_external_event(
            move |machine| {
                if machine.cpu_mut().set_backend(backend) {
                    shared.cpu_backend.store(backend.to_u8(), Ordering::SeqCst);
                    shared.callbacks.report_message(&format!("CPU backend switched to {}", backend));
                } else {
                    shared
                        .callbacks
                        .report_error(&format!("CPU backend {} is not supported", backend));
                }
            },
            false,
        )
    }

    pub fn set_cpu_frequency(&self, frequency: f32) -> Result<(), SystemError> {
        let shared = self.shared().clone();
        self.queue_external_event(
            move |machine| {
                if machine.set_cpu_frequency(frequency) {
                    shared.cpu_frequency.store(frequency.to_bits(), Ordering::SeqCst);
                    shared.throttle_reset.store(true, Ordering::SeqCst);
                } else {
                    shared
                        .callbacks
                        .report_error(&format!("Invalid CPU frequency {}", frequency));
                }
            },
            false,
        )
    }

    pub fn flush_cpu_code_cache(&self) -> Result<(), SystemError> {
        self.queue_external_event(|machine| machine.cpu_mut().flush_code_cache(), false)
    }

    pub fn is_speed_limiter_enabled(&self) -> bool {
        self.shared().speed_limiter.load(Ordering::SeqCst)
    }

    pub fn set_speed_limiter_enabled(&self, enabled: bool) {
        log::info!("[Host] Speed limiter {}", if enabled { "enabled" } else { "disabled" });
        self.shared().speed_limiter.store(enabled, Ordering::SeqCst);
        self.shared().throttle_reset.store(true, Ordering::SeqCst);
    }

    // ========== Snapshots ==========

    /// Save the machine to `path` between slices. The file is replaced only
    /// if serialization and the write succeed; failures go to
    /// [`HostCallbacks::report_error`].
    pub fn save_system_state(&self, path: impl AsRef<Path>) -> Result<(), SystemError> {
        let path = path.as_ref().to_path_buf();
        let shared = self.shared().clone();
        self.queue_external_event(
            move |machine| match write_state_file(machine, &path) {
                Ok(size) => {
                    log::info!("[Host] Saved {} bytes to {}", size, path.display());
                    shared.events.add_osd_message("State saved", DEFAULT_OSD_DURATION);
                }
                Err(e) => shared
                    .callbacks
                    .report_error(&format!("Failed to save state to {}: {}", path.display(), e)),
            },
            false,
        )
    }

    /// Load the machine from `path`.
    ///
    /// On error the machine may be partially loaded. The simulation is held
    /// paused and [`resume_simulation`](Self::resume_simulation) is refused
    /// until [`reset_system`](Self::reset_system) runs.
    pub fn load_system_state(&self, path: impl AsRef<Path>) -> Result<(), SystemError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        log::info!("[Host] Loading {} bytes from {}", data.len(), path.display());

        let shared = self.shared().clone();
        let result = self.with_machine(move |machine| {
            let result = machine.load_state(&data);
            shared.throttle_reset.store(true, Ordering::SeqCst);
            match &result {
                Ok(()) => {
                    shared.cpu_frequency.store(machine.cpu_frequency().to_bits(), Ordering::SeqCst);
                    shared.cpu_backend.store(machine.cpu_backend().to_u8(), Ordering::SeqCst);
                    shared.callbacks.on_system_state_loaded();
                }
                Err(e) => {
                    log::error!("[Host] State load failed, reset required: {}", e);
                    shared.load_failed.store(true, Ordering::SeqCst);
                    if shared.state() == ExecutionState::Running {
                        shared.set_state(ExecutionState::Paused);
                        shared.resume_after_reset.store(true, Ordering::SeqCst);
                        shared.callbacks.on_simulation_paused();
                    }
                }
            }
            result
        })?;
        Ok(result?)
    }

    // ========== Statistics ==========

    pub fn stats(&self) -> SimulationStats {
        *lock(&self.shared().stats)
    }

    // ========== Input and UI ==========

    pub fn events(&self) -> &Arc<HostEvents> {
        self.handle.events()
    }

    pub fn inject_key_event(&self, scancode: ScanCode, key_down: bool) -> Result<(), SystemError> {
        let events = self.events().clone();
        self.queue_external_event(move |_| events.execute_keyboard_callbacks(scancode, key_down), false)
    }

    pub fn inject_mouse_motion(&self, dx: i32, dy: i32) -> Result<(), SystemError> {
        let events = self.events().clone();
        self.queue_external_event(move |_| events.execute_mouse_position_change_callbacks(dx, dy), false)
    }

    pub fn inject_mouse_button(&self, button: u32, pressed: bool) -> Result<(), SystemError> {
        let events = self.events().clone();
        self.queue_external_event(
            move |_| events.execute_mouse_button_change_callbacks(button, pressed),
            false,
        )
    }

    pub fn send_ctrl_alt_del(&self) -> Result<(), SystemError> {
        let events = self.events().clone();
        self.queue_external_event(
            move |_| {
                let keys = [ScanCode::LEFT_CONTROL, ScanCode::LEFT_ALT, ScanCode::DELETE];
                for &key in &keys {
                    events.execute_keyboard_callbacks(key, true);
                }
                for &key in keys.iter().rev() {
                    events.execute_keyboard_callbacks(key, false);
                }
            },
            false,
        )
    }

    /// Run a component's UI callback on the simulation thread. Returns false
    /// if no such callback is registered.
    pub fn trigger_ui_callback(&self, component: &ComponentId, label: &str) -> Result<bool, SystemError> {
        let Some(callback) = self.events().ui_callback(component, label) else {
            return Ok(false);
        };
        self.queue_external_event(move |_| callback(), false)?;
        Ok(true)
    }

    pub fn trigger_ui_file_callback(
        &self,
        component: &ComponentId,
        label: &str,
        path: &str,
    ) -> Result<bool, SystemError> {
        let Some(callback) = self.events().ui_file_callback(component, label) else {
            return Ok(false);
        };
        let path = path.to_string();
        self.queue_external_event(move |_| callback(&path), false)?;
        Ok(true)
    }

    pub fn add_osd_message(&self, text: &str, duration: f32) {
        self.events().add_osd_message(text, duration);
    }

    pub fn report_error(&self, message: &str) {
        self.shared().callbacks.report_error(message);
    }

    pub fn report_message(&self, message: &str) {
        self.shared().callbacks.report_message(message);
    }
}

impl Drop for HostInterface {
    fn drop(&mut self) {
        self.stop_simulation();
    }
}

fn write_state_file(machine: &Machine, path: &Path) -> Result<usize, SystemError> {
    let data = machine.save_state()?;
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    fs::write(&staging, &data)?;
    if let Err(e) = fs::rename(&staging, path) {
        let _ = fs::remove_file(&staging);
        return Err(e.into());
    }
    Ok(data.len())
}

/// CPU time consumed by the calling thread.
#[cfg(target_os = "linux")]
fn thread_cpu_time() -> Duration {
    // SAFETY: rusage is plain data; getrusage fills it in.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) } != 0 {
        return Duration::ZERO;
    }
    let to_duration = |tv: libc::timeval| Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000);
    to_duration(usage.ru_utime) + to_duration(usage.ru_stime)
}

#[cfg(not(target_os = "linux"))]
fn thread_cpu_time() -> Duration {
    Duration::ZERO
}

/// Per-window bookkeeping for [`SimulationStats`].
struct StatsTracker {
    stats: SimulationStats,
    window_cpu_time: Duration,
    window_cpu_stats: ExecutionStats,
}

impl StatsTracker {
    fn new(machine: &Machine) -> Self {
        Self {
            stats: SimulationStats::default(),
            window_cpu_time: thread_cpu_time(),
            window_cpu_stats: machine.cpu_stats(),
        }
    }

    fn restart(&mut self, machine: &Machine) {
        self.window_cpu_time = thread_cpu_time();
        self.window_cpu_stats = machine.cpu_stats();
    }

    fn update(&mut self, shared: &Shared, machine: &Machine, throttle: &mut Throttle, now: Instant) {
        let cpu_stats = machine.cpu_stats();
        self.stats.total_time_simulated = machine.simulation_time().max(0) as u64;
        self.stats.cpu_stats = cpu_stats;
        self.stats.lost_time = throttle.lost_time();

        let sample = throttle.update_speed(machine.simulation_time(), now);
        if let Some(sample) = sample {
            let cpu_time = thread_cpu_time();
            let busy = cpu_time.saturating_sub(self.window_cpu_time);
            self.stats.simulation_speed = sample.speed;
            self.stats.host_cpu_usage = (busy.as_secs_f64() / sample.real_time.as_secs_f64() * 100.0) as f32;
            self.stats.delta_time_simulated = sample.simulated_time.max(0) as u64;
            self.stats.cpu_delta = cpu_stats.since(&self.window_cpu_stats);
            self.window_cpu_time = cpu_time;
            self.window_cpu_stats = cpu_stats;
        }

        *lock(&shared.stats) = self.stats;
        if sample.is_some() {
            shared.callbacks.on_simulation_stats_update(&self.stats);
        }
    }
}

fn simulation_thread(
    shared: Arc<Shared>,
    mut config: SystemConfig,
    barrier: Arc<Barrier>,
    init: mpsc::Sender<Result<(), SystemError>>,
) {
    *lock(&shared.simulation_thread) = Some(thread::current().id());
    let _guard = ThreadExitGuard(shared.clone());

    let mut machine = match Machine::new(&mut config) {
        Ok(machine) => machine,
        Err(e) => {
            let _ = init.send(Err(e));
            return;
        }
    };
    machine.reset();
    shared.cpu_backend.store(machine.cpu_backend().to_u8(), Ordering::SeqCst);
    shared.callbacks.on_system_initialized();
    shared.set_state(ExecutionState::Running);

    if init.send(Ok(())).is_err() {
        return;
    }
    barrier.wait();
    log::debug!("[Host] Simulation thread running");

    let mut throttle = Throttle::new(machine.simulation_time(), Instant::now());
    let mut tracker = StatsTracker::new(&machine);

    while shared.thread_running.load(Ordering::SeqCst) {
        shared.execute_external_events(&mut machine);

        if shared.throttle_reset.swap(false, Ordering::SeqCst) {
            throttle.reset(machine.simulation_time(), Instant::now());
            tracker.restart(&machine);
        }

        if shared.state() != ExecutionState::Running {
            shared.semaphore.wait();
            shared.throttle_reset.store(true, Ordering::SeqCst);
            continue;
        }

        machine.execute_slice(SLICE_TIME);

        let now = Instant::now();
        if shared.speed_limiter.load(Ordering::Relaxed) {
            if let ThrottleAction::Sleep(duration) = throttle.throttle(machine.simulation_time(), now) {
                thread::sleep(duration);
            }
        } else {
            throttle.rebase(machine.simulation_time(), now);
        }

        tracker.update(&shared, &machine, &mut throttle, now);
    }

    log::debug!("[Host] Simulation thread exiting");
    shared.callbacks.on_system_destroy();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::bochs_vga::VBE_DISPI_IOPORT_INDEX;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> SystemConfig {
        SystemConfig {
            memory_size: 2 * 1024 * 1024,
            cpu_frequency: 1_000_000.0,
            speed_limiter: false,
            vga: Some(crate::devices::BochsVgaConfig {
                vram_size: 1024 * 1024,
                ..Default::default()
            }),
            ..SystemConfig::default()
        }
    }

    fn instructions(host: &HostInterface) -> u64 {
        host.with_machine(|m| m.cpu_stats().instructions()).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[derive(Default)]
    struct Counting {
        initialized: AtomicUsize,
        paused: AtomicUsize,
        resumed: AtomicUsize,
        loaded: AtomicUsize,
        destroyed: AtomicUsize,
        errors: AtomicUsize,
    }

    impl HostCallbacks for Counting {
        fn on_system_initialized(&self) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }
        fn on_simulation_paused(&self) {
            self.paused.fetch_add(1, Ordering::SeqCst);
        }
        fn on_simulation_resumed(&self) {
            self.resumed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_system_state_loaded(&self) {
            self.loaded.fetch_add(1, Ordering::SeqCst);
        }
        fn on_system_destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        fn report_error(&self, _message: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn create_runs_and_stop_is_idempotent() {
        let callbacks = Arc::new(Counting::default());
        let mut host = HostInterface::new(callbacks.clone());
        assert_eq!(host.execution_state(), ExecutionState::Stopped);

        host.create_system(test_config()).unwrap();
        assert_eq!(host.execution_state(), ExecutionState::Running);
        assert_eq!(callbacks.initialized.load(Ordering::SeqCst), 1);
        assert!(matches!(
            host.create_system(test_config()),
            Err(SystemError::AlreadyCreated)
        ));

        wait_until(|| instructions(&host) > 0);

        host.stop_simulation();
        host.stop_simulation();
        assert_eq!(host.execution_state(), ExecutionState::Stopped);
        assert_eq!(callbacks.destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(host.pause_simulation(), Err(SystemError::NotRunning)));
    }

    #[test]
    fn create_failure_leaves_system_stopped() {
        let mut host = HostInterface::default();
        let config = SystemConfig {
            memory_size: 1024,
            ..test_config()
        };
        assert!(matches!(host.create_system(config), Err(SystemError::Config(_))));
        assert_eq!(host.execution_state(), ExecutionState::Stopped);

        let config = SystemConfig {
            vga: Some(crate::devices::BochsVgaConfig {
                vram_size: 1024 * 1024,
                bios_image: Some(PathBuf::from("/nonexistent/vgabios.bin")),
                ..Default::default()
            }),
            ..test_config()
        };
        assert!(matches!(
            host.create_system(config),
            Err(SystemError::DeviceInit { .. })
        ));
        assert_eq!(host.execution_state(), ExecutionState::Stopped);

        // A later create still works.
        host.create_system(test_config()).unwrap();
        assert_eq!(host.execution_state(), ExecutionState::Running);
    }

    #[test]
    fn nothing_executes_while_paused() {
        let callbacks = Arc::new(Counting::default());
        let mut host = HostInterface::new(callbacks.clone());
        host.create_system(test_config()).unwrap();
        wait_until(|| instructions(&host) > 0);

        host.pause_simulation().unwrap();
        assert_eq!(host.execution_state(), ExecutionState::Paused);
        assert_eq!(callbacks.paused.load(Ordering::SeqCst), 1);

        let before = instructions(&host);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(instructions(&host), before);

        host.resume_simulation().unwrap();
        wait_until(|| instructions(&host) > before);
        assert_eq!(host.execution_state(), ExecutionState::Running);
        assert_eq!(callbacks.resumed.load(Ordering::SeqCst), 1);
        host.stop_simulation();
    }

    #[test]
    fn external_events_run_in_order_on_simulation_thread() {
        let mut host = HostInterface::default();
        host.create_system(test_config()).unwrap();
        assert!(!host.is_on_simulation_thread());

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            host.queue_external_event(move |_| order.lock().unwrap().push(i), false)
                .unwrap();
        }
        let handle = host.handle();
        let on_thread = host.with_machine(move |_| handle.is_on_simulation_thread()).unwrap();
        assert!(on_thread);
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());

        // Events queued from inside an event run in the same drain.
        let handle = host.handle();
        let nested = Arc::new(AtomicBool::new(false));
        let flag = nested.clone();
        host.queue_external_event(
            move |_| {
                handle
                    .queue_external_event(move |_| flag.store(true, Ordering::SeqCst), false)
                    .unwrap();
            },
            true,
        )
        .unwrap();
        host.with_machine(|_| ()).unwrap();
        assert!(nested.load(Ordering::SeqCst));
        host.stop_simulation();
    }

    #[test]
    fn speed_limiter_paces_simulated_time() {
        let mut host = HostInterface::default();
        let start = Instant::now();
        host.create_system(SystemConfig {
            speed_limiter: true,
            ..test_config()
        })
        .unwrap();
        assert!(host.is_speed_limiter_enabled());

        thread::sleep(Duration::from_millis(300));
        let simulated = host.with_machine(|m| m.simulation_time()).unwrap();
        let elapsed = start.elapsed();
        host.stop_simulation();

        // At most one slice plus the allowed variance ahead of real time.
        assert!(
            Duration::from_nanos(simulated as u64) <= elapsed + Duration::from_millis(120),
            "simulated {} ns in {:?}",
            simulated,
            elapsed
        );
        assert!(simulated > 0);
    }

    #[test]
    fn cpu_control_events() {
        let callbacks = Arc::new(Counting::default());
        let mut host = HostInterface::new(callbacks.clone());
        host.create_system(test_config()).unwrap();
        assert_eq!(host.cpu_backend(), CpuBackendKind::Interpreter);
        assert_eq!(host.cpu_frequency(), 1_000_000.0);

        host.set_cpu_backend(CpuBackendKind::CachedInterpreter).unwrap();
        host.set_cpu_frequency(2_000_000.0).unwrap();
        host.flush_cpu_code_cache().unwrap();
        host.with_machine(|_| ()).unwrap();
        assert_eq!(host.cpu_backend(), CpuBackendKind::CachedInterpreter);
        assert_eq!(host.cpu_frequency(), 2_000_000.0);

        host.set_cpu_backend(CpuBackendKind::Recompiler).unwrap();
        host.set_cpu_frequency(-5.0).unwrap();
        host.with_machine(|_| ()).unwrap();
        assert_eq!(host.cpu_backend(), CpuBackendKind::CachedInterpreter);
        assert_eq!(host.cpu_frequency(), 2_000_000.0);
        assert_eq!(callbacks.errors.load(Ordering::SeqCst), 2);

        host.set_speed_limiter_enabled(true);
        assert!(host.is_speed_limiter_enabled());
        host.stop_simulation();
    }

    #[test]
    fn save_and_load_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.sav");
        let callbacks = Arc::new(Counting::default());
        let mut host = HostInterface::new(callbacks.clone());
        host.create_system(test_config()).unwrap();

        host.with_machine(|m| m.bus().write_memory_dword(0x2000, 0x1234_5678)).unwrap();
        host.save_system_state(&path).unwrap();
        host.with_machine(|m| m.bus().write_memory_dword(0x2000, 0)).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("sav.tmp").exists());
        host.set_cpu_frequency(3_000_000.0).unwrap();
        host.with_machine(|_| ()).unwrap();
        assert_eq!(host.cpu_frequency(), 3_000_000.0);

        host.load_system_state(&path).unwrap();
        assert_eq!(callbacks.loaded.load(Ordering::SeqCst), 1);
        let value = host.with_machine(|m| m.bus().read_memory_dword(0x2000)).unwrap();
        assert_eq!(value, 0x1234_5678);
        assert_eq!(host.cpu_frequency(), 1_000_000.0);
        assert_eq!(host.with_machine(|m| m.cpu_frequency()).unwrap(), 1_000_000.0);

        // Corrupt stream.
        fs::write(&path, b"garbage").unwrap();
        assert!(matches!(host.load_system_state(&path), Err(SystemError::Snapshot(_))));
        assert!(matches!(
            host.load_system_state(dir.path().join("missing.sav")),
            Err(SystemError::Io(_))
        ));
        host.reset_system().unwrap();
        host.stop_simulation();
    }

    #[test]
    fn failed_load_holds_simulation_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.sav");
        let callbacks = Arc::new(Counting::default());
        let mut host = HostInterface::new(callbacks.clone());
        host.create_system(test_config()).unwrap();

        host.save_system_state(&path).unwrap();
        host.with_machine(|_| ()).unwrap();
        let mut data = fs::read(&path).unwrap();
        // Cut into the last section so the earlier ones have already been applied.
        data.truncate(data.len() - 4);
        fs::write(&path, &data).unwrap();

        assert!(matches!(host.load_system_state(&path), Err(SystemError::Snapshot(_))));
        assert_eq!(host.execution_state(), ExecutionState::Paused);
        assert_eq!(callbacks.paused.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.loaded.load(Ordering::SeqCst), 0);

        let held_at = host.with_machine(|m| m.simulation_time()).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(host.with_machine(|m| m.simulation_time()).unwrap(), held_at);

        host.resume_simulation().unwrap();
        host.with_machine(|_| ()).unwrap();
        assert_eq!(host.execution_state(), ExecutionState::Paused);
        assert_eq!(callbacks.errors.load(Ordering::SeqCst), 1);
        assert_eq!(callbacks.resumed.load(Ordering::SeqCst), 0);

        host.reset_system().unwrap();
        wait_until(|| host.with_machine(|m| m.simulation_time()).unwrap() > held_at);
        assert_eq!(host.execution_state(), ExecutionState::Running);
        assert_eq!(callbacks.resumed.load(Ordering::SeqCst), 1);
        host.stop_simulation();
    }

    #[test]
    fn input_reaches_callbacks_on_simulation_thread() {
        let mut host = HostInterface::default();
        host.create_system(test_config()).unwrap();

        let keys = Arc::new(Mutex::new(Vec::new()));
        let owner = host.events().new_owner();
        let sink = keys.clone();
        let handle = host.handle();
        host.events().add_keyboard_callback(owner, move |sc, down| {
            assert!(handle.is_on_simulation_thread());
            sink.lock().unwrap().push((sc, down));
        });

        host.send_ctrl_alt_del().unwrap();
        host.with_machine(|_| ()).unwrap();
        let keys = keys.lock().unwrap().clone();
        assert_eq!(keys.len(), 6);
        assert_eq!(keys[0], (ScanCode::LEFT_CONTROL, true));
        assert_eq!(keys[2], (ScanCode::DELETE, true));
        assert_eq!(keys[5], (ScanCode::LEFT_CONTROL, false));

        let component = ComponentId::from("BochsVGA");
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        host.events().add_ui_callback(&component, "Dump", move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(host.trigger_ui_callback(&component, "Dump").unwrap());
        assert!(!host.trigger_ui_callback(&component, "Missing").unwrap());
        host.with_machine(|_| ()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        host.events().remove_all_callbacks(owner);
        host.stop_simulation();
    }

    #[test]
    fn stats_are_published() {
        let mut host = HostInterface::default();
        host.create_system(test_config()).unwrap();
        wait_until(|| host.stats().total_time_simulated > 0);
        let stats = host.stats();
        assert!(stats.cpu_stats.instructions() > 0);
        let vga_ports = host
            .with_machine(|m| m.bus().is_io_port_connected(VBE_DISPI_IOPORT_INDEX))
            .unwrap();
        assert!(vga_ports);
    }
}

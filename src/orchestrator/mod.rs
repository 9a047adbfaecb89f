// SPDX-License-Identifier: GPL-3.0-only

//! Live orchestrator (spec §4.8): the glue that routes frames through the four
//! worker stages (G), reacting to cascade-invalidating user actions and publishing
//! progress to a caller-supplied [`Listener`].
//!
//! Grounded directly on `original_source/include/astrophoto-toolbox/stacking/
//! livestacking.h`/`.hpp` (`LiveStacking<BITMAP>`): `setup`/`load`/`save`/
//! `add_dark_frame`/`add_light_frame`/`set_reference`/`set_luminancy_threshold`/
//! `start`/`cancel`/`stop`/`wait`/the four worker callbacks/`next_step` all
//! correspond 1:1 to methods of that class. Cyclic orchestrator<->worker ownership
//! (Design Notes §9) is resolved the Rust way: each worker's job closure captures an
//! `Arc<Shared>` pointing back at the orchestrator's state instead of a raw listener
//! pointer, so there is no lifetime cycle to break by hand.

mod config;

pub use config::{StackingConfig, StackingOptions};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::background::BackgroundCalibrationParameters;
use crate::bitmap::Bitmap;
use crate::calibration;
use crate::error::{StackError, StackResult};
use crate::fits::{HduRef, Store};
use crate::masterdark::{self, MasterDark};
use crate::registration;
use crate::stacking::Stacker;
use crate::stars::{detect_stars_for_stacking, Star};
use crate::transform::Transformation;
use crate::workers::{Latch, Worker};

const CONFIG_FILE: &str = "stacking.txt";
const MASTER_DARK_FILE: &str = "master_dark.fits";
const STACKED_FILE: &str = "stacked.fits";
const CALIBRATED_LIGHTS_DIR: &str = "calibrated/lights";
const MASTER_DARK_TMP_DIR: &str = "tmp_master_dark";
const STACKING_TMP_DIR: &str = "tmp_stacking";

/// Per-dark-frame status (spec §3 "Frame status records").
#[derive(Debug, Clone)]
pub struct DarkFrameStatus {
    pub path: PathBuf,
    pub stacked: bool,
    pub pending: bool,
}

/// Per-light-frame status (spec §3 "Frame status records").
#[derive(Debug, Clone)]
pub struct LightFrameStatus {
    pub path: PathBuf,
    pub calibrated: bool,
    pub registered: bool,
    pub stacked: bool,
    pub valid: bool,
    pub ready: bool,
}

impl LightFrameStatus {
    fn untouched(path: PathBuf) -> Self {
        LightFrameStatus {
            path,
            calibrated: false,
            registered: false,
            stacked: false,
            valid: true,
            ready: true,
        }
    }
}

/// Point-in-time snapshot of the pipeline's progress (spec §3 "Live stacking infos
/// snapshot"), handed to [`Listener::progress_notification`] under the same lock that
/// guards the status tables, so it is always internally consistent.
#[derive(Debug, Clone, Default)]
pub struct LiveStackingInfos {
    pub nb_dark_frames: usize,
    pub nb_light_frames: usize,
    pub nb_processed: usize,
    pub nb_registered: usize,
    pub nb_valid: usize,
    pub nb_stacking: usize,
    pub nb_stacked: usize,
    pub dark_frames: Vec<DarkFrameStatus>,
    pub light_frames: Vec<LightFrameStatus>,
}

/// Caller-implemented progress sink (spec §6 "Listener interface").
pub trait Listener: Send + Sync {
    /// Called after every status-table change, unless a cancel is already underway.
    fn progress_notification(&self, infos: LiveStackingInfos);

    /// Called once per successful stacking pass with the refreshed `stacked.fits`.
    fn stacking_done(&self, path: PathBuf);
}

struct Frames {
    darks: Vec<DarkFrameStatus>,
    lights: Vec<LightFrameStatus>,
    reference: Option<usize>,
}

impl Frames {
    fn snapshot(&self) -> LiveStackingInfos {
        let nb_processed = self.lights.iter().filter(|l| l.calibrated).count();
        let nb_registered = self.lights.iter().filter(|l| l.registered).count();
        let nb_valid = self.lights.iter().filter(|l| l.valid).count();
        let nb_stacked = self.lights.iter().filter(|l| l.stacked).count();
        let nb_stacking = self
            .lights
            .iter()
            .filter(|l| l.valid && l.registered && !l.stacked)
            .count();

        LiveStackingInfos {
            nb_dark_frames: self.darks.len(),
            nb_light_frames: self.lights.len(),
            nb_processed,
            nb_registered,
            nb_valid,
            nb_stacking,
            nb_stacked,
            dark_frames: self.darks.clone(),
            light_frames: self.lights.clone(),
        }
    }
}

/// Jobs queued on the four worker stages (spec §4.7 module G).
type MasterDarkJob = Vec<PathBuf>;

struct CalibrationJob {
    path: PathBuf,
    is_reference: bool,
}

struct RegistrationJob {
    path: PathBuf,
    is_reference: bool,
}

struct StackingJob {
    path: PathBuf,
    is_reference: bool,
}

/// State shared between the orchestrator's public API and every worker's job
/// closure. Lives behind an `Arc` so worker threads (which need `'static` closures)
/// can reach it without the orchestrator outliving its workers by a raw pointer.
struct Shared {
    folder: PathBuf,
    listener: Arc<dyn Listener>,
    options: StackingOptions,

    frames: Mutex<Frames>,
    luminancy_threshold: Mutex<Option<f64>>,
    effective_threshold: Mutex<Option<f64>>,
    cancelled: AtomicBool,

    master_dark: Mutex<Option<Arc<MasterDark>>>,
    reference_calibration: Mutex<Option<BackgroundCalibrationParameters>>,
    stacker: Mutex<Option<Stacker>>,

    master_dark_worker: Worker<MasterDarkJob>,
    calibration_worker: Worker<CalibrationJob>,
    registration_worker: Worker<RegistrationJob>,
    stacking_worker: Worker<StackingJob>,
}

impl Shared {
    fn calibrated_path(&self, light_path: &Path) -> PathBuf {
        let stem = light_path.file_stem().unwrap_or(light_path.as_os_str());
        let mut name = PathBuf::from(stem);
        name.set_extension("fits");
        self.folder.join(CALIBRATED_LIGHTS_DIR).join(name)
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.folder.join(path)
        }
    }

    fn emit_progress(&self) {
        if self.cancelled.load(Ordering::Relaxed) {
            return;
        }
        let infos = self.frames.lock().unwrap().snapshot();
        self.listener.progress_notification(infos);
    }
}

/// Live image-stacking pipeline orchestrator (spec §4.8, module H).
pub struct Orchestrator {
    shared: Option<Arc<Shared>>,
    running: bool,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Orchestrator { shared: None, running: false }
    }

    fn shared(&self) -> &Arc<Shared> {
        self.shared.as_ref().expect("setup() must be called before use")
    }

    /// Configures the working folder and listener. Only valid from IDLE (before the
    /// first `setup`, or after a prior `setup` that was never `start`ed).
    pub fn setup(&mut self, listener: Arc<dyn Listener>, folder: impl Into<PathBuf>, luminancy_threshold: Option<f64>) -> bool {
        if self.running {
            return false;
        }

        let folder = folder.into();
        std::fs::create_dir_all(folder.join(CALIBRATED_LIGHTS_DIR)).ok();

        let options = StackingOptions::load_or_default(&folder);

        self.shared = Some(Arc::new(Shared {
            folder,
            listener,
            options,
            frames: Mutex::new(Frames { darks: Vec::new(), lights: Vec::new(), reference: None }),
            luminancy_threshold: Mutex::new(luminancy_threshold),
            effective_threshold: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            master_dark: Mutex::new(None),
            reference_calibration: Mutex::new(None),
            stacker: Mutex::new(None),
            master_dark_worker: Worker::new("master-dark"),
            calibration_worker: Worker::new("calibration"),
            registration_worker: Worker::new("registration"),
            stacking_worker: Worker::new("stacking"),
        }));

        true
    }

    /// Parses `stacking.txt` from the working folder (spec §6).
    pub fn load(&mut self) -> bool {
        let shared = self.shared().clone();
        let Ok(config) = StackingConfig::load(&shared.folder.join(CONFIG_FILE)) else {
            return false;
        };

        let mut frames = shared.frames.lock().unwrap();
        frames.darks = config
            .dark_frames
            .iter()
            .map(|p| DarkFrameStatus { path: p.clone(), stacked: false, pending: false })
            .collect();
        frames.lights = config
            .light_frames
            .iter()
            .map(|p| {
                let calibrated_path = shared.calibrated_path(p);
                let calibrated = calibrated_path.exists();
                let registered = calibrated
                    && Store::open(&calibrated_path, true)
                        .ok()
                        .and_then(|mut store| store.read_stars(HduRef::Name("STARS")).ok())
                        .map(|(stars, _)| !stars.is_empty())
                        .unwrap_or(false);
                LightFrameStatus {
                    path: p.clone(),
                    calibrated,
                    registered,
                    stacked: false,
                    valid: true,
                    ready: true,
                }
            })
            .collect();
        frames.reference = config.reference;

        if shared.folder.join(MASTER_DARK_FILE).exists() {
            for dark in frames.darks.iter_mut() {
                dark.stacked = true;
            }
        }

        true
    }

    /// Emits `stacking.txt` into the working folder (spec §6).
    pub fn save(&self) -> bool {
        let shared = self.shared();
        let frames = shared.frames.lock().unwrap();
        let config = StackingConfig {
            dark_frames: frames.darks.iter().map(|d| d.path.clone()).collect(),
            light_frames: frames.lights.iter().map(|l| l.path.clone()).collect(),
            reference: frames.reference,
        };
        config.save(&shared.folder.join(CONFIG_FILE)).is_ok()
    }

    /// Appends a dark frame. If the orchestrator is currently running, triggers a
    /// full cascade invalidation (spec §4.8 cascade table).
    pub fn add_dark_frame(&mut self, path: impl Into<PathBuf>) -> bool {
        let shared = self.shared().clone();
        let path = path.into();

        {
            let mut frames = shared.frames.lock().unwrap();
            frames.darks.push(DarkFrameStatus { path, stacked: false, pending: false });
        }

        if self.running {
            info!("dark frame added while running, invalidating master dark and all lights");
            self.cancel();
            self.wait();

            let _ = std::fs::remove_file(shared.folder.join(MASTER_DARK_FILE));
            let _ = std::fs::remove_file(shared.folder.join(STACKED_FILE));
            let _ = std::fs::remove_dir_all(shared.folder.join(CALIBRATED_LIGHTS_DIR));
            std::fs::create_dir_all(shared.folder.join(CALIBRATED_LIGHTS_DIR)).ok();

            {
                let mut frames = shared.frames.lock().unwrap();
                for light in frames.lights.iter_mut() {
                    *light = LightFrameStatus::untouched(light.path.clone());
                }
            }
            *shared.master_dark.lock().unwrap() = None;
            *shared.reference_calibration.lock().unwrap() = None;
            *shared.stacker.lock().unwrap() = None;

            self.start();
        }

        true
    }

    /// Appends a light frame. By default the first light frame added becomes the
    /// reference.
    pub fn add_light_frame(&mut self, path: impl Into<PathBuf>) -> bool {
        let shared = self.shared().clone();
        let path = path.into();

        let mut entry = LightFrameStatus::untouched(path.clone());
        let calibrated_path = shared.calibrated_path(&path);
        entry.calibrated = calibrated_path.exists();
        if entry.calibrated {
            entry.registered = Store::open(&calibrated_path, true)
                .ok()
                .and_then(|mut store| store.read_stars(HduRef::Name("STARS")).ok())
                .map(|(stars, _)| !stars.is_empty())
                .unwrap_or(false);
        }

        let is_first;
        {
            let mut frames = shared.frames.lock().unwrap();
            frames.lights.push(entry.clone());
            is_first = frames.lights.len() == 1;
            if is_first {
                frames.reference = Some(0);
            }
        }

        if self.running {
            if !entry.calibrated {
                shared.calibration_worker.push_frames(vec![CalibrationJob { path, is_reference: is_first }]);
            } else if !entry.registered {
                shared
                    .registration_worker
                    .push_frames(vec![RegistrationJob { path: calibrated_path, is_reference: is_first }]);
            } else {
                shared.stacking_worker.push_frames(vec![StackingJob { path: calibrated_path, is_reference: is_first }]);
            }
        }

        true
    }

    /// Changes the reference light frame; triggers a full cascade invalidation.
    pub fn set_reference(&mut self, index: Option<usize>) {
        let shared = self.shared().clone();

        {
            let mut frames = shared.frames.lock().unwrap();
            let Some(index) = index else { return };
            if index >= frames.lights.len() || Some(index) == frames.reference {
                return;
            }
            frames.reference = Some(index);
        }

        let was_running = self.running;
        if was_running {
            self.cancel();
            self.wait();
        }

        let _ = std::fs::remove_file(shared.folder.join(STACKED_FILE));
        let _ = std::fs::remove_dir_all(shared.folder.join(CALIBRATED_LIGHTS_DIR));
        std::fs::create_dir_all(shared.folder.join(CALIBRATED_LIGHTS_DIR)).ok();

        {
            let mut frames = shared.frames.lock().unwrap();
            for light in frames.lights.iter_mut() {
                *light = LightFrameStatus::untouched(light.path.clone());
            }
        }
        *shared.reference_calibration.lock().unwrap() = None;
        *shared.stacker.lock().unwrap() = None;
        *shared.effective_threshold.lock().unwrap() = None;

        if was_running {
            self.start();
        }
    }

    /// Changes the registration luminancy threshold; triggers a partial
    /// invalidation (registration + stacking only).
    pub fn set_luminancy_threshold(&mut self, threshold: Option<f64>) {
        let shared = self.shared().clone();

        if *shared.luminancy_threshold.lock().unwrap() == threshold {
            return;
        }
        *shared.luminancy_threshold.lock().unwrap() = threshold;
        *shared.effective_threshold.lock().unwrap() = None;

        let was_running = self.running;
        if was_running {
            let latch = Latch::new();
            shared.registration_worker.cancel(Some(latch.clone()));
            latch.wait();
            let latch = Latch::new();
            shared.stacking_worker.cancel(Some(latch.clone()));
            latch.wait();
        }

        let _ = std::fs::remove_file(shared.folder.join(STACKED_FILE));
        *shared.stacker.lock().unwrap() = None;
        *shared.reference_calibration.lock().unwrap() = None;

        {
            let mut frames = shared.frames.lock().unwrap();
            for light in frames.lights.iter_mut() {
                light.registered = false;
                light.stacked = false;
                light.valid = true;
                light.ready = light.calibrated;
            }
        }
        shared.emit_progress();

        if was_running {
            self.next_step();
        }
    }

    /// Spawns the four worker threads (idempotent per orchestrator instance) and
    /// kicks off processing via [`Self::next_step`].
    pub fn start(&mut self) -> bool {
        if self.running {
            return false;
        }
        let shared = self.shared().clone();
        shared.cancelled.store(false, Ordering::Relaxed);

        start_master_dark_worker(&shared);
        start_calibration_worker(&shared);
        start_registration_worker(&shared);
        start_stacking_worker(&shared);

        self.running = true;
        self.next_step();
        true
    }

    /// Drops queued work and interrupts in-flight jobs at their next safe point,
    /// then blocks until every worker is quiescent.
    pub fn cancel(&mut self) {
        self.cancel_async();
        self.wait();
    }

    /// Like [`Self::cancel`] but does not block; pair with [`Self::wait`].
    pub fn cancel_async(&mut self) {
        if !self.running {
            return;
        }
        let shared = self.shared();
        shared.cancelled.store(true, Ordering::Relaxed);
        shared.master_dark_worker.cancel(None);
        shared.calibration_worker.cancel(None);
        shared.registration_worker.cancel(None);
        shared.stacking_worker.cancel(None);
    }

    /// Drains every worker's queue (finishing queued jobs), then blocks until idle.
    pub fn stop(&mut self) {
        self.stop_async();
        self.wait();
    }

    /// Like [`Self::stop`] but does not block; pair with [`Self::wait`].
    pub fn stop_async(&mut self) {
        if !self.running {
            return;
        }
        let shared = self.shared();
        shared.master_dark_worker.stop(None);
        shared.calibration_worker.stop(None);
        shared.registration_worker.stop(None);
        shared.stacking_worker.stop(None);
    }

    /// Blocks until every worker is quiescent, following `cancel_async`/
    /// `stop_async`. After a cancel the worker threads stay alive, parked and ready
    /// for more work; after a stop they have actually exited and a later
    /// [`Self::start`] respawns them fresh.
    pub fn wait(&mut self) {
        let shared = self.shared();
        shared.master_dark_worker.wait();
        shared.calibration_worker.wait();
        shared.registration_worker.wait();
        shared.stacking_worker.wait();
        self.running = false;
    }

    /// A consistent point-in-time snapshot of the pipeline's progress.
    pub fn get_infos(&self) -> LiveStackingInfos {
        self.shared().frames.lock().unwrap().snapshot()
    }

    pub fn get_reference(&self) -> Option<usize> {
        self.shared().frames.lock().unwrap().reference
    }

    /// Decides what to push onto which worker next: recompute the master dark if
    /// any dark is unstacked, otherwise drive the reference frame through its next
    /// stage followed by every other ready frame. Shared with the per-stage worker
    /// completion callbacks (see [`dispatch_next_step`]), which call back into this
    /// same logic from a context that only holds `&Arc<Shared>`.
    fn next_step(&mut self) {
        dispatch_next_step(self.shared());
    }
}

/// The actual routing logic behind [`Orchestrator::next_step`], factored out as a
/// free function so worker completion callbacks (which only own an `Arc<Shared>`,
/// never a `&mut Orchestrator`) can trigger the next dispatch themselves.
fn dispatch_next_step(shared: &Arc<Shared>) {
    let mut frames = shared.frames.lock().unwrap();

    let must_recompute_dark = frames.darks.iter().any(|d| !d.stacked);
    if must_recompute_dark {
        let paths: Vec<PathBuf> = frames
            .darks
            .iter_mut()
            .map(|d| {
                d.pending = true;
                shared.absolute(&d.path)
            })
            .collect();
        drop(frames);
        shared.master_dark_worker.push_frames(vec![paths]);
        return;
    }

    if frames.lights.is_empty() {
        return;
    }

    let Some(reference_index) = frames.reference else {
        return;
    };
    let reference = frames.lights[reference_index].clone();

    let mut to_calibrate = Vec::new();
    let mut to_register = Vec::new();
    let mut to_stack = Vec::new();

    for (i, entry) in frames.lights.iter_mut().enumerate() {
        if !entry.valid || !entry.ready {
            continue;
        }
        if i != reference_index {
            if !entry.calibrated {
                to_calibrate.push(entry.path.clone());
            } else if !entry.registered {
                to_register.push(shared.calibrated_path(&entry.path));
            } else if !entry.stacked {
                to_stack.push(shared.calibrated_path(&entry.path));
            }
        }
        entry.ready = false;
    }
    drop(frames);

    if !reference.calibrated {
        shared
            .calibration_worker
            .push_reference_frame(CalibrationJob { path: reference.path.clone(), is_reference: true });
    } else if !reference.registered {
        shared.registration_worker.push_reference_frame(RegistrationJob {
            path: shared.calibrated_path(&reference.path),
            is_reference: true,
        });
    } else if !reference.stacked {
        shared.stacking_worker.push_reference_frame(StackingJob {
            path: shared.calibrated_path(&reference.path),
            is_reference: true,
        });
    }

    if !to_calibrate.is_empty() {
        let jobs = to_calibrate.into_iter().map(|path| CalibrationJob { path, is_reference: false }).collect();
        shared.calibration_worker.push_frames(jobs);
    }
    if !to_register.is_empty() {
        let jobs = to_register.into_iter().map(|path| RegistrationJob { path, is_reference: false }).collect();
        shared.registration_worker.push_frames(jobs);
    }
    if !to_stack.is_empty() {
        let jobs = to_stack.into_iter().map(|path| StackingJob { path, is_reference: false }).collect();
        shared.stacking_worker.push_frames(jobs);
    }
}

fn start_master_dark_worker(shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    shared.master_dark_worker.start(move |paths: MasterDarkJob, cancel| {
        let tmp_dir = shared.folder.join(MASTER_DARK_TMP_DIR);
        std::fs::create_dir_all(&tmp_dir).ok();

        let result = load_bitmaps(&paths).and_then(|bitmaps| masterdark::compute_master_dark(&bitmaps, cancel));

        let success = match result {
            Ok(dark) => {
                let write_ok = Store::create(&shared.folder.join(MASTER_DARK_FILE))
                    .and_then(|mut store| {
                        store.write_bitmap(&dark.bitmap, Some("IMAGE"))?;
                        store.write_points(&dark.hot_pixels, "HOTPIXELS")
                    })
                    .is_ok();
                if write_ok {
                    *shared.master_dark.lock().unwrap() = Some(Arc::new(dark));
                }
                write_ok
            }
            Err(StackError::Cancelled) => false,
            Err(e) => {
                warn!(error = %e, "master dark computation failed");
                false
            }
        };

        let mut frames = shared.frames.lock().unwrap();
        for dark in frames.darks.iter_mut() {
            if dark.pending {
                dark.pending = false;
                dark.stacked = success;
            }
        }
        drop(frames);

        shared.emit_progress();

        if success && !shared.cancelled.load(Ordering::Relaxed) {
            dispatch_next_step(&shared);
        }
    });
}

fn start_calibration_worker(shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    shared.calibration_worker.start(move |job: CalibrationJob, cancel| {
        let success = calibrate_one(&shared, &job.path, cancel);

        {
            let mut frames = shared.frames.lock().unwrap();
            if let Some(entry) = frames.lights.iter_mut().find(|l| l.path == job.path) {
                if success {
                    entry.calibrated = true;
                } else {
                    entry.valid = false;
                    entry.ready = true;
                }
            }
        }

        shared.emit_progress();

        if success && !shared.cancelled.load(Ordering::Relaxed) {
            let calibrated_path = shared.calibrated_path(&job.path);
            if job.is_reference {
                shared
                    .registration_worker
                    .push_reference_frame(RegistrationJob { path: calibrated_path, is_reference: true });
            } else {
                shared
                    .registration_worker
                    .push_frames(vec![RegistrationJob { path: calibrated_path, is_reference: false }]);
            }
        } else {
            let mut frames = shared.frames.lock().unwrap();
            if let Some(entry) = frames.lights.iter_mut().find(|l| l.path == job.path) {
                entry.ready = true;
            }
        }
    });
}

fn start_registration_worker(shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    shared.registration_worker.start(move |job: RegistrationJob, cancel| {
        let success = register_one(&shared, &job, cancel);

        {
            let mut frames = shared.frames.lock().unwrap();
            if let Some(entry) = frames.lights.iter_mut().find(|l| shared.calibrated_path(&l.path) == job.path) {
                if success {
                    entry.registered = true;
                } else {
                    entry.valid = false;
                    entry.ready = true;
                }
            }
        }

        shared.emit_progress();

        if success && !shared.cancelled.load(Ordering::Relaxed) {
            shared.stacking_worker.push_frames(vec![StackingJob { path: job.path, is_reference: job.is_reference }]);
        }
    });
}

fn start_stacking_worker(shared: &Arc<Shared>) {
    let shared = Arc::clone(shared);
    shared.stacking_worker.start(move |job: StackingJob, cancel| {
        let success = stack_one(&shared, &job, cancel);

        let mut last_of_burst = false;
        if success {
            let mut frames = shared.frames.lock().unwrap();
            if let Some(entry) = frames.lights.iter_mut().find(|l| shared.calibrated_path(&l.path) == job.path) {
                entry.stacked = true;
                entry.ready = true;
            }
            drop(frames);

            let stacked_count = shared.stacker.lock().unwrap().as_ref().map(|s| s.count()).unwrap_or(0) as usize;
            let batch_full = shared.options.stacking_batch_size > 0
                && stacked_count % shared.options.stacking_batch_size == 0;
            last_of_burst = batch_full || shared.stacking_worker.pending() == 0;
        } else {
            let mut frames = shared.frames.lock().unwrap();
            if let Some(entry) = frames.lights.iter_mut().find(|l| shared.calibrated_path(&l.path) == job.path) {
                entry.valid = false;
                entry.ready = true;
            }
        }

        if !shared.cancelled.load(Ordering::Relaxed) && last_of_burst {
            let stacked_path = shared.folder.join(STACKED_FILE);
            let tmp_dir = shared.folder.join(STACKING_TMP_DIR);
            std::fs::create_dir_all(&tmp_dir).ok();

            if let Some(stacker) = shared.stacker.lock().unwrap().as_ref() {
                let tmp = tmp_dir.join(STACKED_FILE);
                let write_ok = Store::create(&tmp)
                    .and_then(|mut store| store.write_bitmap(stacker.output(), Some("IMAGE")))
                    .is_ok();
                if write_ok && std::fs::rename(&tmp, &stacked_path).is_ok() {
                    shared.emit_progress();
                    shared.listener.stacking_done(stacked_path);
                }
            }
        } else {
            shared.emit_progress();
        }
    });
}

fn load_bitmaps(paths: &[PathBuf]) -> StackResult<Vec<Bitmap>> {
    paths
        .iter()
        .map(|p| {
            Store::open(p, true)
                .and_then(|mut store| store.read_bitmap(HduRef::Index(1)))
        })
        .collect()
}

fn calibrate_one(shared: &Arc<Shared>, light_path: &Path, cancel: &AtomicBool) -> bool {
    let absolute = shared.absolute(light_path);
    let raw = match Store::open(&absolute, true).and_then(|mut s| s.read_bitmap(HduRef::Index(1))) {
        Ok(bmp) => bmp,
        Err(e) => {
            warn!(path = %absolute.display(), error = %e, "failed to read light frame");
            return false;
        }
    };

    if cancel.load(Ordering::Relaxed) {
        return false;
    }

    let master_dark = shared.master_dark.lock().unwrap().clone();
    let calibrated = match &master_dark {
        Some(dark) => match calibration::calibrate(&raw, &dark.bitmap, &dark.hot_pixels) {
            Ok(bmp) => bmp,
            Err(e) => {
                warn!(error = %e, "calibration failed");
                return false;
            }
        },
        None => raw,
    };

    let out_path = shared.calibrated_path(light_path);
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    match Store::create(&out_path).and_then(|mut s| s.write_bitmap(&calibrated, Some("IMAGE"))) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to write calibrated frame");
            false
        }
    }
}

fn register_one(shared: &Arc<Shared>, job: &RegistrationJob, cancel: &AtomicBool) -> bool {
    let mut store = match Store::open(&job.path, false) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to open calibrated frame for registration");
            return false;
        }
    };

    let bitmap = match store.read_bitmap(HduRef::Index(1)) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to read calibrated bitmap");
            return false;
        }
    };

    if cancel.load(Ordering::Relaxed) {
        return false;
    }

    let configured = *shared.luminancy_threshold.lock().unwrap();
    let threshold = if job.is_reference {
        configured.or(*shared.effective_threshold.lock().unwrap())
    } else {
        shared.effective_threshold.lock().unwrap().or(configured)
    };

    let stars = detect_stars_for_stacking(&bitmap, threshold);

    if job.is_reference {
        *shared.effective_threshold.lock().unwrap() = threshold;

        if store
            .write_stars(&stars, (bitmap.width(), bitmap.height()), threshold, "STARS")
            .is_err()
        {
            return false;
        }
        let identity = Transformation::identity(bitmap.width() as f64, bitmap.height() as f64);
        return store.write_transformation(&identity, "TRANSFORM").is_ok();
    }

    let reference_stars = match load_reference_stars(shared) {
        Some(stars) => stars,
        None => return false,
    };

    let transform = match registration::register(&reference_stars, &stars, (bitmap.width(), bitmap.height())) {
        Ok(t) => t,
        Err(e) => {
            debug!(error = %e, path = %job.path.display(), "registration failed for frame");
            return false;
        }
    };

    if store
        .write_stars(&stars, (bitmap.width(), bitmap.height()), threshold, "STARS")
        .is_err()
    {
        return false;
    }
    store.write_transformation(&transform, "TRANSFORM").is_ok()
}

fn load_reference_stars(shared: &Arc<Shared>) -> Option<Vec<Star>> {
    let reference_path = {
        let frames = shared.frames.lock().unwrap();
        let index = frames.reference?;
        shared.calibrated_path(&frames.lights[index].path)
    };
    let mut store = Store::open(&reference_path, true).ok()?;
    store.read_stars(HduRef::Name("STARS")).ok().map(|(stars, _)| stars)
}

fn stack_one(shared: &Arc<Shared>, job: &StackingJob, cancel: &AtomicBool) -> bool {
    let mut store = match Store::open(&job.path, true) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to open frame for stacking");
            return false;
        }
    };

    let bitmap = match store.read_bitmap(HduRef::Index(1)) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to read frame bitmap for stacking");
            return false;
        }
    };
    let transform = match store.read_transformation(HduRef::Name("TRANSFORM")) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "failed to read transformation for stacking");
            return false;
        }
    };

    let background = calibration::measure_background(&bitmap);

    if job.is_reference {
        *shared.reference_calibration.lock().unwrap() = Some(background);
        let mut stacker_slot = shared.stacker.lock().unwrap();
        if stacker_slot.is_none() {
            *stacker_slot = Some(Stacker::new(bitmap.depth(), bitmap.channels(), bitmap.width(), bitmap.height()));
        }
        let stacker = stacker_slot.as_mut().unwrap();
        return stacker.accumulate(&bitmap, &transform, &background, &background, cancel).is_ok();
    }

    let reference_calibration = match *shared.reference_calibration.lock().unwrap() {
        Some(c) => c,
        None => {
            warn!("stacking a non-reference frame before the reference was stacked");
            return false;
        }
    };

    let mut stacker_slot = shared.stacker.lock().unwrap();
    let Some(stacker) = stacker_slot.as_mut() else {
        warn!("stacker not initialized");
        return false;
    };

    match stacker.accumulate(&bitmap, &transform, &background, &reference_calibration, cancel) {
        Ok(()) => true,
        Err(StackError::Cancelled) => false,
        Err(e) => {
            warn!(error = %e, "stacking accumulation failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{Channels, Depth};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    impl Orchestrator {
        /// Polls [`Self::get_infos`] until every dark is stacked and every valid
        /// light frame has reached the stacked state, or a 5s timeout elapses.
        fn wait_for_idle(&self) {
            use std::time::{Duration, Instant};
            let start = Instant::now();
            loop {
                let infos = self.get_infos();
                let darks_done = infos.dark_frames.iter().all(|d| d.stacked);
                let lights_settled = infos.light_frames.iter().all(|l| !l.valid || l.stacked);
                if darks_done && lights_settled {
                    break;
                }
                if start.elapsed() > Duration::from_secs(5) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    struct RecordingListener {
        stacking_done: AtomicUsize,
        last_infos: StdMutex<Option<LiveStackingInfos>>,
    }

    impl RecordingListener {
        fn new() -> Self {
            RecordingListener { stacking_done: AtomicUsize::new(0), last_infos: StdMutex::new(None) }
        }
    }

    impl Listener for RecordingListener {
        fn progress_notification(&self, infos: LiveStackingInfos) {
            *self.last_infos.lock().unwrap() = Some(infos);
        }

        fn stacking_done(&self, _path: PathBuf) {
            self.stacking_done.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn write_light_frame(path: &Path, value: f64) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, 8, 8);
        for y in 0..8 {
            for x in 0..8 {
                bmp.set_raw(x, y, 0, value);
            }
        }
        let mut store = Store::create(path).unwrap();
        store.write_bitmap(&bmp, Some("IMAGE")).unwrap();
    }

    #[test]
    fn a_single_light_frame_with_no_darks_reaches_stacked_done() {
        let dir = tempfile::tempdir().unwrap();
        let light_path = dir.path().join("light1.fits");
        write_light_frame(&light_path, 10.0);

        let listener = Arc::new(RecordingListener::new());
        let mut orchestrator = Orchestrator::new();
        orchestrator.setup(listener.clone(), dir.path().to_path_buf(), None);
        orchestrator.add_light_frame(light_path);

        orchestrator.start();
        orchestrator.wait_for_idle();

        assert_eq!(listener.stacking_done.load(Ordering::SeqCst), 1);
        let infos = orchestrator.get_infos();
        assert_eq!(infos.nb_light_frames, 1);
        assert_eq!(infos.nb_stacked, 1);
    }

    #[test]
    fn set_reference_clears_registered_and_stacked_state() {
        let dir = tempfile::tempdir().unwrap();
        let light1 = dir.path().join("light1.fits");
        let light2 = dir.path().join("light2.fits");
        write_light_frame(&light1, 10.0);
        write_light_frame(&light2, 10.0);

        let listener = Arc::new(RecordingListener::new());
        let mut orchestrator = Orchestrator::new();
        orchestrator.setup(listener, dir.path().to_path_buf(), None);
        orchestrator.add_light_frame(light1);
        orchestrator.add_light_frame(light2);

        orchestrator.start();
        orchestrator.wait_for_idle();

        orchestrator.set_reference(Some(1));

        let infos = orchestrator.get_infos();
        assert!(infos.light_frames.iter().all(|l| !l.registered && !l.stacked));
        assert!(!dir.path().join(STACKED_FILE).exists());
    }
}

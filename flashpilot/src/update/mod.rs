//! Update orchestration.
//!
//! [`Updater`] runs one update session at a time through a fixed sequence
//! of phases:
//!
//! ```text
//! Idle → SelectingDevice → Preparing → ConnectingBootloader → LoadingImages
//!      → Flashing → Resetting → Disconnecting → Succeeded | Failed
//! ```
//!
//! Every phase returns a [`PhaseOutcome`]. Soft failures (preparation,
//! reset) are logged and the sequence continues; fatal ones are reported
//! once through the same path. Teardown always runs, exactly once, before
//! `start` returns.

mod outcome;

pub use outcome::{FailureCause, PhaseOutcome};

use crate::bootloader::{
    BootloaderClient, BootloaderFactory, DeviceIdentity, FlashImage, WriteOptions,
};
use crate::error::Error;
use crate::image::ImageSource;
use crate::link::{DeviceAccess, DeviceLink, KNOWN_BRIDGES};
use crate::manifest::{UpdateManifest, check_layout};
use crate::prepare::{self, DEFAULT_SETTLE_DELAY};
use crate::sink::{ImageProgress, LogLevel, ProgressSink, StatusCategory};
use log::{debug, info, trace, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Orchestrator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No session has run yet.
    Idle,
    /// Waiting for the environment to grant a device.
    SelectingDevice,
    /// Preparation handshake.
    Preparing,
    /// Bootloader handshake.
    ConnectingBootloader,
    /// Fetching firmware images.
    LoadingImages,
    /// Writing images.
    Flashing,
    /// Hard reset into the new application.
    Resetting,
    /// Releasing the bootloader client and device link.
    Disconnecting,
    /// Terminal: update written.
    Succeeded,
    /// Terminal: update failed.
    Failed,
}

impl Phase {
    /// Whether the phase ends a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::SelectingDevice => "selecting device",
            Self::Preparing => "preparing",
            Self::ConnectingBootloader => "connecting bootloader",
            Self::LoadingImages => "loading images",
            Self::Flashing => "flashing",
            Self::Resetting => "resetting",
            Self::Disconnecting => "disconnecting",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Identifier of one update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Single-flight token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session running; a start request will be accepted.
    Idle,
    /// A session is running; start requests are dropped.
    Active(SessionId),
}

/// Result of an [`Updater::start`] request.
#[derive(Debug)]
pub enum StartOutcome {
    /// Another session was active; the request was dropped.
    Busy,
    /// A session ran to a terminal phase.
    Finished(UpdateReport),
}

impl StartOutcome {
    /// The report, if a session ran.
    pub fn report(&self) -> Option<&UpdateReport> {
        match self {
            Self::Busy => None,
            Self::Finished(report) => Some(report),
        }
    }
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct UpdateReport {
    /// Session identifier.
    pub session: SessionId,
    /// `Ok` for `Succeeded`, the cause for `Failed`.
    pub result: Result<(), FailureCause>,
    /// Identity reported by the bootloader, if the handshake succeeded.
    pub device: Option<DeviceIdentity>,
    /// Every phase entered, in order, ending with the terminal phase.
    pub history: Vec<Phase>,
    /// Messages of the soft failures that were logged and skipped.
    pub soft_failures: Vec<String>,
}

impl UpdateReport {
    /// Whether the session ended in `Succeeded`.
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }

    /// Terminal phase.
    pub fn final_phase(&self) -> Phase {
        if self.succeeded() {
            Phase::Succeeded
        } else {
            Phase::Failed
        }
    }

    /// Failure cause, if any.
    pub fn cause(&self) -> Option<&FailureCause> {
        self.result.as_ref().err()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the single-flight token when the session ends, even on panic.
struct ActiveGuard<'a> {
    slot: &'a Mutex<SessionState>,
    id: SessionId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *lock(self.slot) = SessionState::Idle;
        trace!("Session {} released", self.id);
    }
}

/// Phase bookkeeping of one session.
struct PhaseLog<'a> {
    id: SessionId,
    slot: &'a Mutex<Phase>,
    history: Vec<Phase>,
}

impl PhaseLog<'_> {
    fn enter(&mut self, phase: Phase) {
        debug!("Session {}: {phase}", self.id);
        self.history.push(phase);
        *lock(self.slot) = phase;
    }
}

/// Mutable state of one update attempt.
struct Session<'a> {
    phases: PhaseLog<'a>,
    link: Option<Box<dyn DeviceLink>>,
    client: Option<Box<dyn BootloaderClient>>,
    device: Option<DeviceIdentity>,
    soft_failures: Vec<String>,
    torn_down: bool,
}

impl<'a> Session<'a> {
    fn new(id: SessionId, slot: &'a Mutex<Phase>) -> Self {
        Self {
            phases: PhaseLog {
                id,
                slot,
                history: Vec::new(),
            },
            link: None,
            client: None,
            device: None,
            soft_failures: Vec::new(),
            torn_down: false,
        }
    }

    /// Disconnect the client and close the link, swallowing errors.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.phases.enter(Phase::Disconnecting);

        if let Some(mut client) = self.client.take() {
            if let Some(link) = self.link.as_deref_mut() {
                if let Err(e) = client.disconnect(link) {
                    trace!("Bootloader disconnect failed (ignored): {e}");
                }
            }
        }
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close() {
                trace!("Closing {} failed (ignored): {e}", link.name());
            }
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Device update orchestrator.
///
/// Owns the manifest and the collaborators. [`Updater::start`] takes
/// `&self` so it can be shared between threads; at most one session runs
/// at a time and concurrent requests return [`StartOutcome::Busy`].
pub struct Updater {
    manifest: UpdateManifest,
    access: Box<dyn DeviceAccess>,
    images: Box<dyn ImageSource>,
    bootloader: Box<dyn BootloaderFactory>,
    sink: Box<dyn ProgressSink>,
    settle_delay: Duration,
    session: Mutex<SessionState>,
    phase: Mutex<Phase>,
    next_session: AtomicU64,
}

impl Updater {
    /// Create an updater for `manifest` with the given collaborators.
    pub fn new(
        manifest: UpdateManifest,
        access: impl DeviceAccess + 'static,
        images: impl ImageSource + 'static,
        bootloader: impl BootloaderFactory + 'static,
        sink: impl ProgressSink + 'static,
    ) -> Self {
        Self {
            manifest,
            access: Box::new(access),
            images: Box::new(images),
            bootloader: Box::new(bootloader),
            sink: Box::new(sink),
            settle_delay: DEFAULT_SETTLE_DELAY,
            session: Mutex::new(SessionState::Idle),
            phase: Mutex::new(Phase::Idle),
            next_session: AtomicU64::new(0),
        }
    }

    /// Set the pause between the preparation handshake and the bootloader connection.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// The manifest driving this updater.
    pub fn manifest(&self) -> &UpdateManifest {
        &self.manifest
    }

    /// Current single-flight token.
    pub fn session_state(&self) -> SessionState {
        *lock(&self.session)
    }

    /// Phase of the running session, or the terminal phase of the last one.
    pub fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    fn try_begin(&self) -> Option<ActiveGuard<'_>> {
        let mut state = lock(&self.session);
        if let SessionState::Active(id) = *state {
            debug!("Session {id} is active, dropping start request");
            return None;
        }
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed) + 1);
        *state = SessionState::Active(id);
        Some(ActiveGuard {
            slot: &self.session,
            id,
        })
    }

    /// Run one update session to completion.
    ///
    /// Returns [`StartOutcome::Busy`] without side effects if a session is
    /// already active.
    pub fn start(&self) -> StartOutcome {
        let Some(guard) = self.try_begin() else {
            return StartOutcome::Busy;
        };
        info!(
            "Starting update {} of {} {}",
            guard.id, self.manifest.project.name, self.manifest.project.version
        );

        let mut session = Session::new(guard.id, &self.phase);
        let result = self.run_phases(&mut session);

        if let Err(cause) = &result {
            self.report_failure(cause);
        }
        session.teardown();

        let terminal = if result.is_ok() {
            self.sink.on_status(
                &format!(
                    "Update complete: {} {}",
                    self.manifest.project.name, self.manifest.project.version
                ),
                StatusCategory::Success,
            );
            Phase::Succeeded
        } else {
            Phase::Failed
        };
        session.phases.enter(terminal);

        let report = UpdateReport {
            session: guard.id,
            result,
            device: session.device.take(),
            history: std::mem::take(&mut session.phases.history),
            soft_failures: std::mem::take(&mut session.soft_failures),
        };
        drop(session);
        drop(guard);

        StartOutcome::Finished(report)
    }

    fn run_phases(&self, session: &mut Session<'_>) -> Result<(), FailureCause> {
        let soft = &mut session.soft_failures;

        session.phases.enter(Phase::SelectingDevice);
        self.sink
            .on_status("Select the device to update", StatusCategory::Working);
        let link = match self.access.request_access(KNOWN_BRIDGES) {
            Ok(link) => link,
            Err(Error::UserCancelled) => return Err(FailureCause::NoDeviceSelected),
            Err(e) => return Err(FailureCause::DeviceUnavailable(e.to_string())),
        };
        info!("Using device on {}", link.name());
        let link = &mut **session.link.insert(link);

        session.phases.enter(Phase::Preparing);
        self.settle(soft, self.prepare(link))?;

        session.phases.enter(Phase::ConnectingBootloader);
        let client = &mut **session.client.insert(self.bootloader.create());
        session.device = self.settle(soft, self.connect(client, link))?;

        session.phases.enter(Phase::LoadingImages);
        let images = self
            .settle(soft, self.load_images())?
            .unwrap_or_default();

        session.phases.enter(Phase::Flashing);
        self.settle(soft, self.flash(client, link, images))?;

        session.phases.enter(Phase::Resetting);
        self.settle(soft, self.reset(client, link))?;

        Ok(())
    }

    /// Phase boundary: log soft failures and carry on, stop on fatal ones.
    fn settle<T>(
        &self,
        soft: &mut Vec<String>,
        outcome: PhaseOutcome<T>,
    ) -> Result<Option<T>, FailureCause> {
        match outcome {
            PhaseOutcome::Continue(value) => Ok(Some(value)),
            PhaseOutcome::SoftFailure(message) => {
                info!("{message}");
                self.sink.on_log(&message, LogLevel::Info);
                soft.push(message);
                Ok(None)
            },
            PhaseOutcome::Fatal(cause) => Err(cause),
        }
    }

    fn prepare(&self, link: &mut dyn DeviceLink) -> PhaseOutcome<()> {
        let command = &self.manifest.bootload_command;
        if !command.enabled {
            debug!("Preparation command disabled, skipping");
            return PhaseOutcome::Continue(());
        }

        self.sink.on_status(
            "Asking the running firmware to enter bootloader mode",
            StatusCategory::Working,
        );
        prepare::request_bootloader(link, command, self.settle_delay)
    }

    fn connect(
        &self,
        client: &mut dyn BootloaderClient,
        link: &mut dyn DeviceLink,
    ) -> PhaseOutcome<DeviceIdentity> {
        let baud = self.manifest.device.baudrate;
        self.sink.on_status(
            &format!("Connecting to bootloader at {baud} baud"),
            StatusCategory::Working,
        );

        match client.connect(link, baud) {
            Ok(identity) => {
                info!("Connected to {}", identity.chip);
                self.sink
                    .on_log(&format!("Connected to {}", identity.chip), LogLevel::Info);
                PhaseOutcome::Continue(identity)
            },
            Err(e) => PhaseOutcome::Fatal(FailureCause::BootloaderUnreachable(message_of(e))),
        }
    }

    fn load_images(&self) -> PhaseOutcome<Vec<FlashImage>> {
        let total = self.manifest.firmware.len();
        let mut images = Vec::with_capacity(total);

        for (index, entry) in self.manifest.firmware.iter().enumerate() {
            self.sink.on_status(
                &format!("Loading {} ({}/{total})", entry.name, index + 1),
                StatusCategory::Working,
            );
            match self.images.fetch(&entry.name, &entry.file) {
                Ok(data) => {
                    debug!(
                        "Image {} ({} bytes) -> 0x{:08X}",
                        entry.name,
                        data.len(),
                        entry.address
                    );
                    images.push(FlashImage {
                        name: entry.name.clone(),
                        address: entry.address,
                        data,
                    });
                },
                Err(e) => {
                    return PhaseOutcome::Fatal(FailureCause::ImageLoadFailed {
                        name: entry.name.clone(),
                        reason: message_of(e),
                    });
                },
            }
        }

        let spans: Vec<_> = images.iter().map(FlashImage::span).collect();
        for warning in check_layout(&spans, self.manifest.device.flash_size_bytes()) {
            warn!("{warning}");
            self.sink.on_log(&warning.to_string(), LogLevel::Warn);
        }

        PhaseOutcome::Continue(images)
    }

    fn flash(
        &self,
        client: &mut dyn BootloaderClient,
        link: &mut dyn DeviceLink,
        images: Vec<FlashImage>,
    ) -> PhaseOutcome<()> {
        self.sink.on_status(
            &format!("Writing {} image(s)", images.len()),
            StatusCategory::Working,
        );

        let sink = self.sink.as_ref();
        let mut tracker = ImageProgress::default();
        let mut on_progress = |image: usize, written: usize, total: usize| {
            if let Some(percent) = tracker.update(image, written, total) {
                sink.on_progress(percent);
            }
        };

        let result = client.write_images(
            link,
            &images,
            &self.manifest.device,
            WriteOptions::default(),
            &mut on_progress,
        );

        match result {
            Ok(()) => {
                if let Some(percent) = tracker.finish() {
                    sink.on_progress(percent);
                }
                info!("Wrote {} image(s)", images.len());
                PhaseOutcome::Continue(())
            },
            Err(e) => PhaseOutcome::Fatal(FailureCause::FlashWriteFailed(message_of(e))),
        }
    }

    fn reset(
        &self,
        client: &mut dyn BootloaderClient,
        link: &mut dyn DeviceLink,
    ) -> PhaseOutcome<()> {
        self.sink
            .on_status("Restarting device", StatusCategory::Working);
        match client.hard_reset(link) {
            Ok(()) => PhaseOutcome::Continue(()),
            Err(e) => PhaseOutcome::SoftFailure(format!(
                "Hard reset failed ({}); manual reset may be required",
                message_of(e)
            )),
        }
    }

    fn report_failure(&self, cause: &FailureCause) {
        warn!("Update failed: {cause}");
        self.sink.on_status("Update failed", StatusCategory::Error);
        self.sink.on_log(&cause.to_string(), LogLevel::Error);
        self.sink.on_log(cause.hint(), LogLevel::Info);
    }
}

/// Collaborator message without the library's own prefix.
fn message_of(e: Error) -> String {
    match e {
        Error::Bootloader(msg) => msg,
        Error::ImageFetch { reason, .. } => reason,
        other => other.to_string(),
    }
}

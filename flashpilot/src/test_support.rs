//! Recording fakes for the collaborator traits.

use crate::bootloader::{
    BootloaderClient, BootloaderFactory, DeviceIdentity, FlashImage, WriteOptions, WriteProgress,
};
use crate::error::{Error, Result};
use crate::image::ImageSource;
use crate::link::{DeviceAccess, DeviceLink, UsbFilter};
use crate::manifest::{DeviceParams, UpdateManifest};
use crate::sink::{LogLevel, ProgressSink, StatusCategory};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex};

pub(crate) const TWO_IMAGES: &str = r#"{
    "project": { "name": "demo", "version": "1.2.0" },
    "bootloadCommand": { "enabled": true, "command": "bootload", "baudrate": 115200, "timeout": 0 },
    "device": { "baudrate": 460800, "flashSize": "4MB" },
    "firmware": {
        "boot": { "file": "boot.bin", "address": "0x1000" },
        "app": { "file": "app.bin", "address": "0x10000" }
    }
}"#;

/// Two-image manifest with the preparation command switched on or off.
pub(crate) fn manifest(prepare: bool) -> UpdateManifest {
    let mut manifest = UpdateManifest::from_json(TWO_IMAGES).unwrap();
    manifest.bootload_command.enabled = prepare;
    manifest
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkOp {
    Open(u32),
    Write(Vec<u8>),
    Close,
}

#[derive(Debug, Default)]
struct LinkState {
    open: bool,
    ops: Vec<LinkOp>,
    fail_open_at: Option<u32>,
    fail_write: bool,
    fail_close: bool,
}

/// Link recording every call. Clones share state.
#[derive(Debug, Clone)]
pub(crate) struct FakeLink {
    name: String,
    state: Arc<Mutex<LinkState>>,
}

impl FakeLink {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::default(),
        }
    }

    pub(crate) fn fail_open_at(self, baud: u32) -> Self {
        self.state.lock().unwrap().fail_open_at = Some(baud);
        self
    }

    pub(crate) fn fail_write(self) -> Self {
        self.state.lock().unwrap().fail_write = true;
        self
    }

    pub(crate) fn fail_close(self) -> Self {
        self.state.lock().unwrap().fail_close = true;
        self
    }

    pub(crate) fn ops(&self) -> Vec<LinkOp> {
        self.state.lock().unwrap().ops.clone()
    }
}

impl DeviceLink for FakeLink {
    fn open(&mut self, baud_rate: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open_at == Some(baud_rate) {
            return Err(Error::Io(std::io::Error::other("Device or resource busy")));
        }
        state.ops.push(LinkOp::Open(baud_rate));
        state.open = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(Error::NotOpen);
        }
        if state.fail_write {
            return Err(Error::Timeout("write".into()));
        }
        state.ops.push(LinkOp::Write(data.to_vec()));
        Ok(())
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(LinkOp::Close);
        state.open = false;
        if state.fail_close {
            return Err(Error::Io(std::io::Error::other("close failed")));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Blocks `request_access` until the test releases it.
pub(crate) struct Gate {
    pub(crate) entered: Mutex<Sender<()>>,
    pub(crate) release: Mutex<Receiver<()>>,
}

enum Grant {
    Link(FakeLink),
    Cancel,
    Fail(String),
}

/// Device access granting a fixed link, cancelling or failing.
pub(crate) struct FakeAccess {
    grant: Grant,
    requests: Arc<AtomicUsize>,
    gate: Option<Gate>,
}

impl FakeAccess {
    pub(crate) fn granting(link: &FakeLink) -> Self {
        Self::with(Grant::Link(link.clone()))
    }

    pub(crate) fn cancelling() -> Self {
        Self::with(Grant::Cancel)
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self::with(Grant::Fail(message.to_string()))
    }

    fn with(grant: Grant) -> Self {
        Self {
            grant,
            requests: Arc::default(),
            gate: None,
        }
    }

    pub(crate) fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn requests(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.requests)
    }
}

impl DeviceAccess for FakeAccess {
    fn request_access(&self, filters: &[UsbFilter]) -> Result<Box<dyn DeviceLink>> {
        assert!(!filters.is_empty());
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.entered.lock().unwrap().send(()).unwrap();
            gate.release.lock().unwrap().recv().unwrap();
        }
        match &self.grant {
            Grant::Link(link) => Ok(Box::new(link.clone())),
            Grant::Cancel => Err(Error::UserCancelled),
            Grant::Fail(msg) => Err(Error::Io(std::io::Error::other(msg.clone()))),
        }
    }
}

/// Image source serving in-memory blobs by image name.
#[derive(Default)]
pub(crate) struct FakeImages {
    blobs: HashMap<String, Vec<u8>>,
    broken: HashSet<String>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl FakeImages {
    pub(crate) fn with(mut self, name: &str, size: usize) -> Self {
        self.blobs.insert(name.to_string(), vec![0xA5; size]);
        self
    }

    pub(crate) fn broken(mut self, name: &str) -> Self {
        self.broken.insert(name.to_string());
        self
    }

    pub(crate) fn fetched(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.fetched)
    }
}

impl ImageSource for FakeImages {
    fn fetch(&self, name: &str, file: &str) -> Result<Vec<u8>> {
        self.fetched.lock().unwrap().push(name.to_string());
        if self.broken.contains(name) {
            return Err(Error::ImageFetch {
                file: file.to_string(),
                reason: "HTTP 404".into(),
            });
        }
        self.blobs.get(name).cloned().ok_or_else(|| Error::ImageFetch {
            file: file.to_string(),
            reason: "not found".into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClientCall {
    Connect(u32),
    Write(Vec<String>),
    HardReset,
    Disconnect,
}

/// Failure and progress script for [`FakeBootloader`] clients.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    pub(crate) connect_error: Option<String>,
    pub(crate) write_error: Option<String>,
    pub(crate) reset_fails: bool,
    pub(crate) disconnect_fails: bool,
    /// `(image, written, total)` reports; one 100% report per image when empty.
    pub(crate) progress: Vec<(usize, usize, usize)>,
}

/// Factory producing scripted clients that record their calls.
#[derive(Clone, Default)]
pub(crate) struct FakeBootloader {
    script: Script,
    calls: Arc<Mutex<Vec<ClientCall>>>,
    created: Arc<AtomicUsize>,
}

impl FakeBootloader {
    pub(crate) fn scripted(script: Script) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<ClientCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl BootloaderFactory for FakeBootloader {
    fn create(&self) -> Box<dyn BootloaderClient> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeClient {
            script: self.script.clone(),
            calls: Arc::clone(&self.calls),
        })
    }
}

struct FakeClient {
    script: Script,
    calls: Arc<Mutex<Vec<ClientCall>>>,
}

impl FakeClient {
    fn record(&self, call: ClientCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl BootloaderClient for FakeClient {
    fn connect(&mut self, link: &mut dyn DeviceLink, baud_rate: u32) -> Result<DeviceIdentity> {
        self.record(ClientCall::Connect(baud_rate));
        link.open(baud_rate)?;
        match &self.script.connect_error {
            Some(msg) => Err(Error::Bootloader(msg.clone())),
            None => Ok(DeviceIdentity {
                chip: "ESP32-D0WD-V3".into(),
                id: Some("24:0a:c4:00:00:01".into()),
            }),
        }
    }

    fn write_images(
        &mut self,
        _link: &mut dyn DeviceLink,
        images: &[FlashImage],
        _params: &DeviceParams,
        _options: WriteOptions,
        progress: WriteProgress<'_>,
    ) -> Result<()> {
        self.record(ClientCall::Write(
            images.iter().map(|i| i.name.clone()).collect(),
        ));
        if self.script.progress.is_empty() {
            for (index, image) in images.iter().enumerate() {
                progress(index, image.data.len(), image.data.len());
            }
        } else {
            for &(index, written, total) in &self.script.progress {
                progress(index, written, total);
            }
        }
        match &self.script.write_error {
            Some(msg) => Err(Error::Bootloader(msg.clone())),
            None => Ok(()),
        }
    }

    fn hard_reset(&mut self, _link: &mut dyn DeviceLink) -> Result<()> {
        self.record(ClientCall::HardReset);
        if self.script.reset_fails {
            return Err(Error::Bootloader("no response to reset".into()));
        }
        Ok(())
    }

    fn disconnect(&mut self, _link: &mut dyn DeviceLink) -> Result<()> {
        self.record(ClientCall::Disconnect);
        if self.script.disconnect_fails {
            return Err(Error::Bootloader("already gone".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SinkEvent {
    Status(String, StatusCategory),
    Log(String, LogLevel),
    Progress(u8),
}

/// Sink collecting every event in order. Clones share the event list.
#[derive(Clone, Default)]
pub(crate) struct RecordingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn progress(&self) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn logs(&self, level: LogLevel) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Log(text, l) if l == level => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn on_status(&self, text: &str, category: StatusCategory) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Status(text.to_string(), category));
    }

    fn on_log(&self, text: &str, level: LogLevel) {
        self.events
            .lock()
            .unwrap()
            .push(SinkEvent::Log(text.to_string(), level));
    }

    fn on_progress(&self, percent: u8) {
        self.events.lock().unwrap().push(SinkEvent::Progress(percent));
    }
}

//! Threaded NMSG I/O multiplexing.
//!
//! An [`Io`] context owns a set of inputs and outputs. [`Io::run`] spawns
//! one worker thread per input; each worker reads containers (or
//! presentation lines) and fans payloads out to the outputs, either striping
//! containers round-robin across writers or mirroring every container to
//! every writer. Delivery always happens under the receiving output's own
//! mutex, and a worker holds at most one output lock at a time, so there is
//! no lock ordering to get wrong.
//!
//! Close triggers fire inline on the delivery path: every `count` payloads
//! or at each epoch-aligned `interval` boundary the output is closed and the
//! close callback may install a replacement. Every handle gets a final
//! `Eof` close event at shutdown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::container::{Nmsg, NmsgPayload};
use crate::error::{Error, Result};
use crate::input::{NmsgInput, PresInput};
use crate::module::ModuleSet;
use crate::output::{Output, OutputKind, WriteOutcome, DEFAULT_ENDLINE};
use crate::payload::now_timespec;
use crate::rate::Rate;

/// How payloads spread across outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Each container goes to exactly one writer of each kind, round-robin.
    #[default]
    Stripe,
    /// Every container goes to every writer.
    Mirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    Eof,
    Count,
    Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    Input,
    Output,
}

/// Handed to the close callback when a handle closes.
///
/// For `Count` and `Interval` closes the callback may install a fresh sink
/// in `reopen`; leaving it empty keeps the output closed, and later writes
/// to it fail the delivering worker.
pub struct CloseEvent<'a> {
    pub io_type: IoType,
    pub output_kind: Option<OutputKind>,
    pub close_type: CloseType,
    pub user: Option<u64>,
    pub reopen: &'a mut Option<Box<dyn Output>>,
}

pub type ClosedFn = dyn Fn(&mut CloseEvent<'_>) + Send + Sync;

// ─── Output handle ───────────────────────────────────────────────────────────

struct OutputCore {
    /// `None` once closed without a reopen.
    out: Option<Box<dyn Output>>,
    filter: Option<(u32, u32)>,
    rate: Option<Rate>,
    source: Option<u32>,
    operator: Option<u32>,
    group: Option<u32>,
    /// Start of the current close-interval window.
    last_sec: u64,
}

/// One output as seen by the multiplexer: the sink behind its mutex, plus
/// per-handle policy and counters.
pub struct OutputHandle {
    core: Mutex<OutputCore>,
    kind: OutputKind,
    user: Option<u64>,
    containers_out: AtomicU64,
    payloads_out: AtomicU64,
}

impl OutputHandle {
    fn new(out: Box<dyn Output>, user: Option<u64>) -> Arc<Self> {
        let kind = out.kind();
        Arc::new(Self {
            core: Mutex::new(OutputCore {
                out: Some(out),
                filter: None,
                rate: None,
                source: None,
                operator: None,
                group: None,
                last_sec: 0,
            }),
            kind,
            user,
            containers_out: AtomicU64::new(0),
            payloads_out: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, OutputCore> {
        self.core.lock().unwrap()
    }

    /// Only payloads matching (vid, msgtype) are written; everything else is
    /// silently discarded. `(0, 0)` disables the filter.
    pub fn set_filter(&self, vid: u32, msgtype: u32) {
        self.lock().filter = if vid == 0 && msgtype == 0 {
            None
        } else {
            Some((vid, msgtype))
        };
    }

    /// Name-based variant of [`set_filter`](Self::set_filter). Fails when
    /// the vendor or message type is not registered.
    pub fn set_filter_byname(&self, modules: &ModuleSet, vname: &str, mname: &str) -> Result<()> {
        let (vid, msgtype) = modules.lookup_byname(vname, mname)?;
        self.set_filter(vid, msgtype);
        Ok(())
    }

    /// Pace this output; `None` removes the limiter.
    pub fn set_rate(&self, rate: Option<Rate>) {
        self.lock().rate = rate;
    }

    pub fn set_source(&self, source: Option<u32>) {
        self.lock().source = source;
    }

    pub fn set_operator(&self, operator: Option<u32>) {
        self.lock().operator = operator;
    }

    pub fn set_group(&self, group: Option<u32>) {
        self.lock().group = group;
    }

    pub fn kind(&self) -> OutputKind {
        self.kind
    }

    pub fn user(&self) -> Option<u64> {
        self.user
    }

    /// Containers flushed to the wire (write batches for presentation
    /// outputs).
    pub fn containers_out(&self) -> u64 {
        self.containers_out.load(Relaxed)
    }

    /// Payloads accepted past the filter.
    pub fn payloads_out(&self) -> u64 {
        self.payloads_out.load(Relaxed)
    }
}

// ─── Io context ──────────────────────────────────────────────────────────────

struct Shared {
    nmsg_outputs: Vec<Arc<OutputHandle>>,
    pres_outputs: Vec<Arc<OutputHandle>>,
    mode: OutputMode,
    count: u64,
    interval: u64,
    source: Option<u32>,
    operator: Option<u32>,
    group: Option<u32>,
    closed_fn: Option<Arc<ClosedFn>>,
    stop: Arc<AtomicBool>,
    debug: i32,
}

/// Requests a running [`Io::run`] to stop. Clonable, callable from any
/// thread; workers notice at their next receive boundary.
#[derive(Clone)]
pub struct IoBreaker(Arc<AtomicBool>);

impl IoBreaker {
    pub fn break_loop(&self) {
        self.0.store(true, Relaxed);
    }
}

/// The multiplexing context. Configure, add handles, then [`run`](Io::run).
pub struct Io {
    nmsg_inputs: Vec<(NmsgInput, Option<u64>)>,
    pres_inputs: Vec<(PresInput, Option<u64>)>,
    nmsg_outputs: Vec<Arc<OutputHandle>>,
    pres_outputs: Vec<Arc<OutputHandle>>,
    output_mode: OutputMode,
    count: u64,
    interval: u64,
    endline: String,
    quiet: bool,
    zlibout: bool,
    debug: i32,
    source: Option<u32>,
    operator: Option<u32>,
    group: Option<u32>,
    closed_fn: Option<Arc<ClosedFn>>,
    stop: Arc<AtomicBool>,
    /// (is_pres, user) for inputs consumed by `run`, kept for the final
    /// close events.
    finished_inputs: Vec<(bool, Option<u64>)>,
    ran: bool,
}

impl Default for Io {
    fn default() -> Self {
        Self::new()
    }
}

impl Io {
    pub fn new() -> Self {
        Self {
            nmsg_inputs: Vec::new(),
            pres_inputs: Vec::new(),
            nmsg_outputs: Vec::new(),
            pres_outputs: Vec::new(),
            output_mode: OutputMode::Stripe,
            count: 0,
            interval: 0,
            endline: DEFAULT_ENDLINE.to_owned(),
            quiet: false,
            zlibout: false,
            debug: 0,
            source: None,
            operator: None,
            group: None,
            closed_fn: None,
            stop: Arc::new(AtomicBool::new(false)),
            finished_inputs: Vec::new(),
            ran: false,
        }
    }

    /// Add a container input. Only allowed before `run`.
    pub fn add_input(&mut self, input: NmsgInput, user: Option<u64>) -> Result<()> {
        self.check_not_running()?;
        self.nmsg_inputs.push((input, user));
        Ok(())
    }

    /// Add a presentation-text input. Only allowed before `run`.
    pub fn add_pres_input(&mut self, input: PresInput, user: Option<u64>) -> Result<()> {
        self.check_not_running()?;
        self.pres_inputs.push((input, user));
        Ok(())
    }

    /// Add an output of any kind. Presentation outputs and container
    /// outputs stripe independently. Returns the handle for per-output
    /// policy (filter, rate, stamps) and counters.
    pub fn add_output(
        &mut self,
        output: Box<dyn Output>,
        user: Option<u64>,
    ) -> Result<Arc<OutputHandle>> {
        self.check_not_running()?;
        let handle = OutputHandle::new(output, user);
        match handle.kind() {
            OutputKind::Pres => self.pres_outputs.push(handle.clone()),
            _ => self.nmsg_outputs.push(handle.clone()),
        }
        Ok(handle)
    }

    fn check_not_running(&self) -> Result<()> {
        if self.ran {
            return Err(Error::Failure("io loop already started".into()));
        }
        Ok(())
    }

    pub fn set_closed_fn(&mut self, f: impl Fn(&mut CloseEvent<'_>) + Send + Sync + 'static) {
        self.closed_fn = Some(Arc::new(f));
    }

    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.output_mode = mode;
    }

    /// Close each output every `count` payloads; 0 disables.
    pub fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    /// Close each output every `interval` wall-clock seconds, aligned to
    /// epoch multiples; 0 disables.
    pub fn set_interval(&mut self, interval: u64) {
        self.interval = interval;
    }

    /// Presentation line continuation; copied unconditionally.
    pub fn set_endline(&mut self, endline: &str) {
        self.endline = endline.to_owned();
    }

    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    /// zlib-compress containers on every container output.
    pub fn set_zlibout(&mut self, zlibout: bool) {
        self.zlibout = zlibout;
    }

    pub fn set_debug(&mut self, debug: i32) {
        self.debug = debug;
    }

    /// Stamp every outgoing payload's source field.
    pub fn set_source(&mut self, source: Option<u32>) {
        self.source = source;
    }

    pub fn set_operator(&mut self, operator: Option<u32>) {
        self.operator = operator;
    }

    pub fn set_group(&mut self, group: Option<u32>) {
        self.group = group;
    }

    /// A stop handle usable from any thread while `run` is blocking.
    pub fn breaker(&self) -> IoBreaker {
        IoBreaker(self.stop.clone())
    }

    /// Process until every input reaches end of stream (or the loop is
    /// broken). Spawns one worker per input and blocks until all exit. A
    /// failed worker does not stop the others.
    pub fn run(&mut self) -> Result<()> {
        self.check_not_running()?;
        self.ran = true;

        for handle in self.nmsg_outputs.iter().chain(self.pres_outputs.iter()) {
            let mut core = handle.lock();
            if let Some(out) = core.out.as_mut() {
                if self.zlibout {
                    out.set_zlib(true);
                }
                out.set_endline(&self.endline);
                out.set_quiet(self.quiet);
            }
        }

        if self.interval > 0 {
            let now = now_timespec().0;
            let aligned = now - now % self.interval;
            for handle in self.nmsg_outputs.iter().chain(self.pres_outputs.iter()) {
                handle.lock().last_sec = aligned;
            }
        }

        let shared = Arc::new(Shared {
            nmsg_outputs: self.nmsg_outputs.clone(),
            pres_outputs: self.pres_outputs.clone(),
            mode: self.output_mode,
            count: self.count,
            interval: self.interval,
            source: self.source,
            operator: self.operator,
            group: self.group,
            closed_fn: self.closed_fn.clone(),
            stop: self.stop.clone(),
            debug: self.debug,
        });

        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        for (i, (input, user)) in self.nmsg_inputs.drain(..).enumerate() {
            self.finished_inputs.push((false, user));
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("nmsg-in-{i}"))
                .spawn(move || worker_nmsg(shared, input))
                .expect("failed to spawn nmsg worker");
            workers.push(handle);
        }

        for (i, (input, user)) in self.pres_inputs.drain(..).enumerate() {
            self.finished_inputs.push((true, user));
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("pres-in-{i}"))
                .spawn(move || worker_pres(shared, input))
                .expect("failed to spawn pres worker");
            workers.push(handle);
        }

        let mut panicked = false;
        for worker in workers {
            if worker.join().is_err() {
                panicked = true;
            }
        }
        if panicked {
            return Err(Error::Failure("an io worker panicked".into()));
        }
        Ok(())
    }

    /// Flush and close every output and fire an `Eof` close event for each
    /// handle, inputs included.
    pub fn shutdown(mut self) {
        self.stop.store(true, Relaxed);

        let closed_fn = self.closed_fn.clone();
        let fire = |io_type: IoType, kind: Option<OutputKind>, user: Option<u64>| {
            if let Some(cb) = &closed_fn {
                let mut reopen = None;
                let mut ev = CloseEvent {
                    io_type,
                    output_kind: kind,
                    close_type: CloseType::Eof,
                    user,
                    reopen: &mut reopen,
                };
                cb(&mut ev);
            }
        };

        for (_, user) in self
            .finished_inputs
            .drain(..)
            .chain(self.nmsg_inputs.drain(..).map(|(_, u)| (false, u)))
            .chain(self.pres_inputs.drain(..).map(|(_, u)| (true, u)))
        {
            fire(IoType::Input, None, user);
        }

        for handle in self.nmsg_outputs.drain(..).chain(self.pres_outputs.drain(..)) {
            {
                let mut core = handle.lock();
                if let Some(out) = core.out.as_mut() {
                    match out.close() {
                        Ok(WriteOutcome::ContainerWritten) => {
                            handle.containers_out.fetch_add(1, Relaxed);
                        }
                        Ok(WriteOutcome::Buffered) => {}
                        Err(e) => tracing::warn!(error = %e, "output close failed"),
                    }
                }
                core.out = None;
            }
            fire(IoType::Output, Some(handle.kind()), handle.user());
            if self.debug >= 2 {
                tracing::debug!(
                    containers_out = handle.containers_out(),
                    payloads_out = handle.payloads_out(),
                    "output handle closed"
                );
            }
        }
    }
}

// ─── Workers ─────────────────────────────────────────────────────────────────

fn worker_nmsg(shared: Arc<Shared>, mut input: NmsgInput) {
    let mut containers_in: u64 = 0;
    let mut payloads_in: u64 = 0;
    let mut nmsg_cursor = 0usize;
    let mut pres_cursor = 0usize;

    loop {
        if shared.stop.load(Relaxed) {
            break;
        }
        let nmsg = match input.read_container() {
            Ok(nmsg) => nmsg,
            Err(e) if e.is_transient() => {
                if let Error::Malformed(why) = &e {
                    tracing::debug!(why = %why, "frame dropped");
                }
                continue;
            }
            Err(Error::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "nmsg input failed");
                break;
            }
        };
        containers_in += 1;
        payloads_in += nmsg.payloads.len() as u64;
        let now = now_timespec();

        let delivered = match shared.mode {
            OutputMode::Stripe => {
                let mut res = Ok(());
                if !shared.nmsg_outputs.is_empty() {
                    let handle = &shared.nmsg_outputs[nmsg_cursor % shared.nmsg_outputs.len()];
                    res = deliver_container(&shared, handle, &nmsg, now);
                    nmsg_cursor = nmsg_cursor.wrapping_add(1);
                }
                if res.is_ok() && !shared.pres_outputs.is_empty() {
                    let handle = &shared.pres_outputs[pres_cursor % shared.pres_outputs.len()];
                    res = deliver_container(&shared, handle, &nmsg, now);
                    pres_cursor = pres_cursor.wrapping_add(1);
                }
                res
            }
            OutputMode::Mirror => shared
                .nmsg_outputs
                .iter()
                .chain(shared.pres_outputs.iter())
                .try_for_each(|handle| deliver_container(&shared, handle, &nmsg, now)),
        };

        if let Err(e) = delivered {
            tracing::warn!(error = %e, "delivery failed; input worker exiting");
            break;
        }
    }

    if shared.debug >= 3 {
        tracing::debug!(containers_in, payloads_in, "nmsg worker finished");
    }
}

fn worker_pres(shared: Arc<Shared>, mut input: PresInput) {
    let mut lines_in: u64 = 0;
    let mut payloads_in: u64 = 0;
    let mut cursor = 0usize;

    loop {
        if shared.stop.load(Relaxed) {
            break;
        }
        let line = match input.read_line() {
            Ok(line) => line,
            Err(Error::Eof) => break,
            Err(e) => {
                tracing::warn!(error = %e, "pres input failed");
                break;
            }
        };
        lines_in += 1;

        let bytes = match input.parse_line(&line) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable presentation line dropped");
                continue;
            }
        };
        payloads_in += 1;

        let now = now_timespec();
        let payload = NmsgPayload::make(&bytes, input.vid(), input.msgtype(), now.0, now.1);

        let delivered = match shared.mode {
            OutputMode::Stripe => {
                if shared.nmsg_outputs.is_empty() {
                    Ok(())
                } else {
                    let handle = &shared.nmsg_outputs[cursor % shared.nmsg_outputs.len()];
                    cursor = cursor.wrapping_add(1);
                    deliver_one(&shared, handle, payload, now)
                }
            }
            OutputMode::Mirror => shared
                .nmsg_outputs
                .iter()
                .try_for_each(|handle| deliver_one(&shared, handle, payload.clone(), now)),
        };

        if let Err(e) = delivered {
            tracing::warn!(error = %e, "delivery failed; pres worker exiting");
            break;
        }
    }

    if shared.debug >= 3 {
        tracing::debug!(lines_in, payloads_in, "pres worker finished");
    }
}

// ─── Delivery ────────────────────────────────────────────────────────────────

fn deliver_container(
    shared: &Shared,
    handle: &OutputHandle,
    nmsg: &Nmsg,
    now: (u64, u32),
) -> Result<()> {
    let mut core = handle.lock();
    for payload in &nmsg.payloads {
        deliver_payload(shared, handle, &mut core, payload.clone(), now)?;
    }
    if handle.kind() == OutputKind::Pres {
        handle.containers_out.fetch_add(1, Relaxed);
    }
    Ok(())
}

fn deliver_one(
    shared: &Shared,
    handle: &OutputHandle,
    payload: NmsgPayload,
    now: (u64, u32),
) -> Result<()> {
    let mut core = handle.lock();
    deliver_payload(shared, handle, &mut core, payload, now)
}

/// Write one payload under the handle's lock, then evaluate close triggers.
fn deliver_payload(
    shared: &Shared,
    handle: &OutputHandle,
    core: &mut OutputCore,
    mut payload: NmsgPayload,
    now: (u64, u32),
) -> Result<()> {
    if let Some((vid, msgtype)) = core.filter {
        if payload.vid != vid || payload.msgtype != msgtype {
            return Ok(());
        }
    }

    payload.stamp(shared.source, shared.operator, shared.group);
    payload.stamp(core.source, core.operator, core.group);

    if let Some(rate) = core.rate.as_mut() {
        rate.pace();
    }

    let out = core
        .out
        .as_mut()
        .ok_or_else(|| Error::Failure("write to closed output".into()))?;
    match out.append(payload)? {
        WriteOutcome::ContainerWritten => {
            handle.containers_out.fetch_add(1, Relaxed);
        }
        WriteOutcome::Buffered => {}
    }
    let total = handle.payloads_out.fetch_add(1, Relaxed) + 1;

    if shared.count > 0 && total % shared.count == 0 {
        close_and_notify(shared, handle, core, CloseType::Count);
    }
    if shared.interval > 0 && now.0.saturating_sub(core.last_sec) >= shared.interval {
        core.last_sec = now.0 - now.0 % shared.interval;
        close_and_notify(shared, handle, core, CloseType::Interval);
    }
    Ok(())
}

/// Close the sink, fire the callback, and install a replacement if the
/// callback provides one.
fn close_and_notify(
    shared: &Shared,
    handle: &OutputHandle,
    core: &mut OutputCore,
    close_type: CloseType,
) {
    if let Some(out) = core.out.as_mut() {
        match out.close() {
            Ok(WriteOutcome::ContainerWritten) => {
                handle.containers_out.fetch_add(1, Relaxed);
            }
            Ok(WriteOutcome::Buffered) => {}
            Err(e) => tracing::warn!(error = %e, "output close failed"),
        }
    }
    core.out = None;

    if let Some(cb) = &shared.closed_fn {
        let mut reopen = None;
        let mut ev = CloseEvent {
            io_type: IoType::Output,
            output_kind: Some(handle.kind()),
            close_type,
            user: handle.user(),
            reopen: &mut reopen,
        };
        cb(&mut ev);
        if let Some(new_out) = reopen {
            core.out = Some(new_out);
        }
    }
}

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use iia_core::{Engine, GenerationFailure, GenerationRequest, OrchestratorState, StateStream};
use parking_lot::Mutex;

/// Something the stub engine did, with when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Load,
    GenerateStart,
    GenerateEnd,
    Free,
}

/// Shared record of every engine call, for asserting on ordering and overlap.
#[derive(Default)]
pub struct CallLog {
    calls: Mutex<Vec<(Call, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    live_handles: AtomicUsize,
    max_live_handles: AtomicUsize,
}

impl CallLog {
    fn record(&self, call: Call) {
        self.calls.lock().push((call, Instant::now()));
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls.lock().iter().filter(|(c, _)| *c == call).count()
    }

    pub fn first(&self, call: Call) -> Option<Instant> {
        self.calls
            .lock()
            .iter()
            .find(|(c, _)| *c == call)
            .map(|(_, at)| *at)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().iter().map(|(c, _)| *c).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.max_live_handles.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> usize {
        self.live_handles.load(Ordering::SeqCst)
    }
}

/// What `txt2img` hands back.
#[derive(Debug, Clone)]
pub enum Output {
    Zeros,
    Nothing,
    Error(String),
    Truncated,
}

pub struct StubEngine {
    log: Arc<CallLog>,
    accept_load: bool,
    output: Output,
    load_delay: Duration,
    generate_delay: Duration,
    loaded: bool,
}

impl StubEngine {
    pub fn new() -> (Self, Arc<CallLog>) {
        let log = Arc::new(CallLog::default());
        let engine = Self {
            log: log.clone(),
            accept_load: true,
            output: Output::Zeros,
            load_delay: Duration::ZERO,
            generate_delay: Duration::ZERO,
            loaded: false,
        };
        (engine, log)
    }

    pub fn rejecting_loads(mut self) -> Self {
        self.accept_load = false;
        self
    }

    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn with_generate_delay(mut self, delay: Duration) -> Self {
        self.generate_delay = delay;
        self
    }
}

impl Engine for StubEngine {
    fn load_model(&mut self, _model_path: &Path, _vae_path: Option<&Path>, _threads: usize) -> bool {
        self.log.enter();
        self.log.record(Call::Load);
        thread::sleep(self.load_delay);
        if self.accept_load {
            self.loaded = true;
            let live = self.log.live_handles.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.max_live_handles.fetch_max(live, Ordering::SeqCst);
        }
        self.log.exit();
        self.accept_load
    }

    fn txt2img(&mut self, request: &GenerationRequest) -> Result<Vec<u8>, GenerationFailure> {
        self.log.enter();
        self.log.record(Call::GenerateStart);
        thread::sleep(self.generate_delay);
        let output = match &self.output {
            Output::Zeros => Ok(vec![0; request.expected_len()]),
            Output::Nothing => Err(GenerationFailure::EmptyOutput),
            Output::Error(reason) => Err(GenerationFailure::Engine(reason.clone())),
            Output::Truncated => Ok(vec![0; request.expected_len() / 2]),
        };
        self.log.record(Call::GenerateEnd);
        self.log.exit();
        output
    }

    fn free_model(&mut self) {
        self.log.enter();
        self.log.record(Call::Free);
        if self.loaded {
            self.loaded = false;
            self.log.live_handles.fetch_sub(1, Ordering::SeqCst);
        }
        self.log.exit();
    }
}

/// A readable stand-in model file.
pub fn model_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"GGUF").unwrap();
    path
}

pub async fn wait_for(
    stream: &mut StateStream,
    predicate: impl FnMut(&OrchestratorState) -> bool,
) -> OrchestratorState {
    tokio::time::timeout(Duration::from_secs(5), stream.wait_for(predicate))
        .await
        .expect("timed out waiting for state")
        .expect("state stream closed")
}

/// Drains snapshots already delivered to `stream`.
pub fn drain(stream: &mut StateStream) -> Vec<OrchestratorState> {
    std::iter::from_fn(|| stream.try_next()).collect()
}

/// Collects snapshots up to and including the first one satisfying `predicate`.
pub async fn collect_until(
    stream: &mut StateStream,
    mut predicate: impl FnMut(&OrchestratorState) -> bool,
) -> Vec<OrchestratorState> {
    let collect = async {
        let mut seen = Vec::new();
        while let Some(state) = stream.next().await {
            let done = predicate(&state);
            seen.push(state);
            if done {
                break;
            }
        }
        seen
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("timed out collecting states")
}

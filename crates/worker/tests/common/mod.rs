//! In-process fakes for the worker's collaborators.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use fluxbot_core::{GenerationResult, JobRequest, SubmitterId};
use fluxbot_engine::{EngineClientError, EngineLifecycle, GenerationClient, ProcessError};
use fluxbot_gpu::{AdmissionConfig, AdmissionController, ProbeUnavailable, ResourceProbe, ResourceUsage};
use fluxbot_worker::{
    AbortController, CompletionLog, JobQueue, JobService, Notice, Notifier, NotifyError, Recipient,
    WorkerConfig, WorkerLoop,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Engine process
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeEngine {
    running: AtomicBool,
    fail_start: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
    kills: AtomicUsize,
    killed: tokio::sync::Notify,
}

impl FakeEngine {
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Resolve once `kill` is called more than `seen` times in total.
    async fn killed_after(&self, seen: usize) {
        loop {
            let notified = self.killed.notified();
            if self.kills() > seen {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl EngineLifecycle for FakeEngine {
    async fn is_running(&self) -> bool {
        self.running()
    }

    async fn start(&self) -> Result<(), ProcessError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(ProcessError::EngineStartTimeout {
                waited: Duration::from_secs(60),
            });
        }
        self.set_running(true);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_running(false);
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.set_running(false);
        self.killed.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Engine client
// ---------------------------------------------------------------------------

/// What the fake engine does with one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    NoOutput,
    FailUpload,
    FailSubmit,
    /// Never completes; fails with a lost connection once the engine is
    /// killed.
    HangUntilKilled,
}

pub struct FakeClient {
    engine: Arc<FakeEngine>,
    output_dir: PathBuf,
    script: Mutex<VecDeque<Behaviour>>,
    current: Mutex<Behaviour>,
    uploads: AtomicUsize,
    submissions: AtomicUsize,
    /// Signalled when an execution starts hanging.
    pub in_flight: tokio::sync::Notify,
}

impl FakeClient {
    pub fn new(engine: Arc<FakeEngine>, output_dir: PathBuf) -> Self {
        Self {
            engine,
            output_dir,
            script: Mutex::new(VecDeque::new()),
            current: Mutex::new(Behaviour::Succeed),
            uploads: AtomicUsize::new(0),
            submissions: AtomicUsize::new(0),
            in_flight: tokio::sync::Notify::new(),
        }
    }

    /// Behaviours for the next jobs, in order. Later jobs succeed.
    pub fn script(&self, behaviours: impl IntoIterator<Item = Behaviour>) {
        self.script.lock().unwrap().extend(behaviours);
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    fn current(&self) -> Behaviour {
        *self.current.lock().unwrap()
    }
}

#[async_trait]
impl GenerationClient for FakeClient {
    async fn upload_asset(&self, path: &Path) -> Result<String, EngineClientError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        let behaviour = self.script.lock().unwrap().pop_front().unwrap_or(Behaviour::Succeed);
        *self.current.lock().unwrap() = behaviour;

        if behaviour == Behaviour::FailUpload || !path.exists() {
            return Err(EngineClientError::UploadError("connection refused".into()));
        }
        Ok(format!("uploaded_{n}.jpg"))
    }

    async fn submit(&self, _asset_name: &str, _prompt: &str) -> Result<String, EngineClientError> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.current() == Behaviour::FailSubmit {
            return Err(EngineClientError::SubmissionError("engine rejected the workflow".into()));
        }
        Ok(format!("exec-{n}"))
    }

    async fn await_completion(&self, execution_id: &str) -> Result<GenerationResult, EngineClientError> {
        match self.current() {
            Behaviour::HangUntilKilled => {
                let seen = self.engine.kills();
                self.in_flight.notify_one();
                self.engine.killed_after(seen).await;
                Err(EngineClientError::ConnectionLost("engine went away".into()))
            }
            Behaviour::NoOutput => Ok(GenerationResult::no_output()),
            _ => {
                let output = self.output_dir.join(format!("output_{execution_id}.png"));
                tokio::fs::write(&output, b"png")
                    .await
                    .map_err(|e| EngineClientError::RetrievalError(e.to_string()))?;
                Ok(GenerationResult::produced(output))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Recipient, Notice)>>,
    /// For each `Completed` notice, whether its file existed at delivery.
    outputs_present: Mutex<Vec<bool>>,
    failing: AtomicBool,
    attempts: AtomicUsize,
    queued_latency: Mutex<Option<Duration>>,
}

impl RecordingNotifier {
    /// Make every delivery fail from now on.
    pub fn fail_all(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Hold every `Queued` delivery for `latency` before it lands.
    pub fn slow_queued(&self, latency: Duration) {
        *self.queued_latency.lock().unwrap() = Some(latency);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(Recipient, Notice)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn to(&self, submitter: SubmitterId) -> Vec<Notice> {
        self.sent()
            .into_iter()
            .filter(|(r, _)| r.submitter == submitter)
            .map(|(_, n)| n)
            .collect()
    }

    pub fn terminal_count(&self, submitter: SubmitterId) -> usize {
        self.to(submitter).iter().filter(|n| n.is_terminal()).count()
    }

    pub fn count(&self, pred: impl Fn(&Notice) -> bool) -> usize {
        self.sent().iter().filter(|(_, n)| pred(n)).count()
    }

    pub fn outputs_present(&self) -> Vec<bool> {
        self.outputs_present.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: Recipient, notice: Notice) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError("chat unreachable".into()));
        }
        let latency = *self.queued_latency.lock().unwrap();
        if let (Notice::Queued { .. }, Some(latency)) = (&notice, latency) {
            tokio::time::sleep(latency).await;
        }
        if let Notice::Completed { output } = &notice {
            self.outputs_present.lock().unwrap().push(output.exists());
        }
        self.sent.lock().unwrap().push((recipient, notice));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GPU probe
// ---------------------------------------------------------------------------

/// Replays used-percent readings, repeating the last one.
pub struct ScriptedProbe {
    readings: Mutex<VecDeque<Option<u64>>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(readings: impl IntoIterator<Item = Option<u64>>) -> Self {
        Self {
            readings: Mutex::new(readings.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceProbe for ScriptedProbe {
    async fn usage(&self) -> Result<ResourceUsage, ProbeUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reading = {
            let mut readings = self.readings.lock().unwrap();
            if readings.len() > 1 {
                readings.pop_front().flatten()
            } else {
                readings.front().copied().flatten()
            }
        };
        reading
            .map(|used_mb| ResourceUsage {
                used_mb,
                total_mb: 100,
            })
            .ok_or_else(|| ProbeUnavailable::new("no GPU"))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub const JOB_ESTIMATE: Duration = Duration::from_secs(90);

pub struct Harness {
    pub dir: TempDir,
    pub queue: Arc<JobQueue>,
    pub engine: Arc<FakeEngine>,
    pub client: Arc<FakeClient>,
    pub notifier: Arc<RecordingNotifier>,
    pub probe: Arc<ScriptedProbe>,
    pub completions: Arc<CompletionLog>,
    pub service: JobService,
}

impl Harness {
    /// GPU memory always free (5 %).
    pub fn new() -> Self {
        Self::with_probe(ScriptedProbe::new([Some(5)]))
    }

    pub fn with_probe(probe: ScriptedProbe) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(JobQueue::new());
        let engine = Arc::new(FakeEngine::default());
        let client = Arc::new(FakeClient::new(Arc::clone(&engine), dir.path().to_path_buf()));
        let notifier = Arc::new(RecordingNotifier::default());
        let completions = Arc::new(CompletionLog::new(dir.path().join("completions.log")));

        let service = JobService::new(
            Arc::clone(&queue),
            AbortController::new(Arc::clone(&queue), engine.clone()),
            notifier.clone(),
            Arc::clone(&completions),
        )
        .with_job_estimate(JOB_ESTIMATE);

        Self {
            dir,
            queue,
            engine,
            client,
            notifier,
            probe: Arc::new(probe),
            completions,
            service,
        }
    }

    pub fn worker(&self, config: WorkerConfig) -> WorkerLoop {
        let admission = AdmissionController::new(
            self.probe.clone(),
            AdmissionConfig {
                max_used_percent: 20.0,
                poll_interval: Duration::from_millis(10),
            },
        );
        WorkerLoop::new(
            Arc::clone(&self.queue),
            self.engine.clone(),
            self.client.clone(),
            Arc::new(admission),
            self.notifier.clone(),
            Arc::clone(&self.completions),
            config,
        )
    }

    /// A request from `submitter` with its input image written to disk.
    pub fn request(&self, submitter: SubmitterId) -> JobRequest {
        let input_path = self.dir.path().join(format!("input_{submitter}.jpg"));
        std::fs::write(&input_path, b"jpeg").unwrap();
        JobRequest {
            submitter,
            prompt: format!("prompt from {submitter}"),
            input_path,
            reply_to: Some(submitter * 100),
        }
    }

    pub fn input_path(&self, submitter: SubmitterId) -> PathBuf {
        self.dir.path().join(format!("input_{submitter}.jpg"))
    }

    /// Output images currently in the working directory.
    pub fn outputs(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("output_"))
            })
            .collect()
    }
}

/// Poll `cond` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

//! Download lifecycle: task tracking, progress, resume tokens.
//!
//! # Design
//! `DownloadController` tracks one active task id per client. Every download
//! or resume gets a fresh `TaskId`; beginning a new one supersedes the old.
//! A superseded task's progress is discarded by id comparison, and the task
//! stops at its next chunk with a `Failed` event that still carries a resume
//! token, so nothing already on disk is lost.
//!
//! Body bytes stream into a temp file under the configured download
//! directory. On failure after partial progress the file is kept and a
//! `ResumeToken` describing it is handed to the caller; on failure without
//! progress the file is removed.

use std::fmt;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, TransferResult};
use crate::http::{HttpMethod, HttpRequest};
use crate::transport::HttpTransport;

/// Identity of one download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "download-{}", self.0)
    }
}

/// Progress of the tracked download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Fraction of the expected total, in `[0, 1]`.
    Determinate(f32),
    /// The server did not announce a length.
    Indeterminate { bytes_written: u64 },
}

/// One event on a download stream. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress(Progress),
    /// The body is complete at this path; the caller owns the file.
    Completed(PathBuf),
    Failed {
        error: NetworkError,
        resume_token: Option<ResumeToken>,
    },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress(_))
    }
}

/// Opaque data that lets a failed download continue where it stopped.
#[derive(Clone, PartialEq, Eq)]
pub struct ResumeToken(Bytes);

impl ResumeToken {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    fn encode(data: &ResumeData) -> Option<Self> {
        match serde_json::to_vec(data) {
            Ok(bytes) => Some(Self(bytes.into())),
            Err(e) => {
                warn!(error = %e, "could not encode resume data");
                None
            }
        }
    }

    pub(crate) fn decode(&self) -> TransferResult<ResumeData> {
        serde_json::from_slice(&self.0)
            .map_err(|e| NetworkError::Decode(format!("unreadable resume token: {e}")))
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumeToken({} bytes)", self.0.len())
    }
}

/// Contents of a resume token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResumeData {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub temp_path: PathBuf,
    pub bytes_received: u64,
    pub total_bytes: Option<u64>,
    /// `ETag` or `Last-Modified` of the partial response, sent as `If-Range`.
    pub validator: Option<String>,
}

/// Lifecycle phase of the tracked download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    Idle,
    InFlight,
    Completed,
    Failed,
}

/// Snapshot of what the controller is tracking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadState {
    pub active_task: Option<TaskId>,
    pub last_progress: f32,
    pub phase: DownloadPhase,
}

/// Tracks the single in-flight download of a client.
#[derive(Debug)]
pub struct DownloadController {
    next_id: AtomicU64,
    state: Mutex<DownloadState>,
}

impl DownloadController {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(DownloadState {
                active_task: None,
                last_progress: 0.0,
                phase: DownloadPhase::Idle,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DownloadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id without tracking it.
    pub fn allocate(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Track `task` as the active download, superseding any other.
    pub fn begin(&self, task: TaskId) {
        let mut state = self.lock();
        if let Some(previous) = state.active_task.replace(task) {
            info!(%previous, %task, "download superseded");
        }
        state.last_progress = 0.0;
        state.phase = DownloadPhase::InFlight;
    }

    pub fn is_current(&self, task: TaskId) -> bool {
        self.lock().active_task == Some(task)
    }

    /// Record progress for `task`. Returns false if `task` is not tracked,
    /// in which case the event must be dropped.
    pub fn record_progress(&self, task: TaskId, progress: Progress) -> bool {
        let mut state = self.lock();
        if state.active_task != Some(task) {
            return false;
        }
        if let Progress::Determinate(fraction) = progress {
            state.last_progress = state.last_progress.max(fraction);
        }
        true
    }

    /// Mark `task` terminal if it is still the tracked one.
    pub fn finish(&self, task: TaskId, phase: DownloadPhase) {
        let mut state = self.lock();
        if state.active_task == Some(task) {
            state.active_task = None;
            state.phase = phase;
        }
    }

    /// Stop tracking the active download. Its task winds down at the next
    /// chunk boundary.
    pub fn cancel(&self) -> Option<TaskId> {
        let mut state = self.lock();
        let cancelled = state.active_task.take();
        if cancelled.is_some() {
            state.phase = DownloadPhase::Idle;
        }
        cancelled
    }

    pub fn state(&self) -> DownloadState {
        *self.lock()
    }
}

impl Default for DownloadController {
    fn default() -> Self {
        Self::new()
    }
}

/// Events of one download, in order, ending with exactly one terminal event.
#[derive(Debug)]
pub struct DownloadStream {
    task: TaskId,
    events: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl DownloadStream {
    pub(crate) fn new(task: TaskId, events: mpsc::UnboundedReceiver<DownloadEvent>) -> Self {
        Self { task, events }
    }

    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Wait for the terminal event, skipping progress.
    pub async fn finished(mut self) -> Option<DownloadEvent> {
        while let Some(event) = self.next().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }
}

impl Stream for DownloadStream {
    type Item = DownloadEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DownloadEvent>> {
        self.events.poll_recv(cx)
    }
}

/// A download ready to run.
#[derive(Debug, Clone)]
pub(crate) struct DownloadJob {
    pub task: TaskId,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub download_dir: PathBuf,
    pub resume: Option<ResumeData>,
}

/// Terminal failure of a download run.
#[derive(Debug)]
pub(crate) struct DownloadFailure {
    pub error: NetworkError,
    pub resume_token: Option<ResumeToken>,
}

impl DownloadFailure {
    fn plain(error: NetworkError) -> Self {
        Self { error, resume_token: None }
    }

    /// Remove the partial file behind the resume token, for callers that
    /// have no way to hand the token on.
    pub(crate) async fn discard_partial(self) -> NetworkError {
        if let Some(data) = self.resume_token.as_ref().and_then(|token| token.decode().ok()) {
            if let Err(e) = tokio::fs::remove_file(&data.temp_path).await {
                debug!(path = %data.temp_path.display(), error = %e, "could not remove partial file");
            }
        }
        self.error
    }
}

/// Fraction of `total` covered by `written`, clamped to `[0, 1]`.
pub(crate) fn fraction(written: u64, total: u64) -> f32 {
    if total == 0 {
        return 1.0;
    }
    (written as f64 / total as f64).min(1.0) as f32
}

struct Target {
    file: File,
    path: PathBuf,
    offset: u64,
}

fn io_failure(context: &str, err: std::io::Error) -> DownloadFailure {
    DownloadFailure::plain(NetworkError::Transport(format!("{context}: {err}")))
}

async fn create_target(dir: &Path) -> Result<Target, DownloadFailure> {
    let named = tempfile::Builder::new()
        .prefix("download-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(|e| io_failure("could not create temp file", e))?;
    let (file, path) = named
        .keep()
        .map_err(|e| io_failure("could not keep temp file", e.error))?;
    Ok(Target {
        file: File::from_std(file),
        path,
        offset: 0,
    })
}

/// Whether `path` resolves to a file inside `dir`.
async fn is_within(dir: &Path, path: &Path) -> bool {
    let (Ok(dir), Ok(path)) = (tokio::fs::canonicalize(dir).await, tokio::fs::canonicalize(path).await) else {
        return false;
    };
    path.starts_with(&dir) && path != dir
}

/// Reopen the partial file of `resume`, or start fresh when it is gone,
/// shorter than recorded, or outside the download directory.
async fn reopen_target(dir: &Path, resume: &ResumeData) -> Result<Target, DownloadFailure> {
    if !is_within(dir, &resume.temp_path).await {
        if tokio::fs::try_exists(&resume.temp_path).await.unwrap_or(false) {
            warn!(path = %resume.temp_path.display(), dir = %dir.display(), "resume token points outside the download directory, restarting download");
        } else {
            debug!(path = %resume.temp_path.display(), "partial file missing, restarting download");
        }
        return create_target(dir).await;
    }
    let on_disk = tokio::fs::metadata(&resume.temp_path).await.map(|m| m.len()).ok();
    match on_disk {
        Some(len) if len >= resume.bytes_received => {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&resume.temp_path)
                .await
                .map_err(|e| io_failure("could not reopen partial file", e))?;
            file.set_len(resume.bytes_received)
                .await
                .map_err(|e| io_failure("could not trim partial file", e))?;
            file.seek(SeekFrom::Start(resume.bytes_received))
                .await
                .map_err(|e| io_failure("could not seek partial file", e))?;
            Ok(Target {
                file,
                path: resume.temp_path.clone(),
                offset: resume.bytes_received,
            })
        }
        _ => {
            debug!(path = %resume.temp_path.display(), "partial file too short, restarting download");
            create_target(dir).await
        }
    }
}

/// Parse the first byte and total of `Content-Range: bytes a-b/total`.
fn parse_content_range(value: &str) -> Option<(u64, Option<u64>)> {
    let unit_range = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = unit_range.split_once('/')?;
    let (start, _) = range.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = total.trim().parse().ok();
    Some((start, total))
}

/// Drive one download to a terminal outcome.
///
/// `on_progress` is called after every chunk; returning `false` stops the
/// transfer as superseded.
pub(crate) async fn run_download<T, F>(
    transport: &T,
    job: DownloadJob,
    mut on_progress: F,
) -> Result<PathBuf, DownloadFailure>
where
    T: HttpTransport,
    F: FnMut(Progress) -> bool + Send,
{
    let mut target = match &job.resume {
        Some(resume) => reopen_target(&job.download_dir, resume).await?,
        None => create_target(&job.download_dir).await?,
    };

    let mut request = HttpRequest::new(HttpMethod::Get, job.url.clone());
    request.headers = job.headers.clone();
    request.timeout = job.timeout;
    if target.offset > 0 {
        request.headers.push(("Range".to_string(), format!("bytes={}-", target.offset)));
        if let Some(validator) = job.resume.as_ref().and_then(|r| r.validator.clone()) {
            request.headers.push(("If-Range".to_string(), validator));
        }
    }

    debug!(task = %job.task, url = %job.url, offset = target.offset, "download request");
    let mut partial = Partial {
        job: &job,
        path: target.path.clone(),
        received: target.offset,
        total: job.resume.as_ref().and_then(|r| r.total_bytes),
        validator: job.resume.as_ref().and_then(|r| r.validator.clone()),
    };

    let response = match transport.send(request).await {
        Ok(response) => response,
        Err(e) => return Err(partial.fail(&mut target.file, e.into()).await),
    };

    if !(200..=299).contains(&response.status) {
        let code = response.status;
        let body = match response.collect().await {
            Ok(response) => response.text(),
            Err(_) => String::new(),
        };
        discard(target.file, &target.path).await;
        return Err(DownloadFailure::plain(NetworkError::ServerStatus { code, body }));
    }

    partial.validator = response
        .header("etag")
        .or_else(|| response.header("last-modified"))
        .map(str::to_string)
        .or(partial.validator);

    if response.status == 206 && target.offset > 0 {
        let range = response.header("content-range").and_then(parse_content_range);
        match range {
            Some((start, _)) if start != target.offset => {
                let err = NetworkError::Transport(format!(
                    "server resumed at byte {start}, expected {}",
                    target.offset
                ));
                return Err(partial.fail(&mut target.file, err).await);
            }
            Some((_, Some(total))) => partial.total = Some(total),
            _ => partial.total = response.content_length.map(|len| len + target.offset),
        }
    } else {
        if target.offset > 0 {
            debug!(task = %job.task, "server ignored range, restarting from zero");
            let restart = async {
                target.file.set_len(0).await?;
                target.file.seek(SeekFrom::Start(0)).await
            };
            if let Err(e) = restart.await {
                return Err(io_failure("could not truncate partial file", e));
            }
            target.offset = 0;
            partial.received = 0;
        }
        partial.total = response.content_length;
    }

    let mut body = response.body;
    let mut last_reported = None;
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Err(partial.fail(&mut target.file, e.into()).await),
        };
        if let Err(e) = target.file.write_all(&chunk).await {
            return Err(partial.fail(&mut target.file, io_error(e)).await);
        }
        partial.received += chunk.len() as u64;

        let progress = match partial.total {
            Some(total) => Progress::Determinate(fraction(partial.received, total)),
            None => Progress::Indeterminate { bytes_written: partial.received },
        };
        last_reported = Some(progress);
        if !on_progress(progress) {
            let err = NetworkError::Transport("download superseded".to_string());
            return Err(partial.fail(&mut target.file, err).await);
        }
    }

    if let Some(total) = partial.total {
        if partial.received < total {
            let err = NetworkError::Transport(format!(
                "connection closed after {} of {total} bytes",
                partial.received
            ));
            return Err(partial.fail(&mut target.file, err).await);
        }
        if last_reported != Some(Progress::Determinate(1.0)) {
            on_progress(Progress::Determinate(1.0));
        }
    }

    if let Err(e) = target.file.flush().await {
        return Err(partial.fail(&mut target.file, io_error(e)).await);
    }
    info!(task = %job.task, bytes = partial.received, path = %target.path.display(), "download completed");
    Ok(target.path)
}

fn io_error(err: std::io::Error) -> NetworkError {
    NetworkError::Transport(format!("could not write download: {err}"))
}

async fn discard(file: File, path: &Path) {
    drop(file);
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %e, "could not remove temp file");
    }
}

/// What has reached disk so far, for building a resume token.
struct Partial<'a> {
    job: &'a DownloadJob,
    path: PathBuf,
    received: u64,
    total: Option<u64>,
    validator: Option<String>,
}

impl Partial<'_> {
    async fn fail(&self, file: &mut File, error: NetworkError) -> DownloadFailure {
        if let Err(e) = file.flush().await {
            warn!(task = %self.job.task, error = %e, "could not flush partial download");
        }
        if self.received == 0 {
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                debug!(path = %self.path.display(), error = %e, "could not remove temp file");
            }
            warn!(task = %self.job.task, error = %error, "download failed");
            return DownloadFailure::plain(error);
        }

        warn!(task = %self.job.task, error = %error, received = self.received, "download failed with partial data");
        let resume_token = ResumeToken::encode(&ResumeData {
            url: self.job.url.clone(),
            headers: self.job.headers.clone(),
            temp_path: self.path.clone(),
            bytes_received: self.received,
            total_bytes: self.total,
            validator: self.validator.clone(),
        });
        DownloadFailure { error, resume_token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_is_clamped_and_guarded() {
        assert_eq!(fraction(0, 10), 0.0);
        assert_eq!(fraction(5, 10), 0.5);
        assert_eq!(fraction(15, 10), 1.0);
        assert_eq!(fraction(0, 0), 1.0);
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range("bytes 100-199/200"), Some((100, Some(200))));
        assert_eq!(parse_content_range("bytes 5-9/*"), Some((5, None)));
        assert_eq!(parse_content_range("items 1-2/3"), None);
        assert_eq!(parse_content_range("bytes garbage"), None);
    }

    #[test]
    fn begin_supersedes_previous_task() {
        let controller = DownloadController::new();
        let first = controller.allocate();
        let second = controller.allocate();
        assert_ne!(first, second);

        controller.begin(first);
        assert!(controller.is_current(first));
        controller.begin(second);
        assert!(!controller.is_current(first));
        assert!(controller.is_current(second));

        assert!(!controller.record_progress(first, Progress::Determinate(0.9)));
        assert!(controller.record_progress(second, Progress::Determinate(0.3)));
        assert_eq!(controller.state().last_progress, 0.3);
    }

    #[test]
    fn finish_only_applies_to_tracked_task() {
        let controller = DownloadController::new();
        let stale = controller.allocate();
        let live = controller.allocate();
        controller.begin(stale);
        controller.begin(live);

        controller.finish(stale, DownloadPhase::Failed);
        assert_eq!(controller.state().phase, DownloadPhase::InFlight);

        controller.finish(live, DownloadPhase::Completed);
        let state = controller.state();
        assert_eq!(state.phase, DownloadPhase::Completed);
        assert!(state.active_task.is_none());
    }

    #[test]
    fn last_progress_never_decreases() {
        let controller = DownloadController::new();
        let task = controller.allocate();
        controller.begin(task);
        controller.record_progress(task, Progress::Determinate(0.6));
        controller.record_progress(task, Progress::Determinate(0.4));
        controller.record_progress(task, Progress::Indeterminate { bytes_written: 9 });
        assert_eq!(controller.state().last_progress, 0.6);
    }

    #[test]
    fn cancel_stops_tracking() {
        let controller = DownloadController::new();
        assert!(controller.cancel().is_none());
        let task = controller.allocate();
        controller.begin(task);
        assert_eq!(controller.cancel(), Some(task));
        assert!(!controller.is_current(task));
        assert_eq!(controller.state().phase, DownloadPhase::Idle);
    }

    #[test]
    fn resume_token_round_trips_and_rejects_garbage() {
        let data = ResumeData {
            url: "http://h/file".into(),
            headers: vec![("x-a".into(), "1".into())],
            temp_path: PathBuf::from("/tmp/download-x.part"),
            bytes_received: 42,
            total_bytes: Some(100),
            validator: Some("\"v1\"".into()),
        };
        let token = ResumeToken::encode(&data).unwrap();
        assert!(!token.as_bytes().is_empty());
        assert_eq!(token.decode().unwrap(), data);

        let garbage = ResumeToken::from_bytes(&b"not a token"[..]);
        assert!(matches!(garbage.decode(), Err(NetworkError::Decode(_))));
    }
}

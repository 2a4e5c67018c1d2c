//! The [`BuildContext`] carries telemetry and control through a navmesh build.

use std::{
    cell::RefCell,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// The stages of a navmesh build, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum BuildStage {
    /// Validating the config and classifying the input triangles.
    Ingest,
    /// Voxelizing the triangles into a [`Heightfield`](crate::Heightfield).
    Rasterize,
    /// Removing spans an agent cannot stand on.
    Filter,
    /// Compacting, eroding and partitioning the walkable spans into regions.
    Partition,
    /// Tracing and simplifying the region outlines.
    Contour,
    /// Building the [`PolygonNavmesh`](crate::PolygonNavmesh).
    PolygonBuild,
    /// Building the [`DetailNavmesh`](crate::DetailNavmesh).
    DetailBuild,
}

impl BuildStage {
    /// All stages in execution order.
    pub const ALL: [BuildStage; 7] = [
        BuildStage::Ingest,
        BuildStage::Rasterize,
        BuildStage::Filter,
        BuildStage::Partition,
        BuildStage::Contour,
        BuildStage::PolygonBuild,
        BuildStage::DetailBuild,
    ];

    /// A short human-readable name of the stage.
    pub fn name(self) -> &'static str {
        match self {
            BuildStage::Ingest => "ingest",
            BuildStage::Rasterize => "rasterize",
            BuildStage::Filter => "filter",
            BuildStage::Partition => "partition",
            BuildStage::Contour => "contour",
            BuildStage::PolygonBuild => "polygon mesh",
            BuildStage::DetailBuild => "detail mesh",
        }
    }

    /// Approximate share of the whole build that is done once this stage has finished.
    pub fn completed_fraction(self) -> f32 {
        match self {
            BuildStage::Ingest => 0.05,
            BuildStage::Rasterize => 0.2,
            BuildStage::Filter => 0.3,
            BuildStage::Partition => 0.65,
            BuildStage::Contour => 0.8,
            BuildStage::PolygonBuild => 0.9,
            BuildStage::DetailBuild => 1.0,
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Severity of a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum LogLevel {
    /// Detailed progress information.
    Debug,
    /// General progress information.
    Info,
    /// Something was skipped or degraded, but the build continues.
    Warn,
    /// The build failed.
    Error,
}

/// A message recorded by a [`BuildContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct LogEntry {
    /// Severity of the message
    pub level: LogLevel,
    /// The message itself
    pub message: String,
}

/// Progress reported to the callback of a [`BuildContext`] after each finished stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuildProgress {
    /// The stage that just finished
    pub stage: BuildStage,
    /// Share of the build that is done, in `(0, 1]`
    pub fraction: f32,
}

/// A shared flag used to cancel a running build from another thread.
///
/// Cancellation is checked between stages, so a running stage is always finished first.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every build observing this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

type ProgressCallback = Box<dyn FnMut(BuildProgress) + Send>;

/// Session state of a navmesh build: per-stage timers, a log, progress reporting and cancellation.
///
/// A context is passed explicitly to [`build_navmesh`](crate::build_navmesh).
/// Timers and log entries accumulate over several builds until [`BuildContext::reset`] is called.
#[derive(Default)]
pub struct BuildContext {
    stage_durations: [Duration; BuildStage::ALL.len()],
    total_duration: Duration,
    log: Vec<LogEntry>,
    progress: Option<ProgressCallback>,
    cancellation: CancellationToken,
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("stage_durations", &self.stage_durations)
            .field("total_duration", &self.total_duration)
            .field("log", &self.log)
            .field("progress", &self.progress.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

impl BuildContext {
    /// Creates an empty context without a progress callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the callback invoked after every finished stage.
    pub fn with_progress(mut self, callback: impl FnMut(BuildProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Makes the context observe the given cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// A handle to the token this context observes. Cancelling it stops the build at the next stage boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Records a message and forwards it to `tracing`.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        emit(level, &message);
        self.log.push(LogEntry { level, message });
    }

    /// All messages recorded so far.
    pub fn log_entries(&self) -> &[LogEntry] {
        &self.log
    }

    /// Time accumulated in the given stage.
    pub fn stage_duration(&self, stage: BuildStage) -> Duration {
        self.stage_durations[stage.index()]
    }

    /// Time accumulated by whole builds, including the bookkeeping between stages.
    pub fn total_duration(&self) -> Duration {
        self.total_duration
    }

    /// Clears the timers and the log. The progress callback and cancellation token are kept.
    pub fn reset(&mut self) {
        self.stage_durations = Default::default();
        self.total_duration = Duration::ZERO;
        self.log.clear();
    }

    /// Runs `f` and adds its running time to the timer of `stage`.
    /// Messages passed to [`stage_log`] while `f` runs are appended to the log.
    pub(crate) fn time_stage<T>(&mut self, stage: BuildStage, f: impl FnOnce(&mut Self) -> T) -> T {
        let outer = STAGE_LOG.replace(Some(Vec::new()));
        let start = Instant::now();
        let result = f(self);
        self.stage_durations[stage.index()] += start.elapsed();
        let recorded = STAGE_LOG.replace(outer).unwrap_or_default();
        self.log.extend(recorded);
        result
    }

    pub(crate) fn add_total_duration(&mut self, duration: Duration) {
        self.total_duration += duration;
    }

    /// Notifies the progress callback that `stage` has finished.
    pub(crate) fn report_progress(&mut self, stage: BuildStage) {
        if let Some(progress) = &mut self.progress {
            progress(BuildProgress {
                stage,
                fraction: stage.completed_fraction(),
            });
        }
    }
}

thread_local! {
    static STAGE_LOG: RefCell<Option<Vec<LogEntry>>> = const { RefCell::new(None) };
}

fn emit(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!("{message}"),
        LogLevel::Info => tracing::info!("{message}"),
        LogLevel::Warn => tracing::warn!("{message}"),
        LogLevel::Error => tracing::error!("{message}"),
    }
}

/// Reports a problem found inside a stage method.
///
/// The message is forwarded to `tracing`. If a [`BuildContext`] is running the stage on this thread,
/// it also lands in the context's log.
pub(crate) fn stage_log(level: LogLevel, message: impl Into<String>) {
    let message = message.into();
    emit(level, &message);
    STAGE_LOG.with_borrow_mut(|log| {
        if let Some(log) = log {
            log.push(LogEntry { level, message });
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn stages_are_ordered_and_fractions_increase() {
        for pair in BuildStage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].completed_fraction() < pair[1].completed_fraction());
        }
        assert_eq!(BuildStage::DetailBuild.completed_fraction(), 1.0);
        assert_eq!(BuildStage::PolygonBuild.to_string(), "polygon mesh");
    }

    #[test]
    fn log_is_recorded_and_reset() {
        let mut ctx = BuildContext::new();
        ctx.log(LogLevel::Info, "Building navigation:");
        ctx.log(LogLevel::Warn, format!("{} contours dropped", 2));
        assert_eq!(ctx.log_entries().len(), 2);
        assert_eq!(ctx.log_entries()[1], LogEntry {
            level: LogLevel::Warn,
            message: "2 contours dropped".to_string(),
        });
        ctx.reset();
        assert!(ctx.log_entries().is_empty());
        assert_eq!(ctx.total_duration(), Duration::ZERO);
    }

    #[test]
    fn stage_timers_accumulate() {
        let mut ctx = BuildContext::new();
        let value = ctx.time_stage(BuildStage::Contour, |_| {
            std::thread::sleep(Duration::from_millis(2));
            7
        });
        assert_eq!(value, 7);
        assert!(ctx.stage_duration(BuildStage::Contour) >= Duration::from_millis(2));
        assert_eq!(ctx.stage_duration(BuildStage::Rasterize), Duration::ZERO);
    }

    #[test]
    fn stage_messages_reach_the_log() {
        stage_log(LogLevel::Warn, "outside of any stage");
        let mut ctx = BuildContext::new();
        ctx.time_stage(BuildStage::Contour, |ctx| {
            ctx.log(LogLevel::Info, "tracing outlines");
            stage_log(LogLevel::Warn, "Dropping degenerate contour of region 3 with 2 vertices.");
        });
        let messages: Vec<_> = ctx
            .log_entries()
            .iter()
            .map(|entry| (entry.level, entry.message.as_str()))
            .collect();
        assert_eq!(messages, [
            (LogLevel::Info, "tracing outlines"),
            (
                LogLevel::Warn,
                "Dropping degenerate contour of region 3 with 2 vertices."
            ),
        ]);

        stage_log(LogLevel::Warn, "after the stage");
        assert_eq!(ctx.log_entries().len(), 2);
    }

    #[test]
    fn progress_callback_receives_stages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut ctx = BuildContext::new().with_progress(move |progress| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(progress);
            }
        });
        ctx.report_progress(BuildStage::Ingest);
        ctx.report_progress(BuildStage::DetailBuild);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].stage, BuildStage::Ingest);
        assert_eq!(seen[1].fraction, 1.0);
    }

    #[test]
    fn cancellation_is_shared() {
        let token = CancellationToken::new();
        let ctx = BuildContext::new().with_cancellation(token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.cancellation_token().is_cancelled());
    }
}

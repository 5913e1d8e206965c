//! Bounded-channel plumbing shared by every stage.
//!
//! Each stage runs as its own task, reads a [`RecordStream`] and, optionally,
//! produces another one. Errors travel in-band: a failing stage pushes its
//! error downstream and reports [`PatchError::Aborted`] itself, so the last
//! stage in a pipeline always sees the root cause.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::PatchError;

pub type RecordStream<T> = mpsc::Receiver<Result<T, PatchError>>;
pub type RecordSink<T> = mpsc::Sender<Result<T, PatchError>>;

/// A bounded stream whose capacity is the high-water mark.
pub fn channel<T>(high_water_mark: usize) -> (RecordSink<T>, RecordStream<T>) {
    mpsc::channel(high_water_mark.max(1))
}

/// A running stage: the records it emits plus its completion signal.
pub struct Stage<T, R> {
    pub output: RecordStream<T>,
    pub task: StageTask<R>,
}

pub struct StageTask<R> {
    name: &'static str,
    handle: JoinHandle<Result<R, PatchError>>,
}

impl<R> StageTask<R> {
    pub(crate) fn new(name: &'static str, handle: JoinHandle<Result<R, PatchError>>) -> Self {
        Self { name, handle }
    }

    /// Wait for the stage to finish.
    pub async fn finish(self) -> Result<R, PatchError> {
        self.handle.await.map_err(|e| PatchError::Task {
            stage: self.name,
            reason: e.to_string(),
        })?
    }
}

impl<T, R> Stage<T, R> {
    /// Drop the output and wait for completion. Only useful for stages whose
    /// output is passthrough-only.
    pub async fn finish(self) -> Result<R, PatchError> {
        drop(self.output);
        self.task.finish().await
    }
}

/// Combine a stage's result with the result of the stage feeding it,
/// preferring whichever error is not a mere abort notice.
pub fn settle<A, B>(
    downstream: Result<A, PatchError>,
    upstream: Result<B, PatchError>,
) -> Result<(A, B), PatchError> {
    match (downstream, upstream) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(down), Err(up)) if down.is_aborted() => Err(up),
        (Err(down), _) => Err(down),
        (Ok(_), Err(up)) => Err(up),
    }
}

/// Push `err` downstream if anyone is listening. Returns what the failing
/// stage itself should report.
pub(crate) async fn forward_failure<T>(
    sink: Option<&RecordSink<T>>,
    stage: &'static str,
    err: PatchError,
) -> PatchError {
    tracing::error!(stage, error = %err, "pipeline stage failed");
    let Some(sink) = sink else {
        return err;
    };
    match sink.send(Err(err)).await {
        Ok(()) => PatchError::Aborted(stage),
        Err(mpsc::error::SendError(Err(err))) => err,
        Err(mpsc::error::SendError(Ok(_))) => PatchError::Aborted(stage),
    }
}

/// [`forward_failure`] for stages running on a blocking thread.
pub(crate) fn forward_failure_blocking<T>(
    sink: &RecordSink<T>,
    stage: &'static str,
    err: PatchError,
) -> PatchError {
    tracing::error!(stage, error = %err, "pipeline stage failed");
    match sink.blocking_send(Err(err)) {
        Ok(()) => PatchError::Aborted(stage),
        Err(mpsc::error::SendError(Err(err))) => err,
        Err(mpsc::error::SendError(Ok(_))) => PatchError::Aborted(stage),
    }
}

/// Optional downstream for stages whose re-emission is switchable. A
/// consumer that hangs up early just stops receiving.
pub(crate) struct Passthrough<T> {
    sink: Option<RecordSink<T>>,
}

impl<T> Passthrough<T> {
    /// Returns the passthrough handle and the stream callers see.
    pub(crate) fn new(enabled: bool, high_water_mark: usize) -> (Self, RecordStream<T>) {
        let (sink, output) = channel(high_water_mark);
        let sink = enabled.then_some(sink);
        (Self { sink }, output)
    }

    pub(crate) async fn emit(&mut self, record: T) {
        if let Some(sink) = &self.sink {
            if sink.send(Ok(record)).await.is_err() {
                tracing::debug!("passthrough consumer went away");
                self.sink = None;
            }
        }
    }

    pub(crate) async fn fail(&self, stage: &'static str, err: PatchError) -> PatchError {
        forward_failure(self.sink.as_ref(), stage, err).await
    }
}

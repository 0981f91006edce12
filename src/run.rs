use crate::checkpoint::{CheckpointStore, StoredWatermark};
use crate::error::{
    AppendError, FatalError, MalformedRecord, RunFailure, SourceError, WriteFailure,
};
use crate::mapper::RecordMapper;
use crate::source::{EventSource, EventStore, RawEventRow};
use crate::writer::LineSink;
use std::ops::ControlFlow;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedStage {
    Connection,
    Query,
    Malformed,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed(FailedStage),
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Failed(RunFailure),
}

/// Summary of one extraction pass.
#[derive(Debug)]
pub struct RunReport {
    /// Watermark loaded at the start of the run.
    pub started_from: i64,
    /// Timestamp of the last line written during this run (in memory; only
    /// persisted when the run completed).
    pub watermark: i64,
    pub exported: usize,
    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    pub fn state(&self) -> RunState {
        match &self.outcome {
            RunOutcome::Completed => RunState::Completed,
            RunOutcome::Failed(failure) => RunState::Failed(failure.stage()),
        }
    }
}

impl RunFailure {
    pub fn stage(&self) -> FailedStage {
        match self {
            RunFailure::Source(SourceError::Connection(_)) => FailedStage::Connection,
            RunFailure::Source(SourceError::Query(_)) => FailedStage::Query,
            RunFailure::Malformed(_) => FailedStage::Malformed,
            RunFailure::Write { .. } => FailedStage::Write,
        }
    }
}

/// Why the row loop stopped early.
enum Halt {
    Failure(RunFailure),
    Fatal(FatalError),
}

/// Fetch, map, write, checkpoint. Reused across daemon ticks; holds no
/// connection between runs.
pub struct Exporter<S, W> {
    store: S,
    checkpoint: CheckpointStore,
    mapper: RecordMapper,
    sink: W,
}

impl<S: EventStore, W: LineSink> Exporter<S, W> {
    pub fn new(store: S, checkpoint: CheckpointStore, mapper: RecordMapper, sink: W) -> Self {
        Self {
            store,
            checkpoint,
            mapper,
            sink,
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Runs one pass.
    ///
    /// Recoverable failures (event store, malformed row, missing directory or
    /// permission) come back as `Ok` with a failed outcome and leave the stored
    /// watermark untouched. Anything else is returned as `Err`.
    ///
    /// The stored watermark only ever moves to the `ts` of a line that was
    /// appended and synced before the save began, so a failed run can cause
    /// duplicates on retry but never a gap.
    pub fn run_once(&mut self) -> Result<RunReport, FatalError> {
        let mut state = RunState::Idle;
        let stored = self.checkpoint.load()?;
        let started_from = stored.value();
        let mut report = RunReport {
            started_from,
            watermark: started_from,
            exported: 0,
            outcome: RunOutcome::Completed,
        };

        transition(&mut state, RunState::Connecting);
        let room_ids = self.mapper.room_ids();
        let halt = {
            let mut source = match self.store.connect() {
                Ok(source) => source,
                Err(e) => {
                    error!("Could not connect to database: {e}");
                    return Ok(self.fail(&mut state, report, e.into()));
                }
            };

            transition(&mut state, RunState::Streaming);
            let mapper = &self.mapper;
            let sink = &mut self.sink;
            let mut halt: Option<Halt> = None;
            let scanned = source.scan_messages(&room_ids, started_from, &mut |row: RawEventRow| {
                match export_row(mapper, sink, &row) {
                    Ok(ts) => {
                        if ts < report.watermark {
                            warn!(ts, watermark = report.watermark, "Row arrived out of order");
                        }
                        report.watermark = report.watermark.max(ts);
                        report.exported += 1;
                        ControlFlow::Continue(())
                    }
                    Err(h) => {
                        halt = Some(h);
                        ControlFlow::Break(())
                    }
                }
            });
            match (halt, scanned) {
                (Some(h), _) => Some(h),
                (None, Err(e)) => Some(Halt::Failure(e.into())),
                (None, Ok(())) => None,
            }
            // `source` is dropped here, releasing the connection.
        };

        match halt {
            Some(Halt::Fatal(e)) => return Err(e),
            Some(Halt::Failure(failure)) => {
                error!(
                    exported = report.exported,
                    watermark = report.watermark,
                    "{failure}; stopping this run without saving the watermark"
                );
                return Ok(self.fail(&mut state, report, failure));
            }
            None => {}
        }

        if report.exported > 0 || stored == StoredWatermark::Missing {
            self.sink.sync()?;
            self.checkpoint.save(report.watermark)?;
        }
        transition(&mut state, RunState::Completed);
        info!(
            exported = report.exported,
            watermark = report.watermark,
            "Run completed."
        );
        Ok(report)
    }

    fn fail(&self, state: &mut RunState, mut report: RunReport, failure: RunFailure) -> RunReport {
        transition(state, RunState::Failed(failure.stage()));
        report.outcome = RunOutcome::Failed(failure);
        report
    }
}

fn transition(state: &mut RunState, next: RunState) {
    debug!(from = ?*state, to = ?next, "Run state change");
    *state = next;
}

fn export_row<W: LineSink>(
    mapper: &RecordMapper,
    sink: &mut W,
    row: &RawEventRow,
) -> Result<i64, Halt> {
    let record = mapper.map(row).map_err(|e| Halt::Failure(e.into()))?;
    let dest = mapper.route(&record).map_err(|e| Halt::Failure(e.into()))?;
    let line = record
        .to_line()
        .map_err(|e| Halt::Failure(MalformedRecord::new(record.ts, e.to_string()).into()))?;

    match sink.append(&dest.path, &line) {
        Ok(()) => {
            debug!(ts = record.ts, path = %dest.path.display(), "Message written.");
            Ok(record.ts)
        }
        Err(AppendError::MissingParent { path }) => Err(Halt::Failure(RunFailure::Write {
            received_ts: record.ts,
            room: dest.room_name,
            path,
            reason: WriteFailure::MissingParent,
        })),
        Err(AppendError::PermissionDenied { path }) => Err(Halt::Failure(RunFailure::Write {
            received_ts: record.ts,
            room: dest.room_name,
            path,
            reason: WriteFailure::PermissionDenied,
        })),
        Err(AppendError::Io { path, source }) => Err(Halt::Fatal(FatalError::Io { path, source })),
    }
}

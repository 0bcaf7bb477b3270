use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    sync::mpsc::{self, RecvTimeoutError, TrySendError},
    thread::{self, JoinHandle},
    time::Duration,
};

use air_brakes_flight_core::{DebugSnapshot, LogRow};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to open flight log: {0}")]
    Open(#[from] io::Error),
    #[error("failed to write flight log: {0}")]
    Csv(#[from] csv::Error),
    #[error("flight log writer did not finish within {0:?}")]
    FlushTimeout(Duration),
    #[error("flight log writer thread exited unexpectedly")]
    WriterGone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// rows buffered for the writer thread, further rows are dropped
    pub channel_capacity: usize,
    pub flush_every_rows: u64,
    /// how long shutdown waits for the writer to drain and flush
    pub flush_budget_ms: u64,
    pub diagnostics_every_tick: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            flush_every_rows: 100,
            flush_budget_ms: 500,
            diagnostics_every_tick: false,
        }
    }
}

/// Streams log rows to a CSV file from a dedicated writer thread so the
/// control loop never waits on disk.
///
/// Dropping the recorder without [`CsvRecorder::finish`] still closes the
/// channel and waits up to the flush budget for the file to be flushed.
pub struct CsvRecorder {
    rows: Option<mpsc::SyncSender<LogRow>>,
    finished: mpsc::Receiver<Result<u64, RecorderError>>,
    writer: Option<JoinHandle<()>>,
    flush_budget: Duration,
    sent: u64,
    lost: u64,
}

impl CsvRecorder {
    pub fn create(path: &Path, config: &RecorderConfig) -> Result<Self, RecorderError> {
        let file = File::create(path)?;
        Ok(Self::from_writer(file, config))
    }

    pub fn from_writer<W: Write + Send + 'static>(writer: W, config: &RecorderConfig) -> Self {
        let (rows_tx, rows_rx) = mpsc::sync_channel::<LogRow>(config.channel_capacity.max(1));
        let (finished_tx, finished_rx) = mpsc::channel();
        let flush_every_rows = config.flush_every_rows.max(1);

        let writer = thread::spawn(move || {
            let result = write_rows(writer, rows_rx, flush_every_rows);
            // the recorder may already have given up waiting
            let _ = finished_tx.send(result);
        });

        Self {
            rows: Some(rows_tx),
            finished: finished_rx,
            writer: Some(writer),
            flush_budget: Duration::from_millis(config.flush_budget_ms),
            sent: 0,
            lost: 0,
        }
    }

    /// Hand a row to the writer thread, never blocks. The row is dropped
    /// when the writer is too far behind.
    pub fn record(&mut self, row: LogRow) {
        let Some(rows) = &self.rows else {
            self.lost += 1;
            return;
        };
        match rows.try_send(row) {
            Ok(()) => self.sent += 1,
            Err(TrySendError::Full(_)) => {
                self.lost += 1;
                if self.lost % 1000 == 1 {
                    warn!("flight log writer is behind, {} rows dropped", self.lost);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.lost += 1;
                if self.lost == 1 {
                    warn!("flight log writer is gone, rows are being discarded");
                }
            }
        }
    }

    pub fn rows_sent(&self) -> u64 {
        self.sent
    }

    pub fn rows_lost(&self) -> u64 {
        self.lost
    }

    /// Close the channel and wait at most the flush budget for the writer.
    /// Returns the number of rows written.
    pub fn finish(mut self) -> Result<u64, RecorderError> {
        self.close()
    }

    fn close(&mut self) -> Result<u64, RecorderError> {
        self.rows = None;
        let result = match self.finished.recv_timeout(self.flush_budget) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // the thread is left detached
                self.writer = None;
                return Err(RecorderError::FlushTimeout(self.flush_budget));
            }
            Err(RecvTimeoutError::Disconnected) => Err(RecorderError::WriterGone),
        };
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            warn!("flight log writer thread panicked");
        }
        result
    }
}

impl Drop for CsvRecorder {
    fn drop(&mut self) {
        if self.rows.is_none() {
            return;
        }
        match self.close() {
            Ok(written) => debug!("flight log dropped without finish, {} rows written", written),
            Err(e) => warn!("flight log dropped without finish: {}", e),
        }
    }
}

fn write_rows<W: Write>(
    writer: W,
    rows: mpsc::Receiver<LogRow>,
    flush_every_rows: u64,
) -> Result<u64, RecorderError> {
    let mut writer = csv::Writer::from_writer(writer);
    let mut written = 0u64;
    for row in rows {
        writer.serialize(&row)?;
        written += 1;
        if written % flush_every_rows == 0 {
            writer.flush()?;
        }
    }
    writer.flush()?;
    debug!("flight log closed after {} rows", written);
    Ok(written)
}

/// Publishes the latest [`DebugSnapshot`]; readers poll and never block the loop.
#[derive(Clone)]
pub struct SnapshotPublisher(watch::Sender<Option<DebugSnapshot>>);

impl SnapshotPublisher {
    pub fn new() -> (Self, watch::Receiver<Option<DebugSnapshot>>) {
        let (tx, rx) = watch::channel(None);
        (Self(tx), rx)
    }

    pub fn publish(&self, snapshot: DebugSnapshot) {
        self.0.send_replace(Some(snapshot));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<DebugSnapshot>> {
        self.0.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn row(tick: u64) -> LogRow {
        LogRow {
            tick,
            timestamp_ns: tick * 10_000_000,
            phase: 'S',
            current_altitude: 1.5,
            predicted_apogee: (tick % 2 == 0).then_some(300.0),
            ..Default::default()
        }
    }

    #[test]
    fn writes_header_and_one_line_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.csv");

        let mut recorder = CsvRecorder::create(&path, &RecorderConfig::default()).unwrap();
        for tick in 1..=250 {
            recorder.record(row(tick));
        }
        assert_eq!(recorder.rows_sent(), 250);
        assert_eq!(recorder.finish().unwrap(), 250);

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("tick,timestamp_ns,phase,extension,fail_safe"));
        assert!(header.contains("invalid_fields"));
        assert!(header.contains("queue_dropped"));

        let rows: Vec<_> = lines.collect();
        assert_eq!(rows.len(), 250);
        assert!(rows[0].starts_with("1,10000000,S,"));
        assert!(rows[249].starts_with("250,"));
    }

    #[test]
    fn rows_are_readable_back_in_tick_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.csv");

        let mut recorder = CsvRecorder::create(&path, &RecorderConfig::default()).unwrap();
        for tick in 1..=10 {
            recorder.record(row(tick));
        }
        recorder.finish().unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        let apogee = headers.iter().position(|h| h == "predicted_apogee").unwrap();
        let ticks: Vec<u64> = reader
            .records()
            .map(|record| {
                let record = record.unwrap();
                // odd ticks carry no prediction
                let tick: u64 = record[0].parse().unwrap();
                assert_eq!(record[apogee].is_empty(), tick % 2 == 1);
                tick
            })
            .collect();
        assert_eq!(ticks, (1..=10).collect::<Vec<_>>());
    }

    struct StuckWriter;

    impl Write for StuckWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(200));
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn finish_gives_up_after_the_flush_budget() {
        let config = RecorderConfig {
            flush_every_rows: 1,
            flush_budget_ms: 10,
            ..Default::default()
        };
        let mut recorder = CsvRecorder::from_writer(StuckWriter, &config);
        for tick in 1..=5 {
            recorder.record(row(tick));
        }
        assert!(matches!(
            recorder.finish(),
            Err(RecorderError::FlushTimeout(_))
        ));
    }

    #[test]
    fn slow_writer_drops_rows_instead_of_queueing_them() {
        let config = RecorderConfig {
            channel_capacity: 4,
            flush_every_rows: 1,
            flush_budget_ms: 10,
            ..Default::default()
        };
        let mut recorder = CsvRecorder::from_writer(StuckWriter, &config);
        for tick in 1..=50 {
            recorder.record(row(tick));
        }

        // the channel plus the row the writer is stuck on
        assert!(recorder.rows_sent() <= 5, "{} rows sent", recorder.rows_sent());
        assert_eq!(recorder.rows_sent() + recorder.rows_lost(), 50);
    }

    #[test]
    fn dropping_the_recorder_flushes_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flight.csv");

        {
            let mut recorder = CsvRecorder::create(&path, &RecorderConfig::default()).unwrap();
            for tick in 1..=150 {
                recorder.record(row(tick));
            }
            assert_eq!(recorder.rows_lost(), 0);
        }

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let ticks: Vec<u64> = reader
            .records()
            .map(|record| record.unwrap()[0].parse().unwrap())
            .collect();
        assert_eq!(ticks, (1..=150).collect::<Vec<_>>());
    }

    #[test]
    fn snapshots_are_latest_value() {
        let (publisher, rx) = SnapshotPublisher::new();
        assert!(rx.borrow().is_none());
        assert!(publisher.subscribe().borrow().is_none());
    }
}

use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use fleet_core::types::AuditRecord;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

// ---------------------------------------------------------------------------
// AuditLog
//
// Append-only NDJSON file fed through a channel and a single writer task.
// `record` never blocks and never fails the caller: I/O problems are logged
// on the writer side and the record is dropped.
// ---------------------------------------------------------------------------

pub struct AuditLog {
    tx: Mutex<Option<mpsc::UnboundedSender<AuditRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Audit log writing NDJSON lines to `path`, one record per line.
    /// Parent directories are created on first write.
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(writer_task(path, rx));
        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
        }
    }

    /// No-op audit log for configs with auditing disabled.
    pub fn disabled() -> Self {
        Self {
            tx: Mutex::new(None),
            writer: Mutex::new(None),
        }
    }

    /// Queue a record for the writer. Infallible by contract.
    pub fn record(&self, record: AuditRecord) {
        let tx = match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(tx) = tx {
            if tx.send(record).is_err() {
                warn!("audit writer is gone, dropping record");
            }
        }
    }

    /// Close the channel and wait for the writer to flush its backlog.
    pub async fn shutdown(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);

        let handle = match self.writer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "audit writer task did not shut down cleanly");
            }
        }
    }
}

async fn writer_task(path: PathBuf, mut rx: mpsc::UnboundedReceiver<AuditRecord>) {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(path = %path.display(), error = %e, "cannot create audit log directory");
            }
        }
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path);

    let mut out = match file {
        Ok(file) => Some(std::io::BufWriter::new(file)),
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot open audit log, records will be dropped");
            None
        }
    };

    while let Some(record) = rx.recv().await {
        let Some(writer) = out.as_mut() else {
            continue;
        };
        let written = serde_json::to_writer(&mut *writer, &record)
            .map_err(std::io::Error::other)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(e) = written {
            error!(error = %e, "audit write failed, disabling writer");
            out = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

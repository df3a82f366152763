use std::fmt;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use vbk_types::block::ExBlockInfo;

const MIB: f64 = 1024.0 * 1024.0;

/// Final record of every block, indexed by block index.
pub struct ResultTable {
    records: Mutex<Vec<Option<ExBlockInfo>>>,
}

impl ResultTable {
    pub fn new(total: usize) -> Self {
        Self {
            records: Mutex::new(vec![None; total]),
        }
    }

    pub fn record(&self, info: ExBlockInfo) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let index = info.index();
        match records.get_mut(index) {
            Some(slot) => *slot = Some(info),
            None => warn!(index, total = records.len(), "result for unknown block index"),
        }
    }

    pub fn snapshot(&self) -> Vec<Option<ExBlockInfo>> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Run totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TotalBlocksInfo {
    pub blocks: usize,
    /// Plain bytes covered by processed blocks.
    pub size: u64,
    /// Bytes actually sent to or read from the repository.
    pub stream_size: u64,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
    pub succeeded: usize,
    pub failed: usize,
    pub deduplicated: usize,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

impl TotalBlocksInfo {
    pub fn from_records(records: &[Option<ExBlockInfo>], elapsed: Duration) -> Self {
        let mut totals = TotalBlocksInfo {
            blocks: records.len(),
            elapsed,
            ..Default::default()
        };
        for info in records.iter().flatten() {
            if info.failed {
                totals.failed += 1;
                continue;
            }
            totals.succeeded += 1;
            totals.size += info.size_in_bytes;
            totals.stream_size += info.stream_size;
            if info.duplicated {
                totals.deduplicated += 1;
            }
        }
        totals
    }

    /// Blocks with no record: never started because the run was aborted.
    pub fn not_processed(&self) -> usize {
        self.blocks - self.succeeded - self.failed
    }
}

impl fmt::Display for TotalBlocksInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total: {} blocks  {}  stream {}  {:.2}s  succeeded {}  failed {}  deduplicated {}",
            self.blocks,
            format_size(self.size),
            format_size(self.stream_size),
            self.elapsed.as_secs_f64(),
            self.succeeded,
            self.failed,
            self.deduplicated
        )
    }
}

pub fn header() -> &'static str {
    "      n   tot  m c e        offset          last       size     stream    time  key               digest"
}

pub fn separator() -> String {
    "_".repeat(header().len())
}

fn format_size(bytes: u64) -> String {
    format!("{:7.2}MB", bytes as f64 / MIB)
}

/// One fixed-width line per block. Deduplicated blocks are bracketed.
pub fn format_line(info: &ExBlockInfo, total: usize) -> String {
    let position = info.index() + 1;
    if info.failed {
        return format!(
            "({position:5}/{total:5})  FAILED  {} {:6.2}s  attempts {}  reason: {}",
            format_size(info.size_in_bytes),
            info.elapsed.as_secs_f64(),
            info.attempts,
            info.reason.as_deref().unwrap_or("unknown")
        );
    }

    let (open, close) = if info.duplicated { ('[', ']') } else { ('(', ')') };
    let marker = |set: bool, c: char| if set { c } else { ' ' };
    let stream = if info.duplicated {
        "        -".to_string()
    } else {
        format_size(info.stream_size)
    };
    let key = info
        .content_key
        .map(|k| k.to_string())
        .unwrap_or_else(|| "-".repeat(16));
    format!(
        "{open}{position:5}/{total:5}{close} {} {} {} {:13} {:13} {} {} {:6.2}s  {key}  {}",
        marker(info.block.is_modified(), '*'),
        marker(info.block.compressed, 'x'),
        marker(info.block.ciphered, 'x'),
        info.block.offset(),
        info.block.extent.last(),
        format_size(info.size_in_bytes),
        stream,
        info.elapsed.as_secs_f64(),
        info.digest_hex()
    )
}

/// Start time, header, one line per recorded block in index order, separator
/// and totals.
pub fn build_report(
    records: &[Option<ExBlockInfo>],
    totals: &TotalBlocksInfo,
    started_at: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Started: {}", started_at.to_rfc3339());
    let _ = writeln!(out, "{}", header());
    for info in records.iter().flatten() {
        let _ = writeln!(out, "{}", format_line(info, records.len()));
    }
    let _ = writeln!(out, "{}", separator());
    let _ = writeln!(out, "{totals}");
    out
}

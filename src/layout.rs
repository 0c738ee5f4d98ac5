//! On-disk artefacts of a publication run.
//!
//! ```text
//! <out>/events/events.ndjson    one record per line, unsigned or signed
//! <out>/cache/event_index.json  {"count": n, "d": [...]}
//! <out>/cache/qc_report.json    last quality-control report
//! ```

use std::{
    fs,
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};

use crate::event::{Draft, Event};

/// Contents of the events file.
#[derive(Debug, Clone)]
pub enum Records {
    Unsigned(Vec<Draft>),
    Signed(Vec<Event>),
}

impl Records {
    /// Drafts regardless of signing state; signatures are discarded.
    pub fn into_drafts(self) -> Vec<Draft> {
        match self {
            Records::Unsigned(v) => v,
            Records::Signed(v) => v.iter().map(Event::to_draft).collect(),
        }
    }
}

/// Output directory of one publication.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensure the directory structure exists.
    pub fn init(&self) -> Result<()> {
        for d in ["events", "cache"] {
            fs::create_dir_all(self.root.join(d))?;
        }
        Ok(())
    }

    pub fn events_path(&self) -> PathBuf {
        self.root.join("events/events.ndjson")
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join("cache/event_index.json")
    }

    pub fn qc_report_path(&self) -> PathBuf {
        self.root.join("cache/qc_report.json")
    }

    /// Write unsigned records and refresh the identifier index.
    pub fn write_drafts(&self, drafts: &[Draft]) -> Result<()> {
        self.init()?;
        write_ndjson(&self.events_path(), drafts)?;
        let d: Vec<&str> = drafts.iter().filter_map(Draft::d_tag).collect();
        self.write_json(&self.index_path(), &json!({ "count": drafts.len(), "d": d }))
    }

    /// Replace the events file with signed records.
    pub fn write_events(&self, events: &[Event]) -> Result<()> {
        self.init()?;
        write_ndjson(&self.events_path(), events)?;
        let d: Vec<&str> = events.iter().filter_map(Event::d_tag).collect();
        self.write_json(&self.index_path(), &json!({ "count": events.len(), "d": d }))
    }

    /// Read the events file, detecting whether it holds signed records.
    pub fn read_records(&self) -> Result<Records> {
        let path = self.events_path();
        let file = fs::File::open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut values = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line)
                .with_context(|| format!("{}:{}: invalid JSON", path.display(), n + 1))?;
            values.push(value);
        }

        let signed = values.iter().filter(|v| is_signed(v)).count();
        if signed == 0 {
            let drafts = values
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<Draft>, _>>()?;
            Ok(Records::Unsigned(drafts))
        } else if signed == values.len() {
            let events = values
                .into_iter()
                .map(serde_json::from_value)
                .collect::<Result<Vec<Event>, _>>()?;
            Ok(Records::Signed(events))
        } else {
            bail!(
                "{} mixes signed and unsigned records ({signed} of {} signed)",
                path.display(),
                values.len()
            )
        }
    }

    /// Signed records only; unsigned files are an error.
    pub fn read_events(&self) -> Result<Vec<Event>> {
        match self.read_records()? {
            Records::Signed(events) => Ok(events),
            Records::Unsigned(_) => Err(anyhow!(
                "{} holds unsigned records; run `sign` first",
                self.events_path().display()
            )),
        }
    }

    /// Atomically write `value` as pretty JSON.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        write_atomic(path, |w| {
            serde_json::to_writer_pretty(&mut *w, value)?;
            w.write_all(b"\n")?;
            Ok(())
        })
    }
}

fn is_signed(value: &Value) -> bool {
    ["id", "pubkey", "sig"]
        .iter()
        .all(|k| value.get(k).and_then(Value::as_str).is_some_and(|s| !s.is_empty()))
}

fn write_ndjson<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    write_atomic(path, |w| {
        for record in records {
            serde_json::to_writer(&mut *w, record)?;
            w.write_all(b"\n")?;
        }
        Ok(())
    })
}

/// Write through a temporary file in the same directory, then rename.
fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<&mut fs::File>) -> Result<()>,
{
    let parent_dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent_dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent_dir)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        fill(&mut w)?;
        w.flush()?;
    }
    tmp.persist(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

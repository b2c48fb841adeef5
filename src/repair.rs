//! Row repair collaborator for LLM-resolved policies, plus the side
//! artifact corrected rows are written to and record/replay wrappers for
//! testing repairers without a live model.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::engine::Value;
use crate::error::{DfcError, Result};

/// A result row keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// Everything a repairer is given about a violating row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub constraint: String,
    pub description: String,
    pub row: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RepairOutcome {
    Corrected(Row),
    Declined,
}

/// Repairs rows that violate an LLM-resolved policy. Implementations may
/// call out to a model, apply a fixed rule, or decline.
pub trait RowRepair {
    fn repair(&self, request: &RepairRequest) -> Result<RepairOutcome>;
}

/// One line of the side artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub corrected_row: Row,
    pub originating_query: String,
    pub originating_policy_id: String,
    pub timestamp: u64,
}

/// Append-only JSON-lines file holding corrected rows. Corrections never
/// flow back into query results; this file is the only place they land.
pub struct SideArtifact {
    writer: Mutex<BufWriter<File>>,
}

impl SideArtifact {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn append(&self, record: &ArtifactRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A request/outcome pair captured by [`RecordingRepair`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairExchange {
    pub request: RepairRequest,
    pub outcome: RepairOutcome,
}

/// Wraps a live repairer and records every exchange so a later run can
/// replay them deterministically.
pub struct RecordingRepair<R: RowRepair> {
    inner: R,
    log: Mutex<Vec<RepairExchange>>,
}

impl<R: RowRepair> RecordingRepair<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn exchanges(&self) -> Vec<RepairExchange> {
        self.log.lock().clone()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for exchange in self.log.lock().iter() {
            serde_json::to_writer(&mut writer, exchange)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl<R: RowRepair> RowRepair for RecordingRepair<R> {
    fn repair(&self, request: &RepairRequest) -> Result<RepairOutcome> {
        let outcome = self.inner.repair(request)?;
        self.log.lock().push(RepairExchange {
            request: request.clone(),
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }
}

fn request_key(request: &RepairRequest) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

/// Replays recorded exchanges keyed by the full request content. A request
/// with no recorded response falls through to the optional live repairer,
/// or fails.
pub struct ReplayRepair {
    responses: HashMap<String, RepairOutcome>,
    delay: Option<Duration>,
    fallback: Option<Box<dyn RowRepair>>,
}

impl ReplayRepair {
    pub fn from_exchanges(exchanges: &[RepairExchange]) -> Result<Self> {
        let mut responses = HashMap::new();
        for exchange in exchanges {
            responses.insert(request_key(&exchange.request)?, exchange.outcome.clone());
        }
        Ok(Self {
            responses,
            delay: None,
            fallback: None,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut exchanges = Vec::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            exchanges.push(serde_json::from_str::<RepairExchange>(line)?);
        }
        Self::from_exchanges(&exchanges)
    }

    /// Simulates live latency on each replayed response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_fallback(mut self, fallback: Box<dyn RowRepair>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl RowRepair for ReplayRepair {
    fn repair(&self, request: &RepairRequest) -> Result<RepairOutcome> {
        if let Some(outcome) = self.responses.get(&request_key(request)?) {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            return Ok(outcome.clone());
        }
        match &self.fallback {
            Some(live) => live.repair(request),
            None => Err(DfcError::RepairFailure(
                "no recorded response for repair request".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;

    impl RowRepair for Uppercase {
        fn repair(&self, request: &RepairRequest) -> Result<RepairOutcome> {
            let mut row = request.row.clone();
            for value in row.values_mut() {
                if let Value::Text(text) = value {
                    *text = text.to_uppercase();
                }
            }
            Ok(RepairOutcome::Corrected(row))
        }
    }

    fn request(name: &str) -> RepairRequest {
        RepairRequest {
            constraint: "users.name = upper(users.name)".into(),
            description: "names are stored uppercase".into(),
            row: Row::from([("name".to_string(), Value::Text(name.into()))]),
        }
    }

    #[test]
    fn recording_captures_exchanges() {
        let recorder = RecordingRepair::new(Uppercase);
        recorder.repair(&request("alice")).unwrap();
        recorder.repair(&request("bob")).unwrap();
        let exchanges = recorder.exchanges();
        assert_eq!(exchanges.len(), 2);
        assert!(matches!(exchanges[0].outcome, RepairOutcome::Corrected(_)));
    }

    #[test]
    fn replay_returns_recorded_outcomes() {
        let recorder = RecordingRepair::new(Uppercase);
        recorder.repair(&request("alice")).unwrap();
        let replay = ReplayRepair::from_exchanges(&recorder.exchanges()).unwrap();
        let outcome = replay.repair(&request("alice")).unwrap();
        let RepairOutcome::Corrected(row) = outcome else {
            panic!("expected a correction");
        };
        assert_eq!(row["name"], Value::Text("ALICE".into()));
    }

    #[test]
    fn replay_miss_without_fallback_fails() {
        let replay = ReplayRepair::from_exchanges(&[]).unwrap();
        let err = replay.repair(&request("alice"));
        assert!(matches!(err, Err(DfcError::RepairFailure(_))));
    }

    #[test]
    fn replay_miss_falls_through_to_live_repairer() {
        let replay = ReplayRepair::from_exchanges(&[])
            .unwrap()
            .with_fallback(Box::new(Uppercase));
        let outcome = replay.repair(&request("carol")).unwrap();
        let RepairOutcome::Corrected(row) = outcome else {
            panic!("expected a correction");
        };
        assert_eq!(row["name"], Value::Text("CAROL".into()));
    }

    #[test]
    fn exchanges_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exchanges.jsonl");
        let recorder = RecordingRepair::new(Uppercase);
        recorder.repair(&request("alice")).unwrap();
        recorder.save(&path).unwrap();

        let replay = ReplayRepair::load(&path).unwrap();
        let outcome = replay.repair(&request("alice")).unwrap();
        assert!(matches!(outcome, RepairOutcome::Corrected(_)));
    }

    #[test]
    fn artifact_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrections.jsonl");
        let artifact = SideArtifact::open(&path).unwrap();
        artifact
            .append(&ArtifactRecord {
                corrected_row: Row::from([("name".to_string(), Value::Text("ALICE".into()))]),
                originating_query: "SELECT name FROM users".into(),
                originating_policy_id: "policy_0000000000000001".into(),
                timestamp: 0,
            })
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
        let record: ArtifactRecord = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(record.originating_query, "SELECT name FROM users");
    }
}

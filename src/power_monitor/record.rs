use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::MonitorError;
use super::harmonics::SpectrumSummary;
use super::types::{ChannelId, SampleBatch};

pub const DEFAULT_RECORD_DIR: &str = "data/samples";

/// Raw capture written by the debug and phase modes for offline plotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizerRecord {
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate_ksps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_correction: Option<f64>,
    pub batch: SampleBatch,
    /// Voltage rebuilt with `phase_correction`, aligned with `batch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuilt_voltage: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub spectra: BTreeMap<String, SpectrumSummary>,
}

impl VisualizerRecord {
    pub fn new(title: &str, batch: SampleBatch) -> Self {
        VisualizerRecord {
            title: title.to_string(),
            created_at: Utc::now(),
            sample_rate_ksps: None,
            channel: None,
            phase_correction: None,
            batch,
            rebuilt_voltage: None,
            spectra: BTreeMap::new(),
        }
    }

    /// File name derived from the title, confined to a single path component.
    pub fn file_name(&self) -> Result<String, MonitorError> {
        let stem: String = self
            .title
            .trim()
            .chars()
            .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        let stem = stem.trim_start_matches('.');

        if stem.chars().all(|c| c == '_' || c == '.') {
            return Err(MonitorError::InvalidTitle(self.title.clone()));
        }
        Ok(format!("{}.json", stem))
    }
}

/*
* @brief Write a record as JSON under dir.
* @param dir Target directory, created when missing.
* @param record Record to write; its title gives the file name.
* @return Path of the written file.
*/
pub fn write_record(dir: &Path, record: &VisualizerRecord) -> Result<PathBuf, MonitorError> {
    fs::create_dir_all(dir)?;
    let path = dir.join(record.file_name()?);
    let json = serde_json::to_string_pretty(record)?;
    fs::write(&path, json)?;
    Ok(path)
}

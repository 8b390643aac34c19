//! Instrument status document
//!
//! Every sample carries a `…asc.txt` status document: one `key;value` pair
//! per line, written by the instrument. It feeds the derived volumes
//! (sampling duration), sanity checks (scanned-image count) and overrides
//! the configured instrument metadata when present. All entries are echoed
//! into the structured report.

use std::path::Path;

use pmon_common::config::RetryConfig;
use pmon_common::Result;

use crate::imaging::with_retry;
use crate::models::sample::Sample;

pub const KEY_SAMPLING_DURATION: &str = "Probenahmezeit";
pub const KEY_SCANNED_IMAGES: &str = "Anzahl_gescannte_Bilder";
pub const KEY_DEVICE: &str = "Device";
pub const KEY_FLOW_RATE: &str = "Analysenvolumenstrom";
pub const KEY_SERIAL_NUMBER: &str = "Seriennummer";
pub const KEY_SAMPLING_START: &str = "Beginn_der_Probenahme";
pub const KEY_SAMPLING_END: &str = "Ende_der_Probenahme";
pub const KEY_STATION_NUMBER: &str = "WMO-Stationsnummer";

/// Parsed status document, preserving entry order for report echoing.
#[derive(Debug, Clone, Default)]
pub struct StatusDoc {
    entries: Vec<(String, String)>,
}

impl StatusDoc {
    /// Read and parse a status document, blocking through transient I/O
    /// failures (the instrument may still be writing the file).
    pub async fn read(path: &Path, retry: &RetryConfig) -> Result<Self> {
        let name = path.to_string_lossy().into_owned();
        let content = with_retry(&name, retry, || std::fs::read_to_string(path)).await?;
        Ok(Self::parse(&content))
    }

    /// Parse `key;value` lines; lines without a separator are ignored.
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(3, ';');
                let key = parts.next()?.trim();
                let value = parts.next()?.trim();
                if key.is_empty() {
                    None
                } else {
                    Some((key.to_string(), value.to_string()))
                }
            })
            .collect();
        StatusDoc { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sampling duration in seconds.
    pub fn sampling_duration_secs(&self) -> Option<u64> {
        self.get(KEY_SAMPLING_DURATION)?.trim().parse().ok()
    }

    /// Number of regions the instrument reports having scanned.
    pub fn scanned_images(&self) -> Option<usize> {
        self.get(KEY_SCANNED_IMAGES)?.trim().parse().ok()
    }

    /// Override configured instrument metadata with values the instrument
    /// wrote itself.
    pub fn apply_overrides(&self, sample: &mut Sample) {
        if let Some(device) = self.get(KEY_DEVICE) {
            if !device.is_empty() {
                sample.device_name = device.to_string();
            }
        }
        if let Some(flow) = self.get(KEY_FLOW_RATE) {
            if let Ok(value) = flow.trim().parse::<f64>() {
                sample.flow_rate = value as u32;
            }
        }
        if let Some(serial) = self.get(KEY_SERIAL_NUMBER) {
            if !serial.is_empty() {
                sample.serial_number = serial.to_string();
            }
        }
        if let Some(start) = self.get(KEY_SAMPLING_START) {
            if !start.is_empty() {
                sample.sampling_start = Some(start.to_string());
            }
        }
        if let Some(end) = self.get(KEY_SAMPLING_END) {
            if !end.is_empty() {
                sample.sampling_end = Some(end.to_string());
            }
        }
        if let Some(station) = self.get(KEY_STATION_NUMBER) {
            if !station.is_empty() {
                sample.station_number = Some(station.to_string());
            }
        }
    }
}

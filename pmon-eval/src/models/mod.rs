//! Data model: samples, regions and detected objects

pub mod region;
pub mod sample;

pub use region::{BoundingBox, DetectedObject, Region, SortedOut};
pub use sample::{DytRecord, Sample, SampleIdentity, SampleSource, SampleState};

use crate::models::{FixQuality, GpsFix};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of the POST request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixQuality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&GpsFix> for LocationPayload {
    fn from(fix: &GpsFix) -> Self {
        Self {
            lat: fix.latitude,
            lon: fix.longitude,
            fix: Some(fix.quality),
            timestamp: fix.timestamp,
        }
    }
}

pub fn encode(fix: &GpsFix) -> serde_json::Result<String> {
    serde_json::to_string(&LocationPayload::from(fix))
}

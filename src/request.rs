//! Wire-level shape of a rendering request, as popped off a queue and
//! handed to a worker.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The job type requested, matched case-insensitively against the raw
/// `type` field (the original dispatcher used `strcasecmp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Jpeg,
    Profile,
}

impl JobType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "jpeg" => Some(Self::Jpeg),
            "profile" => Some(Self::Profile),
            _ => None,
        }
    }
}

/// One rendering request, as carried inside a private queue's job
/// payload. Fields not needed by a given job type are simply ignored by
/// the renderer it ends up routed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub pid: String,
    pub esaf: i64,
    #[serde(rename = "type")]
    pub job_type_raw: String,
    pub filename: String,
    pub frame: u32,

    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub xsize: u32,
    #[serde(default)]
    pub ysize: u32,
    #[serde(default)]
    pub wval: u32,
    #[serde(default)]
    pub contrast: u32,

    #[serde(default)]
    pub pax: f64,
    #[serde(default)]
    pub pay: f64,
    #[serde(default)]
    pub pbx: f64,
    #[serde(default)]
    pub pby: f64,
}

impl RequestDescriptor {
    pub fn job_type(&self) -> Option<JobType> {
        JobType::parse(&self.job_type_raw)
    }

    /// Parse a shared-queue payload: the second element of the `BRPOP`
    /// reply array. Missing `pid` is treated as a malformed request by
    /// the caller, not a parse error here, so `pid` stays a plain
    /// `String` field rather than an `Option`.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| anyhow!("malformed request payload: {}", e))?;
        if value.get("pid").is_none() {
            return Err(anyhow!("request payload missing required 'pid' field"));
        }
        serde_json::from_value(value).map_err(|e| anyhow!("malformed request payload: {}", e))
    }

    /// Re-serialize as sorted, compact JSON — matching the dispatcher's
    /// `json_dumps(..., JSON_SORT_KEYS | JSON_COMPACT)` before pushing
    /// onto a private queue.
    pub fn to_json_string(&self) -> Result<String> {
        let value = serde_json::to_value(self)?;
        let sorted = sort_json_keys(value);
        Ok(serde_json::to_string(&sorted)?)
    }
}

fn sort_json_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.into_iter().map(|(k, v)| (k, sort_json_keys(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k, v);
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_json_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_request() {
        let raw = r#"{"pid":"abc123","esaf":42,"type":"JPEG","filename":"x.h5","frame":1}"#;
        let req = RequestDescriptor::from_json_str(raw).expect("should parse");
        assert_eq!(req.pid, "abc123");
        assert_eq!(req.job_type(), Some(JobType::Jpeg));
    }

    #[test]
    fn missing_pid_is_rejected() {
        let raw = r#"{"esaf":42,"type":"jpeg","filename":"x.h5","frame":1}"#;
        assert!(RequestDescriptor::from_json_str(raw).is_err());
    }

    #[test]
    fn job_type_match_is_case_insensitive() {
        assert_eq!(JobType::parse("Jpeg"), Some(JobType::Jpeg));
        assert_eq!(JobType::parse("PROFILE"), Some(JobType::Profile));
        assert_eq!(JobType::parse("nonsense"), None);
    }

    #[test]
    fn round_trip_preserves_fields() {
        let raw = r#"{"pid":"p","esaf":1,"type":"profile","filename":"a.h5","frame":3,
            "pax":1.0,"pay":2.0,"pbx":3.0,"pby":4.0}"#;
        let req = RequestDescriptor::from_json_str(raw).expect("should parse");
        let out = req.to_json_string().expect("should serialize");
        let reparsed = RequestDescriptor::from_json_str(&out).expect("should reparse");
        assert_eq!(reparsed.pax, 1.0);
        assert_eq!(reparsed.pby, 4.0);
    }
}

//! Per-request routing annotations and their REST header mapping.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Request priority, also the queue bucket index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    BestEffort,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            Priority::BestEffort => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    /// Additive score boost for the requesting priority.
    pub fn boost(self) -> f64 {
        match self {
            Priority::BestEffort => -100.0,
            Priority::Normal => 0.0,
            Priority::High => 200.0,
            Priority::Critical => 500.0,
        }
    }

    /// Parse a header value; unknown values return None so the automatic
    /// defaulting rules apply, as if no header was sent.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "best_effort" | "besteffort" | "0" => Some(Priority::BestEffort),
            "normal" | "1" => Some(Priority::Normal),
            "high" | "2" => Some(Priority::High),
            "critical" | "3" => Some(Priority::Critical),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::BestEffort => "best_effort",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Text,
    Code,
    Image,
    Audio,
    Realtime,
    #[default]
    Auto,
}

impl MediaType {
    /// Unknown values fall through to the default.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => MediaType::Text,
            "code" => MediaType::Code,
            "image" => MediaType::Image,
            "audio" => MediaType::Audio,
            "realtime" => MediaType::Realtime,
            _ => MediaType::Auto,
        }
    }
}

/// Caller-supplied routing hints, immutable for the life of a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub latency_critical: bool,
    #[serde(default)]
    pub prefer_power_efficiency: bool,
    #[serde(default)]
    pub max_latency_ms: Option<f64>,
    #[serde(default)]
    pub max_power_watts: Option<f64>,
    #[serde(default)]
    pub cache_enabled: Option<bool>,
    #[serde(default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub custom: HashMap<String, String>,
}

/// Accepts `true|1|yes|on`, case-insensitive, trimmed.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

impl Annotations {
    /// Effective priority after defaulting: explicit wins; latency-critical
    /// and realtime media imply critical; audio implies high.
    pub fn effective_priority(&self) -> Priority {
        if let Some(p) = self.priority {
            return p;
        }
        if self.latency_critical || self.media_type == MediaType::Realtime {
            Priority::Critical
        } else if self.media_type == MediaType::Audio {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    /// Build annotations from the `X-*` request header map.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let mut custom = HashMap::new();
        for (name, value) in headers {
            let name = name.as_str();
            if let Some(key) = name
                .strip_prefix("x-custom-")
                .or_else(|| name.strip_prefix("X-Custom-"))
            {
                if let Ok(v) = value.to_str() {
                    custom.insert(key.to_string(), v.to_string());
                }
            }
        }

        Self {
            target: get("x-target-backend"),
            latency_critical: get("x-latency-critical")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            prefer_power_efficiency: get("x-power-efficient")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            max_latency_ms: get("x-max-latency-ms").and_then(|v| v.parse().ok()),
            max_power_watts: get("x-max-power-watts").and_then(|v| v.parse().ok()),
            cache_enabled: get("x-cache-enabled").map(|v| parse_bool(&v)),
            media_type: get("x-media-type")
                .map(|v| MediaType::parse(&v))
                .unwrap_or_default(),
            priority: get("x-priority").and_then(|v| Priority::parse(&v)),
            request_id: get("x-request-id"),
            deadline_ms: get("x-deadline-ms").and_then(|v| v.parse().ok()),
            custom,
        }
    }
}

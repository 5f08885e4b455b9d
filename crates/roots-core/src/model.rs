//! Telemetry records returned by data stores.
//!
//! All timestamps are epoch milliseconds.

use serde::{Deserialize, Serialize};

/// Synthetic call name used for time spent inside the application itself.
pub const LOCAL_CALL: &str = "LOCAL";

// ─── API calls and traced requests ──────────────────────────────────

/// One downstream call made while serving a traced request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCall {
    pub timestamp: i64,
    pub service: String,
    pub operation: String,
    pub elapsed_ms: u64,
}

impl ApiCall {
    pub fn new(
        timestamp: i64,
        service: impl Into<String>,
        operation: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            timestamp,
            service: service.into(),
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// `service:operation`, the identity used in path keys.
    pub fn name(&self) -> String {
        format!("{}:{}", self.service, self.operation)
    }
}

/// A traced request: the ordered list of API calls is its execution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRequest {
    pub request_id: String,
    pub timestamp: i64,
    pub application: String,
    pub operation: String,
    pub api_calls: Vec<ApiCall>,
    pub response_time_ms: u64,
}

impl ApplicationRequest {
    /// Call names joined by `", "`. Requests sharing this key took the same path.
    pub fn path_key(&self) -> String {
        self.api_calls
            .iter()
            .map(ApiCall::name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Sum of the elapsed time of every API call.
    pub fn api_call_time(&self) -> u64 {
        self.api_calls.iter().map(|c| c.elapsed_ms).sum()
    }

    /// Response time not explained by API calls. Negative when the trace
    /// data is inconsistent (calls overlapping the response).
    pub fn local_time(&self) -> i64 {
        self.response_time_ms as i64 - self.api_call_time() as i64
    }
}

/// Sort requests by timestamp and drop duplicates of the same request id.
pub fn normalize_requests(requests: &mut Vec<ApplicationRequest>) {
    requests.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.request_id.cmp(&b.request_id))
    });
    let mut seen = std::collections::HashSet::new();
    requests.retain(|r| seen.insert(r.request_id.clone()));
}

// ─── Summaries and samples ──────────────────────────────────────────

/// Mean response time and request count for one request type in one window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimeSummary {
    /// Start of the sampling window.
    pub timestamp: i64,
    pub mean_response_time: f64,
    pub request_count: f64,
}

impl ResponseTimeSummary {
    pub fn new(timestamp: i64, mean_response_time: f64, request_count: f64) -> Self {
        Self {
            timestamp,
            mean_response_time,
            request_count,
        }
    }
}

/// One raw response-time sample produced by a benchmark client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub timestamp: i64,
    pub application: String,
    pub method: String,
    pub path: String,
    pub response_time_ms: u64,
}

impl BenchmarkResult {
    /// `"METHOD path"`, the key benchmark samples are grouped by.
    pub fn request_type(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Share (0-100) of an operation's requests that took one execution path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathRatio {
    pub timestamp: i64,
    pub ratio: f64,
}

impl PathRatio {
    pub fn new(timestamp: i64, ratio: f64) -> Self {
        Self { timestamp, ratio }
    }

    pub fn zero(timestamp: i64) -> Self {
        Self::new(timestamp, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, ts: i64, calls: &[(&str, &str, u64)], rt: u64) -> ApplicationRequest {
        ApplicationRequest {
            request_id: id.to_string(),
            timestamp: ts,
            application: "app".to_string(),
            operation: "GET /".to_string(),
            api_calls: calls
                .iter()
                .map(|(s, o, e)| ApiCall::new(ts, *s, *o, *e))
                .collect(),
            response_time_ms: rt,
        }
    }

    #[test]
    fn path_key_joins_call_names() {
        let r = request("r1", 1, &[("datastore", "get", 5), ("memcache", "put", 3)], 20);
        assert_eq!(r.path_key(), "datastore:get, memcache:put");
        assert_eq!(r.api_call_time(), 8);
        assert_eq!(r.local_time(), 12);
    }

    #[test]
    fn empty_path_key_for_request_without_calls() {
        let r = request("r1", 1, &[], 7);
        assert_eq!(r.path_key(), "");
        assert_eq!(r.local_time(), 7);
    }

    #[test]
    fn local_time_can_be_negative() {
        let r = request("r1", 1, &[("a", "b", 30)], 10);
        assert_eq!(r.local_time(), -20);
    }

    #[test]
    fn normalize_orders_and_dedups() {
        let mut requests = vec![
            request("r2", 20, &[], 1),
            request("r1", 10, &[], 1),
            request("r2", 20, &[], 1),
        ];
        normalize_requests(&mut requests);
        let ids: Vec<_> = requests.iter().map(|r| r.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[test]
    fn benchmark_request_type() {
        let b = BenchmarkResult {
            timestamp: 1,
            application: "app".into(),
            method: "GET".into(),
            path: "/users".into(),
            response_time_ms: 3,
        };
        assert_eq!(b.request_type(), "GET /users");
    }
}

//! Search request bodies.
//!
//! Access logs are aggregated server side (method → path → period buckets);
//! benchmark samples and API call traces are fetched as documents through
//! the scroll API.

use serde_json::{Value, json};

use super::FieldMappings;

/// Page size for scrolled queries.
pub const SCROLL_SIZE: usize = 1000;
/// How long Elasticsearch keeps a scroll context alive between pages.
pub const SCROLL_KEEP_ALIVE: &str = "1m";

fn range(field: &str, start: i64, end: i64) -> Value {
    json!({ "range": { field: { "gte": start, "lt": end, "format": "epoch_millis" } } })
}

fn avg_time(fields: &FieldMappings) -> Value {
    json!({ "avg_time": { "avg": { "field": fields.access_log_response_time } } })
}

pub fn response_time_summary(fields: &FieldMappings, start: i64, end: i64) -> Value {
    json!({
        "size": 0,
        "query": { "bool": { "filter": [range(&fields.access_log_timestamp, start, end)] } },
        "aggs": {
            "methods": {
                "terms": { "field": fields.access_log_method, "size": 10 },
                "aggs": {
                    "paths": {
                        "terms": { "field": fields.access_log_path, "size": 100 },
                        "aggs": avg_time(fields),
                    }
                }
            }
        }
    })
}

pub fn response_time_history(fields: &FieldMappings, start: i64, end: i64, period_ms: i64) -> Value {
    json!({
        "size": 0,
        "query": { "bool": { "filter": [range(&fields.access_log_timestamp, start, end)] } },
        "aggs": {
            "methods": {
                "terms": { "field": fields.access_log_method, "size": 10 },
                "aggs": {
                    "paths": {
                        "terms": { "field": fields.access_log_path, "size": 100 },
                        "aggs": {
                            "periods": {
                                "histogram": {
                                    "field": fields.access_log_timestamp,
                                    "interval": period_ms,
                                    "offset": start.rem_euclid(period_ms),
                                    "min_doc_count": 0,
                                    "extended_bounds": { "min": start, "max": end - period_ms },
                                },
                                "aggs": avg_time(fields),
                            }
                        }
                    }
                }
            }
        }
    })
}

pub fn workload_summary(
    fields: &FieldMappings,
    method: &str,
    path: &str,
    start: i64,
    end: i64,
    period_ms: i64,
) -> Value {
    json!({
        "size": 0,
        "query": {
            "bool": {
                "filter": [
                    { "term": { fields.access_log_method.as_str(): method } },
                    { "term": { fields.access_log_path.as_str(): path } },
                    range(&fields.access_log_timestamp, start, end),
                ]
            }
        },
        "aggs": {
            "periods": {
                "histogram": {
                    "field": fields.access_log_timestamp,
                    "interval": period_ms,
                    "offset": start.rem_euclid(period_ms),
                    "min_doc_count": 0,
                    "extended_bounds": { "min": start, "max": end - period_ms },
                }
            }
        }
    })
}

pub fn benchmark_results(fields: &FieldMappings, start: i64, end: i64) -> Value {
    json!({
        "size": SCROLL_SIZE,
        "query": { "bool": { "filter": [range(&fields.benchmark_timestamp, start, end)] } },
        "sort": [{ fields.benchmark_timestamp.as_str(): "asc" }],
    })
}

pub fn request_info(fields: &FieldMappings, operation: Option<&str>, start: i64, end: i64) -> Value {
    let mut filter = vec![range(&fields.api_call_request_timestamp, start, end)];
    if let Some(op) = operation {
        filter.push(json!({ "term": { fields.api_call_request_operation_raw.as_str(): op } }));
    }
    json!({
        "size": SCROLL_SIZE,
        "query": { "bool": { "filter": filter } },
        "sort": [
            { fields.api_call_request_timestamp.as_str(): "asc" },
            { fields.api_call_sequence_number.as_str(): "asc" },
        ],
    })
}

pub fn scroll(scroll_id: &str) -> Value {
    json!({ "scroll": SCROLL_KEEP_ALIVE, "scroll_id": scroll_id })
}

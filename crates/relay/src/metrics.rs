use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_messages_total: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    auth_rejections_total: Mutex<HashMap<String, u64>>,
    active_connections: AtomicI64,
    cursor_updates_dropped_total: AtomicU64,
    conflicts_resolved_total: AtomicU64,
    locks_expired_total: AtomicU64,
    broker_publish_failures_total: AtomicU64,
    broker_publish_dropped_total: AtomicU64,
    remote_events_applied_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            ws_messages_total: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            auth_rejections_total: Mutex::new(HashMap::new()),
            active_connections: AtomicI64::new(0),
            cursor_updates_dropped_total: AtomicU64::new(0),
            conflicts_resolved_total: AtomicU64::new(0),
            locks_expired_total: AtomicU64::new(0),
            broker_publish_failures_total: AtomicU64::new(0),
            broker_publish_dropped_total: AtomicU64::new(0),
            remote_events_applied_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_message(kind: &str, is_error: bool) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_message(kind, is_error);
    }
}

pub fn record_auth_rejection(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_auth_rejection(reason);
    }
}

pub fn connection_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.active_connections.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn connection_closed() {
    if let Some(metrics) = global_metrics() {
        metrics.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn increment_cursor_updates_dropped() {
    if let Some(metrics) = global_metrics() {
        metrics.cursor_updates_dropped_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_conflicts_resolved() {
    if let Some(metrics) = global_metrics() {
        metrics.conflicts_resolved_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn add_locks_expired(count: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.locks_expired_total.fetch_add(count, Ordering::SeqCst);
    }
}

pub fn increment_broker_publish_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.broker_publish_failures_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_broker_publish_dropped() {
    if let Some(metrics) = global_metrics() {
        metrics.broker_publish_dropped_total.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn increment_remote_events_applied() {
    if let Some(metrics) = global_metrics() {
        metrics.remote_events_applied_total.fetch_add(1, Ordering::SeqCst);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_message(&self, kind: &str, is_error: bool) {
        let label = normalize_label(kind);
        increment_label_counter(&self.ws_messages_total, &label, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &label, 1);
        }
    }

    pub fn record_auth_rejection(&self, reason: &str) {
        increment_label_counter(&self.auth_rejections_total, &normalize_label(reason), 1);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "relay_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str("# HELP relay_ws_messages_total Total websocket messages by type.\n");
        output.push_str("# TYPE relay_ws_messages_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_messages_total", "type", &self.ws_messages_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket messages that failed by type.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", "type", &self.ws_errors_total);

        output.push_str("# HELP relay_auth_rejections_total Rejected connection credentials by reason.\n");
        output.push_str("# TYPE relay_auth_rejections_total counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_auth_rejections_total",
            "reason",
            &self.auth_rejections_total,
        );

        output.push_str("# HELP relay_active_connections Currently registered websocket connections.\n");
        output.push_str("# TYPE relay_active_connections gauge\n");
        output.push_str(&format!("relay_active_connections {}\n", self.active_connections()));

        append_atomic_counter(
            &mut output,
            "relay_cursor_updates_dropped_total",
            "Cursor updates dropped by slow-consumer backpressure.",
            &self.cursor_updates_dropped_total,
        );
        append_atomic_counter(
            &mut output,
            "relay_conflicts_resolved_total",
            "Concurrent element edits resolved by the transform engine.",
            &self.conflicts_resolved_total,
        );
        append_atomic_counter(
            &mut output,
            "relay_locks_expired_total",
            "Locks released because their owner's presence expired.",
            &self.locks_expired_total,
        );
        append_atomic_counter(
            &mut output,
            "relay_broker_publish_failures_total",
            "Broker publish attempts that failed.",
            &self.broker_publish_failures_total,
        );
        append_atomic_counter(
            &mut output,
            "relay_broker_publish_dropped_total",
            "Room events not delivered to remote instances.",
            &self.broker_publish_dropped_total,
        );
        append_atomic_counter(
            &mut output,
            "relay_remote_events_applied_total",
            "Room events received from other instances and applied locally.",
            &self.remote_events_applied_total,
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments: Vec<String> = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        // Room and user ids are caller-chosen; keep label cardinality bounded.
        match normalized_segments.last().map(String::as_str) {
            Some("rooms") => {
                normalized_segments.push("{room_id}".to_string());
                continue;
            }
            Some("history") => {
                normalized_segments.push("{user_id}".to_string());
                continue;
            }
            _ => {}
        }

        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_atomic_counter(output: &mut String, metric_name: &str, help: &str, value: &AtomicU64) {
    output.push_str(&format!("# HELP {metric_name} {help}\n"));
    output.push_str(&format!("# TYPE {metric_name} counter\n"));
    output.push_str(&format!("{metric_name} {}\n", value.load(Ordering::SeqCst)));
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

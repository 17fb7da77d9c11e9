pub use node_metrics::*;

pub const VALID_DEPOSIT_LOGS: &str = "execution_valid_deposit_logs_total";
pub const MISSED_DEPOSIT_LOGS: &str = "execution_missed_deposit_logs_total";
pub const LATEST_BLOCK_HEIGHT: &str = "execution_latest_block_height";
pub const LATEST_BLOCK_TIME: &str = "execution_latest_block_time";
pub const LAST_REQUESTED_BLOCK: &str = "execution_last_requested_block";
pub const DEPOSIT_COUNT: &str = "execution_deposit_count";
pub const LOG_BATCH_SIZE: &str = "execution_log_batch_size";
pub const ENDPOINT_CONNECTED: &str = "execution_endpoint_connected";

lazy_static! {
    /*
     * Deposit logs
     */
    pub static ref VALID_DEPOSIT_LOGS_TOTAL: Result<IntCounter> =
        try_create_int_counter(VALID_DEPOSIT_LOGS, "Count of deposit logs applied in order");
    pub static ref MISSED_DEPOSIT_LOGS_TOTAL: Result<IntCounter> =
        try_create_int_counter(MISSED_DEPOSIT_LOGS, "Count of deposit logs that skipped an index");
    pub static ref DEPOSIT_COUNT_GAUGE: Result<IntGauge> =
        try_create_int_gauge(DEPOSIT_COUNT, "Number of leaves in the deposit tree");
    pub static ref LOG_BATCH_SIZE_GAUGE: Result<IntGauge> =
        try_create_int_gauge(LOG_BATCH_SIZE, "Current block span of eth_getLogs requests");

    /*
     * Execution head
     */
    pub static ref LATEST_BLOCK_HEIGHT_GAUGE: Result<IntGauge> =
        try_create_int_gauge(LATEST_BLOCK_HEIGHT, "Height of the latest execution head seen");
    pub static ref LATEST_BLOCK_TIME_GAUGE: Result<IntGauge> =
        try_create_int_gauge(LATEST_BLOCK_TIME, "Timestamp of the latest execution head seen");
    pub static ref LAST_REQUESTED_BLOCK_GAUGE: Result<IntGauge> =
        try_create_int_gauge(LAST_REQUESTED_BLOCK, "Highest block scanned for deposit logs");

    /*
     * Execution rpc connection
     */
    pub static ref ENDPOINT_CONNECTED_GAUGE: Result<IntGauge> = try_create_int_gauge(
        ENDPOINT_CONNECTED, "Set to 1 if connected to an execution node, otherwise set to 0"
    );
}

/// Where the service reports its counters and gauges.
pub trait MetricsSink: Send + Sync {
    fn inc_counter(&self, name: &'static str);

    fn set_gauge(&self, name: &'static str, value: i64);
}

/// Reports to the process-wide prometheus registry.
#[derive(Default, Clone, Copy)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn inc_counter(&self, name: &'static str) {
        match name {
            VALID_DEPOSIT_LOGS => node_metrics::inc_counter(&VALID_DEPOSIT_LOGS_TOTAL),
            MISSED_DEPOSIT_LOGS => node_metrics::inc_counter(&MISSED_DEPOSIT_LOGS_TOTAL),
            _ => (),
        }
    }

    fn set_gauge(&self, name: &'static str, value: i64) {
        let gauge = match name {
            LATEST_BLOCK_HEIGHT => &*LATEST_BLOCK_HEIGHT_GAUGE,
            LATEST_BLOCK_TIME => &*LATEST_BLOCK_TIME_GAUGE,
            LAST_REQUESTED_BLOCK => &*LAST_REQUESTED_BLOCK_GAUGE,
            DEPOSIT_COUNT => &*DEPOSIT_COUNT_GAUGE,
            LOG_BATCH_SIZE => &*LOG_BATCH_SIZE_GAUGE,
            ENDPOINT_CONNECTED => &*ENDPOINT_CONNECTED_GAUGE,
            _ => return,
        };
        node_metrics::set_gauge(gauge, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_sink_updates_registry() {
        let metrics = PrometheusMetrics;
        metrics.set_gauge(LOG_BATCH_SIZE, 250);
        assert_eq!(get_int_gauge_value(&LOG_BATCH_SIZE_GAUGE), Some(250));

        metrics.inc_counter(VALID_DEPOSIT_LOGS);
        let text = encode_text().unwrap();
        assert!(text.contains(VALID_DEPOSIT_LOGS));
    }
}

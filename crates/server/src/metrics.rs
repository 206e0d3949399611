use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    http_requests: AtomicU64,
    live_events_egress: AtomicU64,
    challenges_created: AtomicU64,
    wakeups_sent: AtomicU64,
    handshakes_completed: AtomicU64,
    handshakes_declined: AtomicU64,
    handshakes_timed_out: AtomicU64,
    push_deliveries: AtomicU64,
    push_failures: AtomicU64,
    push_tokens_pruned: AtomicU64,
    jobs_processed: AtomicU64,
    rate_limited: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_http(&self) {
        self.http_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_live_egress(&self) {
        self.live_events_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_challenge_created(&self) {
        self.challenges_created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_wakeup_sent(&self) {
        self.wakeups_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_handshake_declined(&self) {
        self.handshakes_declined.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_handshake_timed_out(&self) {
        self.handshakes_timed_out.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_push_delivered(&self) {
        self.push_deliveries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_push_failed(&self) {
        self.push_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_push_token_pruned(&self) {
        self.push_tokens_pruned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_job_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE rally_connections_active gauge\nrally_connections_active {}\n\
             # TYPE rally_http_requests counter\nrally_http_requests {}\n\
             # TYPE rally_live_events_egress counter\nrally_live_events_egress {}\n\
             # TYPE rally_challenges_created counter\nrally_challenges_created {}\n\
             # TYPE rally_wakeups_sent counter\nrally_wakeups_sent {}\n\
             # TYPE rally_handshakes_completed counter\nrally_handshakes_completed {}\n\
             # TYPE rally_handshakes_declined counter\nrally_handshakes_declined {}\n\
             # TYPE rally_handshakes_timed_out counter\nrally_handshakes_timed_out {}\n\
             # TYPE rally_push_deliveries counter\nrally_push_deliveries {}\n\
             # TYPE rally_push_failures counter\nrally_push_failures {}\n\
             # TYPE rally_push_tokens_pruned counter\nrally_push_tokens_pruned {}\n\
             # TYPE rally_jobs_processed counter\nrally_jobs_processed {}\n\
             # TYPE rally_rate_limited counter\nrally_rate_limited {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.http_requests.load(Ordering::SeqCst),
            self.live_events_egress.load(Ordering::SeqCst),
            self.challenges_created.load(Ordering::SeqCst),
            self.wakeups_sent.load(Ordering::SeqCst),
            self.handshakes_completed.load(Ordering::SeqCst),
            self.handshakes_declined.load(Ordering::SeqCst),
            self.handshakes_timed_out.load(Ordering::SeqCst),
            self.push_deliveries.load(Ordering::SeqCst),
            self.push_failures.load(Ordering::SeqCst),
            self.push_tokens_pruned.load(Ordering::SeqCst),
            self.jobs_processed.load(Ordering::SeqCst),
            self.rate_limited.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_encoding_reflects_counters() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.mark_challenge_created();
        metrics.mark_challenge_created();
        let encoded = metrics.encode_prometheus();
        assert!(encoded.contains("rally_connections_active 1"));
        assert!(encoded.contains("rally_challenges_created 2"));
    }
}

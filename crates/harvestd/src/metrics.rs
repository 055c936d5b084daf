//! Prometheus counters for the ingress and the job pipeline.

use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub events_received: IntCounter,
    pub events_ignored: IntCounter,
    pub events_invalid: IntCounter,
    pub jobs_scheduled: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_retried: IntCounter,
    pub jobs_discarded: IntCounter,
    pub files_uploaded: IntCounter,
    pub files_skipped: IntCounter,
    pub images_pushed: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_received = IntCounter::new(
            "harvestd_webhook_events_received_total",
            "Webhook deliveries that passed signature validation",
        )?;
        let events_ignored = IntCounter::new(
            "harvestd_webhook_events_ignored_total",
            "Webhook deliveries acknowledged without producing a job",
        )?;
        let events_invalid = IntCounter::new(
            "harvestd_webhook_events_invalid_total",
            "Webhook deliveries rejected (signature or payload)",
        )?;
        let jobs_scheduled = IntCounter::new(
            "harvestd_jobs_scheduled_total",
            "Jobs enqueued by the scheduler",
        )?;
        let jobs_completed = IntCounter::new(
            "harvestd_jobs_completed_total",
            "Jobs handled successfully",
        )?;
        let jobs_retried = IntCounter::new(
            "harvestd_jobs_retried_total",
            "Jobs left on disk after a retryable failure",
        )?;
        let jobs_discarded = IntCounter::new(
            "harvestd_jobs_discarded_total",
            "Jobs removed after a non-retryable failure",
        )?;
        let files_uploaded = IntCounter::new(
            "harvestd_files_uploaded_total",
            "Files uploaded to generic destinations",
        )?;
        let files_skipped = IntCounter::new(
            "harvestd_files_skipped_total",
            "Files skipped because the destination hash already matched",
        )?;
        let images_pushed = IntCounter::new(
            "harvestd_images_pushed_total",
            "Container images and indexes pushed to docker destinations",
        )?;

        for counter in [
            &events_received,
            &events_ignored,
            &events_invalid,
            &jobs_scheduled,
            &jobs_completed,
            &jobs_retried,
            &jobs_discarded,
            &files_uploaded,
            &files_skipped,
            &images_pushed,
        ] {
            registry.register(Box::new(counter.clone()))?;
        }

        Ok(Self {
            registry,
            events_received,
            events_ignored,
            events_invalid,
            jobs_scheduled,
            jobs_completed,
            jobs_retried,
            jobs_discarded,
            files_uploaded,
            files_skipped,
            images_pushed,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        if TextEncoder::new().encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_rendered_output() {
        let metrics = Metrics::new().unwrap();
        metrics.jobs_scheduled.inc();
        metrics.jobs_scheduled.inc();

        let rendered = metrics.render();
        assert!(rendered.contains("harvestd_jobs_scheduled_total 2"));
        assert!(rendered.contains("harvestd_webhook_events_received_total 0"));
    }
}

use once_cell::sync::Lazy;
use prometheus::{Counter, CounterVec, Gauge, Opts, Registry};

/// Global metrics for the deploy server
pub struct Metrics {
    pub registry: Registry,

    // Auth flow metrics
    pub login_attempts_total: Counter,
    pub login_rate_limited_total: Counter,
    pub callback_failures_total: CounterVec,
    pub sessions_created_total: Counter,

    // State metrics
    pub widgets_registered_total: Counter,
    pub events_published_total: CounterVec,
    pub active_sessions: Gauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let login_attempts_total = Counter::with_opts(Opts::new(
            "atrium_login_attempts_total",
            "Total login attempts",
        ))?;

        let login_rate_limited_total = Counter::with_opts(Opts::new(
            "atrium_login_rate_limited_total",
            "Login attempts rejected by the rate limiter",
        ))?;

        let callback_failures_total = CounterVec::new(
            Opts::new(
                "atrium_callback_failures_total",
                "Failed OAuth callback handling attempts",
            ),
            &["reason"],
        )?;

        let sessions_created_total = Counter::with_opts(Opts::new(
            "atrium_sessions_created_total",
            "Sessions created after successful login",
        ))?;

        let widgets_registered_total = Counter::with_opts(Opts::new(
            "atrium_widgets_registered_total",
            "Widgets registered with the widget store",
        ))?;

        let events_published_total = CounterVec::new(
            Opts::new(
                "atrium_events_published_total",
                "Events published to the event bus",
            ),
            &["channel"],
        )?;

        let active_sessions = Gauge::with_opts(Opts::new(
            "atrium_active_sessions",
            "Approximate count of live sessions on this worker",
        ))?;

        registry.register(Box::new(login_attempts_total.clone()))?;
        registry.register(Box::new(login_rate_limited_total.clone()))?;
        registry.register(Box::new(callback_failures_total.clone()))?;
        registry.register(Box::new(sessions_created_total.clone()))?;
        registry.register(Box::new(widgets_registered_total.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            login_attempts_total,
            login_rate_limited_total,
            callback_failures_total,
            sessions_created_total,
            widgets_registered_total,
            events_published_total,
            active_sessions,
        })
    }
}

pub static METRICS: Lazy<Metrics> =
    Lazy::new(|| Metrics::new().expect("Failed to initialize metrics"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_cleanly() {
        let metrics = Metrics::new().unwrap();
        metrics.login_attempts_total.inc();
        metrics
            .callback_failures_total
            .with_label_values(&["invalid_state"])
            .inc();

        let families = metrics.registry.gather();
        assert!(!families.is_empty());
    }
}

//! Prometheus metric registry (A5), mirroring the `concron_` namespace:
//! gauges for current state, counters for lifetime totals, and a duration
//! summary for task execution.

use prometheus::{
    CounterVec, Gauge, GaugeVec, Opts, Registry, SummaryVec,
};

const NAMESPACE: &str = "concron";

pub struct Metrics {
    pub registry: Registry,
    pub info: Gauge,
    pub loaded_tasks: GaugeVec,
    pub running_tasks: GaugeVec,
    pub task_started: CounterVec,
    pub task_finished: CounterVec,
    pub task_duration: SummaryVec,
    pub task_last_exit_code: GaugeVec,
    pub crontab_load: CounterVec,
    pub crontab_load_duration: SummaryVec,
}

impl Metrics {
    pub fn new(version: &str, commit: &str) -> Self {
        let registry = Registry::new();

        let info = Gauge::with_opts(
            Opts::new("info", "Information about the concron process.")
                .namespace(NAMESPACE)
                .const_label("version", version)
                .const_label("commit", commit),
        )
        .expect("static metric opts");
        info.set(1.0);

        let loaded_tasks = GaugeVec::new(
            Opts::new("loaded_tasks_total", "Number of loaded tasks.").namespace(NAMESPACE),
            &["source", "user"],
        )
        .expect("static metric opts");

        let running_tasks = GaugeVec::new(
            Opts::new("running_tasks_total", "Number of currently running tasks.")
                .namespace(NAMESPACE),
            &["source", "user"],
        )
        .expect("static metric opts");

        let task_started = CounterVec::new(
            Opts::new("task_started_total", "How many tasks started.").namespace(NAMESPACE),
            &["source", "schedule", "user", "command", "stdin"],
        )
        .expect("static metric opts");

        let task_finished = CounterVec::new(
            Opts::new("task_finished_total", "How many tasks finished.").namespace(NAMESPACE),
            &["source", "schedule", "user", "command", "stdin", "exit_code"],
        )
        .expect("static metric opts");

        let task_duration = SummaryVec::new(
            prometheus::SummaryOpts::new(
                "task_duration_seconds",
                "A summary of the duration to execute a task.",
            )
            .namespace(NAMESPACE)
            .objectives(vec![(0.0, 0.0), (0.25, 0.0), (0.5, 0.0), (0.75, 0.0), (1.0, 0.0)]),
            &["source", "schedule", "user", "command", "stdin", "exit_code"],
        )
        .expect("static metric opts");

        let task_last_exit_code = GaugeVec::new(
            Opts::new("task_last_exit_code", "The latest exit code of the task.")
                .namespace(NAMESPACE),
            &["source", "schedule", "user", "command", "stdin"],
        )
        .expect("static metric opts");

        let crontab_load = CounterVec::new(
            Opts::new("crontab_load_total", "How many times the crontab has been loaded.")
                .namespace(NAMESPACE),
            &["path", "status"],
        )
        .expect("static metric opts");

        let crontab_load_duration = SummaryVec::new(
            prometheus::SummaryOpts::new(
                "crontab_load_duration_seconds",
                "A summary of the duration to load a crontab.",
            )
            .namespace(NAMESPACE),
            &["path", "status"],
        )
        .expect("static metric opts");

        for collector in [
            Box::new(info.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(loaded_tasks.clone()),
            Box::new(running_tasks.clone()),
            Box::new(task_started.clone()),
            Box::new(task_finished.clone()),
            Box::new(task_duration.clone()),
            Box::new(task_last_exit_code.clone()),
            Box::new(crontab_load.clone()),
            Box::new(crontab_load_duration.clone()),
        ] {
            registry.register(collector).expect("no duplicate metric names");
        }

        Metrics {
            registry,
            info,
            loaded_tasks,
            running_tasks,
            task_started,
            task_finished,
            task_duration,
            task_last_exit_code,
            crontab_load,
            crontab_load_duration,
        }
    }

    /// Renders the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("text encoding never fails");
        String::from_utf8(buf).expect("prometheus text format is always utf8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_info_metric() {
        let m = Metrics::new("0.0.0", "unknown");
        let out = m.render();
        assert!(out.contains("concron_info"));
    }

    #[test]
    fn counters_show_up_after_increment() {
        let m = Metrics::new("0.0.0", "unknown");
        m.task_started
            .with_label_values(&["t", "@daily", "*", "echo hi", ""])
            .inc();
        let out = m.render();
        assert!(out.contains("concron_task_started_total"));
    }
}

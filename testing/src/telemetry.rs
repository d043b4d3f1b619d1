use errors::SetupStage;
use metrics::{counter, histogram};
use std::time::Duration;

pub struct Telemetry;

impl Telemetry {
    pub fn record_setup(failed_stage: Option<SetupStage>, elapsed: Duration) {
        let outcome = if failed_stage.is_some() { "failed" } else { "ready" };
        let stage = failed_stage.map_or("none", |stage| stage.as_str());
        counter!("canned_fixture_setups_total", "outcome" => outcome, "stage" => stage).increment(1);
        histogram!("canned_fixture_setup_duration_ms", "outcome" => outcome)
            .record(elapsed.as_secs_f64() * 1000.0);
    }

    pub fn record_probe_attempt(success: bool) {
        let result = if success { "ok" } else { "not_ready" };
        counter!("canned_probe_attempts_total", "result" => result).increment(1);
    }

    pub fn record_teardown(clean: bool) {
        let result = if clean { "clean" } else { "suppressed_error" };
        counter!("canned_fixture_teardowns_total", "result" => result).increment(1);
    }
}

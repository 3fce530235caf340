use std::path::Path;

pub const STARTING: &str = "Starting Blueprint...";
pub const NO_ARTIFACT: &str = "Response contained no artifact; nothing to apply";

pub fn config_loaded(path: Option<&Path>) -> String {
    match path {
        Some(path) => format!("Loaded configuration from {}", path.display()),
        None => "No config file found, using defaults".to_string(),
    }
}

pub fn sandbox_ready(root: &Path) -> String {
    format!("Sandbox ready at {}", root.display())
}

pub fn sandbox_booting(delay_ms: u64) -> String {
    format!("Sandbox booting ({delay_ms}ms)...")
}

pub const DRY_RUN: &str = "Dry run: effects are applied to an in-memory sandbox";

pub fn replay_finished(turn_id: &str, steps: usize, failed: usize) -> String {
    format!("Replay of {turn_id} finished: {steps} steps, {failed} failed")
}

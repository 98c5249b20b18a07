//! Exit status of the `pixsim` runner.

use std::fs;
use std::path::PathBuf;
use std::process::{Command, ExitStatus};

const DETECTORS: &str = r#"
[alpide]
assembly = monolithic
number_of_pixels = 1024, 512
pixel_size = 0.029, 0.027
sensor_thickness = 0.05

[plane0]
type = "alpide"
"#;

/// Writes `modules` after a global section to a fresh directory and runs the
/// binary on it.
fn pixsim(name: &str, modules: &str) -> ExitStatus {
    let dir = std::env::temp_dir().join(format!("pixsim-cli-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("detectors.conf"), DETECTORS).unwrap();

    let config: PathBuf = dir.join("run.conf");
    fs::write(
        &config,
        format!(
            "[Pixsim]\ndetectors_file = \"detectors.conf\"\nnumber_of_events = 5\n\
             random_seed = 3\nlog_level = warn,pixsim=info\n{modules}"
        ),
    )
    .unwrap();

    Command::new(env!("CARGO_BIN_EXE_pixsim"))
        .arg(&config)
        .args(["--workers", "2"])
        .env_remove("RUST_LOG")
        .status()
        .unwrap()
}

const CHAIN: &str = r#"
[ChargeDepositor]
pixels_per_event = 3

[ThresholdDigitizer]
threshold = 1000000
on_empty = keep

[HitCounter]
"#;

#[test]
fn completed_run_succeeds() {
    assert!(pixsim("completed", CHAIN).success());
}

#[test]
fn skipped_events_do_not_fail_the_run() {
    let modules = CHAIN.replace("on_empty = keep", "on_empty = skip");
    assert!(pixsim("skipped", &modules).success());
}

#[test]
fn fatal_module_error_fails_the_run() {
    let modules = CHAIN.replace("on_empty = keep", "on_empty = abort");
    assert!(!pixsim("fatal", &modules).success());
}

#[test]
fn setup_error_fails_the_run() {
    let modules = format!("{CHAIN}\n[PulseShaper]\n");
    assert!(!pixsim("setup", &modules).success());
}

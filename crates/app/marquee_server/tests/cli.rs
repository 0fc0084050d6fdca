use assert_cmd::Command;
use predicates::prelude::*;

fn server() -> Command {
    let mut cmd = Command::cargo_bin("marquee_server").unwrap();
    // Keep a developer's .env and shell from leaking in.
    for var in [
        "MARQUEE_ENV",
        "JWT_SECRET",
        "JWT_REFRESH_SECRET",
        "DATABASE_URL",
        "BIND_ADDR",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd.current_dir(env!("CARGO_TARGET_TMPDIR"));
    cmd
}

#[test]
fn development_config_is_accepted() {
    server()
        .arg("--check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration ok (Development)"));
}

#[test]
fn production_without_secret_is_fatal() {
    server()
        .arg("--check-config")
        .env("MARQUEE_ENV", "production")
        .assert()
        .failure()
        .stderr(predicate::str::contains("JWT_SECRET"));
}

#[test]
fn production_with_strong_secret_is_accepted() {
    server()
        .arg("--check-config")
        .env("MARQUEE_ENV", "production")
        .env("JWT_SECRET", "x".repeat(48))
        .assert()
        .success()
        .stdout(predicate::str::contains("Production"));
}

#[test]
fn malformed_settings_are_reported() {
    server()
        .arg("--check-config")
        .env("DB_READY_TIMEOUT_SECS", "soon")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DB_READY_TIMEOUT_SECS"));
}

use assert_cmd::Command;
use predicates::prelude::*;

fn agent() -> Command {
    let mut cmd = Command::cargo_bin("marquee_agent").unwrap();
    for var in [
        "MARQUEE_SERVER_URL",
        "MARQUEE_TENANT_ID",
        "MARQUEE_USERNAME",
        "MARQUEE_PASSWORD",
        "MARQUEE_PIN",
        "MARQUEE_AGENT_GRANT",
    ] {
        cmd.env_remove(var);
    }
    cmd.current_dir(env!("CARGO_TARGET_TMPDIR"));
    cmd
}

#[test]
fn credentials_are_required() {
    agent()
        .args(["--tenant-id", "T1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--username").or(predicate::str::contains("--grant")));
}

#[test]
fn username_needs_a_password() {
    agent()
        .args(["--tenant-id", "T1", "--username", "cashier1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--password"));
}

#[test]
fn unreachable_server_fails_the_start() {
    agent()
        .args([
            "--server-url",
            "http://127.0.0.1:9/",
            "--tenant-id",
            "T1",
            "--grant",
            "not-a-real-grant",
        ])
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .failure()
        .stderr(predicate::str::contains("agent failed to start"));
}

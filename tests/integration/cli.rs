//! The `conductor` binary, driven the way an operator would drive it.

use std::process::Command;

use crate::fixtures::{write_script, TestRepo};

/// Test: `run --json` prints nothing but the report on stdout
/// Given a one-task plan and a shell agent that succeeds
/// When `conductor run --json` finishes
/// Then stdout parses as the JSON report and progress went to stderr
#[test]
fn test_cli_run_json_stdout_is_the_report() {
    let repo = TestRepo::new();
    let home = tempfile::tempdir().unwrap();
    let agent = write_script(
        home.path(),
        "agent.sh",
        r#"read envelope
echo "working on $CONDUCTOR_TASK_ID"
echo '{"success": true, "output": "done"}'
"#,
    );
    let conductor_dir = home.path().join(".conductor");
    std::fs::create_dir_all(&conductor_dir).unwrap();
    std::fs::write(
        conductor_dir.join("conductor.toml"),
        format!(
            "agent_command = \"{}\"\ntermination_grace_ms = 200\nmax_retries = 0\n",
            agent.display()
        ),
    )
    .unwrap();
    let plan = home.path().join("plan.json");
    std::fs::write(
        &plan,
        r#"[{"id": "api", "description": "Implement REST endpoints", "agentRole": "backend"}]"#,
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_conductor"))
        .args(["run", "Add an endpoint", "--json", "--auto-approve"])
        .arg("--plan")
        .arg(&plan)
        .arg("--repo")
        .arg(&repo.path)
        .env("HOME", home.path())
        .env_remove("CONDUCTOR_DEBUG")
        .output()
        .expect("Failed to run conductor");

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(output.status.success(), "stderr: {}", stderr);
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is not a JSON report");
    assert_eq!(report["completed"], serde_json::json!(["api"]));
    assert!(stderr.contains("Planning: Add an endpoint"));
    assert!(repo.branch_exists("conductor/api"));
}

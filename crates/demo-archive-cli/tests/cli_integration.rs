use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_archive<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_demo-archive"))
        .env_remove("DEMO_ARCHIVE_ROOT")
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute demo-archive binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_archive(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "demo-archive command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_u64(value: &Value, key: &str) -> u64 {
    value
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_record_fixture(dir: &Path, name: &str, action_steps: usize, reward_steps: usize) -> PathBuf {
    let actions = (0..action_steps)
        .map(|step| serde_json::json!({ "shape": [2], "data": { "f32": [step, step] } }))
        .collect::<Vec<_>>();
    let rewards = (0..reward_steps).map(|step| serde_json::json!(step)).collect::<Vec<_>>();
    let frames = (0..action_steps.max(reward_steps))
        .map(|step| {
            serde_json::json!({
                "cam0": { "shape": [2, 2], "data": { "u8": [step, step, step, step] } },
                "cam1": { "shape": [1], "data": { "f64": [0.5] } }
            })
        })
        .collect::<Vec<_>>();
    let record = serde_json::json!({
        "action": { "kind": "array_sequence", "value": actions },
        "reward": { "kind": "numeric_sequence", "value": rewards },
        "frames": { "kind": "dict_sequence", "value": frames },
        "instruction": { "kind": "scalar_text", "value": "Task description: reach the target" }
    });
    let path = dir.join(name);
    fs::write(&path, serde_json::to_vec_pretty(&record).unwrap_or_default())
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
    path
}

// Test IDs: TCLI-001
#[test]
fn cli_import_list_show_replay_export_delete_flow() {
    let dir = unique_temp_dir("demo-archive-cli-flow");
    let root = dir.join("archive");
    let fixture = write_record_fixture(&dir, "record.json", 6, 4);

    let imported = run_json([
        "--root",
        path_str(&root),
        "import",
        "--env",
        "metaworld",
        "--task",
        "reach-v2",
        "--file",
        path_str(&fixture),
        "--timestamp",
        "20240102_030405",
    ]);
    assert_eq!(as_str(&imported, "contract_version"), "cli.v1");
    assert_eq!(as_str(&imported, "timestamp"), "20240102_030405");
    assert_eq!(as_str(&imported, "entry"), "metaworld/reach-v2/20240102_030405");
    assert_eq!(as_u64(&imported, "steps"), 4);

    let listed = run_json([
        "--root",
        path_str(&root),
        "list",
        "--env",
        "metaworld",
        "--task",
        "reach-v2",
    ]);
    assert_eq!(listed["timestamps"], serde_json::json!(["20240102_030405"]));
    assert_eq!(as_u64(&listed, "total_pages"), 1);

    let shown = run_json([
        "--root",
        path_str(&root),
        "show",
        "--env",
        "metaworld",
        "--task",
        "reach-v2",
        "--timestamp",
        "20240102_030405",
    ]);
    assert_eq!(as_u64(&shown, "steps"), 4);
    assert_eq!(as_str(&shown, "instruction"), "Task description: reach the target");
    assert_eq!(shown["fields"]["action"]["length"], 4);
    assert_eq!(shown["fields"]["frames"]["kind"], "dict");
    assert_eq!(shown["fields"]["frames"]["sub_fields"]["cam0"]["dtype"], "u8");

    let replayed = run_json([
        "--root",
        path_str(&root),
        "replay",
        "--env",
        "metaworld",
        "--task",
        "reach-v2",
        "--timestamp",
        "20240102_030405",
        "--field",
        "reward",
        "--from",
        "1",
        "--to",
        "2",
    ]);
    let frames = replayed["frames"]
        .as_array()
        .unwrap_or_else(|| panic!("frames should be an array: {replayed}"));
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["step"], 1);
    assert_eq!(frames[0]["values"], serde_json::json!({ "reward": 1 }));
    assert_eq!(frames[1]["values"]["reward"], 2);

    let out = dir.join("exported").join("record.json");
    let exported = run_json([
        "--root",
        path_str(&root),
        "export",
        "--env",
        "metaworld",
        "--task",
        "reach-v2",
        "--timestamp",
        "20240102_030405",
        "--out",
        path_str(&out),
    ]);
    assert_eq!(as_str(&exported, "status"), "exported");
    let body = fs::read_to_string(&out)
        .unwrap_or_else(|err| panic!("failed to read export {}: {err}", out.display()));
    let record: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("export is not valid JSON: {err}"));
    assert_eq!(record["action"]["value"].as_array().map(Vec::len), Some(4));
    assert_eq!(record["instruction"]["kind"], "scalar_text");

    let deleted = run_json([
        "--root",
        path_str(&root),
        "delete",
        "--env",
        "metaworld",
        "--task",
        "reach-v2",
        "--timestamp",
        "20240102_030405",
    ]);
    assert_eq!(as_str(&deleted, "status"), "deleted");

    let after = run_json([
        "--root",
        path_str(&root),
        "list",
        "--env",
        "metaworld",
        "--task",
        "reach-v2",
    ]);
    assert_eq!(after["timestamps"], serde_json::json!([]));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-002
#[test]
fn cli_lists_unknown_task_as_single_empty_page() {
    let dir = unique_temp_dir("demo-archive-cli-ghost");
    let root = dir.join("archive");

    let listed = run_json([
        "--root",
        path_str(&root),
        "list",
        "--env",
        "ghost_env",
        "--task",
        "ghost_task",
        "--page",
        "3",
    ]);
    assert_eq!(listed["timestamps"], serde_json::json!([]));
    assert_eq!(as_u64(&listed, "total_pages"), 1);
    assert!(!root.join("ghost_env").join("ghost_task.sqlite3").exists());

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-003
#[test]
fn cli_import_at_taken_timestamp_gets_suffix_and_enumerates() {
    let dir = unique_temp_dir("demo-archive-cli-collide");
    let root = dir.join("archive");
    let fixture = write_record_fixture(&dir, "record.json", 3, 3);

    let import = |task: &str| {
        run_json([
            "--root",
            path_str(&root),
            "import",
            "--env",
            "gym",
            "--task",
            task,
            "--file",
            path_str(&fixture),
            "--timestamp",
            "20240505_101010",
        ])
    };
    assert_eq!(as_str(&import("CartPole-v1"), "timestamp"), "20240505_101010");
    assert_eq!(as_str(&import("CartPole-v1"), "timestamp"), "20240505_101010-02");
    import("Pendulum-v1");

    let envs = run_json(["--root", path_str(&root), "envs"]);
    assert_eq!(envs["environments"], serde_json::json!(["gym"]));

    let tasks = run_json(["--root", path_str(&root), "tasks", "--env", "gym"]);
    assert_eq!(
        tasks["tasks"],
        serde_json::json!([
            { "task": "CartPole-v1", "demonstrations": 2 },
            { "task": "Pendulum-v1", "demonstrations": 1 }
        ])
    );

    let report = run_json([
        "--root",
        path_str(&root),
        "integrity-check",
        "--env",
        "gym",
        "--task",
        "CartPole-v1",
    ]);
    assert_eq!(report["quick_check_ok"], true);
    assert_eq!(as_u64(&report, "demonstrations"), 2);
    assert_eq!(report["corrupt_blocks"], serde_json::json!([]));

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-004
#[test]
fn cli_reports_missing_entries_and_bad_arguments_as_failures() {
    let dir = unique_temp_dir("demo-archive-cli-errors");
    let root = dir.join("archive");

    let missing = run_archive([
        "--root",
        path_str(&root),
        "show",
        "--env",
        "gym",
        "--task",
        "CartPole-v1",
        "--timestamp",
        "20240101_000000",
    ]);
    assert!(!missing.status.success());
    assert!(String::from_utf8_lossy(&missing.stderr).contains("not found"));

    let bad_timestamp = run_archive([
        "--root",
        path_str(&root),
        "delete",
        "--env",
        "gym",
        "--task",
        "CartPole-v1",
        "--timestamp",
        "yesterday",
    ]);
    assert!(!bad_timestamp.status.success());

    let zero_page = run_archive([
        "--root",
        path_str(&root),
        "list",
        "--env",
        "gym",
        "--task",
        "CartPole-v1",
        "--page",
        "0",
    ]);
    assert!(!zero_page.status.success());

    let _ = fs::remove_dir_all(&dir);
}

// Test IDs: TCLI-005
#[test]
fn cli_root_flag_overrides_config_file() {
    let dir = unique_temp_dir("demo-archive-cli-config");
    let configured_root = dir.join("from-config");
    let flag_root = dir.join("from-flag");
    let config = dir.join("archive.yaml");
    fs::write(&config, format!("root: {}\ncompression_level: 5\n", path_str(&configured_root)))
        .unwrap_or_else(|err| panic!("failed to write config {}: {err}", config.display()));
    let fixture = write_record_fixture(&dir, "record.json", 2, 2);

    run_json([
        "--config",
        path_str(&config),
        "import",
        "--env",
        "libero",
        "--task",
        "libero_10",
        "--file",
        path_str(&fixture),
    ]);
    assert!(configured_root.join("libero").join("libero_10.sqlite3").is_file());

    run_json([
        "--config",
        path_str(&config),
        "--root",
        path_str(&flag_root),
        "import",
        "--env",
        "libero",
        "--task",
        "libero_10",
        "--file",
        path_str(&fixture),
    ]);
    assert!(flag_root.join("libero").join("libero_10.sqlite3").is_file());

    let listed = run_json([
        "--config",
        path_str(&config),
        "list",
        "--env",
        "libero",
        "--task",
        "libero_10",
    ]);
    assert_eq!(as_u64(&listed, "total_count"), 1);

    let _ = fs::remove_dir_all(&dir);
}

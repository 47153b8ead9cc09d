use std::path::Path;
use std::process::Command;

use serde_json::{Value, json};

fn run_tabguard(store: &Path, args: &[&str]) -> (bool, Value) {
	let output = Command::new(env!("CARGO_BIN_EXE_tabguard"))
		.arg("--store")
		.arg(store)
		.args(args)
		.output()
		.expect("Failed to execute tabguard");
	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let value = serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"));
	(output.status.success(), value)
}

#[test]
fn protection_toggle_persists() {
	let dir = tempfile::tempdir().unwrap();
	let store = dir.path().join("store.json");

	let (ok, result) = run_tabguard(&store, &["protection", "status"]);
	assert!(ok);
	assert_eq!(result["data"], json!({ "enabled": true, "persisted": false }));

	let (ok, _) = run_tabguard(&store, &["protection", "off"]);
	assert!(ok);

	let (_, result) = run_tabguard(&store, &["protection", "status"]);
	assert_eq!(result["command"], "protection status");
	assert_eq!(result["data"], json!({ "enabled": false, "persisted": true }));
}

#[test]
fn audit_analyze_flags_quick_reload() {
	let dir = tempfile::tempdir().unwrap();
	let store = dir.path().join("store.json");
	let history = json!([
		{ "startTime": 1_000, "endTime": 60_000, "url": "https://app/chat", "endUrl": "https://app/chat" },
		{ "startTime": 60_300, "endTime": 90_000, "url": "https://app/chat", "navigationType": "reload", "endUrl": "https://app/chat" },
	]);
	let contents = json!({ "refresh_tracker_history": history.to_string() });
	std::fs::write(&store, contents.to_string()).unwrap();

	let (ok, result) = run_tabguard(&store, &["audit", "analyze"]);
	assert!(ok);
	assert_eq!(result["data"]["potentialAutoRefresh"], true);
	assert_eq!(result["data"]["suspicion"]["timeDiff"], 300);

	let (_, result) = run_tabguard(&store, &["audit", "show"]);
	let entries = result["data"]["history"].as_array().unwrap();
	assert_eq!(entries.len(), 3);
	assert_eq!(entries[2]["type"], "potential_auto_refresh");

	let (ok, _) = run_tabguard(&store, &["audit", "clear"]);
	assert!(ok);
	let (_, result) = run_tabguard(&store, &["audit", "show"]);
	assert_eq!(result["data"]["history"], json!([]));
}

#[test]
fn decide_reports_block() {
	let dir = tempfile::tempdir().unwrap();
	let (ok, result) = run_tabguard(&dir.path().join("store.json"), &["decide", "--streaming"]);
	assert!(ok);
	assert_eq!(result["data"]["decision"], json!({ "action": "block", "reason": "autoRefresh" }));
	assert_eq!(result["data"]["status"]["stats"]["blockedAutoRefreshes"], 1);
}

#[test]
fn config_reflects_overrides() {
	let dir = tempfile::tempdir().unwrap();
	let config = dir.path().join("config.json");
	std::fs::write(&config, r#"{ "initialLoadGrace": 5000 }"#).unwrap();

	let (ok, result) = run_tabguard(&dir.path().join("store.json"), &["--config", config.to_str().unwrap(), "config"]);
	assert!(ok);
	assert_eq!(result["data"]["initialLoadGrace"], 5000);
	assert_eq!(result["data"]["auditCapacity"], 20);
}

#[test]
fn relay_demo_walks_every_step() {
	let dir = tempfile::tempdir().unwrap();
	let (ok, result) = run_tabguard(&dir.path().join("store.json"), &["relay-demo"]);
	assert!(ok);

	let steps = result["data"]["steps"].as_array().unwrap();
	let names: Vec<_> = steps.iter().map(|s| s["step"].as_str().unwrap()).collect();
	assert_eq!(names, ["register", "rehydrate", "multi-open", "deferred-activation", "status"]);
	assert_eq!(steps[2]["detail"]["oldSessionId"], "chat-1");
	assert_eq!(steps[2]["detail"]["oldSessionCached"], false);
	assert_eq!(steps[3]["detail"]["activation"], "deferred");
	assert_eq!(steps[3]["detail"]["phaseAfterStreaming"], "active");
}

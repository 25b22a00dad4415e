use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

const SITE_PLAN: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../geocad-engine/tests/data/site_plan.dxf"
);
const SITE_PLAN_LOCAL: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../geocad-engine/tests/data/site_plan_local.dxf"
);
const DEFAULT_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../config/default.toml");

fn geocad() -> Command {
    let mut cmd = Command::cargo_bin("geocad").expect("找不到 geocad 可执行文件");
    cmd.env_remove("GEOCAD_CONFIG").env("RUST_LOG", "warn");
    cmd
}

fn stdout_json(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("输出应为 JSON")
}

#[test]
fn inspect_lists_layers_and_geodata() {
    let report = stdout_json(geocad().args(["inspect", SITE_PLAN]));

    let names: Vec<&str> = report["layers"]
        .as_array()
        .expect("layers 应为数组")
        .iter()
        .filter_map(|layer| layer["name"].as_str())
        .collect();
    assert!(names.contains(&"Walls"));
    assert!(names.contains(&"Defpoints"));
    assert_eq!(report["geodata"]["epsg"], 32633);
}

#[test]
fn ingest_with_manual_anchor_prints_records() {
    let report = stdout_json(geocad().args([
        "--config",
        DEFAULT_CONFIG,
        "ingest",
        SITE_PLAN_LOCAL,
        "--lat",
        "42",
        "--long",
        "12",
    ]));

    assert_eq!(report["drawing"]["georef"]["crs"], 32633);
    let layers = report["layers"].as_array().expect("layers 应为数组");
    assert!(layers.iter().all(|layer| layer["name"] != "Defpoints"));
    let entities = report["entities"].as_array().expect("entities 应为数组");
    assert!(!entities.is_empty());
    assert_eq!(entities[0]["geometry"]["type"], "GeometryCollection");
}

#[test]
fn export_writes_geodata_object() {
    let dir = tempfile::tempdir().expect("创建临时目录失败");
    let output = dir.path().join("georeferenced.dxf");
    let before = fs::read_to_string(SITE_PLAN_LOCAL).expect("读取夹具失败");

    geocad()
        .args(["export", SITE_PLAN_LOCAL, "--lat", "42", "--long", "12", "--rotation", "-15"])
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    let written = fs::read_to_string(&output).expect("应写出文件");
    assert!(written.contains("GEODATA"));
    let report = stdout_json(geocad().arg("inspect").arg(&output));
    assert_eq!(report["geodata"]["epsg"], 32633);
    let rotation = report["geodata"]["rotation"].as_f64().expect("应有旋转角");
    assert!((rotation + 15.0).abs() < 1e-6);
    assert_eq!(fs::read_to_string(SITE_PLAN_LOCAL).expect("读取夹具失败"), before);
}

#[test]
fn missing_file_fails_with_context() {
    geocad()
        .args(["inspect", "/nonexistent/plan.dxf"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/plan.dxf"));
}

#[test]
fn out_of_range_latitude_is_rejected() {
    geocad()
        .args(["ingest", SITE_PLAN_LOCAL, "--lat", "95", "--long", "12"])
        .assert()
        .failure();
}

#[test]
fn latitude_requires_longitude() {
    geocad()
        .args(["ingest", SITE_PLAN_LOCAL, "--lat", "42"])
        .assert()
        .failure();
}

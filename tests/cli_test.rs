//! Tests for the pinphotos command-line interface

use assert_cmd::Command;
use mockito::{Matcher, Server};
use predicates::prelude::*;
use std::error::Error;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn pinphotos() -> Command {
    Command::cargo_bin("pinphotos").expect("Failed to find pinphotos binary")
}

/// Writes a config that keeps all state inside `dir`
fn write_config(dir: &Path, base_url: &str) -> Result<std::path::PathBuf, Box<dyn Error>> {
    let config_path = dir.join("pinphotos.yaml");
    let config_content = format!(
        r#"
api_key: test-key
base_url: "{base_url}"
data_file: "{data}"
cache_dir: "{cache}"
page_range: 1
"#,
        data = dir.join("data/pins.yaml").display(),
        cache = dir.join("data/images").display(),
    );
    fs::write(&config_path, config_content)?;
    Ok(config_path)
}

#[test]
fn test_init_creates_config() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("pinphotos.yaml");

    pinphotos()
        .arg("init")
        .current_dir(temp_dir.path())
        .assert()
        .success();

    let content = fs::read_to_string(&config_path)?;
    assert!(content.contains("base_url"), "Config should contain base_url");
    assert!(content.contains("data_file"), "Config should contain data_file");
    assert!(content.contains("cache_dir"), "Config should contain cache_dir");

    Ok(())
}

#[test]
fn test_init_without_force_keeps_existing() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("pinphotos.yaml");
    fs::write(&config_path, "api_key: mine")?;

    pinphotos()
        .arg("init")
        .current_dir(temp_dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Config file already exists"));
    assert_eq!(fs::read_to_string(&config_path)?, "api_key: mine");

    pinphotos()
        .args(["init", "--force"])
        .current_dir(temp_dir.path())
        .assert()
        .success();
    assert!(fs::read_to_string(&config_path)?.contains("per_page"));

    Ok(())
}

#[test]
fn test_missing_config_error() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;

    pinphotos()
        .arg("--config")
        .arg(temp_dir.path().join("does_not_exist.yaml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));

    Ok(())
}

#[test]
fn test_pin_add_list_remove() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let config_path = write_config(temp_dir.path(), "http://127.0.0.1:1/services/rest/")?;

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["pin", "add", "45.5", "-73.6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("at 45.5, -73.6"));

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["pin", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 pins"));

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["pin", "remove", "45.50005", "-73.6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed pin"));

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["photos", "45.5", "-73.6"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No pin at 45.5, -73.6"));

    Ok(())
}

#[test]
fn test_photos_fetches_then_uses_cache() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let mut server = Server::new();
    let search = server
        .mock("GET", "/services/rest/")
        .match_query(Matcher::UrlEncoded("page".into(), "0".into()))
        .with_status(200)
        .with_body(
            r#"{"photos": {"photo": [
                {"id": "2", "title": "Bridge", "url_m": "https://example.com/2.jpg"},
                {"id": "1", "title": "Market", "url_m": "https://example.com/1.jpg"}
            ]}, "stat": "ok"}"#,
        )
        .expect(1)
        .create();

    let config_path = write_config(
        temp_dir.path(),
        &format!("{}/services/rest/", server.url()),
    )?;

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["pin", "add", "45.5", "-73.6"])
        .assert()
        .success();

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["photos", "45.5", "-73.6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Inserted 2 photos"))
        .stdout(predicate::str::contains("Market"));

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["photos", "45.5", "-73.6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 photos"))
        .stdout(predicate::str::contains("Searching").not());

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["delete", "45.5", "-73.6", "--positions", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 1 photos"))
        .stdout(predicate::str::contains("Bridge"));

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Pins: 1"))
        .stdout(predicate::str::contains("Photos: 1"));

    search.assert();
    Ok(())
}

#[test]
fn test_empty_search_reports_no_photos() -> Result<(), Box<dyn Error>> {
    let temp_dir = TempDir::new()?;
    let mut server = Server::new();
    let _search = server
        .mock("GET", "/services/rest/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"photos": {"photo": []}, "stat": "ok"}"#)
        .create();

    let config_path = write_config(
        temp_dir.path(),
        &format!("{}/services/rest/", server.url()),
    )?;

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["pin", "add", "0.5", "0.5"])
        .assert()
        .success();

    pinphotos()
        .arg("--config")
        .arg(&config_path)
        .args(["photos", "0.5", "0.5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No photos for this pin"));

    Ok(())
}

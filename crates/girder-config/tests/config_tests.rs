//! Configuration loading and precedence tests

use girder_config::{BridgeConfig, ConfigError, ConfigLoader, ViolationPolicy};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn create_config_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let config_path = dir.join(name);
    fs::write(&config_path, content).unwrap();
    config_path
}

// ============================================================================
// Loading
// ============================================================================

#[test]
#[serial]
fn test_load_when_no_config_exists() {
    let temp_dir = TempDir::new().unwrap();

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("missing.toml"));
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(!config.is_project());
    assert_eq!(config.bridge, BridgeConfig::default());
}

#[test]
#[serial]
fn test_empty_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(temp_dir.path(), "girder.toml", "");

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("missing.toml"));
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(config.is_project());
    assert_eq!(config.log_level(), "info");
}

#[test]
fn test_invalid_toml_reports_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(temp_dir.path(), "girder.toml", "[logging\nlevel = 1");

    match BridgeConfig::load_from_file(&path) {
        Err(ConfigError::TomlParseError { file, .. }) => assert_eq!(file, path),
        other => panic!("expected TomlParseError, got {:?}", other),
    }
}

#[test]
fn test_missing_file_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("absent.toml");

    assert!(matches!(
        BridgeConfig::load_from_file(&path),
        Err(ConfigError::NotFound(_))
    ));
}

// ============================================================================
// Precedence
// ============================================================================

#[test]
#[serial]
fn test_project_overrides_global() {
    let temp_dir = TempDir::new().unwrap();
    let global = create_config_file(
        temp_dir.path(),
        "global.toml",
        r#"
[logging]
level = "error"
json = true

[lifetime]
protocol_violation = "report"
"#,
    );
    let project_dir = temp_dir.path().join("project");
    fs::create_dir(&project_dir).unwrap();
    create_config_file(
        &project_dir,
        "girder.toml",
        r#"
[logging]
level = "debug"
"#,
    );

    let mut loader = ConfigLoader::with_global_config_path(global);
    let config = loader.load_from_directory(&project_dir).unwrap();

    assert_eq!(config.log_level(), "debug");
    assert!(config.bridge.log_json());
    assert_eq!(config.bridge.protocol_violation(), ViolationPolicy::Report);
}

#[test]
#[serial]
fn test_env_library_path_prepends() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(
        temp_dir.path(),
        "girder.toml",
        r#"
[libraries]
search_paths = ["/project/lib"]
"#,
    );

    let joined = env::join_paths(["/env/a", "/env/b"]).unwrap();
    env::set_var("GIRDER_LIBRARY_PATH", &joined);

    let mut loader = ConfigLoader::with_global_config_path(temp_dir.path().join("missing.toml"));
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    env::remove_var("GIRDER_LIBRARY_PATH");

    assert_eq!(
        config.bridge.library_search_paths(),
        &[
            PathBuf::from("/env/a"),
            PathBuf::from("/env/b"),
            PathBuf::from("/project/lib"),
        ]
    );
}

#[rstest]
#[case("abort", ViolationPolicy::Abort)]
#[case("report", ViolationPolicy::Report)]
#[case("REPORT", ViolationPolicy::Report)]
fn test_policy_parsing(#[case] input: &str, #[case] expected: ViolationPolicy) {
    assert_eq!(input.parse::<ViolationPolicy>().unwrap(), expected);
}

#[rstest]
#[case("trace")]
#[case("debug")]
#[case("info")]
#[case("warn")]
#[case("error")]
fn test_valid_log_levels(#[case] level: &str) {
    let toml = format!("[logging]\nlevel = \"{}\"\n", level);
    let config: BridgeConfig = toml::from_str(&toml).unwrap();
    assert!(config.validate().is_ok());
}

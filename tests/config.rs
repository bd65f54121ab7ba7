//! `BusConfig::load` layering tests: an explicit file path, then the
//! `TXBUS__`-prefixed environment override on top of it. `#[serial]`
//! because these tests mutate process-wide environment variables that
//! `config::Environment` reads; running them in parallel would race.

use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;
use txbus::BusConfig;

fn config_file(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp config file");
    file.write_all(yaml.as_bytes()).expect("write temp config file");
    file
}

#[test]
#[serial]
fn load_reads_explicit_file_path() {
    let file = config_file("broker:\n  url: amqp://file-broker:5672\n  cluster: from-file\n");

    let cfg = BusConfig::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(cfg.broker.url, "amqp://file-broker:5672");
    assert_eq!(cfg.broker.cluster, "from-file");
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = config_file("broker:\n  url: amqp://file-broker:5672\n  cluster: from-file\n");

    std::env::set_var("TXBUS__BROKER__URL", "amqp://env-broker:5672");
    let result = BusConfig::load(Some(file.path().to_str().unwrap()));
    std::env::remove_var("TXBUS__BROKER__URL");

    let cfg = result.unwrap();
    assert_eq!(cfg.broker.url, "amqp://env-broker:5672");
    // Untouched by the environment override, still comes from the file.
    assert_eq!(cfg.broker.cluster, "from-file");
}

#[test]
#[serial]
fn missing_explicit_file_is_an_error() {
    let err = BusConfig::load(Some("/nonexistent/path/to/txbus.yaml"));
    assert!(err.is_err());
}

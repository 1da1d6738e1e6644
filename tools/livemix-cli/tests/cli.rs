//! End-to-end checks of the `livemix` binary.

use std::net::TcpListener;
use std::process::{Command, Output};

fn livemix(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_livemix"))
        .args(args)
        // Keep a user's config file out of the way.
        .env("XDG_CONFIG_HOME", std::env::temp_dir().join("livemix-cli-tests"))
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run livemix")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_missing_link_exits_before_building() {
    let output = livemix(&["--verbose"]);
    assert_eq!(output.status.code(), Some(1));
    let err = stderr(&output);
    assert!(err.contains("Please specify rtmp link to publish"), "{err}");
    assert!(!err.contains("Graph built"), "{err}");
    assert!(!err.contains("Linked"), "{err}");
}

#[test]
fn test_unreachable_endpoint_exits_with_transition_code() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let link = format!("tcp://127.0.0.1:{port}");
    let output = livemix(&["-r", &link, "--duration", "1"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stderr(&output).contains("network_sink"));
}

#[test]
fn test_unsupported_scheme_is_a_configuration_error() {
    let output = livemix(&["--rtmp-link", "http://example.com/live"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Unsupported scheme 'http'"));
}

#[test]
fn test_missing_config_file() {
    let output = livemix(&["--config", "/nonexistent/livemix.json", "-r", "tcp://127.0.0.1:1"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Failed to read config"));
}

#[test]
fn test_stages_lists_every_kind() {
    let output = livemix(&["stages"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for kind in ["capture", "overlay", "compositor", "junction", "queue", "encoder", "muxer", "network-sink"] {
        assert!(stdout.contains(&format!("{kind}: ")), "{kind} missing");
    }
}

#[test]
fn test_help_names_the_link_flag() {
    let output = livemix(&["--help"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("--rtmp-link"));
}

//! Security tests: SSRF validation, the exec gate, and sandbox isolation.
//!
//! The sandbox tests run small WAT guests that try to reach beyond their
//! grant (host environment, preopened directories, unbounded memory or CPU).

use std::collections::BTreeMap;
use std::time::Duration;

use livesource_rs::prelude::*;
use livesource_rs::sandbox::SandboxModule;
use livesource_rs::security::{validate_http_url, UrlRejection};

/// Helper to create a test sandbox config.
fn test_config() -> SandboxConfig {
    SandboxConfig::builder()
        .timeout(Duration::from_secs(5))
        .max_memory(1024 * 1024)
        .build()
}

fn load(wat: &str, config: &SandboxConfig, env: &BTreeMap<String, String>) -> SandboxModule {
    SandboxModule::from_bytes("guest", wat, config, env).unwrap()
}

#[test]
fn test_ssrf_blocks_internal_targets() {
    let policy = SecurityPolicy::default();
    for url in [
        "http://127.0.0.1/",
        "http://localhost/",
        "http://LOCALHOST./admin",
        "http://api.localhost/",
        "http://169.254.169.254/latest/meta-data",
        "http://10.0.0.5:8080/",
        "http://192.168.1.1/",
        "http://172.16.0.1/",
        "http://0.0.0.0/",
        "http://[::1]/",
        "http://[fe80::1]/",
    ] {
        assert!(validate_http_url(url, &policy).is_err(), "{url} should be blocked");
    }
}

#[test]
fn test_ssrf_rejects_other_schemes() {
    let policy = SecurityPolicy::default();
    assert!(matches!(
        validate_http_url("file:///etc/passwd", &policy),
        Err(UrlRejection::Scheme(_))
    ));
    assert!(matches!(
        validate_http_url("gopher://example.com/", &policy),
        Err(UrlRejection::Scheme(_))
    ));
    assert!(matches!(
        validate_http_url("not a url", &policy),
        Err(UrlRejection::Invalid(_))
    ));
}

#[test]
fn test_ssrf_allows_public_targets() {
    let policy = SecurityPolicy::default();
    assert!(validate_http_url("https://api.example.com/", &policy).is_ok());
    assert!(validate_http_url("https://93.184.216.34/v1/items", &policy).is_ok());
}

#[test]
fn test_rest_source_blocked_at_build() {
    let config = SourceConfig::builder(SourceKind::Rest)
        .url("http://169.254.169.254/latest/meta-data/")
        .build();
    let err = build_source("metadata", &config, &RuntimeOptions::default()).err().unwrap();
    assert!(err.is_security());
    assert!(!err.is_retryable());
}

#[test]
fn test_ssrf_bypass_is_explicit() {
    let config = SourceConfig::builder(SourceKind::Rest)
        .url("http://127.0.0.1:9/items")
        .build();
    let options = RuntimeOptions::default().dangerously_bypass_ssrf_for_tests();
    assert!(build_source("local", &config, &options).is_ok());
}

#[test]
fn test_exec_gate() {
    let config = SourceConfig::builder(SourceKind::Exec).command("echo hi").build();

    let err = build_source("cmd", &config, &RuntimeOptions::default()).err().unwrap();
    assert!(err.is_security());
    assert_eq!(err.kind(), ErrorKind::Security);

    let options = RuntimeOptions::default().allow_exec(true);
    assert!(build_source("cmd", &config, &options).is_ok());
}

#[test]
fn test_declaration_cannot_enable_exec() {
    let config: SourceConfig = serde_json::from_value(serde_json::json!({
        "type": "exec",
        "cmd": "echo hi",
        "allow_exec": true,
        "security": {"allow_exec": true}
    }))
    .unwrap();
    let err = build_source("cmd", &config, &RuntimeOptions::default()).err().unwrap();
    assert!(err.is_security());
}

/// Test that infinite loops are terminated by the epoch deadline.
#[tokio::test]
async fn test_infinite_loop_timeout() {
    let config = SandboxConfig::builder()
        .timeout(Duration::from_millis(200))
        .max_memory(1024 * 1024)
        .build();
    let mut module = load(
        r#"(module
             (memory (export "memory") 1)
             (func (export "fetch") (result i32) (loop $spin (br $spin)) i32.const 0)
             (func (export "result_length") (result i32) i32.const 0))"#,
        &config,
        &BTreeMap::new(),
    );

    let started = std::time::Instant::now();
    let err = module.fetch().unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_fuel_exhaustion() {
    let config = SandboxConfig::builder()
        .timeout(Duration::from_secs(30))
        .max_fuel(100_000)
        .build();
    let mut module = load(
        r#"(module
             (memory (export "memory") 1)
             (func (export "fetch") (result i32) (loop $spin (br $spin)) i32.const 0)
             (func (export "result_length") (result i32) i32.const 0))"#,
        &config,
        &BTreeMap::new(),
    );

    let err = module.fetch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
    assert!(err.to_string().contains("fuel"), "{err}");
}

/// Test that memory growth past the limit is refused.
#[tokio::test]
async fn test_memory_exhaustion_protection() {
    let mut module = load(
        r#"(module
             (memory (export "memory") 1)
             (func (export "fetch") (result i32)
               (if (i32.eq (memory.grow (i32.const 2000)) (i32.const -1))
                 (then unreachable))
               i32.const 0)
             (func (export "result_length") (result i32) i32.const 0))"#,
        &test_config(),
        &BTreeMap::new(),
    );

    let err = module.fetch().unwrap_err();
    assert!(err.to_string().contains("memory limit exceeded"), "{err}");
}

/// Test that the guest sees only its declared environment.
#[tokio::test]
async fn test_host_environment_not_inherited() {
    let mut env = BTreeMap::new();
    env.insert("API_TOKEN".to_string(), "secret".to_string());

    let mut module = load(
        r#"(module
             (import "wasi_snapshot_preview1" "environ_sizes_get"
               (func $sizes (param i32 i32) (result i32)))
             (memory (export "memory") 1)
             (data (i32.const 100) "[{\"count\":1}]")
             (data (i32.const 200) "[{\"count\":9}]")
             (func (export "fetch") (result i32)
               (drop (call $sizes (i32.const 0) (i32.const 4)))
               (if (result i32) (i32.eq (i32.load (i32.const 0)) (i32.const 1))
                 (then (i32.const 100))
                 (else (i32.const 200))))
             (func (export "result_length") (result i32) i32.const 13))"#,
        &test_config(),
        &env,
    );

    assert_eq!(module.fetch().unwrap(), br#"[{"count":1}]"#);
}

/// Test that no directories are preopened for the guest.
#[tokio::test]
async fn test_filesystem_access_blocked() {
    let mut module = load(
        r#"(module
             (import "wasi_snapshot_preview1" "fd_prestat_get"
               (func $prestat (param i32 i32) (result i32)))
             (memory (export "memory") 1)
             (data (i32.const 100) "[{\"fs\":\"none\"}]")
             (data (i32.const 200) "[{\"fs\":\"open\"}]")
             (func (export "fetch") (result i32)
               (if (result i32) (i32.eqz (call $prestat (i32.const 3) (i32.const 0)))
                 (then (i32.const 200))
                 (else (i32.const 100))))
             (func (export "result_length") (result i32) i32.const 15))"#,
        &test_config(),
        &BTreeMap::new(),
    );

    assert_eq!(module.fetch().unwrap(), br#"[{"fs":"none"}]"#);
}

/// Test that a module cannot point the host outside its memory.
#[tokio::test]
async fn test_result_outside_memory_rejected() {
    let mut module = load(
        r#"(module
             (memory (export "memory") 1)
             (func (export "fetch") (result i32) i32.const -16)
             (func (export "result_length") (result i32) i32.const 64))"#,
        &test_config(),
        &BTreeMap::new(),
    );
    let err = module.fetch().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transient);
}

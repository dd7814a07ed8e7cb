// Load configuration, optionally read from a json file.
//
// The file holds a single object { ... }, all fields optional:
//
//   retry_count - integer, how many times to re-read a profile file that is still being written
//   retry_delay_ms - integer, milliseconds to wait between those attempts
//   live_monitoring - boolean, take advisory read locks on profile files that a running job may be
//                     writing
//   read_user_events - boolean, whether to read the user event sections of flat profiles
//
// As with the system config files, the input is human-generated, so we use the generic JSON parser
// and decode the fields explicitly to get decent error messages.

use anyhow::{bail, Result};
use serde_json::Value;
use std::fs::File;
use std::io::BufReader;
use std::path;
use std::time::Duration;

pub const DEFAULT_RETRY_COUNT: usize = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    /// Number of times a file that could not be read completely is read again before its values
    /// are given up on.
    pub retry_count: usize,
    pub retry_delay: Duration,
    pub live_monitoring: bool,
    pub read_user_events: bool,
}

impl Default for LoadConfig {
    fn default() -> LoadConfig {
        LoadConfig {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
            live_monitoring: false,
            read_user_events: true,
        }
    }
}

pub fn read_from_json(filename: &str) -> Result<LoadConfig> {
    let file = File::open(path::Path::new(filename))?;
    let reader = BufReader::new(file);
    let v = serde_json::from_reader(reader)?;
    parse_config(&v)
}

pub fn parse_config(v: &Value) -> Result<LoadConfig> {
    let mut config = LoadConfig::default();
    if let Value::Object(fields) = v {
        if let Some(n) = grab_u64(fields, "retry_count")? {
            config.retry_count = n as usize;
        }
        if let Some(ms) = grab_u64(fields, "retry_delay_ms")? {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(b) = grab_bool(fields, "live_monitoring")? {
            config.live_monitoring = b;
        }
        if let Some(b) = grab_bool(fields, "read_user_events")? {
            config.read_user_events = b;
        }
    } else {
        bail!("Expected an object value")
    }
    Ok(config)
}

fn grab_u64(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<u64>> {
    match fields.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(n) = n.as_u64() {
                Ok(Some(n))
            } else {
                bail!("Field '{name}' must have unsigned integer value")
            }
        }
        Some(_) => bail!("Field '{name}' must have an integer value"),
    }
}

fn grab_bool(fields: &serde_json::Map<String, Value>, name: &str) -> Result<Option<bool>> {
    match fields.get(name) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => bail!("Field '{name}' must have a boolean value"),
    }
}

#[test]
fn test_config_defaults() {
    let c = parse_config(&serde_json::json!({})).unwrap();
    assert!(c == LoadConfig::default());
    assert!(c.retry_count == 5);
    assert!(c.retry_delay == Duration::from_millis(250));
}

#[test]
fn test_config_fields() {
    let c = parse_config(&serde_json::json!({
        "retry_count": 2,
        "retry_delay_ms": 10,
        "live_monitoring": true,
        "read_user_events": false
    }))
    .unwrap();
    assert!(c.retry_count == 2);
    assert!(c.retry_delay == Duration::from_millis(10));
    assert!(c.live_monitoring);
    assert!(!c.read_user_events);

    assert!(parse_config(&serde_json::json!({"retry_count": -1})).is_err());
    assert!(parse_config(&serde_json::json!({"live_monitoring": "yes"})).is_err());
    assert!(parse_config(&serde_json::json!([1, 2])).is_err());
}

#[test]
fn test_config_file() {
    let c = read_from_json("../profile_test_data/config/live.json").unwrap();
    assert!(c.live_monitoring);
    assert!(c.retry_count == 3);
    assert!(read_from_json("../profile_test_data/config/nonexistent.json").is_err());
}

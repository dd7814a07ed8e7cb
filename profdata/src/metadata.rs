// Metadata blocks embedded in profiles:
//
//   <metadata><attribute><name>Node Name</name><value>n001</value></attribute>...</metadata>
//
// Attributes without a name are dropped.  A missing value is the empty string.

use crate::Timestamp;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use xml::reader::{EventReader, XmlEvent};

/// The attribute that holds the start of the run, in microseconds since the epoch.
pub const START_TIME_KEY: &str = "Starting Timestamp";

pub fn parse_metadata_block(block: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = vec![];
    let mut text = String::new();
    let mut name: Option<String> = None;
    let mut value: Option<String> = None;
    for event in EventReader::new(block.as_bytes()) {
        match event? {
            XmlEvent::StartElement { name: elt, .. } => {
                text.clear();
                if elt.local_name == "attribute" {
                    name = None;
                    value = None;
                }
            }
            XmlEvent::Characters(s) | XmlEvent::CData(s) => text.push_str(&s),
            XmlEvent::EndElement { name: elt } => match elt.local_name.as_str() {
                "name" => name = Some(text.trim().to_string()),
                "value" => value = Some(text.trim().to_string()),
                "attribute" => {
                    if let Some(n) = name.take() {
                        pairs.push((n, value.take().unwrap_or_default()));
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }
    Ok(pairs)
}

/// Interpret a metadata value as a start time in microseconds since the epoch.

pub fn parse_start_time(value: &str) -> Option<Timestamp> {
    let micros = value.trim().parse::<i64>().ok()?;
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

#[test]
fn test_parse_metadata_block() {
    let pairs = parse_metadata_block(
        "<metadata><attribute><name>Node Name</name><value>n001</value></attribute>\
         <attribute><name> CPU Cores </name><value>64</value></attribute>\
         <attribute><name>Empty</name></attribute>\
         <attribute><value>orphan</value></attribute></metadata>",
    )
    .unwrap();
    assert!(pairs.len() == 3);
    assert!(pairs[0] == ("Node Name".to_string(), "n001".to_string()));
    assert!(pairs[1] == ("CPU Cores".to_string(), "64".to_string()));
    assert!(pairs[2] == ("Empty".to_string(), "".to_string()));

    assert!(parse_metadata_block("<metadata><attribute>").is_err());
}

#[test]
fn test_parse_start_time() {
    use chrono::{Datelike, Timelike};
    let t = parse_start_time("1690000000000000").unwrap();
    assert!(t.year() == 2023 && t.month() == 7 && t.day() == 22);
    assert!(t.hour() == 4 && t.minute() == 26 && t.second() == 40);
    assert!(parse_start_time("soon").is_none());
}

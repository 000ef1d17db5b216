//! Entry-point payloads. Every accepted shape is resolved once, here, into an
//! [`Invocation`]; nothing downstream inspects raw event JSON.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{PosmapError, Result};
use crate::mapper::DiscoveryRequest;
use crate::pipeline::ProcessRequest;

const INPUT_SUFFIX: &str = ".csv";

#[derive(Debug, Deserialize)]
struct NotificationRecord {
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3Bucket,
    object: S3Object,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: String,
}

/// Raw shapes, most specific first. `Process` accepts anything, so it must
/// stay last.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Event {
    Notification {
        #[serde(rename = "Records")]
        records: Vec<NotificationRecord>,
    },
    Upload {
        bucket: String,
        key: String,
    },
    Discovery(DiscoveryRequest),
    Process(ProcessRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Process {
        /// Bucket named by an upload notification; `None` keeps the configured one.
        bucket: Option<String>,
        request: ProcessRequest,
    },
    Discover(DiscoveryRequest),
    /// An upload that is not a positions export.
    Ignored { bucket: String, key: String },
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Decode `+` and `%XX` escapes in notification object keys.
fn decode_object_key(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => match (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn upload(bucket: String, key: String) -> Invocation {
    if key.ends_with(INPUT_SUFFIX) {
        Invocation::Process {
            bucket: Some(bucket),
            request: ProcessRequest {
                source_key: Some(key),
                ..ProcessRequest::default()
            },
        }
    } else {
        Invocation::Ignored { bucket, key }
    }
}

impl Invocation {
    pub fn from_value(value: Value) -> Result<Self> {
        let event: Event = serde_json::from_value(value)?;
        let invocation = match event {
            Event::Notification { records } => {
                let record = records
                    .into_iter()
                    .next()
                    .ok_or_else(|| PosmapError::NoInput("notification carries no records".to_string()))?;
                upload(record.s3.bucket.name, decode_object_key(&record.s3.object.key))
            }
            Event::Upload { bucket, key } => upload(bucket, key),
            Event::Discovery(req) => Invocation::Discover(req),
            Event::Process(req) => Invocation::Process {
                bucket: None,
                request: req,
            },
        };
        info!(?invocation, "invocation resolved");
        Ok(invocation)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let value = if trimmed.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(trimmed)?
        };
        Self::from_value(value)
    }
}

/// Executes resolved invocations. The CLI and the message bridge share one
/// implementation.
pub trait Runner {
    fn process(&self, bucket: Option<&str>, request: &ProcessRequest) -> Value;
    fn discover(&self, request: &DiscoveryRequest) -> Value;
}

pub fn execute(invocation: &Invocation, runner: &dyn Runner) -> Value {
    match invocation {
        Invocation::Process { bucket, request } => runner.process(bucket.as_deref(), request),
        Invocation::Discover(request) => runner.discover(request),
        Invocation::Ignored { bucket, key } => {
            json!({ "ok": true, "status": "skipped", "bucket": bucket, "key": key })
        }
    }
}

/*
 * Copyright (C) 2025 The Arbor Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::fs::OpenOptions;
#[cfg(not(test))]
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "arbord";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);
static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
    log::set_max_level(if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    });
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DaemonLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl DaemonLogLevel {
    fn as_str(self) -> &'static str {
        match self {
            DaemonLogLevel::Debug => "DEBUG",
            DaemonLogLevel::Info => "INFO",
            DaemonLogLevel::Warn => "WARN",
            DaemonLogLevel::Error => "ERROR",
        }
    }

    fn is_stderr(self) -> bool {
        matches!(self, DaemonLogLevel::Warn | DaemonLogLevel::Error)
    }
}

enum LogTarget {
    Stdio,
    File(Mutex<std::fs::File>),
}

static TARGET: OnceLock<LogTarget> = OnceLock::new();

struct FacadeLogger;

impl log::Log for FacadeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Debug
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            log::Level::Error => DaemonLogLevel::Error,
            log::Level::Warn => DaemonLogLevel::Warn,
            log::Level::Info => DaemonLogLevel::Info,
            log::Level::Debug | log::Level::Trace => DaemonLogLevel::Debug,
        };
        let component = record.module_path().unwrap_or(record.target());
        log_event(level, component, &record.args().to_string(), &[]);
    }

    fn flush(&self) {}
}

static FACADE: FacadeLogger = FacadeLogger;

/// Installs the logger behind the `log` facade. `stdlog` keeps output on
/// stdout/stderr, otherwise lines are appended to the given file.
pub fn init(stdlog: bool, log_file: &Path, verbose: bool) {
    let target = if stdlog {
        LogTarget::Stdio
    } else {
        match OpenOptions::new().create(true).append(true).open(log_file) {
            Ok(file) => LogTarget::File(Mutex::new(file)),
            Err(_) => LogTarget::Stdio,
        }
    };
    let _ = TARGET.set(target);
    let _ = log::set_logger(&FACADE);
    set_verbose(verbose);
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',' | '\n' | '\r' | '\t'
            )
    });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

pub fn log_event(
    level: DaemonLogLevel,
    component: &str,
    message: &str,
    metadata: &[(&str, &str)],
) {
    if level == DaemonLogLevel::Debug && !verbose() {
        return;
    }
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    let pid = std::process::id().to_string();

    match current_log_format() {
        LogFormat::Text => {
            let mut line = String::new();
            push_field(&mut line, "ts", &timestamp);
            push_field(&mut line, "level", level.as_str());
            push_field(&mut line, "service", SERVICE_NAME);
            push_field(&mut line, "component", component);
            push_field(&mut line, "pid", &pid);
            push_field(&mut line, "msg", message);
            for (key, value) in metadata {
                if key.is_empty() {
                    continue;
                }
                push_field(&mut line, key, value);
            }
            write_line(level, &line);
        }
        LogFormat::Json => {
            let mut payload = serde_json::Map::new();
            payload.insert("ts".into(), Value::String(timestamp));
            payload.insert("level".into(), Value::String(level.as_str().to_string()));
            payload.insert("service".into(), Value::String(SERVICE_NAME.to_string()));
            payload.insert("component".into(), Value::String(component.to_string()));
            payload.insert("pid".into(), Value::String(pid));
            payload.insert("msg".into(), Value::String(message.to_string()));
            for (key, value) in metadata {
                if key.is_empty() {
                    continue;
                }
                payload.insert((*key).to_string(), Value::String((*value).to_string()));
            }
            let line = Value::Object(payload).to_string();
            write_line(level, &line);
        }
    }
}

pub fn log_debug(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(DaemonLogLevel::Debug, component, message, metadata);
}

pub fn log_info(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(DaemonLogLevel::Info, component, message, metadata);
}

pub fn log_warn(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(DaemonLogLevel::Warn, component, message, metadata);
}

pub fn log_error(component: &str, message: &str, metadata: &[(&str, &str)]) {
    log_event(DaemonLogLevel::Error, component, message, metadata);
}

#[cfg(not(test))]
fn write_line(level: DaemonLogLevel, line: &str) {
    if let Some(LogTarget::File(file)) = TARGET.get() {
        if let Ok(mut file) = file.lock() {
            if writeln!(file, "{}", line).is_ok() {
                return;
            }
        }
    }

    let write_result = if level.is_stderr() {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", line)
    } else {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)
    };

    if let Err(error) = write_result {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(
            stderr,
            "arbord: failed to write log line: {} (original: {})",
            error, line
        );
    }
}

#[cfg(test)]
fn write_line(level: DaemonLogLevel, line: &str) {
    let _ = level.is_stderr();
    let store = test_log_store();
    let mut guard = store.lock().unwrap();
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(DaemonLogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(DaemonLogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

#[cfg(test)]
pub fn take_test_logs() -> Vec<(DaemonLogLevel, String)> {
    let store = test_log_store();
    let mut guard = store.lock().unwrap();
    guard.drain(..).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logs_carry_component_and_metadata() {
        set_log_format(LogFormat::Text);
        take_test_logs();
        log_info("container", "state change", &[("name", "web"), ("to", "running")]);

        let logs = take_test_logs();
        let line = logs
            .iter()
            .map(|(_, l)| l)
            .find(|l| l.contains("state change"))
            .expect("log line present");
        assert!(line.contains("component=container"));
        assert!(line.contains("name=web"));
        assert!(line.contains("to=running"));
    }

    #[test]
    fn json_logs_are_valid_objects() {
        set_log_format(LogFormat::Json);
        take_test_logs();
        log_warn("holder", "sweep", &[("dead", "2")]);

        let logs = take_test_logs();
        let line = logs
            .iter()
            .map(|(_, l)| l)
            .find(|l| l.contains("sweep"))
            .expect("log line present");
        let payload: Value = serde_json::from_str(line).expect("valid json log");
        assert_eq!(
            payload.get("component").and_then(|v| v.as_str()),
            Some("holder")
        );
        assert_eq!(payload.get("dead").and_then(|v| v.as_str()), Some("2"));
        set_log_format(LogFormat::Text);
    }

    #[test]
    fn debug_lines_are_dropped_unless_verbose() {
        set_log_format(LogFormat::Text);
        VERBOSE.store(false, Ordering::Relaxed);
        take_test_logs();
        log_debug("task", "hidden", &[]);
        assert!(take_test_logs().iter().all(|(_, l)| !l.contains("hidden")));

        VERBOSE.store(true, Ordering::Relaxed);
        log_debug("task", "visible", &[]);
        assert!(take_test_logs().iter().any(|(_, l)| l.contains("visible")));
        VERBOSE.store(false, Ordering::Relaxed);
    }
}

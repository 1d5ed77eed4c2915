//! Output capture for supervised processes.
//!
//! This module provides the per-service ring buffer of captured lines (`LogBuffer`)
//! and the store keyed by service id (`LogStore`) that stdout/stderr readers
//! append to and observers read or subscribe from.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use strip_ansi_escapes::strip;
use tokio::sync::broadcast;

use crate::model::ServiceId;

const LIVE_CAPACITY: usize = 1024;

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

/// A single line of output from a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub service_id: ServiceId,
    pub stream: StreamKind,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    /// The text with ANSI escape sequences removed.
    pub fn plain(&self) -> String {
        String::from_utf8_lossy(&strip(self.text.as_bytes())).into_owned()
    }
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }
}

struct Channel {
    buffer: Mutex<LogBuffer>,
    tx: broadcast::Sender<LogLine>,
}

/// Captured output for every service, bounded per service.
pub struct LogStore {
    max_lines: usize,
    channels: DashMap<ServiceId, Arc<Channel>>,
}

impl LogStore {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            channels: DashMap::new(),
        }
    }

    fn channel(&self, id: &ServiceId) -> Arc<Channel> {
        if let Some(channel) = self.channels.get(id) {
            return channel.clone();
        }
        self.channels
            .entry(id.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(LIVE_CAPACITY);
                Arc::new(Channel {
                    buffer: Mutex::new(LogBuffer::new(self.max_lines)),
                    tx,
                })
            })
            .clone()
    }

    /// Starts capture for a new process, discarding the previous run's lines.
    pub fn attach(&self, id: &ServiceId) -> LogSink {
        let channel = self.channel(id);
        channel.buffer.lock().clear();
        LogSink {
            service_id: id.clone(),
            channel,
        }
    }

    /// Appends a line outside of a process capture.
    pub fn push(&self, id: &ServiceId, stream: StreamKind, text: String) {
        LogSink {
            service_id: id.clone(),
            channel: self.channel(id),
        }
        .push(stream, text);
    }

    /// Lines captured so far, oldest first.
    pub fn read(&self, id: &ServiceId) -> Vec<LogLine> {
        match self.channels.get(id) {
            Some(channel) => channel.buffer.lock().iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Live feed of lines appended after this call.
    pub fn subscribe(&self, id: &ServiceId) -> broadcast::Receiver<LogLine> {
        self.channel(id).tx.subscribe()
    }

    pub fn clear(&self, id: &ServiceId) {
        if let Some(channel) = self.channels.get(id) {
            channel.buffer.lock().clear();
        }
    }

    pub fn remove(&self, id: &ServiceId) {
        self.channels.remove(id);
    }
}

/// Append handle for one service, held by the stream readers of a process.
#[derive(Clone)]
pub struct LogSink {
    service_id: ServiceId,
    channel: Arc<Channel>,
}

impl LogSink {
    pub fn push(&self, stream: StreamKind, text: String) {
        let line = LogLine {
            service_id: self.service_id.clone(),
            stream,
            text,
            timestamp: Utc::now(),
        };
        // Lock held across send so live order matches buffer order.
        let mut buffer = self.channel.buffer.lock();
        buffer.push(line.clone());
        let _ = self.channel.tx.send(line);
    }
}

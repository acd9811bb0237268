//! In-memory tail of recent log lines, served by `GET /logs`.
//!
//! Plugged into `tracing-subscriber` as a second fmt writer so the tail sees
//! exactly what the console sees (minus ANSI colors).

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn push_line(&self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        let stamped = format!("[{}] {}", Local::now().format("%H:%M:%S"), line);
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(stamped);
    }

    /// Snapshot of the tail, oldest first.
    pub fn lines(&self) -> Vec<String> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.iter().cloned().collect()
    }
}

pub struct LogBufferWriter {
    buffer: LogBuffer,
    pending: Vec<u8>,
}

impl io::Write for LogBufferWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(bytes);
        // Split out completed lines; a fmt event may arrive in several writes.
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.buffer.push_line(&String::from_utf8_lossy(&line));
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.buffer.push_line(&String::from_utf8_lossy(&line));
        }
        Ok(())
    }
}

impl Drop for LogBufferWriter {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferWriter {
            buffer: self.clone(),
            pending: Vec::new(),
        }
    }
}

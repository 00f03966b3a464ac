//! Solver progress rendering.
//!
//! Pure presentation: drains the bounded status channel of a solve and
//! prints vertex transitions and build log lines to stderr. Plain mode
//! strips colors for non-TTY consumers.

use crate::solver::{StatusUpdate, Vertex};
use colored::Colorize;
use std::collections::HashSet;
use std::io::Write;
use std::time::Instant;
use tokio::sync::mpsc;

/// Renders status updates as they arrive. One renderer per solve.
pub struct ProgressRenderer {
    plain: bool,
    started: Instant,
    seen_running: HashSet<String>,
    seen_done: HashSet<String>,
}

impl ProgressRenderer {
    pub fn new(plain: bool) -> Self {
        Self {
            plain,
            started: Instant::now(),
            seen_running: HashSet::new(),
            seen_done: HashSet::new(),
        }
    }

    fn timestamp(&self) -> String {
        format!("{:>6.1}s", self.started.elapsed().as_secs_f64())
    }

    fn render_vertex(&mut self, vertex: &Vertex) {
        if vertex.name.is_empty() {
            return;
        }
        if !vertex.error.is_empty() {
            if self.seen_done.insert(vertex.digest.clone()) {
                let line = format!("{} ✗ {}: {}", self.timestamp(), vertex.name, vertex.error);
                self.emit(if self.plain { line.clone() } else { line.red().to_string() });
            }
            return;
        }
        if vertex.completed {
            if self.seen_done.insert(vertex.digest.clone()) {
                let marker = if vertex.cached { "CACHED" } else { "DONE" };
                let line = format!("{} ✓ {} {}", self.timestamp(), marker, vertex.name);
                self.emit(if self.plain {
                    line.clone()
                } else {
                    line.green().to_string()
                });
            }
            return;
        }
        if vertex.started && self.seen_running.insert(vertex.digest.clone()) {
            let line = format!("{} ▶ {}", self.timestamp(), vertex.name);
            self.emit(if self.plain {
                line.clone()
            } else {
                line.cyan().to_string()
            });
        }
    }

    fn render_logs(&mut self, data: &[u8]) {
        let timestamp = self.timestamp();
        for line in String::from_utf8_lossy(data).lines() {
            if line.trim().is_empty() {
                continue;
            }
            let rendered = if self.plain {
                format!("{timestamp} │ {line}")
            } else {
                format!("{timestamp} │ {}", line.dimmed())
            };
            self.emit(rendered);
        }
    }

    fn emit(&self, line: String) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{line}");
    }

    pub fn render(&mut self, update: &StatusUpdate) {
        for vertex in &update.vertexes {
            self.render_vertex(vertex);
        }
        for log in &update.logs {
            self.render_logs(&log.data);
        }
    }
}

/// Drain a status channel into a renderer until the sender side closes.
pub async fn consume(mut status: mpsc::Receiver<StatusUpdate>, mut renderer: ProgressRenderer) {
    while let Some(update) = status.recv().await {
        renderer.render(&update);
    }
}

/// Drain a status channel, collecting the raw build log bytes. Used by the
/// in-container test executor, which parses the runner output out of the
/// build logs.
pub async fn collect_logs(mut status: mpsc::Receiver<StatusUpdate>) -> Vec<u8> {
    let mut buffer = Vec::new();
    while let Some(update) = status.recv().await {
        for log in update.logs {
            buffer.extend_from_slice(&log.data);
        }
    }
    buffer
}

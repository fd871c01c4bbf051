//! Execution Timeline
//!
//! Records step starts, finishes and pauses of one execution so a run can
//! be summarised as per-step durations or an ASCII Gantt chart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What happened at a point in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineEventKind {
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    Paused,
    Resumed,
}

impl TimelineEventKind {
    fn ends_step(self) -> bool {
        matches!(
            self,
            Self::StepCompleted | Self::StepFailed | Self::StepSkipped
        )
    }
}

/// A single timeline entry. Pause and resume events carry the id of the
/// step the execution stopped in front of.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub step_id: String,
    pub kind: TimelineEventKind,
    pub at: Instant,
}

/// Span of one step relative to the timeline origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpan {
    pub step_id: String,
    pub start: Duration,
    pub end: Duration,
    pub outcome: TimelineEventKind,
}

impl StepSpan {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    origin: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            origin: Instant::now(),
        }
    }

    /// Records an event now.
    pub fn record(&mut self, step_id: impl Into<String>, kind: TimelineEventKind) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            kind,
            at: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    /// Finished step spans ordered by start time.
    ///
    /// A step that was retried or re-entered keeps its latest span.
    pub fn spans(&self) -> Vec<StepSpan> {
        let mut open: HashMap<&str, Duration> = HashMap::new();
        let mut spans: Vec<StepSpan> = Vec::new();

        for event in &self.events {
            let offset = event.at.duration_since(self.origin);
            match event.kind {
                TimelineEventKind::StepStarted => {
                    open.insert(&event.step_id, offset);
                }
                kind if kind.ends_step() => {
                    // Skipped steps never start; they get a zero-width span.
                    let start = open.remove(event.step_id.as_str()).unwrap_or(offset);
                    spans.retain(|s| s.step_id != event.step_id);
                    spans.push(StepSpan {
                        step_id: event.step_id.clone(),
                        start,
                        end: offset,
                        outcome: kind,
                    });
                }
                _ => {}
            }
        }

        spans.sort_by_key(|s| s.start);
        spans
    }

    /// Step durations keyed by step id.
    pub fn durations(&self) -> HashMap<String, Duration> {
        self.spans()
            .into_iter()
            .map(|span| {
                let duration = span.duration();
                (span.step_id, duration)
            })
            .collect()
    }

    /// Total time spent paused.
    pub fn paused_time(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut paused_at: Option<Instant> = None;
        for event in &self.events {
            match event.kind {
                TimelineEventKind::Paused => paused_at = paused_at.or(Some(event.at)),
                TimelineEventKind::Resumed => {
                    if let Some(start) = paused_at.take() {
                        total += event.at.duration_since(start);
                    }
                }
                _ => {}
            }
        }
        total
    }

    /// Renders an ASCII Gantt chart, 50 columns wide.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_ms = self.elapsed().as_millis();
        if total_ms == 0 {
            return output;
        }
        let scale = 50.0 / total_ms as f64;

        for span in self.spans() {
            let start_ms = span.start.as_millis();
            let duration_ms = span.duration().as_millis();
            let marker = match span.outcome {
                TimelineEventKind::StepFailed => "x",
                TimelineEventKind::StepSkipped => "-",
                _ => "#",
            };

            let mut bar = " ".repeat((start_ms as f64 * scale) as usize);
            bar.push_str(&marker.repeat(((duration_ms as f64 * scale).max(1.0)) as usize));

            output.push_str(&format!(
                "{:12} |{}| ({} ms)\n",
                truncate(&span.step_id, 12),
                bar,
                duration_ms
            ));
        }

        let paused_ms = self.paused_time().as_millis();
        if paused_ms > 0 {
            output.push_str(&format!("\nPaused: {} ms", paused_ms));
        }
        output.push_str(&format!("\nTotal: {} ms\n", total_ms));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates to a fixed column width.
fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        format!("{:width$}", s, width = width)
    } else {
        let head: String = s.chars().take(width - 3).collect();
        format!("{}...", head)
    }
}

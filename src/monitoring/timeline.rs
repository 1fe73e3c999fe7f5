//! Execution Timeline
//!
//! Tracks step start/end times for generating execution reports and
//! Gantt charts. A timeline is usually rebuilt from a finished workflow's
//! step results with [`ExecutionTimeline::from_workflow`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::workflow::Workflow;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step started executing
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// ID of the step
    pub step_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

/// Tracks the execution timeline of a workflow.
///
/// Records when each step starts, completes, or fails,
/// enabling generation of Gantt charts and timing reports.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

/// Milliseconds from `from` to `to`, clamped at zero.
fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u128 {
    (to - from).num_milliseconds().max(0) as u128
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Builds a timeline from a workflow's recorded step results.
    ///
    /// Starts at the workflow's `started_at` (or the earliest step start)
    /// and ends at its `finished_at` when it has one.
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let results = workflow.results();

        let mut events = Vec::with_capacity(results.len() * 2);
        for step in workflow.steps() {
            if let Some(result) = results.get(&step.id) {
                events.push(TimelineEvent {
                    step_id: step.id.clone(),
                    event_type: EventType::Started,
                    timestamp: result.started_at,
                });
                events.push(TimelineEvent {
                    step_id: step.id.clone(),
                    event_type: if result.is_success() {
                        EventType::Completed
                    } else {
                        EventType::Failed
                    },
                    timestamp: result.finished_at,
                });
            }
        }
        events.sort_by_key(|e| e.timestamp);

        let start_time = workflow
            .started_at()
            .or_else(|| events.first().map(|e| e.timestamp))
            .unwrap_or_else(Utc::now);

        Self {
            events,
            start_time,
            end_time: workflow.finished_at(),
        }
    }

    /// Records an event for a step.
    pub fn add_event(&mut self, step_id: String, event_type: EventType) {
        self.events.push(TimelineEvent {
            step_id,
            event_type,
            timestamp: Utc::now(),
        });
    }

    /// Returns all recorded events.
    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time of the timeline, covering at least
    /// every recorded event.
    pub fn elapsed(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let end = self
            .events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .map_or(end, |last| last.max(end));
        Duration::from_millis(millis_between(self.start_time, end) as u64)
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Each step is shown as a bar indicating when it ran
    /// relative to the total execution time.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();

        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        let mut step_times: HashMap<String, (u128, u128, EventType)> = HashMap::new();

        for event in &self.events {
            let elapsed = millis_between(self.start_time, event.timestamp);

            match event.event_type {
                EventType::Started => {
                    step_times
                        .entry(event.step_id.clone())
                        .or_insert((elapsed, 0, EventType::Started))
                        .0 = elapsed;
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(times) = step_times.get_mut(&event.step_id) {
                        times.1 = elapsed;
                        times.2 = event.event_type;
                    }
                }
            }
        }

        let mut sorted_steps: Vec<_> = step_times.into_iter().collect();
        sorted_steps.sort_by(|(a_id, (a_start, ..)), (b_id, (b_start, ..))| {
            a_start.cmp(b_start).then_with(|| a_id.cmp(b_id))
        });

        for (step_id, (start, end, outcome)) in sorted_steps {
            if outcome == EventType::Started {
                continue;
            }

            let start_pos = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;
            let mark = if outcome == EventType::Failed { "x" } else { "#" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} ms)\n",
                truncate(&step_id, 12),
                bar,
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    /// Returns step durations in milliseconds.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<String, DateTime<Utc>> = HashMap::new();
        let mut durations: HashMap<String, u128> = HashMap::new();

        for event in &self.events {
            match event.event_type {
                EventType::Started => {
                    starts.insert(event.step_id.clone(), event.timestamp);
                }
                EventType::Completed | EventType::Failed => {
                    if let Some(start) = starts.get(&event.step_id) {
                        durations.insert(
                            event.step_id.clone(),
                            millis_between(*start, event.timestamp),
                        );
                    }
                }
            }
        }

        durations
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

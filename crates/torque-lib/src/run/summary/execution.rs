use std::fmt;

use chrono::{DateTime, Duration, Local, SubsecRound};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use tokio::sync::mpsc;
use torque_ui::{color, ColorConfig, BOLD, BOLD_GREEN, BOLD_RED, MAGENTA};

use crate::task_id::TaskId;

// Events are tiny; the channel is sized generously so trackers never block
// on the aggregation task.
type Message = Event;

/// Aggregates per-task events into the run's final counts. One per run;
/// closed exactly once by [`ExecutionTracker::finish`] (which consumes it,
/// so a second close does not compile).
#[derive(Debug)]
pub struct ExecutionTracker {
    // this task handles the state management
    state_thread: tokio::task::JoinHandle<SummaryState>,
    sender: mpsc::Sender<Message>,
}

/// The final states of all task executions.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct SummaryState {
    pub attempted: usize,
    pub failed: usize,
    pub cached: usize,
    pub success: usize,
}

impl SummaryState {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Building => self.attempted += 1,
            Event::BuildFailed => self.failed += 1,
            Event::Cached => self.cached += 1,
            Event::Built => self.success += 1,
        }
    }
}

/// A tracker constructed for each task and used to communicate task events
/// back to the aggregation task.
pub struct TaskTracker<T> {
    sender: mpsc::Sender<Message>,
    started_at: T,
    task_id: TaskId<'static>,
}

#[derive(Debug, Clone, Copy, Serialize)]
enum Event {
    Building,
    BuildFailed,
    Cached,
    Built,
}

/// How a single task attempt ended.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ExecutionState {
    Canceled,
    #[serde(rename_all = "camelCase")]
    Built { exit_code: i32 },
    Cached,
    #[serde(rename_all = "camelCase")]
    BuildFailed { exit_code: i32, err: String },
    Skipped,
}

#[derive(Debug)]
pub struct TaskExecutionSummary {
    started_at: DateTime<Local>,
    ended_at: DateTime<Local>,
    pub state: ExecutionState,
}

impl Serialize for TaskExecutionSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("TaskExecutionSummary", 3)?;
        state.serialize_field("startedAt", &self.started_at.timestamp_millis())?;
        state.serialize_field("endedAt", &self.ended_at.timestamp_millis())?;
        state.serialize_field("state", &self.state)?;
        state.end()
    }
}

impl TaskExecutionSummary {
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExecutionState::BuildFailed { exit_code, .. } | ExecutionState::Built { exit_code } => {
                Some(exit_code)
            }
            _ => None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.ended_at.signed_duration_since(self.started_at)
    }

    /// The run-state label used in summaries: one of `cached`, `built`,
    /// `build-failed`, `skipped`, `canceled`.
    pub fn outcome(&self) -> &'static str {
        match self.state {
            ExecutionState::Canceled => "canceled",
            ExecutionState::Built { .. } => "built",
            ExecutionState::Cached => "cached",
            ExecutionState::BuildFailed { .. } => "build-failed",
            ExecutionState::Skipped => "skipped",
        }
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::channel(128);
        let state_thread = tokio::spawn(async move {
            let mut state = SummaryState::default();
            while let Some(event) = receiver.recv().await {
                state.handle_event(event);
            }
            state
        });

        Self {
            state_thread,
            sender,
        }
    }

    pub fn tracker(&self, task_id: TaskId<'static>) -> TaskTracker<()> {
        TaskTracker {
            sender: self.sender.clone(),
            task_id,
            started_at: (),
        }
    }

    pub async fn finish(self) -> Result<SummaryState, tokio::task::JoinError> {
        let Self {
            state_thread,
            sender,
            ..
        } = self;
        // Dropping the sender closes the channel once all in-flight
        // trackers are done; an explicit close would cut them off.
        drop(sender);

        state_thread.await
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTracker<()> {
    pub async fn start(self) -> TaskTracker<DateTime<Local>> {
        let TaskTracker {
            sender, task_id, ..
        } = self;
        let started_at = Local::now();
        sender
            .send(Event::Building)
            .await
            .expect("execution summary state thread finished early");
        TaskTracker {
            sender,
            started_at,
            task_id,
        }
    }

    /// The task never started: its command was empty or missing.
    pub fn skipped(self) -> TaskExecutionSummary {
        let now = Local::now();
        TaskExecutionSummary {
            started_at: now,
            ended_at: now,
            state: ExecutionState::Skipped,
        }
    }
}

impl TaskTracker<DateTime<Local>> {
    pub fn task_id(&self) -> &TaskId<'static> {
        &self.task_id
    }

    pub fn cancel(self) -> TaskExecutionSummary {
        let Self { started_at, .. } = self;
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Canceled,
        }
    }

    pub async fn cached(self) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Cached)
            .await
            .expect("summary state thread finished early");

        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Cached,
        }
    }

    pub async fn build_succeeded(self, exit_code: i32) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::Built)
            .await
            .expect("summary state thread finished early");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::Built { exit_code },
        }
    }

    pub async fn build_failed(
        self,
        exit_code: i32,
        error: impl fmt::Display,
    ) -> TaskExecutionSummary {
        let Self {
            sender, started_at, ..
        } = self;
        sender
            .send(Event::BuildFailed)
            .await
            .expect("summary state thread finished early");
        TaskExecutionSummary {
            started_at,
            ended_at: Local::now(),
            state: ExecutionState::BuildFailed {
                exit_code,
                err: error.to_string(),
            },
        }
    }
}

/// The footer printed at the end of every run. Byte-stable: tooling greps
/// these lines.
pub struct ExecutionSummary {
    pub state: SummaryState,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
}

impl ExecutionSummary {
    fn duration(&self) -> String {
        let duration = self
            .end_time
            .trunc_subsecs(3)
            .signed_duration_since(self.start_time.trunc_subsecs(3));

        if duration.num_hours() > 0 {
            format!(
                "{}h{}m{}s",
                duration.num_hours(),
                duration.num_minutes() % 60,
                duration.num_seconds() % 60
            )
        } else if duration.num_minutes() > 0 {
            format!(
                "{}m{}s",
                duration.num_minutes(),
                duration.num_seconds() % 60
            )
        } else if duration.num_seconds() > 0 {
            format!("{}s", duration.num_seconds())
        } else {
            format!("{}ms", duration.num_milliseconds())
        }
    }

    pub fn print(&self, color_config: ColorConfig, failed_tasks: Vec<String>) {
        let full_turbo = if self.state.cached == self.state.attempted && self.state.attempted > 0 {
            match std::env::var("TERM_PROGRAM").as_deref() {
                Ok("Apple_Terminal") => color!(color_config, MAGENTA, ">>> FULL TURBO"),
                _ => color_config.rainbow(">>> FULL TURBO"),
            }
        } else {
            String::new()
        };

        let mut line_data = vec![
            (
                "Tasks",
                format!(
                    "{}, {} total",
                    color!(color_config, BOLD_GREEN, "{} successful", self.state.success),
                    self.state.attempted
                ),
            ),
            (
                "Cached",
                format!(
                    "{}, {} total",
                    color!(color_config, BOLD, "{} cached", self.state.cached),
                    self.state.attempted
                ),
            ),
            (
                "Time",
                format!(
                    "{} {}",
                    color!(color_config, BOLD, "{}", self.duration()),
                    full_turbo
                ),
            ),
        ];

        if !failed_tasks.is_empty() {
            let mut formatted: Vec<_> = failed_tasks
                .iter()
                .map(|task| color!(color_config, BOLD_RED, "{task}"))
                .collect();
            formatted.sort();
            line_data.push(("Failed", formatted.join(", ")));
        }

        let max_length = line_data
            .iter()
            .map(|(header, _)| header.len())
            .max()
            .unwrap_or_default();

        println!();
        for (header, trailer) in line_data {
            println!(
                "{}",
                color!(
                    color_config,
                    BOLD,
                    "{}{}:    {}",
                    " ".repeat(max_length - header.len()),
                    header,
                    trailer
                )
            );
        }
        println!();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_multiple_tasks() {
        let summary = ExecutionTracker::new();
        let mut tasks = Vec::new();
        {
            let tracker = summary.tracker(TaskId::new("foo", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let tracker = tracker.start().await;
                let summary = tracker.build_succeeded(0).await;
                assert_eq!(summary.exit_code(), Some(0));
                assert_eq!(summary.outcome(), "built");
            }));
        }
        {
            let tracker = summary.tracker(TaskId::new("bar", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let tracker = tracker.start().await;
                let summary = tracker.cached().await;
                assert_eq!(summary.exit_code(), None);
                assert_eq!(summary.outcome(), "cached");
            }));
        }
        {
            let tracker = summary.tracker(TaskId::new("baz", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let tracker = tracker.start().await;
                let summary = tracker.build_failed(1, "big bad error").await;
                assert_eq!(summary.exit_code(), Some(1));
                assert_eq!(summary.outcome(), "build-failed");
            }));
        }
        {
            let tracker = summary.tracker(TaskId::new("boo", "build").into_owned());
            tasks.push(tokio::spawn(async move {
                let tracker = tracker.start().await;
                let summary = tracker.cancel();
                assert_eq!(summary.exit_code(), None);
                assert_eq!(summary.outcome(), "canceled");
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let state = summary.finish().await.unwrap();
        assert_eq!(state.attempted, 4);
        assert_eq!(state.cached, 1);
        assert_eq!(state.failed, 1);
        assert_eq!(state.success, 1);
    }

    #[tokio::test]
    async fn test_skipped_task_is_not_attempted() {
        let summary = ExecutionTracker::new();
        let tracker = summary.tracker(TaskId::new("foo", "noop").into_owned());
        let task_summary = tracker.skipped();
        assert_eq!(task_summary.outcome(), "skipped");

        let state = summary.finish().await.unwrap();
        assert_eq!(state.attempted, 0);
    }

    #[tokio::test]
    async fn test_timing() {
        let summary = ExecutionTracker::new();
        let tracker = summary.tracker(TaskId::new("foo", "build").into_owned());
        let post_construction_time = Local::now();
        let sleep_duration = Duration::milliseconds(5);
        tokio::time::sleep(sleep_duration.to_std().unwrap()).await;

        let tracker = tracker.start().await;

        tokio::time::sleep(sleep_duration.to_std().unwrap()).await;
        let task_summary = tracker.build_succeeded(0).await;
        assert!(
            post_construction_time < task_summary.started_at,
            "tracker start time starts when start is called"
        );
        assert!(
            sleep_duration <= task_summary.duration(),
            "duration covers the time between start and finish"
        );
    }

    #[test]
    fn test_serialized_state_shape() {
        let state = ExecutionState::BuildFailed {
            exit_code: 3,
            err: "boom".to_string(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "buildFailed");
        assert_eq!(json["exitCode"], 3);
    }
}

//! Prompt queue feeding a backend that runs one prompt at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
	Pending,
	Running,
	Completed,
	Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorTask {
	pub id: String,
	pub prompt: String,
	pub status: TaskStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub label: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub started_at: Option<DateTime<Utc>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewTask {
	pub prompt: String,
	#[serde(default)]
	pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueSnapshot {
	pub enabled: bool,
	pub auto_advance: bool,
	pub tasks: Vec<CoordinatorTask>,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptions {
	pub enabled: bool,
	pub auto_advance: bool,
	/// Prepended to every dispatched prompt when non-empty.
	pub prompt_prefix: String,
}

/// Receives the task being started and the prompt text to run.
pub type DispatchFn = Box<dyn Fn(&CoordinatorTask, String) + Send + Sync>;
pub type StateFn = Box<dyn Fn(&TaskQueueSnapshot) + Send + Sync>;

struct Queue {
	tasks: Vec<CoordinatorTask>,
	enabled: bool,
	auto_advance: bool,
	prompt_prefix: String,
}

impl Queue {
	fn snapshot(&self) -> TaskQueueSnapshot {
		TaskQueueSnapshot {
			enabled: self.enabled,
			auto_advance: self.auto_advance,
			tasks: self.tasks.clone(),
		}
	}

	fn running_index(&self) -> Option<usize> {
		self.tasks.iter().position(|t| t.status == TaskStatus::Running)
	}

	/// The only way a task becomes `Running`.
	fn start_next(&mut self) -> Option<(CoordinatorTask, String)> {
		if self.running_index().is_some() {
			return None;
		}
		let task = self.tasks.iter_mut().find(|t| t.status == TaskStatus::Pending)?;
		task.status = TaskStatus::Running;
		task.started_at = Some(Utc::now());
		let prompt = apply_prefix(&self.prompt_prefix, &task.prompt);
		Some((task.clone(), prompt))
	}

	fn finish_running(&mut self, status: TaskStatus, error: Option<String>) -> Option<String> {
		let index = self.running_index()?;
		let task = &mut self.tasks[index];
		task.status = status;
		task.error = error;
		task.completed_at = Some(Utc::now());
		Some(task.id.clone())
	}
}

pub fn apply_prefix(prefix: &str, prompt: &str) -> String {
	if prefix.trim().is_empty() {
		prompt.to_string()
	} else {
		format!("{prefix}\n\n{prompt}")
	}
}

pub struct TaskCoordinator {
	queue: Mutex<Queue>,
	dispatch: DispatchFn,
	on_state: StateFn,
}

impl TaskCoordinator {
	pub fn new(options: CoordinatorOptions, dispatch: DispatchFn, on_state: StateFn) -> Self {
		Self {
			queue: Mutex::new(Queue {
				tasks: Vec::new(),
				enabled: options.enabled,
				auto_advance: options.auto_advance,
				prompt_prefix: options.prompt_prefix,
			}),
			dispatch,
			on_state,
		}
	}

	fn queue(&self) -> MutexGuard<'_, Queue> {
		self.queue.lock().unwrap_or_else(|e| e.into_inner())
	}

	/// Run `f` under the lock, then publish the resulting snapshot. Callbacks
	/// never run with the lock held.
	fn mutate<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> R {
		let (result, snapshot) = {
			let mut queue = self.queue();
			let result = f(&mut queue);
			(result, queue.snapshot())
		};
		(self.on_state)(&snapshot);
		result
	}

	fn launch(&self, started: Option<(CoordinatorTask, String)>) -> bool {
		match started {
			Some((task, prompt)) => {
				info!(id = %task.id, label = ?task.label, "dispatching task");
				(self.dispatch)(&task, prompt);
				true
			}
			None => false,
		}
	}

	pub fn add_task(&self, prompt: impl Into<String>, label: Option<String>) -> CoordinatorTask {
		let task = new_task(prompt.into(), label);
		debug!(id = %task.id, "task queued");
		self.mutate(|queue| queue.tasks.push(task.clone()));
		task
	}

	pub fn add_tasks(&self, tasks: Vec<NewTask>) -> Vec<CoordinatorTask> {
		let created: Vec<CoordinatorTask> = tasks
			.into_iter()
			.map(|t| new_task(t.prompt, t.label))
			.collect();
		self.mutate(|queue| queue.tasks.extend(created.iter().cloned()));
		created
	}

	/// False for an unknown or running task.
	pub fn remove_task(&self, id: &str) -> bool {
		self.mutate(|queue| {
			let Some(index) = queue.tasks.iter().position(|t| t.id == id) else {
				return false;
			};
			if queue.tasks[index].status == TaskStatus::Running {
				return false;
			}
			queue.tasks.remove(index);
			true
		})
	}

	/// Drop every task that is neither running nor completed.
	pub fn clear_pending(&self) -> usize {
		self.mutate(|queue| {
			let before = queue.tasks.len();
			queue
				.tasks
				.retain(|t| matches!(t.status, TaskStatus::Running | TaskStatus::Completed));
			before - queue.tasks.len()
		})
	}

	pub fn enable(&self) {
		self.mutate(|queue| queue.enabled = true);
	}

	pub fn disable(&self) {
		self.mutate(|queue| queue.enabled = false);
	}

	pub fn set_auto_advance(&self, on: bool) {
		self.mutate(|queue| queue.auto_advance = on);
	}

	/// Manual advance. Ignores the gates but never starts a second task.
	pub fn dispatch_next(&self) -> bool {
		let started = self.mutate(Queue::start_next);
		self.launch(started)
	}

	/// Start the next task if the gates allow and nothing is running. Used when
	/// work is queued while the backend is already idle.
	pub fn advance(&self) -> bool {
		let started = self.mutate(|queue| {
			if queue.enabled && queue.auto_advance {
				queue.start_next()
			} else {
				None
			}
		});
		self.launch(started)
	}

	/// The backend went idle: complete the running task, then maybe start the
	/// next one.
	pub fn on_idle(&self) -> bool {
		let started = self.mutate(|queue| {
			if let Some(id) = queue.finish_running(TaskStatus::Completed, None) {
				info!(id = %id, "task completed");
			}
			if queue.enabled && queue.auto_advance {
				queue.start_next()
			} else {
				None
			}
		});
		self.launch(started)
	}

	pub fn mark_current_failed(&self, reason: Option<String>) -> bool {
		self.mutate(|queue| {
			let reason = reason.or_else(|| Some("task failed".to_string()));
			match queue.finish_running(TaskStatus::Failed, reason) {
				Some(id) => {
					info!(id = %id, "task failed");
					true
				}
				None => false,
			}
		})
	}

	pub fn snapshot(&self) -> TaskQueueSnapshot {
		self.queue().snapshot()
	}
}

fn new_task(prompt: String, label: Option<String>) -> CoordinatorTask {
	CoordinatorTask {
		id: uuid::Uuid::new_v4().to_string(),
		prompt,
		status: TaskStatus::Pending,
		label,
		error: None,
		created_at: Utc::now(),
		started_at: None,
		completed_at: None,
	}
}

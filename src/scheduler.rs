use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use futures_util::future::{join_all, BoxFuture, FutureExt};

use crate::model::path_depth;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub success: bool,
    pub message: String,
}

impl TaskOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

pub struct Task<'a> {
    pub label: String,
    pub priority: i64,
    future: BoxFuture<'a, TaskOutcome>,
}

impl<'a> Task<'a> {
    pub fn new<F>(label: impl Into<String>, priority: i64, fut: F) -> Self
    where
        F: Future<Output = TaskOutcome> + Send + 'a,
    {
        Self {
            label: label.into(),
            priority,
            future: fut.boxed(),
        }
    }
}

impl fmt::Debug for Task<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("priority", &self.priority)
            .finish()
    }
}

// Groups run highest priority first: deletes deepest first, then creates
// shallowest first.
pub fn create_priority(relative_path: &str) -> i64 {
    -(depth_offset(relative_path))
}

pub fn delete_priority(relative_path: &str) -> i64 {
    depth_offset(relative_path)
}

fn depth_offset(relative_path: &str) -> i64 {
    path_depth(relative_path).saturating_sub(1) as i64
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TaskScheduler;

impl TaskScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Group tasks by priority, in execution order.
    pub fn plan(tasks: Vec<Task<'_>>) -> Vec<(i64, Vec<Task<'_>>)> {
        let mut groups: BTreeMap<i64, Vec<Task<'_>>> = BTreeMap::new();
        for task in tasks {
            groups.entry(task.priority).or_default().push(task);
        }
        groups.into_iter().rev().collect()
    }

    /// Run every task. A failing task never stops its siblings or the
    /// following groups; outcomes come back in execution-group order.
    pub async fn run(&self, tasks: Vec<Task<'_>>) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for (priority, group) in Self::plan(tasks) {
            crate::logging::info_kv(
                "running task group",
                &[
                    ("priority", &priority.to_string()),
                    ("tasks", &group.len().to_string()),
                ],
            );
            let labels: Vec<String> = group.iter().map(|t| t.label.clone()).collect();
            let results = join_all(group.into_iter().map(|t| t.future)).await;
            for (label, outcome) in labels.into_iter().zip(results) {
                if !outcome.success {
                    crate::logging::error(format!("task failed {label}: {}", outcome.message));
                }
                outcomes.push(outcome);
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn priorities_follow_depth() {
        assert_eq!(create_priority("a"), 0);
        assert_eq!(create_priority("a/b"), -1);
        assert_eq!(create_priority("a/b/c.txt"), -2);
        assert_eq!(delete_priority("a"), 0);
        assert_eq!(delete_priority("a/b"), 1);
        assert_eq!(delete_priority("a/b/c.txt"), 2);
    }

    #[tokio::test]
    async fn create_groups_run_shallow_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (label, priority, delay) in [("a/b/c", -2, 1), ("a", 0, 30), ("a/b", -1, 5)] {
            let order = order.clone();
            tasks.push(Task::new(label, priority, async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                order.lock().unwrap().push(label);
                TaskOutcome::ok(label)
            }));
        }
        let outcomes = TaskScheduler::new().run(tasks).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["a", "a/b", "a/b/c"]);
    }

    #[tokio::test]
    async fn group_waits_for_all_members_and_failures_do_not_abort() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        {
            let finished = finished.clone();
            tasks.push(Task::new("fails fast", 0, async move {
                finished.lock().unwrap().push("fails fast");
                TaskOutcome::failed("boom")
            }));
        }
        {
            let finished = finished.clone();
            tasks.push(Task::new("slow sibling", 0, async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.lock().unwrap().push("slow sibling");
                TaskOutcome::ok("done")
            }));
        }
        {
            let finished = finished.clone();
            tasks.push(Task::new("next group", -1, async move {
                finished.lock().unwrap().push("next group");
                TaskOutcome::ok("done")
            }));
        }

        let outcomes = TaskScheduler::new().run(tasks).await;
        assert_eq!(outcomes.iter().filter(|o| !o.success).count(), 1);
        let finished = finished.lock().unwrap();
        assert_eq!(finished.len(), 3);
        assert_eq!(finished[2], "next group");
    }

    #[test]
    fn plan_groups_equal_priorities() {
        let tasks = vec![
            Task::new("x", 0, async { TaskOutcome::ok("") }),
            Task::new("y", -1, async { TaskOutcome::ok("") }),
            Task::new("z", 0, async { TaskOutcome::ok("") }),
        ];
        let groups = TaskScheduler::plan(tasks);
        let keys: Vec<i64> = groups.iter().map(|(p, _)| *p).collect();
        assert_eq!(keys, vec![0, -1]);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[tokio::test]
    async fn delete_groups_run_deepest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for path in ["a", "a/b/c.txt", "a/b"] {
            let order = order.clone();
            tasks.push(Task::new(path, delete_priority(path), async move {
                order.lock().unwrap().push(path);
                TaskOutcome::ok(path)
            }));
        }
        TaskScheduler::new().run(tasks).await;
        assert_eq!(*order.lock().unwrap(), vec!["a/b/c.txt", "a/b", "a"]);
    }
}

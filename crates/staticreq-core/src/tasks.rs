//! Background refresh tasks and the registry that selects which to run.
//!
//! A task pairs a descriptor with fixed params and two gates:
//! `need_login` (only runs while logged in, re-runs on every login) and
//! `launch_only` (runs once, at registration).

use std::fmt;
use std::sync::Arc;

use crate::manager::StaticRequestManager;
use crate::request::StaticRequest;

type TaskRunner = dyn Fn(&StaticRequestManager) + Send + Sync;

/// An immutable refresh task. Clone is cheap.
#[derive(Clone)]
pub struct StaticTask {
    request_type: &'static str,
    need_login: bool,
    launch_only: bool,
    runner: Arc<TaskRunner>,
}

impl StaticTask {
    /// Each run clones `request` and issues a network-first fetch for
    /// `params` with no completion callback.
    pub fn new<D>(request: D, params: D::Params, need_login: bool, launch_only: bool) -> Self
    where
        D: StaticRequest + Clone,
    {
        let runner = move |manager: &StaticRequestManager| {
            manager.get_data_ignore_cache(request.clone(), params.clone(), |_model: D::Model| {});
        };

        Self {
            request_type: D::TYPE_NAME,
            need_login,
            launch_only,
            runner: Arc::new(runner),
        }
    }

    pub fn request_type(&self) -> &'static str {
        self.request_type
    }

    pub fn need_login(&self) -> bool {
        self.need_login
    }

    pub fn launch_only(&self) -> bool {
        self.launch_only
    }

    pub(crate) fn run(&self, manager: &StaticRequestManager) {
        (self.runner)(manager)
    }

    fn allowed(&self, logged_in: bool) -> bool {
        !self.need_login || logged_in
    }
}

impl fmt::Debug for StaticTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTask")
            .field("request_type", &self.request_type)
            .field("need_login", &self.need_login)
            .field("launch_only", &self.launch_only)
            .finish()
    }
}

/// The registered task set.
///
/// Only replaced wholesale by [`StaticRequestManager::register_tasks`];
/// the lifecycle listener reads it.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<StaticTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, tasks: Vec<StaticTask>) {
        self.tasks = tasks;
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks to run right after registration: all of them, login-gated.
    pub fn launch_batch(&self, logged_in: bool) -> Vec<StaticTask> {
        self.tasks
            .iter()
            .filter(|t| t.allowed(logged_in))
            .cloned()
            .collect()
    }

    /// Tasks to run when the app comes to the foreground.
    pub fn foreground_batch(&self, logged_in: bool) -> Vec<StaticTask> {
        self.tasks
            .iter()
            .filter(|t| !t.launch_only && t.allowed(logged_in))
            .cloned()
            .collect()
    }

    /// Tasks to run after a login: the recurring login-gated ones.
    pub fn login_batch(&self) -> Vec<StaticTask> {
        self.tasks
            .iter()
            .filter(|t| t.need_login && !t.launch_only)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Clone)]
    struct Noop;

    #[async_trait]
    impl StaticRequest for Noop {
        type Params = ();
        type Model = ();
        const TYPE_NAME: &'static str = "Noop";

        async fn fetch(&self, _params: &()) -> Result<Vec<u8>, FetchError> {
            Ok(b"null".to_vec())
        }

        fn package_to_model(_raw: &Value, _params: &()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.replace(vec![
            StaticTask::new(Noop, (), false, false), // public, recurring
            StaticTask::new(Noop, (), false, true),  // public, launch only
            StaticTask::new(Noop, (), true, false),  // login, recurring
            StaticTask::new(Noop, (), true, true),   // login, launch only
        ]);
        registry
    }

    fn flags(tasks: &[StaticTask]) -> Vec<(bool, bool)> {
        tasks
            .iter()
            .map(|t| (t.need_login(), t.launch_only()))
            .collect()
    }

    #[test]
    fn test_launch_batch_respects_login() {
        let registry = registry();
        assert_eq!(registry.launch_batch(true).len(), 4);
        assert_eq!(
            flags(&registry.launch_batch(false)),
            vec![(false, false), (false, true)]
        );
    }

    #[test]
    fn test_foreground_batch_skips_launch_only() {
        let registry = registry();
        assert_eq!(
            flags(&registry.foreground_batch(true)),
            vec![(false, false), (true, false)]
        );
        assert_eq!(flags(&registry.foreground_batch(false)), vec![(false, false)]);
    }

    #[test]
    fn test_login_batch() {
        assert_eq!(flags(&registry().login_batch()), vec![(true, false)]);
    }

    #[test]
    fn test_replace_is_wholesale() {
        let mut registry = registry();
        registry.replace(vec![StaticTask::new(Noop, (), false, false)]);
        assert_eq!(registry.len(), 1);
        registry.replace(Vec::new());
        assert!(registry.is_empty());
        assert!(registry.launch_batch(true).is_empty());
    }

    #[test]
    fn test_task_debug_names_request_type() {
        let task = StaticTask::new(Noop, (), true, false);
        let debug = format!("{:?}", task);
        assert!(debug.contains("Noop"));
        assert_eq!(task.request_type(), "Noop");
    }
}

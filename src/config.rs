use crate::error::{Error, Result};
use crate::thread::priority::{self, Priority};
use std::time::Duration;

/// How a loop-bound executor treats `schedule_at_fixed_rate` and
/// `schedule_with_fixed_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodicPolicy {
    /// Run once at the initial delay and never repeat.
    OneShot,
    /// Reschedule the next occurrence after each run.
    Repeat,
}

impl Default for PeriodicPolicy {
    fn default() -> Self {
        PeriodicPolicy::OneShot
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub main_name: String,
    pub work_name: String,
    pub scheduled_name: String,
    pub elastic_name: String,

    pub io_priority: Priority,
    pub io_os_priority: i32,
    pub work_priority: Priority,
    pub work_os_priority: i32,

    pub keep_alive: Duration,
    pub pool_queue_capacity: usize,
    pub pool_max_threads: usize,
    pub scheduled_core_threads: usize,

    pub stack_size: Option<usize>,
    pub loop_periodic: PeriodicPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            main_name: "main".to_string(),
            work_name: "work".to_string(),
            scheduled_name: "sche".to_string(),
            elastic_name: "elas".to_string(),

            io_priority: Priority::Normal,
            io_os_priority: priority::THREAD_PRIORITY_DEFAULT
                + priority::THREAD_PRIORITY_LESS_FAVORABLE,
            work_priority: Priority::Normal,
            work_os_priority: priority::THREAD_PRIORITY_DEFAULT
                + priority::THREAD_PRIORITY_LESS_FAVORABLE,

            keep_alive: Duration::from_secs(30),
            pool_queue_capacity: 1,
            pool_max_threads: 256,
            scheduled_core_threads: 4,

            stack_size: None,
            loop_periodic: PeriodicPolicy::default(),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        for (field, name) in [
            ("main_name", &self.main_name),
            ("work_name", &self.work_name),
            ("scheduled_name", &self.scheduled_name),
            ("elastic_name", &self.elastic_name),
        ] {
            if name.is_empty() {
                return Err(Error::config(format!("{} must not be empty", field)));
            }
            if name.contains('\0') {
                return Err(Error::config(format!("{} contains a NUL byte", field)));
            }
        }

        for os in [self.io_os_priority, self.work_os_priority] {
            if !priority::is_valid_os_priority(os) {
                return Err(Error::config(format!(
                    "os priority {} outside [{}, {}]",
                    os,
                    priority::THREAD_PRIORITY_URGENT_AUDIO,
                    priority::THREAD_PRIORITY_LOWEST
                )));
            }
        }

        if self.pool_queue_capacity == 0 {
            return Err(Error::config("pool_queue_capacity must be > 0"));
        }
        if self.pool_max_threads == 0 {
            return Err(Error::config("pool_max_threads must be > 0"));
        }
        if self.scheduled_core_threads == 0 {
            return Err(Error::config("scheduled_core_threads must be > 0"));
        }
        if self.scheduled_core_threads > 1024 {
            return Err(Error::config("scheduled_core_threads too large (max 1024)"));
        }
        if self.keep_alive.is_zero() {
            return Err(Error::config("keep_alive must be > 0"));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn main_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.main_name = name.into();
        self
    }

    pub fn work_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.work_name = name.into();
        self
    }

    pub fn scheduled_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.scheduled_name = name.into();
        self
    }

    pub fn elastic_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.elastic_name = name.into();
        self
    }

    pub fn io_priority(mut self, priority: Priority, os_priority: i32) -> Self {
        self.config.io_priority = priority;
        self.config.io_os_priority = os_priority;
        self
    }

    pub fn work_priority(mut self, priority: Priority, os_priority: i32) -> Self {
        self.config.work_priority = priority;
        self.config.work_os_priority = os_priority;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn pool_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_queue_capacity = capacity;
        self
    }

    pub fn pool_max_threads(mut self, n: usize) -> Self {
        self.config.pool_max_threads = n;
        self
    }

    pub fn scheduled_core_threads(mut self, n: usize) -> Self {
        self.config.scheduled_core_threads = n;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn loop_periodic(mut self, policy: PeriodicPolicy) -> Self {
        self.config.loop_periodic = policy;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.io_os_priority, 1);
        assert_eq!(config.pool_queue_capacity, 1);
        assert_eq!(config.scheduled_core_threads, 4);
        assert_eq!(config.keep_alive, Duration::from_secs(30));
        assert_eq!(config.loop_periodic, PeriodicPolicy::OneShot);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(Config::builder().scheduled_core_threads(0).build().is_err());
        assert!(Config::builder().pool_queue_capacity(0).build().is_err());
        assert!(Config::builder().main_name("").build().is_err());
        assert!(Config::builder()
            .io_priority(Priority::Normal, 42)
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_overrides() {
        let config = Config::builder()
            .work_name("bg")
            .pool_max_threads(8)
            .loop_periodic(PeriodicPolicy::Repeat)
            .build()
            .unwrap();

        assert_eq!(config.work_name, "bg");
        assert_eq!(config.pool_max_threads, 8);
        assert_eq!(config.loop_periodic, PeriodicPolicy::Repeat);
    }
}

//! Configuration loading from YAML files
//!
//! A configuration file describes one application:
//!
//! ```yaml
//! name: shop
//! pids_dir: /var/run/sv/shop/pids
//! logs_dir: /var/log/sv/shop/logs
//! processes:
//!   redis:
//!     group: cache
//!     start: redis-server /etc/redis.conf
//!     ping_command: redis-cli ping
//!     conditions:
//!       - check: memory_usage
//!         above: 200M
//!         times: [3, 5]
//!     triggers:
//!       - type: flapping
//!         times: 3
//!         within: 60
//! ```
//!
//! A directory is loaded file by file in filename order. Unknown keys are
//! rejected; an entry that fails validation is logged and skipped.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::constants::{
    DEFAULT_FLAPPING_RETRY_AFTER_SEC, DEFAULT_FLAPPING_TIMES, DEFAULT_FLAPPING_WITHIN_SEC,
    DEFAULT_RESTART_TIMEOUT_SEC, DEFAULT_START_TIMEOUT_SEC, DEFAULT_STOP_TIMEOUT_SEC,
};
use crate::domain::services::{AlwaysTrue, Condition, CpuUsage, ExecProbe, MemoryUsage};
use crate::domain::{
    parse_memory, parse_percent, ActionSpec, BreachRule, ChildPolicy, ConditionAction,
    ConditionSpec, DomainError, Event, ProcessDefinition, ProcessSignal, ProcessState,
    StdinSource, TransitionAction, TriggerSpec,
};

/// Application name used for default directories when a file has none
pub const DEFAULT_APP_NAME: &str = "sv";

/// Top-level configuration document
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub pids_dir: Option<String>,

    #[serde(default)]
    pub logs_dir: Option<String>,

    #[serde(default)]
    pub processes: BTreeMap<String, ProcessConfig>,
}

/// Process configuration from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    /// Begin supervision as soon as the file is loaded
    #[serde(default = "default_true")]
    pub monitor: bool,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default)]
    pub autostart: Option<bool>,

    #[serde(default)]
    pub daemonize: Option<bool>,

    // Start action
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub before_start: Option<String>,
    #[serde(default)]
    pub after_start: Option<String>,
    #[serde(default)]
    pub start_timeout: Option<u64>,
    #[serde(default)]
    pub start_env: HashMap<String, String>,
    #[serde(default)]
    pub start_with_input: Option<String>,
    #[serde(default)]
    pub start_with_input_file: Option<String>,
    #[serde(default)]
    pub start_with_input_command: Option<String>,

    // Stop action
    #[serde(default)]
    pub stop: Option<String>,
    #[serde(default)]
    pub before_stop: Option<String>,
    #[serde(default)]
    pub after_stop: Option<String>,
    #[serde(default)]
    pub stop_timeout: Option<u64>,
    #[serde(default)]
    pub stop_signals: Option<Vec<String>>,
    #[serde(default)]
    pub stop_env: HashMap<String, String>,

    // Restart action
    #[serde(default)]
    pub restart: Option<String>,
    #[serde(default)]
    pub before_restart: Option<String>,
    #[serde(default)]
    pub after_restart: Option<String>,
    #[serde(default)]
    pub restart_timeout: Option<u64>,
    #[serde(default)]
    pub restart_signals: Option<Vec<String>>,
    #[serde(default)]
    pub restart_env: HashMap<String, String>,

    #[serde(default)]
    pub ping_command: Option<String>,

    #[serde(default)]
    pub pid_command: Option<String>,

    #[serde(default)]
    pub pidfile: Option<String>,

    #[serde(default)]
    pub logfile: Option<String>,

    #[serde(default)]
    pub errfile: Option<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub chdir: Option<String>,

    #[serde(default)]
    pub chroot: Option<String>,

    /// Octal string, e.g. "022"
    #[serde(default)]
    pub umask: Option<String>,

    #[serde(default)]
    pub uid: Option<String>,

    #[serde(default)]
    pub gid: Option<String>,

    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,

    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default)]
    pub monitor_children: Option<ChildrenConfig>,
}

/// Number or string scalar, e.g. `60`, `"60%"` or `"200M"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl Scalar {
    fn as_text(&self) -> String {
        match self {
            Scalar::Number(n) => n.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }
}

/// `times: 3` or `times: [3, 5]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimesConfig {
    Count(usize),
    Window(Vec<usize>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionConfig {
    /// cpu_usage, memory_usage, always_true or exec
    pub check: String,

    #[serde(default)]
    pub above: Option<Scalar>,

    /// Command printing a number, for `exec`
    #[serde(default)]
    pub command: Option<String>,

    /// Seconds between samples; 0 samples every tick
    #[serde(default)]
    pub every: u64,

    #[serde(default)]
    pub times: Option<TimesConfig>,

    #[serde(default, rename = "do")]
    pub actions: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TriggerConfig {
    Flapping {
        #[serde(default)]
        times: Option<usize>,
        /// Seconds
        #[serde(default)]
        within: Option<u64>,
        /// Seconds; 0 disables the retry
        #[serde(default)]
        retry_after: Option<u64>,
        /// 0 means unlimited
        #[serde(default)]
        retries: u32,
    },
    Transition {
        #[serde(default)]
        from: Vec<String>,
        #[serde(default)]
        to: Vec<String>,
        #[serde(rename = "do")]
        action: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChildrenConfig {
    /// `{{PID}}` is replaced with the child pid
    #[serde(default)]
    pub stop_command: Option<String>,

    #[serde(default)]
    pub conditions: Vec<ConditionConfig>,
}

fn default_true() -> bool {
    true
}

/// A validated process ready to be registered
#[derive(Debug, Clone)]
pub struct LoadedProcess {
    pub definition: ProcessDefinition,
    pub monitor: bool,
}

/// Directories applied to processes that do not set their own files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDirs {
    pub pids_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl AppDirs {
    pub fn for_app(app: &str) -> Self {
        Self {
            pids_dir: PathBuf::from(format!("/var/run/sv/{}/pids", app)),
            logs_dir: PathBuf::from(format!("/var/log/sv/{}/logs", app)),
        }
    }
}

impl ConfigFile {
    pub fn parse(contents: &str) -> Result<Self, DomainError> {
        serde_yaml::from_str(contents)
            .map_err(|e| DomainError::InvalidConfiguration(format!("Failed to parse YAML: {}", e)))
    }

    pub fn dirs(&self) -> AppDirs {
        let defaults = AppDirs::for_app(self.name.as_deref().unwrap_or(DEFAULT_APP_NAME));
        AppDirs {
            pids_dir: self
                .pids_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(defaults.pids_dir),
            logs_dir: self
                .logs_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or(defaults.logs_dir),
        }
    }

    /// Convert every process entry; invalid entries are logged and skipped
    pub fn into_processes(self) -> Vec<LoadedProcess> {
        let dirs = self.dirs();
        for dir in [&dirs.pids_dir, &dirs.logs_dir] {
            if let Err(e) = fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "Failed to create directory");
            }
        }

        let mut loaded = Vec::with_capacity(self.processes.len());
        for (name, config) in self.processes {
            let monitor = config.monitor;
            match config.into_definition(&name, &dirs) {
                Ok(definition) => loaded.push(LoadedProcess {
                    definition,
                    monitor,
                }),
                Err(e) => warn!(process = %name, error = %e, "Skipping invalid process"),
            }
        }
        loaded
    }
}

impl ProcessConfig {
    pub fn into_definition(self, name: &str, dirs: &AppDirs) -> Result<ProcessDefinition, DomainError> {
        let daemonize = self.daemonize.unwrap_or(true);
        let mut builder = ProcessDefinition::builder(name)
            .autostart(self.autostart.unwrap_or(true))
            .daemonize(daemonize)
            .start(ActionSpec {
                before: self.before_start,
                command: self.start,
                after: self.after_start,
                env: self.start_env,
                ..ActionSpec::with_timeout(
                    self.start_timeout.unwrap_or(DEFAULT_START_TIMEOUT_SEC),
                    Vec::new(),
                )
            })
            .stop(ActionSpec {
                before: self.before_stop,
                command: self.stop,
                after: self.after_stop,
                env: self.stop_env,
                ..ActionSpec::with_timeout(
                    self.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT_SEC),
                    parse_signals(self.stop_signals.as_deref())?,
                )
            })
            .restart(ActionSpec {
                before: self.before_restart,
                command: self.restart,
                after: self.after_restart,
                env: self.restart_env,
                ..ActionSpec::with_timeout(
                    self.restart_timeout.unwrap_or(DEFAULT_RESTART_TIMEOUT_SEC),
                    parse_signals(self.restart_signals.as_deref())?,
                )
            })
            .env(self.env)
            .groups(self.groups);

        let stdin = [
            self.start_with_input.map(StdinSource::Literal),
            self.start_with_input_file.map(StdinSource::File),
            self.start_with_input_command.map(StdinSource::Command),
        ];
        let mut stdin = stdin.into_iter().flatten();
        if let Some(source) = stdin.next() {
            if stdin.next().is_some() {
                return Err(DomainError::InvalidConfiguration(format!(
                    "{}: only one of start_with_input, start_with_input_file and start_with_input_command may be set",
                    name
                )));
            }
            builder = builder.stdin(source);
        }

        if let Some(group) = self.group {
            builder = builder.group(group);
        }
        if let Some(command) = self.ping_command {
            builder = builder.ping_command(command);
        }
        if let Some(command) = self.pid_command {
            builder = builder.pid_command(command);
        }

        let pidfile = self.pidfile.or_else(|| {
            daemonize.then(|| dirs.pids_dir.join(format!("{}.pid", name)).to_string_lossy().into_owned())
        });
        if let Some(pidfile) = pidfile {
            builder = builder.pidfile(pidfile);
        }
        let logfile = self
            .logfile
            .unwrap_or_else(|| dirs.logs_dir.join(format!("{}.log", name)).to_string_lossy().into_owned());
        builder = builder.logfile(logfile);
        if let Some(errfile) = self.errfile {
            builder = builder.errfile(errfile);
        }

        if let Some(dir) = self.chdir {
            builder = builder.chdir(dir);
        }
        if let Some(dir) = self.chroot {
            builder = builder.chroot(dir);
        }
        if let Some(umask) = self.umask {
            let parsed = u32::from_str_radix(umask.trim(), 8).map_err(|_| {
                DomainError::InvalidConfiguration(format!("{}: invalid umask '{}'", name, umask))
            })?;
            builder = builder.umask(parsed);
        }
        if let Some(uid) = self.uid {
            builder = builder.uid(uid);
        }
        if let Some(gid) = self.gid {
            builder = builder.gid(gid);
        }

        for condition in self.conditions {
            builder = builder.condition(condition.into_spec()?);
        }
        for trigger in self.triggers {
            builder = builder.trigger(trigger.into_spec()?);
        }
        if let Some(children) = self.monitor_children {
            builder = builder.monitor_children(ChildPolicy {
                conditions: children
                    .conditions
                    .into_iter()
                    .map(ConditionConfig::into_spec)
                    .collect::<Result<_, _>>()?,
                stop_command: children.stop_command,
            });
        }

        builder.build()
    }
}

fn parse_signals(names: Option<&[String]>) -> Result<Vec<ProcessSignal>, DomainError> {
    match names {
        Some(names) => ProcessSignal::parse_list(names),
        None => Ok(ProcessSignal::default_escalation()),
    }
}

impl ConditionConfig {
    pub fn into_spec(self) -> Result<ConditionSpec, DomainError> {
        let above = || {
            self.above.as_ref().map(Scalar::as_text).ok_or_else(|| {
                DomainError::InvalidConfiguration(format!("{}: 'above' is required", self.check))
            })
        };

        let condition: Arc<dyn Condition> = match self.check.as_str() {
            "cpu_usage" => Arc::new(CpuUsage {
                above: parse_percent(&above()?)?,
            }),
            "memory_usage" => Arc::new(MemoryUsage {
                above_bytes: parse_memory(&above()?)?,
            }),
            "always_true" => Arc::new(AlwaysTrue),
            "exec" => {
                let command = self.command.clone().ok_or_else(|| {
                    DomainError::InvalidConfiguration("exec: 'command' is required".to_string())
                })?;
                let threshold = above()?;
                Arc::new(ExecProbe {
                    command,
                    above: threshold.trim().parse::<f64>().map_err(|_| {
                        DomainError::InvalidConfiguration(format!(
                            "exec: invalid threshold '{}'",
                            threshold
                        ))
                    })?,
                })
            }
            other => {
                return Err(DomainError::InvalidConfiguration(format!(
                    "Unknown condition '{}'",
                    other
                )))
            }
        };

        let rule = match &self.times {
            None => BreachRule::default(),
            Some(TimesConfig::Count(times)) => BreachRule::times(*times)?,
            Some(TimesConfig::Window(pair)) => match pair.as_slice() {
                [times, window] => BreachRule::new(*times, *window)?,
                _ => {
                    return Err(DomainError::InvalidConfiguration(format!(
                        "{}: times must be a number or [times, within]",
                        self.check
                    )))
                }
            },
        };

        let mut spec = ConditionSpec::new(condition)
            .every(Duration::from_secs(self.every))
            .rule(rule);
        if let Some(actions) = &self.actions {
            let events = actions
                .iter()
                .map(|a| a.parse::<Event>())
                .collect::<Result<Vec<_>, _>>()?;
            spec = spec.action(ConditionAction::Events(events));
        }
        debug!(condition = %self.check, "Parsed condition");
        Ok(spec)
    }
}

impl TriggerConfig {
    pub fn into_spec(self) -> Result<TriggerSpec, DomainError> {
        match self {
            TriggerConfig::Flapping {
                times,
                within,
                retry_after,
                retries,
            } => Ok(TriggerSpec::Flapping {
                times: times.unwrap_or(DEFAULT_FLAPPING_TIMES),
                within: Duration::from_secs(within.unwrap_or(DEFAULT_FLAPPING_WITHIN_SEC)),
                retry_after: Duration::from_secs(
                    retry_after.unwrap_or(DEFAULT_FLAPPING_RETRY_AFTER_SEC),
                ),
                retries,
            }),
            TriggerConfig::Transition { from, to, action } => Ok(TriggerSpec::Transition {
                from: parse_states(&from)?,
                to: parse_states(&to)?,
                action: TransitionAction::Dispatch(action.parse()?),
            }),
        }
    }
}

fn parse_states(names: &[String]) -> Result<Vec<ProcessState>, DomainError> {
    names.iter().map(|n| n.parse::<ProcessState>()).collect()
}

/// Load every process from a YAML file, or from each `*.yaml`/`*.yml` file
/// of a directory in filename order. Within a directory an unreadable or
/// malformed file is logged and skipped.
pub fn load_path(path: &Path) -> Result<Vec<LoadedProcess>, DomainError> {
    if path.is_dir() {
        load_from_directory(path)
    } else if path.is_file() {
        load_file(path)
    } else {
        Err(DomainError::InvalidConfiguration(format!(
            "Configuration path does not exist: {}",
            path.display()
        )))
    }
}

pub fn load_file(path: &Path) -> Result<Vec<LoadedProcess>, DomainError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        DomainError::Io(format!("Failed to read config file '{}': {}", path.display(), e))
    })?;
    let config = ConfigFile::parse(&contents).map_err(|e| {
        DomainError::InvalidConfiguration(format!("{}: {}", path.display(), e))
    })?;
    debug!(path = %path.display(), processes = config.processes.len(), "Parsed configuration file");
    Ok(config.into_processes())
}

fn load_from_directory(dir: &Path) -> Result<Vec<LoadedProcess>, DomainError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| {
            DomainError::Io(format!("Failed to read config directory '{}': {}", dir.display(), e))
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && (path.extension() == Some(OsStr::new("yaml"))
                    || path.extension() == Some(OsStr::new("yml")))
        })
        .collect();
    files.sort();

    let mut loaded = Vec::new();
    for file in files {
        match load_file(&file) {
            Ok(processes) => loaded.extend(processes),
            Err(e) => warn!(path = %file.display(), error = %e, "Skipping configuration file"),
        }
    }
    Ok(loaded)
}

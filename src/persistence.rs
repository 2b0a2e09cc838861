//! Persistence of settings, charging context, control state and event log
//!
//! The controller talks to a [`StateStore`]. [`FileStateStore`] keeps every
//! section in one JSON document and rewrites it after each change so the
//! context and the hysteresis timestamps survive a restart.
//! [`MemoryStateStore`] backs tests and dry runs.

use crate::context::ChargingContext;
use crate::error::{HeliosError, Result};
use crate::interlock::InterlockAction;
use crate::logging::{StructuredLogger, get_logger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Last interlock command that was attempted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterlockRecord {
    pub action: InterlockAction,
    pub at: DateTime<Utc>,
    pub succeeded: bool,
}

/// Timestamps and last-seen values outside the charging context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlState {
    /// Start of the current continuous battery discharge below the threshold
    pub battery_discharge_since: Option<DateTime<Utc>>,
    /// Last digital input level seen in a broadcast
    pub last_input: Option<u8>,
    pub last_plug: Option<u8>,
    pub plug_changed_at: Option<DateTime<Utc>>,
    pub last_state: Option<u8>,
    pub state_changed_at: Option<DateTime<Utc>>,
    pub last_interlock: Option<InterlockRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
}

/// One entry of the bounded event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub component: String,
    pub message: String,
}

impl LogEntry {
    pub fn new<S: Into<String>>(
        timestamp: DateTime<Utc>,
        severity: LogSeverity,
        component: &str,
        message: S,
    ) -> Self {
        Self {
            timestamp,
            severity,
            component: component.to_string(),
            message: message.into(),
        }
    }
}

/// Storage collaborator of the controller
pub trait StateStore: Send + Sync {
    /// Stored strategy settings, `None` before the first save
    fn get_settings(&self) -> Result<Option<Value>>;
    fn save_settings(&self, settings: &Value) -> Result<()>;

    fn get_context(&self) -> Result<ChargingContext>;
    fn save_context(&self, context: &ChargingContext) -> Result<()>;
    /// Merge the keys of a JSON object into the stored context
    fn update_context(&self, patch: &Value) -> Result<ChargingContext>;

    fn get_control_state(&self) -> Result<ControlState>;
    /// Read-modify-write the control state under the store's lock
    fn update_control_state(&self, update: &mut dyn FnMut(&mut ControlState))
    -> Result<ControlState>;

    /// Append to the bounded log, dropping the oldest entry when full
    fn append_log(&self, entry: LogEntry) -> Result<()>;
    /// Newest `limit` entries, oldest first
    fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>>;
}

/// Everything a store holds, in its on-disk layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoredState {
    settings: Option<Value>,
    context: ChargingContext,
    control: ControlState,
    log: VecDeque<LogEntry>,
}

impl StoredState {
    fn patch_context(&mut self, patch: &Value) -> Result<ChargingContext> {
        let Value::Object(changes) = patch else {
            return Err(HeliosError::validation(
                "context",
                "patch must be a JSON object",
            ));
        };
        let mut merged = serde_json::to_value(&self.context)?;
        if let Value::Object(current) = &mut merged {
            for (key, value) in changes {
                current.insert(key.clone(), value.clone());
            }
        }
        let mut context: ChargingContext = serde_json::from_value(merged)?;
        if !context.is_active {
            context.mark_stopped();
        }
        self.context = context.clone();
        Ok(context)
    }

    fn push_log(&mut self, entry: LogEntry, capacity: usize) {
        self.log.push_back(entry);
        while self.log.len() > capacity.max(1) {
            self.log.pop_front();
        }
    }

    fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let skip = self.log.len().saturating_sub(limit);
        self.log.iter().skip(skip).cloned().collect()
    }
}

fn lock(state: &Mutex<StoredState>) -> Result<MutexGuard<'_, StoredState>> {
    state
        .lock()
        .map_err(|_| HeliosError::generic("state store lock poisoned"))
}

/// In-memory store
pub struct MemoryStateStore {
    state: Mutex<StoredState>,
    capacity: usize,
}

impl MemoryStateStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoredState::default()),
            capacity,
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new(500)
    }
}

impl StateStore for MemoryStateStore {
    fn get_settings(&self) -> Result<Option<Value>> {
        Ok(lock(&self.state)?.settings.clone())
    }

    fn save_settings(&self, settings: &Value) -> Result<()> {
        lock(&self.state)?.settings = Some(settings.clone());
        Ok(())
    }

    fn get_context(&self) -> Result<ChargingContext> {
        Ok(lock(&self.state)?.context.clone())
    }

    fn save_context(&self, context: &ChargingContext) -> Result<()> {
        lock(&self.state)?.context = context.clone();
        Ok(())
    }

    fn update_context(&self, patch: &Value) -> Result<ChargingContext> {
        lock(&self.state)?.patch_context(patch)
    }

    fn get_control_state(&self) -> Result<ControlState> {
        Ok(lock(&self.state)?.control.clone())
    }

    fn update_control_state(
        &self,
        update: &mut dyn FnMut(&mut ControlState),
    ) -> Result<ControlState> {
        let mut state = lock(&self.state)?;
        update(&mut state.control);
        Ok(state.control.clone())
    }

    fn append_log(&self, entry: LogEntry) -> Result<()> {
        lock(&self.state)?.push_log(entry, self.capacity);
        Ok(())
    }

    fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(lock(&self.state)?.tail(limit))
    }
}

/// JSON-file store
pub struct FileStateStore {
    path: PathBuf,
    state: Mutex<StoredState>,
    capacity: usize,
    logger: StructuredLogger,
}

impl FileStateStore {
    /// Open the state file, starting empty if it does not exist yet
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        let logger = get_logger("persistence");
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let state: StoredState = serde_json::from_str(&contents)?;
            logger.info(&format!("Loaded persistent state from {}", path.display()));
            state
        } else {
            logger.info("No persistent state file found, using defaults");
            StoredState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
            capacity,
            logger,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` and write the whole document back
    fn mutate<T>(&self, change: impl FnOnce(&mut StoredState) -> Result<T>) -> Result<T> {
        let mut state = lock(&self.state)?;
        let result = change(&mut state)?;
        self.write(&state)?;
        Ok(result)
    }

    fn write(&self, state: &StoredState) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        self.logger.trace("Saved persistent state to disk");
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get_settings(&self) -> Result<Option<Value>> {
        Ok(lock(&self.state)?.settings.clone())
    }

    fn save_settings(&self, settings: &Value) -> Result<()> {
        self.mutate(|state| {
            state.settings = Some(settings.clone());
            Ok(())
        })
    }

    fn get_context(&self) -> Result<ChargingContext> {
        Ok(lock(&self.state)?.context.clone())
    }

    fn save_context(&self, context: &ChargingContext) -> Result<()> {
        self.mutate(|state| {
            state.context = context.clone();
            Ok(())
        })
    }

    fn update_context(&self, patch: &Value) -> Result<ChargingContext> {
        self.mutate(|state| state.patch_context(patch))
    }

    fn get_control_state(&self) -> Result<ControlState> {
        Ok(lock(&self.state)?.control.clone())
    }

    fn update_control_state(
        &self,
        update: &mut dyn FnMut(&mut ControlState),
    ) -> Result<ControlState> {
        self.mutate(|state| {
            update(&mut state.control);
            Ok(state.control.clone())
        })
    }

    fn append_log(&self, entry: LogEntry) -> Result<()> {
        let capacity = self.capacity;
        self.mutate(|state| {
            state.push_log(entry, capacity);
            Ok(())
        })
    }

    fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>> {
        Ok(lock(&self.state)?.tail(limit))
    }
}

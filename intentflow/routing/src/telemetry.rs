use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};
use tokio::runtime::{Builder, Handle, Runtime};

/// Builder for [`Telemetry`] handles.
pub struct TelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    sink: Option<Arc<dyn LogSink>>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl TelemetryBuilder {
    /// Creates the builder for `module`.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
            sink: None,
            event_publisher: None,
        }
    }

    /// Writes JSON lines to `path`.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops file records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Uses an arbitrary sink (takes precedence over `log_path`).
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the handle.
    pub fn build(self) -> Result<Telemetry> {
        let sink: Option<Arc<dyn LogSink>> = match (self.sink, self.log_path) {
            (Some(sink), _) => Some(sink),
            (None, Some(path)) => Some(Arc::new(JsonLogger::with_min_level(
                path,
                self.min_level,
            )?)),
            (None, None) => None,
        };
        let event = match self.event_publisher {
            Some(publisher) => Some(Arc::new(EventHandle::new(publisher)?)),
            None => None,
        };
        Ok(Telemetry {
            module: self.module,
            sink,
            event,
        })
    }
}

/// Logging + event handle shared by routing, training and dispatch components.
///
/// Cloning is cheap; [`Telemetry::scoped`] derives a handle for a sub-module that
/// shares the same sink and publisher.
#[derive(Clone)]
pub struct Telemetry {
    module: String,
    sink: Option<Arc<dyn LogSink>>,
    event: Option<Arc<EventHandle>>,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("module", &self.module)
            .field("logs", &self.sink.is_some())
            .field("events", &self.event.is_some())
            .finish()
    }
}

struct EventHandle {
    runtime: Runtime,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        Ok(Self {
            runtime: Builder::new_current_thread().enable_all().build()?,
            publisher,
        })
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(record))
        }
    }
}

impl Telemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> TelemetryBuilder {
        TelemetryBuilder::new(module)
    }

    /// Module name stamped on records.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Handle for a sub-module sharing this handle's sinks.
    #[must_use]
    pub fn scoped(&self, module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            sink: self.sink.clone(),
            event: self.event.clone(),
        }
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(sink) = &self.sink {
            let record = LogRecord::new(&self.module, level, message).with_metadata(metadata);
            sink.write(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.event {
            handle.publish(EventRecord::new(&self.module, event_type, payload))?;
        }
        Ok(())
    }
}

/// Logs through an optional handle, ignoring sink failures.
pub fn log(telemetry: Option<&Telemetry>, level: LogLevel, message: &str, metadata: Value) {
    if let Some(tel) = telemetry {
        if let Err(err) = tel.log(level, message, metadata) {
            eprintln!("telemetry log failed: {err:?}");
        }
    }
}

/// Emits through an optional handle, ignoring publisher failures.
pub fn event(telemetry: Option<&Telemetry>, event_type: &str, payload: Value) {
    if let Some(tel) = telemetry {
        if let Err(err) = tel.event(event_type, payload) {
            eprintln!("telemetry event failed: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::MemoryLogger;
    use tempfile::tempdir;

    #[test]
    fn writes_log_file_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("routing.log");
        let bus = Arc::new(MemoryEventBus::new(8));
        let telemetry = Telemetry::builder("routing")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "definition.built", json!({ "contexts": 3 }))
            .unwrap();
        telemetry
            .event("routing.definition.built", json!({ "contexts": 3 }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("definition.built"));
        assert_eq!(bus.of_type("routing.definition.built").len(), 1);
    }

    #[test]
    fn scoped_handles_share_the_sink() {
        let sink = Arc::new(MemoryLogger::new());
        let telemetry = Telemetry::builder("routing")
            .sink(sink.clone())
            .build()
            .unwrap();
        let child = telemetry.scoped("routing.directory");
        log(Some(&child), LogLevel::Warn, "command_skipped", json!({}));
        log(None, LogLevel::Warn, "ignored", json!({}));
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].module, "routing.directory");
    }
}

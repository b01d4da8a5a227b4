//! Leveled log events for the external log viewer.
//!
//! Every event is mirrored into `tracing` and then handed to the store without
//! waiting on the outcome.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct LogEvent {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
    pub detail: Option<serde_json::Value>,
}

impl LogEvent {
    pub fn new(level: LogLevel, source: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            source: source.to_string(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Cheap handle that components clone to report events.
pub struct Telemetry<S: Store + ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> Clone for Telemetry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store + ?Sized + 'static> Telemetry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn emit(&self, event: LogEvent) {
        match event.level {
            LogLevel::Debug => tracing::debug!(source = %event.source, detail = ?event.detail, "{}", event.message),
            LogLevel::Info => tracing::info!(source = %event.source, detail = ?event.detail, "{}", event.message),
            LogLevel::Warn => tracing::warn!(source = %event.source, detail = ?event.detail, "{}", event.message),
            LogLevel::Error => tracing::error!(source = %event.source, detail = ?event.detail, "{}", event.message),
        }

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.log_event(&event).await {
                tracing::debug!("dropping log event: {}", e);
            }
        });
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.emit(LogEvent::new(LogLevel::Info, source, message));
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.emit(LogEvent::new(LogLevel::Warn, source, message));
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.emit(LogEvent::new(LogLevel::Error, source, message));
    }

    pub fn debug(&self, source: &str, message: impl Into<String>) {
        self.emit(LogEvent::new(LogLevel::Debug, source, message));
    }
}

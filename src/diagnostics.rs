use crate::error::TciError;
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Validation,
    Numeric,
    Safety,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub category: Category,
    pub component: &'static str,
    pub message: String,
    pub context: BTreeMap<String, f64>,
    /// True when the condition was handled by a fallback.
    pub resolved: bool,
}

impl Diagnostic {
    pub fn new(category: Category, component: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            component,
            message: message.into(),
            context: BTreeMap::new(),
            resolved: false,
        }
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn resolved(mut self, resolved: bool) -> Self {
        self.resolved = resolved;
        self
    }
}

pub trait DiagnosticSink {
    fn emit(&self, diagnostic: Diagnostic);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _diagnostic: Diagnostic) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&self, d: Diagnostic) {
        if d.resolved {
            info!("[{:?}/{}] {} (resolved) {:?}", d.category, d.component, d.message, d.context);
        } else {
            warn!("[{:?}/{}] {} {:?}", d.category, d.component, d.message, d.context);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Diagnostic> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn count(&self, component: &str) -> usize {
        self.records()
            .iter()
            .filter(|d| d.component == component)
            .count()
    }

    pub fn contains(&self, component: &str, fragment: &str) -> bool {
        self.records()
            .iter()
            .any(|d| d.component == component && d.message.contains(fragment))
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, diagnostic: Diagnostic) {
        if let Ok(mut records) = self.records.lock() {
            records.push(diagnostic);
        }
    }
}

/// Records a rejected input on `sink` and hands the error back unchanged.
pub fn rejected(sink: &dyn DiagnosticSink, component: &'static str, err: TciError) -> TciError {
    if let TciError::Validation(message) | TciError::InvalidDosing(message) = &err {
        sink.emit(Diagnostic::new(Category::Validation, component, message.clone()));
    }
    err
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for &S {
    fn emit(&self, diagnostic: Diagnostic) {
        (**self).emit(diagnostic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(Diagnostic::new(Category::Numeric, "ke0", "brent failed").with("ke0", 0.7));
        sink.emit(Diagnostic::new(Category::Numeric, "ke0", "bisection succeeded").resolved(true));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].context["ke0"], 0.7);
        assert!(!records[0].resolved);
        assert!(records[1].resolved);
        assert!(sink.contains("ke0", "bisection"));
        assert_eq!(sink.count("integrator"), 0);
    }

    #[test]
    fn test_rejected_inputs_are_recorded() {
        let sink = MemorySink::new();
        let err = rejected(&sink, "optimizer", TciError::Validation("target must be positive".to_string()));
        assert!(matches!(err, TciError::Validation(_)));
        let err = rejected(&sink, "session", TciError::Safety("ke0 out of band".to_string()));
        assert!(matches!(err, TciError::Safety(_)));

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, Category::Validation);
        assert_eq!(records[0].component, "optimizer");
        assert_eq!(records[0].message, "target must be positive");
        assert!(!records[0].resolved);
    }

    #[test]
    fn test_null_sink_accepts_records() {
        NullSink.emit(Diagnostic::new(Category::Safety, "ke0", "ignored"));
    }
}

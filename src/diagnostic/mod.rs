pub mod ansi;
pub mod json;
pub mod registry;

use crate::runtime::{ErrorKind, Failure, Resource};

/// A reportable failure. Every diagnostic is an error: failures are fatal
/// and nothing in the language produces warnings.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<&'static str>,
    pub message: String,
    pub line: Option<u32>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            code: None,
            message: message.into(),
            line: None,
            notes: Vec::new(),
            suggestion: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

// ---- From impls ----

impl From<&Failure> for Diagnostic {
    fn from(e: &Failure) -> Self {
        let mut d = Diagnostic::error(e.kind.to_string()).with_code(e.code());
        if let Some(line) = e.context.line {
            d = d.with_line(line);
        }
        if let Some(function) = &e.context.function {
            d = d.with_note(format!("in function '{function}'"));
        }
        if let Some(op) = e.context.op {
            d = d.with_note(format!("while executing {op}"));
        }
        if let Some(hint) = suggestion_for(&e.kind) {
            d = d.with_suggestion(hint);
        }
        d
    }
}

fn suggestion_for(kind: &ErrorKind) -> Option<&'static str> {
    match kind {
        ErrorKind::UndefinedVariable { .. } => Some("declare the variable with `var` before assigning to it"),
        ErrorKind::ResourceExhaustion { resource: Resource::Stack, .. } => {
            Some("raise --stack-size or check for unbounded recursion")
        }
        ErrorKind::ResourceExhaustion { resource: Resource::Heap, .. } => {
            Some("raise --heap-size or pass --grow-heap")
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.message, "something went wrong");
        assert!(d.code.is_none());
        assert!(d.line.is_none());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn diagnostic_with_note_and_suggestion() {
        let d = Diagnostic::error("type mismatch")
            .with_note("in function 'foo'")
            .with_suggestion("pass an integer");
        assert_eq!(d.notes, vec!["in function 'foo'"]);
        assert_eq!(d.suggestion.as_deref(), Some("pass an integer"));
    }

    #[test]
    fn from_failure_carries_code_and_context() {
        let e = Failure::arity("fact", 1, 2).with_op("FUNCALL").in_function("main").at_line(7);
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("SJS-E001"));
        assert_eq!(d.line, Some(7));
        assert!(d.message.contains("expected 1 but was 2"), "{}", d.message);
        assert!(!d.message.contains("line 7"), "context belongs in notes: {}", d.message);
        assert!(d.notes.iter().any(|n| n.contains("'main'")));
        assert!(d.notes.iter().any(|n| n.contains("FUNCALL")));
    }

    #[test]
    fn from_failure_suggests_for_exhaustion() {
        let d = Diagnostic::from(&Failure::exhausted(Resource::Heap, 64));
        assert_eq!(d.code, Some("SJS-E006"));
        assert!(d.suggestion.unwrap().contains("--grow-heap"));
    }

    #[test]
    fn from_failure_without_context() {
        let d = Diagnostic::from(&Failure::new(ErrorKind::DivisionByZero));
        assert_eq!(d.message, "division by zero");
        assert!(d.notes.is_empty());
        assert!(d.line.is_none());
        assert!(d.suggestion.is_none());
    }
}

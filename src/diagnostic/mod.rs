pub mod json;

use crate::ast::Span;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

/// A reportable problem from any layer: spec text, shape inference, the
/// eval boundary or configuration.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    /// Spec text the labels point into.
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
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

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for existing error types ----

impl From<&crate::lexer::LexError> for Diagnostic {
    fn from(e: &crate::lexer::LexError) -> Self {
        let span = Span { start: e.position, end: e.position + e.snippet.len().max(1) };
        let mut d = Diagnostic::error(format!("unexpected token '{}'", e.snippet))
            .with_code("TE-L001")
            .with_span(span, "here");
        if !e.suggestion.is_empty() {
            d = d.with_suggestion(e.suggestion.clone());
        }
        d
    }
}

impl From<&crate::parser::ParseError> for Diagnostic {
    fn from(e: &crate::parser::ParseError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code).with_span(e.span, "here")
    }
}

impl From<&crate::graph::TypeError> for Diagnostic {
    fn from(e: &crate::graph::TypeError) -> Self {
        let mut d = Diagnostic::error(&e.message).with_code("TE-T001").with_note(format!("in {}", e.op));
        if let Some(hint) = &e.hint {
            d = d.with_suggestion(hint.clone());
        }
        d
    }
}

impl From<&crate::vm::EvalError> for Diagnostic {
    fn from(e: &crate::vm::EvalError) -> Self {
        Diagnostic::error(e.to_string()).with_code("TE-E001")
    }
}

impl From<&crate::config::ConfigError> for Diagnostic {
    fn from(e: &crate::config::ConfigError) -> Self {
        Diagnostic::error(e.to_string()).with_code("TE-C001")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.labels.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
        assert!(d.code.is_none());
    }

    #[test]
    fn from_lex_error() {
        let e = crate::lexer::LexError {
            position: 7,
            snippet: "'a".to_string(),
            suggestion: "Quote labels with double quotes".to_string(),
        };
        let d = Diagnostic::from(&e);
        assert!(d.message.contains("'a"));
        assert_eq!(d.labels[0].span, Span { start: 7, end: 9 });
        assert_eq!(d.code, Some("TE-L001"));
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn from_parse_error_keeps_code() {
        let e = crate::parser::parse_value_type("tensor(x[2]").unwrap_err();
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some(e.code));
        assert_eq!(d.labels.len(), 1);
    }

    #[test]
    fn from_type_error() {
        let e = crate::graph::TypeError {
            op: "reduce",
            message: "no dimension 'z' in tensor(x[2])".to_string(),
            hint: Some("did you mean 'x'?".to_string()),
        };
        let d = Diagnostic::from(&e);
        assert!(d.notes.iter().any(|n| n.contains("reduce")));
        assert_eq!(d.suggestion.as_deref(), Some("did you mean 'x'?"));
    }

    #[test]
    fn from_eval_error() {
        let e = crate::vm::EvalError::ParamCount { expected: 2, got: 1 };
        let d = Diagnostic::from(&e);
        assert!(d.message.contains("expected 2"));
        assert!(d.labels.is_empty());
    }
}

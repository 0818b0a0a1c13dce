//! Error Classifier
//!
//! Maps backend error messages onto the execution status taxonomy.

use super::ExecutionStatus;

/// Message-pattern classifier for warehouse errors
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify an error message into syntax, timeout, or runtime failure
    pub fn classify(&self, message: &str) -> ExecutionStatus {
        let error_msg = message.to_lowercase();

        if error_msg.contains("interrupted")
            || error_msg.contains("timed out")
            || error_msg.contains("timeout")
            || error_msg.contains("deadline exceeded")
        {
            return ExecutionStatus::Timeout;
        }

        if error_msg.contains("syntax error")
            || error_msg.contains("incomplete input")
            || error_msg.contains("unrecognized token")
            || error_msg.contains("parse error")
        {
            return ExecutionStatus::SyntaxError;
        }

        // no such table / column, type mismatches, division errors...
        ExecutionStatus::RuntimeError
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_syntax_error() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("near \"FORM\": syntax error"),
            ExecutionStatus::SyntaxError
        );
        assert_eq!(
            classifier.classify("incomplete input"),
            ExecutionStatus::SyntaxError
        );
    }

    #[test]
    fn test_classify_interrupt_as_timeout() {
        let classifier = ErrorClassifier::new();
        assert_eq!(classifier.classify("interrupted"), ExecutionStatus::Timeout);
    }

    #[test]
    fn test_classify_missing_column_as_runtime() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("no such column: total"),
            ExecutionStatus::RuntimeError
        );
        assert_eq!(
            classifier.classify("no such column: syntax_version"),
            ExecutionStatus::RuntimeError
        );
    }
}

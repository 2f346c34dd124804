//! Rule compiler contract.
//!
//! A compiler turns rule source text into an immutable, executable session.
//! The registry treats sessions as opaque and only shares them behind `Arc`.

use std::fmt;

use thiserror::Error;

/// Diagnostic produced when rule source text fails to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CompileError {
    /// Human-readable description of the problem.
    pub diagnostic: String,
    /// 1-based source line, when known.
    pub line: Option<usize>,
}

impl CompileError {
    /// Creates a compile error without position information.
    #[must_use]
    pub fn new(diagnostic: impl Into<String>) -> Self {
        Self {
            diagnostic: diagnostic.into(),
            line: None,
        }
    }

    /// Creates a compile error pointing at a source line.
    #[must_use]
    pub fn at_line(diagnostic: impl Into<String>, line: usize) -> Self {
        Self {
            diagnostic: diagnostic.into(),
            line: Some(line),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {line}: {}", self.diagnostic),
            None => f.write_str(&self.diagnostic),
        }
    }
}

/// Compiles rule source text into an executable session.
///
/// Implementations must be callable from several compile workers at once.
pub trait RuleCompiler: Send + Sync + 'static {
    /// The compiled, immutable session artifact.
    type Session: Send + Sync + 'static;

    /// Compile `source` into a session.
    fn compile(&self, source: &str) -> Result<Self::Session, CompileError>;
}

impl<C: RuleCompiler + ?Sized> RuleCompiler for Box<C> {
    type Session = C::Session;

    fn compile(&self, source: &str) -> Result<Self::Session, CompileError> {
        (**self).compile(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl RuleCompiler for Upper {
        type Session = String;

        fn compile(&self, source: &str) -> Result<String, CompileError> {
            if source.is_empty() {
                return Err(CompileError::new("empty"));
            }
            Ok(source.to_uppercase())
        }
    }

    #[test]
    fn test_compile_error_display() {
        assert_eq!(CompileError::new("bad").to_string(), "bad");
        assert_eq!(CompileError::at_line("unexpected token", 4).to_string(), "line 4: unexpected token");
    }

    #[test]
    fn test_boxed_compiler_delegates() {
        let boxed: Box<Upper> = Box::new(Upper);
        assert_eq!(boxed.compile("abc").unwrap(), "ABC");
        assert!(boxed.compile("").is_err());
    }
}

//! Diagnostics for every compiler phase
//!
//! This module defines [`CompileError`], the error value propagated with `?`
//! from the lexer up to the public API, and [`Diagnostics`], the single
//! routine through which every error and warning is formatted and delivered.
//!
//! Message layout:
//! - one `In file included from FILE:LINE:` line per enclosing include
//! - `FILE:LINE: ` for the innermost file (`FILE: ` when no line is known)
//! - `crustcc: ` when no file is open at all
//! - then `error: ` or `warning: ` and the message text

use std::fmt;

/// Which phase produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed tokens: unterminated literals, stray characters
    Lexical,
    /// Grammar violations and preprocessor directive misuse
    Syntax,
    /// Type errors, redefinitions, undeclared identifiers
    Semantic,
    /// Missing files, I/O failures, mapping failures
    Resource,
    /// Undefined symbols, bad relocations, unreadable object files
    Link,
    /// Broken compiler invariants
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Lexical => "lexical",
            ErrorKind::Syntax => "syntax",
            ErrorKind::Semantic => "semantic",
            ErrorKind::Resource => "resource",
            ErrorKind::Link => "link",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", name)
    }
}

/// A reported error. `message` holds the fully formatted diagnostic line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CompileError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

pub type CResult<T> = Result<T, CompileError>;

/// One entry of the include chain: a file name and the current line in it.
/// A line of 0 means "no meaningful line" (binary inputs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub filename: String,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// Warning switches, toggled by name through `set_warning`
#[derive(Debug, Clone, Default)]
pub struct WarningFlags {
    /// Suppress every warning
    pub none: bool,
    /// Turn warnings into errors
    pub error: bool,
    pub unsupported: bool,
    pub write_strings: bool,
    pub implicit_function_declaration: bool,
}

impl WarningFlags {
    /// Apply a named switch; a `no-` prefix inverts `value`. `all` turns on
    /// the warnings meant for everyday use. Returns false for unknown names.
    pub fn set(&mut self, name: &str, value: bool) -> bool {
        if name == "all" {
            self.implicit_function_declaration = true;
            return true;
        }
        let (name, value) = match name.strip_prefix("no-") {
            Some(rest) => (rest, !value),
            None => (name, value),
        };
        match name {
            "none" => self.none = value,
            "error" => self.error = value,
            "unsupported" => self.unsupported = value,
            "write-strings" => self.write_strings = value,
            "implicit-function-declaration" => self.implicit_function_declaration = value,
            _ => return false,
        }
        true
    }
}

pub type ErrorFunc = Box<dyn FnMut(&str)>;

/// Error counter and delivery point for formatted diagnostics
pub struct Diagnostics {
    error_func: Option<ErrorFunc>,
    pub warnings: WarningFlags,
    pub nb_errors: usize,
    last_error: Option<CompileError>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics {
            error_func: None,
            warnings: WarningFlags::default(),
            nb_errors: 0,
            last_error: None,
        }
    }

    /// Route diagnostics to `func` instead of stderr.
    pub fn set_error_func(&mut self, func: ErrorFunc) {
        self.error_func = Some(func);
    }

    /// Build the diagnostic text for `msg` given the include chain
    /// (outermost first).
    pub fn format(chain: &[Location], severity: Severity, msg: &str) -> String {
        let mut out = String::new();
        if let Some((current, parents)) = chain.split_last() {
            for parent in parents {
                out.push_str(&format!(
                    "In file included from {}:{}:\n",
                    parent.filename, parent.line
                ));
            }
            if current.line > 0 {
                out.push_str(&format!("{}:{}: ", current.filename, current.line));
            } else {
                out.push_str(&format!("{}: ", current.filename));
            }
        } else {
            out.push_str("crustcc: ");
        }
        match severity {
            Severity::Warning => out.push_str("warning: "),
            Severity::Error => out.push_str("error: "),
        }
        out.push_str(msg);
        out
    }

    fn deliver(&mut self, text: &str) {
        match self.error_func.as_mut() {
            Some(func) => func(text),
            None => eprintln!("{}", text),
        }
    }

    /// Report an error and count it. The returned value is what callers
    /// propagate when the error is fatal.
    pub fn error(&mut self, chain: &[Location], kind: ErrorKind, msg: &str) -> CompileError {
        let text = Self::format(chain, Severity::Error, msg);
        self.deliver(&text);
        self.nb_errors += 1;
        let err = CompileError::new(kind, text);
        self.last_error = Some(err.clone());
        err
    }

    /// Report a warning, subject to the `none` and `error` switches.
    pub fn warning(&mut self, chain: &[Location], msg: &str) {
        if self.warnings.none {
            return;
        }
        let severity = if self.warnings.error {
            Severity::Error
        } else {
            Severity::Warning
        };
        let text = Self::format(chain, severity, msg);
        self.deliver(&text);
        if self.warnings.error {
            self.nb_errors += 1;
            self.last_error = Some(CompileError::new(ErrorKind::Semantic, text));
        }
    }

    /// Clear the counter at the start of a compilation.
    pub fn reset(&mut self) {
        self.nb_errors = 0;
        self.last_error = None;
    }

    /// Most recent error, or a generic one when only the counter moved.
    pub fn failure(&self) -> CompileError {
        self.last_error.clone().unwrap_or_else(|| {
            CompileError::new(
                ErrorKind::Internal,
                format!("crustcc: error: {} error(s)", self.nb_errors),
            )
        })
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("warnings", &self.warnings)
            .field("nb_errors", &self.nb_errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn loc(name: &str, line: u32) -> Location {
        Location {
            filename: name.to_string(),
            line,
        }
    }

    #[test]
    fn test_format_with_include_chain() {
        let chain = [loc("main.c", 3), loc("inc.h", 7)];
        let text = Diagnostics::format(&chain, Severity::Error, "boom");
        assert_eq!(text, "In file included from main.c:3:\ninc.h:7: error: boom");
    }

    #[test]
    fn test_format_without_file() {
        let text = Diagnostics::format(&[], Severity::Warning, "careful");
        assert_eq!(text, "crustcc: warning: careful");
        let text = Diagnostics::format(&[loc("lib.a", 0)], Severity::Error, "bad");
        assert_eq!(text, "lib.a: error: bad");
    }

    #[test]
    fn test_warning_switches() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut diag = Diagnostics::new();
        diag.set_error_func(Box::new(move |msg| sink.borrow_mut().push(msg.to_string())));

        diag.warning(&[], "first");
        assert_eq!(diag.nb_errors, 0);

        diag.warnings.none = true;
        diag.warning(&[], "hidden");
        diag.warnings.none = false;

        diag.warnings.error = true;
        diag.warning(&[], "escalated");
        assert_eq!(diag.nb_errors, 1);

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], "crustcc: error: escalated");
    }

    #[test]
    fn test_warning_names() {
        let mut flags = WarningFlags::default();
        assert!(flags.set("all", true));
        assert!(flags.implicit_function_declaration);
        assert!(!flags.write_strings && !flags.unsupported);
        assert!(flags.set("no-implicit-function-declaration", true));
        assert!(!flags.implicit_function_declaration);
        assert!(flags.set("write-strings", true));
        assert!(flags.write_strings);
        assert!(!flags.set("no-such-warning", true));
    }
}

//! C front end
//!
//! Source text goes through three layers, each pulling from the one below:
//! - [`buffer`]: windowed file input with an end-of-buffer sentinel
//! - [`lexer`]: preprocessing tokens (source text → tokens)
//! - [`preprocess`]: macro expansion and directives ([`directives`],
//!   [`pp_expr`] for `#if`)
//!
//! The [`parse::Parser`] consumes expanded tokens and generates code as it
//! goes. Its grammar is split across [`declarations`], [`initializers`],
//! [`statements`] and [`expressions`].
//!
//! # Supported C Subset
//!
//! - Types: every integer type, `void`, `_Bool`, pointers, arrays, structs,
//!   unions, enums, typedefs, function pointers
//! - Statements: all of C99, declarations anywhere, `goto`
//! - GNU extensions: `__attribute__`, `typeof`, `__asm__` labels, case ranges
//! - No floating point, bit-fields, compound literals or structs passed
//!   by value
//!
//! # Parser Implementation
//!
//! Hand-written recursive descent with precedence climbing for binary
//! operators. No external parser generator dependencies.

pub mod buffer;
pub mod declarations;
pub mod directives;
pub mod expressions;
pub mod initializers;
pub mod intern;
pub mod lexer;
pub mod parse;
pub mod pp_expr;
pub mod preprocess;
pub mod statements;

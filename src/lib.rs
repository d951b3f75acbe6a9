//! # Introduction
//!
//! crustcc is a single-pass C compiler for x86-64 Linux. It reads C source,
//! generates machine code while it parses, and either writes a relocatable
//! ELF object or links the result in memory and runs it inside the calling
//! process.
//!
//! ## Compilation pipeline
//!
//! ```text
//! Source → Buffer → Lexer → Preprocessor → Parser+Codegen → Sections
//!                                                 ├→ ELF object file
//!                                                 └→ Relocation → run in memory
//! ```
//!
//! 1. [`parser`]: buffered input, tokenizer, preprocessor, and the recursive
//!    descent parser that drives code generation.
//! 2. [`symbols`]: scoped symbol tables and C type descriptors.
//! 3. [`codegen`]: the value stack and x86-64 instruction encoders.
//! 4. [`elf`]: section arena, symbol and relocation tables, object file
//!    output, and loading of objects, archives and shared libraries.
//! 5. [`runtime`]: in-memory linking, symbol resolution against the host
//!    process, and calling the compiled `main`.
//! 6. [`state`]: the [`CompilationState`] that ties it all together and is
//!    the library's public API.
//!
//! ## Example
//!
//! ```no_run
//! use crustcc::{CompilationState, OutputType};
//!
//! let mut state = CompilationState::new();
//! state.set_output_type(OutputType::Memory);
//! state.compile_string("int main() { return 42; }").unwrap();
//! assert_eq!(state.run(&["prog".to_string()]).unwrap(), 42);
//! ```

pub mod codegen;
pub mod elf;
pub mod errors;
pub mod parser;
pub mod runtime;
pub mod state;
pub mod symbols;
pub mod util;

pub use errors::{CompileError, ErrorKind};
pub use state::{CompilationState, OutputType, Settings};

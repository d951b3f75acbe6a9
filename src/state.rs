//! Compilation state and public API
//!
//! A [`CompilationState`] owns everything one compilation needs: the
//! preprocessor with its macro table and include stack, the diagnostics
//! sink, the section arena, the search paths and, once relocated, the
//! in-memory image. No state is global; independent states may live side by
//! side (one per thread), but a single state must not be shared.
//!
//! Typical use:
//!
//! ```text
//! new → set_output_type → add_include_path/define → add_file/compile_string
//!     → output_file (object) | run (memory)
//! ```
//!
//! Errors are reported once through the diagnostics callback and returned
//! as [`CompileError`]; a compilation fails when any error was counted.

use crate::elf::loader::{self, ElfError, InputKind, ScriptInput};
use crate::elf::output::object_bytes;
use crate::elf::symtab::ElfSym;
use crate::elf::{Sections, SHN_ABS, STB_GLOBAL, STB_LOCAL, STT_FILE, STT_NOTYPE};
use crate::errors::{CResult, CompileError, Diagnostics, ErrorFunc, ErrorKind, Location};
use crate::parser::buffer::BufferedFile;
use crate::parser::parse::Parser;
use crate::parser::preprocess::Preprocessor;
use crate::runtime::{self, DynamicLibrary, Image};
use crate::symbols::types::ConversionPolicy;
use crate::util::{self, DynArray};
use log::debug;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Library root substituted for `{B}` in search paths.
pub const DEFAULT_LIB_PATH: &str = "/usr/local/lib/crustcc";
pub const DEFAULT_SYSINCLUDE_PATHS: &str =
    "{B}/include:/usr/local/include:/usr/include/x86_64-linux-gnu:/usr/include";
pub const DEFAULT_LIBRARY_PATHS: &str =
    "/usr/local/lib:/usr/lib/x86_64-linux-gnu:/usr/lib:/lib/x86_64-linux-gnu:/lib";

/// Language and code generation switches
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Plain `char` is unsigned
    pub char_is_unsigned: bool,
    /// Tentative definitions become common symbols instead of `.bss` objects
    pub common: bool,
    /// Prefix external symbol names with `_`
    pub leading_underscore: bool,
    /// Route the C library's memory and string functions through
    /// `__bound_` wrappers
    pub bounds_check: bool,
    /// Decorate `stdcall` function names with `@argsize`
    pub pe_mangling: bool,
    pub conversions: ConversionPolicy,
}

impl Settings {
    /// Apply a named flag; a `no-` prefix inverts `value`. Returns false for
    /// unknown names.
    pub fn set_flag(&mut self, name: &str, value: bool) -> bool {
        let (name, value) = match name.strip_prefix("no-") {
            Some(rest) => (rest, !value),
            None => (name, value),
        };
        match name {
            "unsigned-char" => self.char_is_unsigned = value,
            "signed-char" => self.char_is_unsigned = !value,
            "common" => self.common = value,
            "leading-underscore" => self.leading_underscore = value,
            "bounds-check" => self.bounds_check = value,
            "pe-mangling" => self.pe_mangling = value,
            _ => return false,
        }
        true
    }
}

/// What a compilation produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputType {
    /// Executable code in this process
    #[default]
    Memory,
    /// A relocatable ELF object file
    Object,
    /// Preprocessed source text
    Preprocess,
}

pub struct CompilationState {
    pp: Preprocessor,
    diag: Diagnostics,
    secs: Sections,
    pub settings: Settings,
    output_type: OutputType,
    output_configured: bool,
    lib_path: String,
    library_paths: DynArray<String>,
    nostdinc: bool,
    preprocess_out: Option<Box<dyn Write>>,
    /// Dropped before `dlls` so no code that may call into them remains
    image: Option<Image>,
    dlls: Vec<DynamicLibrary>,
}

impl Default for CompilationState {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilationState {
    pub fn new() -> Self {
        let mut state = CompilationState {
            pp: Preprocessor::new(),
            diag: Diagnostics::new(),
            secs: Sections::new(),
            settings: Settings::default(),
            output_type: OutputType::Memory,
            output_configured: false,
            lib_path: DEFAULT_LIB_PATH.to_string(),
            library_paths: DynArray::new(),
            nostdinc: false,
            preprocess_out: None,
            image: None,
            dlls: Vec::new(),
        };
        let predefined: &[(&str, Option<&str>)] = &[
            ("__STDC__", None),
            ("__STDC_VERSION__", Some("199901L")),
            ("__x86_64__", None),
            ("__unix__", None),
            ("__unix", None),
            ("unix", None),
            ("__linux__", None),
            ("__linux", None),
            ("__CRUSTCC__", Some(env!("CARGO_PKG_VERSION_MAJOR"))),
            ("__SIZE_TYPE__", Some("unsigned long")),
            ("__PTRDIFF_TYPE__", Some("long")),
            ("__WCHAR_TYPE__", Some("int")),
        ];
        for (name, value) in predefined {
            // the builtin definitions are well-formed
            let _ = state.pp.define_symbol(name, *value, &mut state.diag);
        }
        state.add_library_path(DEFAULT_LIBRARY_PATHS);
        state
    }

    // ===== Configuration =====

    /// Deliver diagnostics to `func` instead of standard error.
    pub fn set_error_func(&mut self, func: ErrorFunc) {
        self.diag.set_error_func(func);
    }

    /// Toggle a named warning (`all`, `error`, `unsupported`,
    /// `write-strings`, `implicit-function-declaration`, or any of them
    /// prefixed with `no-`). Returns false for unknown names.
    pub fn set_warning(&mut self, name: &str, value: bool) -> bool {
        self.diag.warnings.set(name, value)
    }

    /// Suppress every warning.
    pub fn set_warnings_disabled(&mut self, value: bool) {
        self.diag.warnings.none = value;
    }

    /// Toggle a code generation flag, see [`Settings::set_flag`].
    pub fn set_flag(&mut self, name: &str, value: bool) -> bool {
        self.settings.set_flag(name, value)
    }

    /// Root directory substituted for `{B}` in later path additions.
    pub fn set_lib_path(&mut self, path: &str) {
        self.lib_path = path.to_string();
    }

    pub fn add_include_path(&mut self, paths: &str) {
        util::split_path(&self.lib_path, paths, &mut self.pp.include_paths);
    }

    pub fn add_sysinclude_path(&mut self, paths: &str) {
        util::split_path(&self.lib_path, paths, &mut self.pp.sysinclude_paths);
    }

    pub fn add_library_path(&mut self, paths: &str) {
        util::split_path(&self.lib_path, paths, &mut self.library_paths);
    }

    /// Do not add the default system include paths.
    pub fn set_nostdinc(&mut self, value: bool) {
        self.nostdinc = value;
    }

    /// Where preprocessed text goes; standard output when never set.
    pub fn set_preprocess_output(&mut self, out: Box<dyn Write>) {
        self.preprocess_out = Some(out);
    }

    /// Select the output kind. Adds the default system include paths and
    /// the flag-dependent predefined macros, so flags and `nostdinc` must be
    /// set first.
    pub fn set_output_type(&mut self, output_type: OutputType) {
        self.output_type = output_type;
        self.output_configured = true;
        if !self.nostdinc {
            self.add_sysinclude_path(DEFAULT_SYSINCLUDE_PATHS);
        }
        if self.settings.char_is_unsigned {
            let _ = self.pp.define_symbol("__CHAR_UNSIGNED__", None, &mut self.diag);
        }
        if self.settings.bounds_check {
            let _ = self.pp.define_symbol("__BOUNDS_CHECKING_ON", None, &mut self.diag);
        }
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    /// Define a preprocessor symbol, `1` when no value is given.
    pub fn define(&mut self, name: &str, value: Option<&str>) -> CResult<()> {
        self.pp.define_symbol(name, value, &mut self.diag)
    }

    pub fn undefine(&mut self, name: &str) {
        self.pp.undefine_symbol(name);
    }

    // ===== Queries =====

    pub fn nb_errors(&self) -> usize {
        self.diag.nb_errors
    }

    pub fn sections(&self) -> &Sections {
        &self.secs
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.pp
    }

    /// Every file read so far, in opening order.
    pub fn deps(&self) -> &[String] {
        self.pp.deps.as_slice()
    }

    // ===== Compilation =====

    fn error(&mut self, chain: &[Location], kind: ErrorKind, msg: &str) -> CompileError {
        self.diag.error(chain, kind, msg)
    }

    /// Compile (or preprocess) one translation unit read from `file`.
    fn compile_unit(&mut self, file: BufferedFile) -> CResult<()> {
        if !self.output_configured {
            self.set_output_type(self.output_type);
        }
        if self.image.is_some() {
            return Err(self.error(&[], ErrorKind::Internal, "cannot compile after relocation"));
        }
        self.diag.reset();
        let name = file.filename.clone();
        debug!("compile {} ({:?})", name, self.output_type);

        let mark = self.pp.define_mark();
        let result = self.pp.push_file(file, &mut self.diag).and_then(|_| match self.output_type {
            OutputType::Preprocess => {
                let mut stdout = io::stdout();
                let out: &mut dyn Write = match self.preprocess_out.as_mut() {
                    Some(out) => out.as_mut(),
                    None => &mut stdout,
                };
                self.pp.preprocess(&mut self.diag, out)
            }
            OutputType::Memory | OutputType::Object => {
                let symtab = self.secs.symtab;
                let info = ElfSym::info(STB_LOCAL, STT_FILE);
                self.secs.put_elf_sym(symtab, 0, 0, info, 0, SHN_ABS, Some(&name));
                Parser::new(&mut self.pp, &mut self.diag, &mut self.secs, &self.settings)
                    .translation_unit()
            }
        });

        while self.pp.pop_file().is_some() {}
        self.pp.reset_state();
        self.pp.release_defines(mark);
        debug!("done {}: {} error(s)", name, self.diag.nb_errors);

        result?;
        if self.diag.nb_errors > 0 {
            return Err(self.diag.failure());
        }
        Ok(())
    }

    /// Compile C source held in memory.
    pub fn compile_string(&mut self, source: &str) -> CResult<()> {
        self.compile_unit(BufferedFile::from_bytes("<string>", source.as_bytes()))
    }

    /// Compile a C file; `-` reads standard input.
    pub fn compile_file(&mut self, filename: &str) -> CResult<()> {
        let file = if filename == "-" {
            BufferedFile::from_reader("<stdin>", Box::new(io::stdin()))
        } else {
            match fs::File::open(filename) {
                Ok(f) => BufferedFile::from_reader(filename, Box::new(f)),
                Err(_) => {
                    let msg = format!("file '{}' not found", filename);
                    return Err(self.error(&[], ErrorKind::Resource, &msg));
                }
            }
        };
        self.compile_unit(file)
    }

    /// Add an input: C source (by extension, or any file when
    /// preprocessing) is compiled, anything else is loaded as an object,
    /// archive, shared library or linker script.
    pub fn add_file(&mut self, filename: &str) -> CResult<()> {
        let ext = util::file_extension(filename);
        if self.output_type == OutputType::Preprocess || ext.is_empty() || ext == "c" || filename == "-" {
            return self.compile_file(filename);
        }
        let data = match fs::read(filename) {
            Ok(data) => data,
            Err(_) => {
                let msg = format!("file '{}' not found", filename);
                return Err(self.error(&[], ErrorKind::Resource, &msg));
            }
        };
        self.pp.deps.push(filename.to_string());
        self.load_binary(filename, &data)
    }

    fn load_binary(&mut self, filename: &str, data: &[u8]) -> CResult<()> {
        // binary inputs have no meaningful line numbers
        let chain = [Location {
            filename: filename.to_string(),
            line: 0,
        }];
        let loaded: Result<(), ElfError> = match loader::classify(data) {
            Ok(InputKind::Object) => {
                debug!("load object {}", filename);
                loader::load_object(&mut self.secs, data)
            }
            Ok(InputKind::Archive) => {
                debug!("load archive {}", filename);
                loader::load_archive(&mut self.secs, data).map(|n| debug!("{} member(s) from {}", n, filename))
            }
            Ok(InputKind::SharedObject) => {
                if self.output_type == OutputType::Memory {
                    match DynamicLibrary::open(filename) {
                        Ok(dll) => self.dlls.push(dll),
                        Err(msg) => return Err(self.error(&chain, ErrorKind::Link, &msg)),
                    }
                }
                loader::load_dll(&mut self.secs, data).map(|_| ())
            }
            Ok(InputKind::Coff) => Err(ElfError::Unsupported("COFF files are".to_string())),
            Ok(InputKind::Script) => {
                return match loader::parse_ld_script(data) {
                    Ok(inputs) => self.add_script_inputs(&inputs, &chain),
                    Err(e) => Err(self.error(&chain, ErrorKind::Link, &e.to_string())),
                };
            }
            Err(e) => Err(e),
        };
        loaded.map_err(|e| self.error(&chain, ErrorKind::Link, &e.to_string()))
    }

    fn add_script_inputs(&mut self, inputs: &[ScriptInput], chain: &[Location]) -> CResult<()> {
        for input in inputs {
            match input {
                ScriptInput::Library(name) => self.add_library(name)?,
                ScriptInput::File(name) => match self.find_in_library_paths(name) {
                    Some(path) => self.add_file(&path)?,
                    None => {
                        let msg = format!("file '{}' not found", name);
                        return Err(self.error(chain, ErrorKind::Link, &msg));
                    }
                },
            }
        }
        Ok(())
    }

    fn find_in_library_paths(&self, name: &str) -> Option<String> {
        if Path::new(name).exists() {
            return Some(name.to_string());
        }
        self.library_paths
            .iter()
            .map(|dir| format!("{}/{}", dir, name))
            .find(|path| Path::new(path).exists())
    }

    /// Link against `lib<name>.so`, or `lib<name>.a` when no shared library
    /// is found on the library paths.
    pub fn add_library(&mut self, name: &str) -> CResult<()> {
        for pattern in ["so", "a"] {
            let file = format!("lib{}.{}", name, pattern);
            let found = self
                .library_paths
                .iter()
                .map(|dir| format!("{}/{}", dir, file))
                .find(|path| Path::new(path).exists());
            if let Some(path) = found {
                return self.add_file(&path);
            }
        }
        let msg = format!("library '{}' not found", name);
        Err(self.error(&[], ErrorKind::Link, &msg))
    }

    /// Make `name` resolve to `addr`, ahead of the host process symbols.
    pub fn add_symbol(&mut self, name: &str, addr: u64) -> CResult<()> {
        let symtab = self.secs.symtab;
        let info = ElfSym::info(STB_GLOBAL, STT_NOTYPE);
        match self.secs.add_elf_sym(symtab, addr, 0, info, 0, SHN_ABS, name) {
            Ok(_) => Ok(()),
            Err(dup) => {
                let msg = format!("'{}' defined twice", dup.name);
                Err(self.error(&[], ErrorKind::Link, &msg))
            }
        }
    }

    // ===== Output =====

    /// Write the object file (object output); nothing to do otherwise.
    pub fn output_file(&mut self, filename: &str) -> CResult<()> {
        match self.output_type {
            OutputType::Object => {
                let bytes = object_bytes(&self.secs).map_err(|e| {
                    let msg = format!("could not build '{}': {}", filename, e);
                    self.error(&[], ErrorKind::Internal, &msg)
                })?;
                debug!("write {} ({} bytes)", filename, bytes.len());
                fs::write(filename, bytes).map_err(|e| {
                    let msg = format!("could not write '{}': {}", filename, e);
                    self.error(&[], ErrorKind::Resource, &msg)
                })
            }
            OutputType::Preprocess => Ok(()),
            OutputType::Memory => Err(self.error(
                &[],
                ErrorKind::Internal,
                "no output file for in-memory compilation",
            )),
        }
    }

    /// Link everything into executable memory. Calling it again is a no-op.
    pub fn relocate(&mut self) -> CResult<()> {
        if self.image.is_some() {
            return Ok(());
        }
        let mut lookup = |name: &str| runtime::host_symbol(name);
        match runtime::relocate(&mut self.secs, &mut lookup) {
            Ok(image) => {
                self.image = Some(image);
                Ok(())
            }
            Err(e) => Err(self.error(&[], ErrorKind::Link, &e.to_string())),
        }
    }

    /// Runtime address of a global symbol after [`CompilationState::relocate`].
    pub fn get_symbol(&self, name: &str) -> Option<u64> {
        self.image.as_ref()?.get_symbol(name)
    }

    /// Relocate if needed and call `main(argc, argv)` with `args` as argv.
    pub fn run(&mut self, args: &[String]) -> CResult<i32> {
        self.relocate()?;
        let entry = if self.settings.leading_underscore {
            "_main"
        } else {
            "main"
        };
        let result = match self.image.as_ref() {
            Some(image) => runtime::run(image, entry, args),
            None => Err(runtime::RunError::NotRelocated),
        };
        result.map_err(|e| self.error(&[], ErrorKind::Link, &e.to_string()))
    }

    /// Write a make rule listing every file read: `target : \` followed by
    /// one tab-indented dependency per line. `filename` defaults to the
    /// target with a `.d` extension.
    pub fn gen_makedeps(&mut self, target: &str, filename: Option<&str>) -> CResult<()> {
        let path = match filename {
            Some(f) => f.to_string(),
            None => {
                let ext = util::file_extension(target);
                let stem = if ext.is_empty() {
                    target
                } else {
                    &target[..target.len() - ext.len() - 1]
                };
                format!("{}.d", stem)
            }
        };
        let mut text = format!("{} : \\\n", target);
        for dep in self.pp.deps.iter() {
            text.push_str(&format!("\t{} \\\n", dep));
        }
        text.push('\n');
        debug!("<- {}", path);
        fs::write(&path, text).map_err(|e| {
            let msg = format!("could not open '{}': {}", path, e);
            self.error(&[], ErrorKind::Resource, &msg)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A shared buffer usable as preprocessor output.
    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn quiet_state(output_type: OutputType) -> (CompilationState, Rc<RefCell<Vec<String>>>) {
        let messages = Rc::new(RefCell::new(Vec::new()));
        let sink = messages.clone();
        let mut state = CompilationState::new();
        state.set_error_func(Box::new(move |msg| sink.borrow_mut().push(msg.to_string())));
        state.set_output_type(output_type);
        (state, messages)
    }

    fn preprocess(state: &mut CompilationState, source: &str) -> String {
        let capture = Capture::default();
        state.set_preprocess_output(Box::new(capture.clone()));
        state.compile_string(source).unwrap();
        let bytes = capture.0.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_flags() {
        let mut settings = Settings::default();
        assert!(settings.set_flag("unsigned-char", true));
        assert!(settings.char_is_unsigned);
        assert!(settings.set_flag("signed-char", true));
        assert!(!settings.char_is_unsigned);
        assert!(settings.set_flag("common", true));
        assert!(settings.common);
        assert!(settings.set_flag("no-common", true));
        assert!(!settings.common);
        assert!(!settings.set_flag("bogus", true));
    }

    #[test]
    fn test_predefined_macros() {
        let (mut state, _) = quiet_state(OutputType::Preprocess);
        let out = preprocess(&mut state, "__STDC_VERSION__ __x86_64__ __SIZE_TYPE__\n");
        assert_eq!(out, "199901L 1 unsigned long\n");
    }

    #[test]
    fn test_defines_made_inside_a_unit_are_released() {
        let (mut state, _) = quiet_state(OutputType::Preprocess);
        state.define("KEEP", Some("7")).unwrap();
        let out = preprocess(&mut state, "#define LOCAL 1\n#undef KEEP\nLOCAL\n");
        assert_eq!(out, "1\n");
        let out = preprocess(&mut state, "KEEP LOCAL\n");
        assert_eq!(out, "7 LOCAL\n");
    }

    #[test]
    fn test_api_define_and_undefine() {
        let (mut state, _) = quiet_state(OutputType::Preprocess);
        state.define("FOO", None).unwrap();
        assert_eq!(preprocess(&mut state, "FOO\n"), "1\n");
        state.undefine("FOO");
        assert_eq!(preprocess(&mut state, "FOO\n"), "FOO\n");
    }

    #[test]
    fn test_errors_fail_the_unit() {
        let (mut state, messages) = quiet_state(OutputType::Object);
        let err = state.compile_string("int main() { return x; }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Semantic);
        assert!(state.nb_errors() > 0);
        assert!(messages.borrow()[0].starts_with("<string>:1: error: "));
    }

    #[test]
    fn test_missing_file_and_library() {
        let (mut state, messages) = quiet_state(OutputType::Memory);
        let err = state.add_file("/nonexistent/dir/x.c").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resource);
        assert_eq!(messages.borrow()[0], "crustcc: error: file '/nonexistent/dir/x.c' not found");
        assert!(state.add_library("surely-no-such-library").is_err());
    }

    #[test]
    fn test_file_symbol_and_deps() {
        let (mut state, _) = quiet_state(OutputType::Object);
        state.compile_string("int x = 1;").unwrap();
        let secs = state.sections();
        let sym = secs.elf_sym(secs.symtab, 1);
        assert_eq!(sym.typ(), STT_FILE);
        assert_eq!(secs.elf_sym_name(secs.symtab, 1), "<string>");
        assert_eq!(state.deps(), &["<string>".to_string()]);
    }

    #[test]
    fn test_add_symbol_feeds_the_program() {
        static mut SEEN: i32 = 0;
        extern "C" fn record(value: i32) -> i32 {
            // SAFETY: the test is the only writer
            unsafe { SEEN = value };
            value * 2
        }
        let (mut state, _) = quiet_state(OutputType::Memory);
        state.add_symbol("record", record as usize as u64).unwrap();
        state
            .compile_string("int record(int);\nint main() { return record(21); }\n")
            .unwrap();
        assert_eq!(state.run(&["prog".to_string()]).unwrap(), 42);
        // SAFETY: the compiled program has returned
        assert_eq!(unsafe { SEEN }, 21);
        assert!(state.get_symbol("main").is_some());
    }

    #[test]
    fn test_output_file_needs_object_output() {
        let (mut state, _) = quiet_state(OutputType::Memory);
        assert!(state.output_file("/tmp/never-written.o").is_err());
    }
}

// crustcc: compile C to an object file, or compile and run it in memory

use std::process;

use clap::{ArgAction, Parser};
use crustcc::util::default_target;
use crustcc::{CompilationState, OutputType};
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Developer tracing to stderr, enabled by `-v` (`-vv` for trace).
struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let tag = match record.level() {
                Level::Error => "error",
                Level::Warn => "warn",
                Level::Info => "info",
                Level::Debug => "debug",
                Level::Trace => "trace",
            };
            eprintln!("[{}] {}", tag, record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

/// Options whose value may be the next argument
const VALUE_OPTIONS: &[&str] = &["-o", "-I", "-L", "-l", "-D", "-U", "-W", "-f"];

const AFTER_HELP: &str = "Without -E or -c the file is compiled and run; remaining arguments
are passed to its main. Use - to read the source from stdin.";

#[derive(Parser, Debug)]
#[command(
    name = "crustcc",
    version,
    about = "Compile C to an x86-64 ELF object, or compile and run it in memory",
    after_help = AFTER_HELP
)]
struct Cli {
    /// Preprocess only, to stdout or -o
    #[arg(short = 'E', conflicts_with = "object")]
    preprocess: bool,
    /// Write a relocatable object file
    #[arg(short = 'c')]
    object: bool,
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<String>,
    #[arg(short = 'I', value_name = "DIR", action = ArgAction::Append)]
    include_paths: Vec<String>,
    #[arg(short = 'L', value_name = "DIR", action = ArgAction::Append)]
    library_paths: Vec<String>,
    #[arg(short = 'l', value_name = "LIB", action = ArgAction::Append)]
    libraries: Vec<String>,
    /// Define a macro, as NAME or NAME=VALUE
    #[arg(short = 'D', value_name = "NAME[=VALUE]", action = ArgAction::Append)]
    defines: Vec<String>,
    #[arg(short = 'U', value_name = "NAME", action = ArgAction::Append)]
    undefines: Vec<String>,
    /// Enable a warning (-Wall, -Werror, -Wno-<name>)
    #[arg(short = 'W', value_name = "NAME", action = ArgAction::Append)]
    warnings: Vec<String>,
    /// Set a code generation flag (-funsigned-char, -fcommon)
    #[arg(short = 'f', value_name = "FLAG", action = ArgAction::Append)]
    flags: Vec<String>,
    /// Disable all warnings
    #[arg(short = 'w')]
    no_warnings: bool,
    /// Skip the default system include paths
    #[arg(long = "nostdinc")]
    nostdinc: bool,
    /// Developer tracing (-vv for more)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbosity: u8,
    #[arg(value_name = "FILE")]
    input: String,
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    run_args: Vec<String>,
}

impl Cli {
    /// Parse a command line, accepting the traditional single-dash
    /// `-nostdinc` as well.
    fn parse_from_args(args: impl IntoIterator<Item = String>) -> Result<Self, clap::Error> {
        let mut args: Vec<String> = args.into_iter().collect();
        let mut i = 1;
        while i < args.len() {
            let arg = args[i].clone();
            match arg.as_str() {
                "-nostdinc" => args[i] = "--nostdinc".to_string(),
                opt if VALUE_OPTIONS.contains(&opt) => i += 1,
                opt if !opt.starts_with('-') || opt == "-" => break,
                _ => {}
            }
            i += 1;
        }
        Cli::try_parse_from(args)
    }

    fn output_type(&self) -> OutputType {
        if self.preprocess {
            OutputType::Preprocess
        } else if self.object {
            OutputType::Object
        } else {
            OutputType::Memory
        }
    }

    fn split_defines(&self) -> Vec<(&str, Option<&str>)> {
        self.defines
            .iter()
            .map(|def| match def.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (def.as_str(), None),
            })
            .collect()
    }
}

fn main() {
    let cli = match Cli::parse_from_args(std::env::args()) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    if cli.verbosity > 0 && log::set_logger(&LOGGER).is_ok() {
        let level = if cli.verbosity > 1 {
            LevelFilter::Trace
        } else {
            LevelFilter::Debug
        };
        log::set_max_level(level);
    }

    let mut state = CompilationState::new();
    for name in &cli.flags {
        if !state.set_flag(name, true) {
            eprintln!("crustcc: warning: unsupported option '-f{}'", name);
        }
    }
    for name in &cli.warnings {
        if !state.set_warning(name, true) {
            eprintln!("crustcc: warning: unsupported option '-W{}'", name);
        }
    }
    state.set_warnings_disabled(cli.no_warnings);
    state.set_nostdinc(cli.nostdinc);

    let output_type = cli.output_type();
    if output_type == OutputType::Preprocess {
        if let Some(path) = &cli.output {
            match std::fs::File::create(path) {
                Ok(file) => state.set_preprocess_output(Box::new(std::io::BufWriter::new(file))),
                Err(e) => {
                    eprintln!("crustcc: error: could not write '{}': {}", path, e);
                    process::exit(1);
                }
            }
        }
    }
    state.set_output_type(output_type);

    for path in &cli.include_paths {
        state.add_include_path(path);
    }
    for path in &cli.library_paths {
        state.add_library_path(path);
    }
    // errors below were already reported through the diagnostics sink
    for (name, value) in cli.split_defines() {
        if state.define(name, value).is_err() {
            process::exit(1);
        }
    }
    for name in &cli.undefines {
        state.undefine(name);
    }

    if state.add_file(&cli.input).is_err() {
        process::exit(1);
    }
    for lib in &cli.libraries {
        if state.add_library(lib).is_err() {
            process::exit(1);
        }
    }

    let status = match output_type {
        OutputType::Preprocess => 0,
        OutputType::Object => {
            let target = cli
                .output
                .clone()
                .unwrap_or_else(|| default_target(Some(&cli.input), true));
            match state.output_file(&target) {
                Ok(()) => 0,
                Err(_) => 1,
            }
        }
        OutputType::Memory => {
            let mut argv = vec![cli.input.clone()];
            argv.extend(cli.run_args.iter().cloned());
            match state.run(&argv) {
                Ok(status) => status,
                Err(_) => 1,
            }
        }
    };
    process::exit(status);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Cli, clap::Error> {
        Cli::parse_from_args(line.split_whitespace().map(String::from))
    }

    #[test]
    fn test_compiler_style_options() {
        let cli = parse("crustcc -c -Iinc -I /usr/local/include -DN=3 -DDEBUG -UX -Wall -funsigned-char -nostdinc -vv -o a.o a.c").unwrap();
        assert_eq!(cli.output_type(), OutputType::Object);
        assert_eq!(cli.include_paths, ["inc", "/usr/local/include"]);
        assert_eq!(cli.split_defines(), [("N", Some("3")), ("DEBUG", None)]);
        assert_eq!(cli.undefines, ["X"]);
        assert_eq!(cli.warnings, ["all"]);
        assert_eq!(cli.flags, ["unsigned-char"]);
        assert!(cli.nostdinc);
        assert_eq!(cli.verbosity, 2);
        assert_eq!(cli.output.as_deref(), Some("a.o"));
        assert_eq!(cli.input, "a.c");
    }

    #[test]
    fn test_arguments_after_input_go_to_program() {
        let cli = parse("crustcc -lm prog.c one -x -nostdinc").unwrap();
        assert_eq!(cli.output_type(), OutputType::Memory);
        assert_eq!(cli.libraries, ["m"]);
        assert!(!cli.nostdinc);
        assert_eq!(cli.input, "prog.c");
        assert_eq!(cli.run_args, ["one", "-x", "-nostdinc"]);
    }

    #[test]
    fn test_bad_command_lines() {
        assert!(parse("crustcc").is_err());
        assert!(parse("crustcc -E -c a.c").is_err());
        assert!(parse("crustcc -o").is_err());
        assert!(parse("crustcc --bogus a.c").is_err());
    }
}

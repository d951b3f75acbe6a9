// Integration tests for the compiler's public API

use crustcc::{CompilationState, ErrorKind, OutputType};
use std::cell::RefCell;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Command;
use std::rc::Rc;

/// Shared buffer usable as preprocessor output
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

/// State whose diagnostics are collected instead of printed.
fn state_with_messages(output_type: OutputType) -> (CompilationState, Rc<RefCell<Vec<String>>>) {
    let messages = Rc::new(RefCell::new(Vec::new()));
    let sink = messages.clone();
    let mut state = CompilationState::new();
    state.set_error_func(Box::new(move |msg| sink.borrow_mut().push(msg.to_string())));
    state.set_output_type(output_type);
    (state, messages)
}

/// Fresh scratch directory for one test.
fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("crustcc-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("cannot create scratch directory");
    dir
}

fn have_cc() -> bool {
    Command::new("cc").arg("--version").output().is_ok_and(|o| o.status.success())
}

#[test]
fn test_preprocess_only() {
    let (mut state, _) = state_with_messages(OutputType::Preprocess);
    let capture = Capture::default();
    state.set_preprocess_output(Box::new(capture.clone()));
    state.compile_string("#define FOO 1\nFOO\n").unwrap();
    assert_eq!(String::from_utf8(capture.0.borrow().clone()).unwrap(), "1\n");
}

#[test]
fn test_command_line_style_defines() {
    let (mut state, _) = state_with_messages(OutputType::Memory);
    state.define("ANSWER", Some("40 + 2")).unwrap();
    state.define("ENABLED", None).unwrap();
    state
        .compile_string("#if ENABLED\nint main() { return ANSWER; }\n#endif\n")
        .unwrap();
    assert_eq!(state.run(&["prog".to_string()]).unwrap(), 42);
}

#[test]
fn test_common_policy() {
    let (mut strict, messages) = state_with_messages(OutputType::Object);
    let err = strict.compile_string("int x;\nint x;\n").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert_eq!(messages.borrow()[0], "<string>:2: error: redefinition of 'x'");

    let (mut merged, _) = state_with_messages(OutputType::Object);
    assert!(merged.set_flag("common", true));
    merged.compile_string("int x;\nint x;\n").unwrap();
    assert_eq!(merged.nb_errors(), 0);
}

#[test]
fn test_unterminated_string_reports_line() {
    let (mut state, messages) = state_with_messages(OutputType::Object);
    let err = state.compile_string("int a;\nchar *s = \"oops;\n").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Lexical);
    assert!(state.nb_errors() >= 1);
    assert_eq!(
        messages.borrow()[0],
        "<string>:2: error: missing terminating \" character"
    );
}

#[test]
fn test_include_chain_in_diagnostics() {
    let dir = scratch_dir("chain");
    fs::write(dir.join("bad.h"), "int ok;\nint 123;\n").unwrap();
    let main = dir.join("main.c");
    fs::write(&main, "#include \"bad.h\"\nint main() { return 0; }\n").unwrap();

    let (mut state, messages) = state_with_messages(OutputType::Object);
    assert!(state.add_file(main.to_str().unwrap()).is_err());
    let first = messages.borrow()[0].clone();
    let mut lines = first.lines();
    let parent = format!("In file included from {}:", main.display());
    assert!(lines.next().unwrap().starts_with(&parent), "{}", first);
    let current = format!("{}:2: error: ", dir.join("bad.h").display());
    assert!(lines.next().unwrap().starts_with(&current), "{}", first);
}

#[test]
fn test_state_is_reusable_across_units() {
    let (mut state, _) = state_with_messages(OutputType::Memory);
    state.compile_string("int twice(int x) { return 2 * x; }").unwrap();
    state
        .compile_string("int twice(int);\nint main() { return twice(21); }")
        .unwrap();
    assert_eq!(state.run(&["prog".to_string()]).unwrap(), 42);
}

#[test]
fn test_add_symbol_and_get_symbol() {
    static VALUE: i32 = 40;
    let (mut state, _) = state_with_messages(OutputType::Memory);
    state
        .add_symbol("host_value", &VALUE as *const i32 as u64)
        .unwrap();
    state
        .compile_string("extern int host_value;\nint offset = 2;\nint main() { return host_value + offset; }")
        .unwrap();
    state.relocate().unwrap();
    let offset = state.get_symbol("offset").expect("offset is exported");
    // SAFETY: `offset` is an int in the relocated image, which `state` owns
    assert_eq!(unsafe { *(offset as *const i32) }, 2);
    assert!(state.get_symbol("nothing_like_this").is_none());
    assert_eq!(state.run(&["prog".to_string()]).unwrap(), 42);
}

#[test]
fn test_undefined_symbol_fails_relocation() {
    let (mut state, messages) = state_with_messages(OutputType::Memory);
    state
        .compile_string("int no_such_function_anywhere(void);\nint main() { return no_such_function_anywhere(); }")
        .unwrap();
    let err = state.relocate().unwrap_err();
    assert_eq!(err.kind, ErrorKind::Link);
    assert!(messages.borrow()[0].contains("undefined symbol 'no_such_function_anywhere'"));
}

#[test]
fn test_object_file_reloaded_in_memory() {
    let dir = scratch_dir("reload");
    let obj = dir.join("lib.o");

    let (mut producer, _) = state_with_messages(OutputType::Object);
    producer
        .compile_string("int scale = 3;\nint scaled(int x) { return x * scale; }\n")
        .unwrap();
    producer.output_file(obj.to_str().unwrap()).unwrap();

    let (mut consumer, _) = state_with_messages(OutputType::Memory);
    consumer.add_file(obj.to_str().unwrap()).unwrap();
    consumer
        .compile_string("int scaled(int);\nint main() { return scaled(14); }\n")
        .unwrap();
    assert_eq!(consumer.run(&["prog".to_string()]).unwrap(), 42);
    assert!(consumer.deps().iter().any(|d| d.ends_with("lib.o")));
}

#[test]
fn test_object_links_with_system_cc() {
    if !have_cc() {
        eprintln!("cc not found, skipping");
        return;
    }
    let dir = scratch_dir("cc");
    let obj = dir.join("prog.o");
    let exe = dir.join("prog");

    let (mut state, _) = state_with_messages(OutputType::Object);
    state
        .compile_string(
            r#"
            int printf(const char *fmt, ...);
            static int counter = 5;
            int *counter_ptr = &counter;
            static int add(int a, int b) { return a + b; }
            int main() {
                printf("sum=%d\n", add(*counter_ptr, 37));
                return add(counter, 37) == 42 ? 0 : 1;
            }
            "#,
        )
        .unwrap();
    state.output_file(obj.to_str().unwrap()).unwrap();

    let link = Command::new("cc").arg(&obj).arg("-o").arg(&exe).output().unwrap();
    assert!(
        link.status.success(),
        "link failed: {}",
        String::from_utf8_lossy(&link.stderr)
    );
    let run = Command::new(&exe).output().unwrap();
    assert_eq!(run.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&run.stdout), "sum=42\n");
}

#[test]
fn test_makedeps() {
    let dir = scratch_dir("deps");
    fs::write(dir.join("defs.h"), "#define N 3\n").unwrap();
    let src = dir.join("unit.c");
    fs::write(&src, "#include \"defs.h\"\nint n = N;\n").unwrap();

    let (mut state, _) = state_with_messages(OutputType::Object);
    state.add_file(src.to_str().unwrap()).unwrap();
    let target = dir.join("unit.o");
    state.gen_makedeps(target.to_str().unwrap(), None).unwrap();

    let text = fs::read_to_string(dir.join("unit.d")).unwrap();
    let expected = format!(
        "{} : \\\n\t{} \\\n\t{} \\\n\n",
        target.display(),
        src.display(),
        dir.join("defs.h").display()
    );
    assert_eq!(text, expected);
}

#[test]
fn test_missing_library() {
    let (mut state, messages) = state_with_messages(OutputType::Memory);
    let err = state.add_library("definitely_not_installed_xyz").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Link);
    assert_eq!(
        messages.borrow()[0],
        "crustcc: error: library 'definitely_not_installed_xyz' not found"
    );
}

#[test]
fn test_string_literal_keeps_raw_bytes() {
    let dir = scratch_dir("bytes");
    let src = dir.join("bytes.c");
    let mut text = b"int main() { char *s = \"".to_vec();
    text.extend_from_slice(&[0xc3, 0x28, 0xff]);
    text.extend_from_slice(
        b"\"; return (unsigned char)s[0] == 0xc3 && s[1] == 0x28 && (unsigned char)s[2] == 0xff && !s[3]; }\n",
    );
    fs::write(&src, text).unwrap();

    let (mut state, _) = state_with_messages(OutputType::Memory);
    state.add_file(src.to_str().unwrap()).unwrap();
    assert_eq!(state.run(&["prog".to_string()]).unwrap(), 1);
}

#[test]
fn test_forward_referenced_global_in_memory() {
    let (mut state, _) = state_with_messages(OutputType::Memory);
    state
        .compile_string("extern int g;\nint f() { return g; }\nint g = 5;\nint main() { return f(); }\n")
        .unwrap();
    assert_eq!(state.run(&["prog".to_string()]).unwrap(), 5);
}

#[test]
fn test_line_restored_after_include() {
    let dir = scratch_dir("line");
    fs::write(dir.join("inc.h"), "int from_header;\n\n\n").unwrap();
    let main = dir.join("main.c");
    fs::write(&main, "#include \"inc.h\"\nint line = __LINE__;\nint main() { return line; }\n").unwrap();

    let (mut state, _) = state_with_messages(OutputType::Memory);
    state.add_file(main.to_str().unwrap()).unwrap();
    assert_eq!(state.run(&["prog".to_string()]).unwrap(), 2);
}

#[test]
fn test_preprocessed_output_is_stable() {
    let source = "#define NEG -1\n#define EMPTY\n#define ID(a) a\n#define STR(x) #x\n\
                  int a = -NEG; int b = 8/EMPTY/2; int c = +ID(+)1;\n\
                  int ID(x)ID(y);\nchar *s = STR(say \"hi\\n\");\n";
    let preprocess = |text: &str| {
        let (mut state, _) = state_with_messages(OutputType::Preprocess);
        let capture = Capture::default();
        state.set_preprocess_output(Box::new(capture.clone()));
        state.compile_string(text).unwrap();
        let out = capture.0.borrow().clone();
        String::from_utf8(out).unwrap()
    };
    let once = preprocess(source);
    assert!(once.contains("int a = - -1;"), "{}", once);
    assert!(once.contains("8/ /2"), "{}", once);
    assert!(once.contains("int x y;"), "{}", once);
    assert_eq!(preprocess(&once), once);
}

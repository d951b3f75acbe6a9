// Compiled programs executed in memory: arithmetic, pointers, control flow

use crustcc::{CompilationState, OutputType};

/// Compile `source` in memory and return what its `main` returns.
fn run(source: &str) -> i32 {
    let mut state = CompilationState::new();
    state.set_output_type(OutputType::Memory);
    state.compile_string(source).expect("compilation failed");
    state.run(&["test".to_string()]).expect("run failed")
}

#[test]
fn test_return_constant() {
    assert_eq!(run("int main() { return 42; }"), 42);
}

#[test]
fn test_arithmetic_coercion() {
    let source = r#"
    int main() {
        char c = 'a';
        int i = 10;
        unsigned char uc = 200;
        signed char sc = -56;
        int ok = 1;

        ok = ok && (c + i == 107);
        ok = ok && (i - c == -87);
        ok = ok && ((unsigned char)(uc + uc) == 144);
        ok = ok && (sc * 2 == -112);
        ok = ok && (c / 2 == 48);
        ok = ok && (-7 / 2 == -3) && (-7 % 2 == -1);
        ok = ok && ((unsigned)-1 > 0) && (-1 < 0);
        ok = ok && ((1u << 31) >> 31 == 1) && ((-8 >> 1) == -4);
        return ok;
    }
    "#;
    assert_eq!(run(source), 1);
}

#[test]
fn test_long_long_arithmetic() {
    let source = r#"
    long long big(long long a) { return a * 1000000; }
    int main() {
        long long x = big(5000000);
        unsigned long y = 0xffffffffUL + 1;
        if (x != 5000000000000LL) return 1;
        if (y != 4294967296UL) return 2;
        if ((int)(x >> 32) != 1164) return 3;
        if (sizeof(long) != 8 || sizeof(int) != 4 || sizeof(short) != 2) return 4;
        return 0;
    }
    "#;
    assert_eq!(run(source), 0);
}

#[test]
fn test_pointer_arithmetic() {
    let source = r#"
    int main() {
        int arr[5];
        int *p = arr;
        int *p2 = p + 2;
        int i;

        *p2 = 42;
        for (i = 0; i < 5; i++)
            if (i != 2) arr[i] = i;
        if (arr[2] != 42) return 1;
        if (p2 - p != 2) return 2;
        p2++;
        if (*p2 != 3) return 3;
        if (*(arr + 4) != 4) return 4;
        return 0;
    }
    "#;
    assert_eq!(run(source), 0);
}

#[test]
fn test_loops_and_switch() {
    let source = r#"
    int classify(int n) {
        switch (n) {
        case 0: return 10;
        case 1:
        case 2: return 20;
        case 3 ... 5: return 30;
        default: break;
        }
        return -1;
    }
    int main() {
        int sum = 0, i = 0, j;
        while (i < 10) { sum += i; i++; }
        do { sum--; } while (sum > 40);
        for (j = 0; j < 100; j++) {
            if (j == 3) continue;
            if (j == 5) break;
            sum += j;
        }
        if (sum != 40 + 0 + 1 + 2 + 4) return 1;
        if (classify(0) + classify(2) + classify(4) + classify(9) != 59) return 2;
        return 0;
    }
    "#;
    assert_eq!(run(source), 0);
}

#[test]
fn test_goto() {
    let source = r#"
    int main() {
        int n = 0;
    again:
        n++;
        if (n < 5) goto again;
        goto done;
        n = 100;
    done:
        return n;
    }
    "#;
    assert_eq!(run(source), 5);
}

#[test]
fn test_recursion() {
    let source = r#"
    int fib(int n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
    int main() { return fib(20) == 6765; }
    "#;
    assert_eq!(run(source), 1);
}

#[test]
fn test_structs_and_unions() {
    let source = r#"
    struct point { int x, y; };
    struct rect { struct point a, b; char tag; };
    union word { int i; unsigned char b[4]; };

    int area(struct rect *r) { return (r->b.x - r->a.x) * (r->b.y - r->a.y); }

    int main() {
        struct rect r;
        struct rect copy;
        union word w;

        r.a.x = 1; r.a.y = 2; r.b.x = 4; r.b.y = 6; r.tag = 'r';
        copy = r;
        if (area(&copy) != 12) return 1;
        if (sizeof(struct rect) != 20) return 2;
        w.i = 0x01020304;
        if (w.b[0] != 4) return 3;
        return 0;
    }
    "#;
    assert_eq!(run(source), 0);
}

#[test]
fn test_globals_and_static_locals() {
    let source = r#"
    int table[] = { 1, 2, 3, 4 };
    char *names[] = { "zero", "one" };
    int *second = &table[1];
    static int counter;

    int tick(void) { static int calls = 10; return ++calls; }

    int main() {
        tick(); tick();
        counter = tick();
        if (counter != 13) return 1;
        if (*second != 2 || sizeof(table) != 16) return 2;
        if (names[1][2] != 'e') return 3;
        return 0;
    }
    "#;
    assert_eq!(run(source), 0);
}

#[test]
fn test_function_pointers() {
    let source = r#"
    typedef int (*binop)(int, int);
    int add(int a, int b) { return a + b; }
    int mul(int a, int b) { return a * b; }
    int apply(binop f, int a, int b) { return f(a, b); }
    int main() {
        binop ops[2];
        ops[0] = add;
        ops[1] = mul;
        return apply(ops[0], 3, 4) + apply(ops[1], 3, 4);
    }
    "#;
    assert_eq!(run(source), 19);
}

#[test]
fn test_many_arguments() {
    let source = r#"
    int sum8(int a, int b, int c, int d, int e, int f, int g, int h) {
        return a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h;
    }
    int main() { return sum8(1, 1, 1, 1, 1, 1, 1, 2); }
    "#;
    assert_eq!(run(source), 44);
}

#[test]
fn test_libc_calls() {
    let source = r#"
    int snprintf(char *buf, unsigned long size, const char *fmt, ...);
    int strcmp(const char *a, const char *b);
    void *malloc(unsigned long n);
    void free(void *p);

    int main() {
        char buf[32];
        int *p = malloc(4 * sizeof(int));
        p[3] = 7;
        snprintf(buf, sizeof buf, "%d-%s", 42 + p[3], "x" "y");
        free(p);
        return strcmp(buf, "49-xy") == 0;
    }
    "#;
    assert_eq!(run(source), 1);
}

#[test]
fn test_main_arguments() {
    let source = r#"
    int main(int argc, char **argv) {
        if (argc != 3) return 100;
        return argv[1][0] - '0' + argv[2][0] - '0';
    }
    "#;
    let mut state = CompilationState::new();
    state.set_output_type(OutputType::Memory);
    state.compile_string(source).unwrap();
    let args = ["prog", "3", "4"].map(String::from);
    assert_eq!(state.run(&args).unwrap(), 7);
}

#[test]
fn test_large_zeroed_global() {
    let source = r#"
    char arena[1 << 28];
    static long counts[1 << 20];
    int main() {
        arena[(1 << 28) - 1] = 7;
        counts[(1 << 20) - 1] = 35;
        return arena[(1 << 28) - 1] + counts[(1 << 20) - 1] + arena[1 << 27];
    }
    "#;
    assert_eq!(run(source), 42);
}

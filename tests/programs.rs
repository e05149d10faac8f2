use quill_core::error::ErrorKind;
use quill_core::{execute, parse, ExecError, ExecStatus, Execution, ParseStatus, Value};

fn run_ok(src: &str) -> Execution {
    let compilation = parse(src);
    assert!(compilation.is_ok(), "{}", compilation.trace.render());
    let execution = execute(&compilation.bytecode);
    assert_eq!(execution.status, ExecStatus::OkStop, "{src}");
    execution
}

fn int(execution: &Execution, name: &str) -> i64 {
    match execution.value(name) {
        Some(Value::Int(v)) => *v,
        other => panic!("{name} is not an int: {other:?}"),
    }
}

#[test]
fn straight_line_program_updates_statics() {
    let execution = run_ok("int a a = 2 int b b = a + 3");
    assert_eq!(int(&execution, "0.a"), 2);
    assert_eq!(int(&execution, "0.b"), 5);
}

#[test]
fn type_error_stops_compilation_with_empty_bytecode() {
    let compilation = parse("int a a = \"x\"");
    assert!(!compilation.is_ok());
    assert_eq!(compilation.status, ParseStatus::Error);
    assert_eq!(compilation.trace.deepest().status, ParseStatus::AssignmentDatatype);
    assert!(compilation.bytecode.code.is_empty());

    let err = quill_core::run("int a a = \"x\"", "main.ql").unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeError);
    assert_eq!(err.help.as_deref(), Some("PARSE_ERROR_ASSIGNMENT_DATATYPE"));
}

#[test]
fn recursion_keeps_locals_per_frame() {
    let execution = run_ok(
        "function fact(int n) of int { int t t = n fact = n <= 1 ? 1 : t * fact(n - 1) } \
         int r r = fact(5)",
    );
    assert_eq!(int(&execution, "0.r"), 120);
}

#[test]
fn sibling_functions_share_names() {
    let execution = run_ok(
        "function twice(int v) of int { twice = v * 2 } \
         function inc(int v) of int { inc = v + 1 } \
         int r r = twice(inc(4)) + inc(twice(1))",
    );
    assert_eq!(int(&execution, "0.r"), 13);
}

#[test]
fn sparse_arrays_count_by_key() {
    let execution = run_ok(
        "array [string] of int c c[\"a\"] += 1 c[\"a\"] += 1 c[\"b\"] = 5 \
         int n n = c[\"a\"] + c[\"b\"]",
    );
    assert_eq!(int(&execution, "0.n"), 7);
    let Some(Value::Array(c)) = execution.value("0.c") else {
        panic!("c is not an array");
    };
    assert_eq!(c.len(), 2);
}

#[test]
fn array_assignment_copies_and_compares_structurally() {
    let execution = run_ok(
        "array [int] of int p array [int] of int q boolean same boolean after \
         p[1] = 2 p[2] = 3 q[2] = 3 q[1] = 2 same = p == q \
         q = p q[1] = 9 after = p == q",
    );
    assert_eq!(execution.value("0.same"), Some(&Value::Bool(true)));
    assert_eq!(execution.value("0.after"), Some(&Value::Bool(false)));
    let Some(Value::Array(p)) = execution.value("0.p") else {
        panic!("p is not an array");
    };
    assert_eq!(p.get(&[Value::Int(1)]), Some(&Value::Int(2)));
}

#[test]
fn block_variables_are_reset_on_entry() {
    let execution = run_ok("int x x = 1 { int x x += 5 .x += x } { int y y = x }");
    assert_eq!(int(&execution, "0.x"), 6);
    assert_eq!(int(&execution, "0.0.x"), 5);
    assert_eq!(int(&execution, "0.1.y"), 6);
}

#[test]
fn builtins_return_floats() {
    let execution = run_ok("float y y = sin(0) + cos(0)");
    assert_eq!(execution.value("0.y"), Some(&Value::Float(1.0)));
}

#[test]
fn runtime_fault_halts_execution() {
    let compilation = parse("int z float q int after q = 1 / z after = 1");
    assert!(compilation.is_ok());
    let execution = execute(&compilation.bytecode);
    assert_eq!(
        execution.status,
        ExecStatus::Failed(ExecError::DivisionByZero {
            op: quill_core::compiler::OpCode::Div
        })
    );
    assert_eq!(execution.status.to_string(), "EXEC_ERROR_DIV_DIV_BY_0");
    assert_eq!(int(&execution, "0.after"), 0);
}

#[test]
fn snapshot_serializes_to_json() {
    let execution = run_ok("int a a = 2 array [int] of string s s[7] = \"hi\"");
    let json = serde_json::to_value(&execution).unwrap();
    assert_eq!(json["status"], "OK_STOP");

    let vars = json["variables"].as_array().unwrap();
    let a = vars.iter().find(|v| v["name"] == "a").unwrap();
    assert_eq!(a["type"], "i");
    assert_eq!(a["value"], 2);

    let s = vars.iter().find(|v| v["name"] == "s").unwrap();
    assert_eq!(s["type"], "a [i] s");
    assert_eq!(s["value"]["elements"][0]["value"], "hi");
}

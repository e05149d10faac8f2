use proptest::prelude::*;
use quill_core::compiler::{Bytecode, Instruction};
use quill_core::{execute, parse, ExecStatus, Value};

proptest! {
    #[test]
    fn appended_jumps_are_relocated(
        prefix in prop::collection::vec(any::<i64>(), 0..8),
        targets in prop::collection::vec(0u32..10_000, 1..6),
    ) {
        let mut head = Bytecode::new();
        for v in &prefix {
            head.put_int(*v);
        }
        head.jump(3);
        let base = head.code.len() as u32;
        let head_jumps = head.jumps().len();

        let mut tail = Bytecode::new();
        for t in &targets {
            tail.jump_if_false(*t);
        }
        head += tail;

        prop_assert_eq!(head.jumps().len(), head_jumps + targets.len());
        prop_assert_eq!(head.read_u32(head.jumps()[0]), Some(3));
        for (slot, t) in head.jumps()[head_jumps..].iter().zip(&targets) {
            prop_assert_eq!(head.read_u32(*slot), Some(t + base));
        }
    }
}

proptest! {
    #[test]
    fn integer_literals_reach_their_variable(n in 0i64..i64::MAX) {
        let compilation = parse(&format!("int a a = {}", n));
        prop_assert!(compilation.is_ok());
        let code = compilation.bytecode.instructions().unwrap();
        prop_assert!(code.iter().any(|(_, i)| *i == Instruction::PutInt(n)));

        let execution = execute(&compilation.bytecode);
        prop_assert_eq!(execution.value("0.a"), Some(&Value::Int(n)));
    }
}

proptest! {
    #[test]
    fn string_literals_are_stored_verbatim(s in "[a-z0-9 ]{0,24}") {
        let execution = execute(&parse(&format!("string s s = \"{}\"", s)).bytecode);
        prop_assert_eq!(execution.status, ExecStatus::OkStop);
        prop_assert_eq!(execution.value("0.s"), Some(&Value::Str(s)));
    }
}

proptest! {
    #[test]
    fn leading_dots_select_the_enclosing_declaration(depth in 1usize..6, dots in 0usize..6) {
        let dots = dots.min(depth);
        let mut src = String::from("int x ");
        for _ in 0..depth {
            src.push_str("{ int x ");
        }
        src.push_str(&".".repeat(dots));
        src.push_str("x = 7 ");
        for _ in 0..depth {
            src.push_str("} ");
        }

        let compilation = parse(&src);
        prop_assert!(compilation.is_ok(), "{}", compilation.trace.render());
        let execution = execute(&compilation.bytecode);

        for level in 0..=depth {
            let name = format!("0{}.x", ".0".repeat(level));
            let expected = if level == depth - dots { 7 } else { 0 };
            prop_assert_eq!(execution.value(&name), Some(&Value::Int(expected)));
        }
    }
}

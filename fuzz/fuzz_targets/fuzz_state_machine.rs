#![no_main]
use libfuzzer_sys::fuzz_target;
use suspend_rs::fuzzing::{execute_program, FuzzProgram};

fuzz_target!(|program: FuzzProgram| {
    if let Err(violation) = execute_program(&program) {
        panic!("{} in {:?}", violation, program);
    }
});

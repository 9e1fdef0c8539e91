use std::process::ExitCode;

fn main() -> ExitCode {
    suspend_rs::run_cli()
}

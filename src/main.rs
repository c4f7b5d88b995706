use std::process::ExitCode;

fn main() -> ExitCode {
    relaykeeper::app::run()
}

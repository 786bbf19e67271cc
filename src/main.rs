use podforward::status::ExitStatus;
use podforward::{core, signals};

/// Entry point - runs core::run() and reports interrupts as status 130
///
/// Returns ExitStatus directly, which implements std::process::Termination.
fn main() -> ExitStatus {
    let args: Vec<String> = std::env::args().collect();

    let status = core::run(args);

    if signals::was_interrupted() {
        return ExitStatus::Interrupted;
    }

    status
}

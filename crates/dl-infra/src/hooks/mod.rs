mod process_runner;

pub use process_runner::ProcessHookRunner;

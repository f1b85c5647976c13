use clap::Parser;
use tasksync::cli::commands::Cli;
use tasksync::cli::handlers;
use tasksync::io::{FormatError, LockError, TaskFileError};

fn main() {
    let cli = Cli::parse();
    if let Err(e) = handlers::dispatch(cli) {
        eprintln!("error: {}", e);
        if let Some(task_err) = e.downcast_ref::<TaskFileError>() {
            match task_err {
                TaskFileError::Lock(LockError::Timeout { .. }) => {
                    eprintln!("hint: if no other process has the file open, retry with --break-lock");
                }
                TaskFileError::Lock(LockError::Unsupported { .. }) => {
                    eprintln!("hint: this filesystem cannot lock; retry with --unlocked");
                }
                TaskFileError::Format(FormatError::TooNew { .. }) => {
                    eprintln!(
                        "hint: upgrade tasksync before opening this file; it was not modified"
                    );
                }
                _ => {}
            }
        }
        std::process::exit(1);
    }
}

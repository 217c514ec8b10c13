use std::process::ExitCode;

mod app;
mod catalog;
mod challenge;
mod cli;
mod config;
mod diff;
mod error;
mod history;
mod journal;
mod lifecycle;
mod lock;
mod logger;
mod persist;
mod review;
mod session;
mod shell;
mod vcs;
mod workspace;


fn main() -> ExitCode {
    app::main()
}

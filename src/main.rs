//! Binary entrypoint that serves the chat ledger.

use std::process::ExitCode;

use chat_ledger::start_chat_ledger;

/// Start the HTTP server backed by the `SQLite` ledger.
fn main() -> ExitCode {
    start_chat_ledger::run()
}

//! Binary entrypoint that launches the chat server.

use std::process::ExitCode;

use ollama_chat::start_ollama_chat;

/// Start the server with configuration from `OLLAMA_CHAT_*` variables.
fn main() -> ExitCode {
    start_ollama_chat::run()
}

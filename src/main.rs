mod backup;
mod db;
mod domain;
mod finance;
mod ipc;

use std::io::{self, BufRead, Write};

fn emit(stdout: &mut io::Stdout, value: &serde_json::Value) {
    let line = serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string());
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

fn main() {
    let mut state = ipc::AppState::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<ipc::Request>(trimmed) {
            Ok(req) => {
                let resp = ipc::handle_request(&mut state, req);
                emit(&mut stdout, &resp);
            }
            Err(e) => {
                // Unparseable input carries no id to echo back.
                emit(
                    &mut stdout,
                    &serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    }),
                );
            }
        }
    }
}

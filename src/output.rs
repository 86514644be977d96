use serde::Serialize;
use std::io::{IsTerminal, Write};

/// User-facing output of the `fleet` commands.
///
/// Command modules report through this trait rather than printing directly,
/// so the same command code can run against a capturing implementation.
pub trait UserOutput: Send + Sync {
    /// Plain line on stdout (tables, JSON, "Checked 3 service(s)")
    fn status(&self, message: &str);

    /// e.g. "qwen-7b running on gpu-a:8001 (pid 4121)"
    fn success(&self, message: &str);

    /// e.g. "llama: host unreachable, left unchanged"
    fn warning(&self, message: &str);

    fn error(&self, message: &str);

    /// Start a line without a newline; `finish_progress` completes it.
    fn progress(&self, message: &str);

    fn finish_progress(&self, result: &str);

    /// Lines captured from a remote host, such as the tail of a server log.
    fn remote_log(&self, tail: &str) {
        self.status("    --- remote log ---");
        for line in tail.lines() {
            self.status(&format!("    | {}", line));
        }
    }
}

/// Pretty-printed JSON on the status stream.
pub fn print_json<T: Serialize + ?Sized>(out: &dyn UserOutput, value: &T) -> anyhow::Result<()> {
    out.status(&serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Terminal output. Colors are used only when stdout is a terminal and
/// `NO_COLOR` is unset.
pub struct CliOutput {
    color: bool,
}

impl CliOutput {
    pub fn new() -> Self {
        let color = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
        Self { color }
    }

    fn paint(&self, code: &str, message: &str) -> String {
        if self.color {
            format!("\x1b[{}m{}\x1b[0m", code, message)
        } else {
            message.to_string()
        }
    }
}

impl Default for CliOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("{}", self.paint("32", message));
    }

    fn warning(&self, message: &str) {
        eprintln!("{}", self.paint("33", message));
    }

    fn error(&self, message: &str) {
        eprintln!("{}", self.paint("31", message));
    }

    fn progress(&self, message: &str) {
        print!("{}", message);
        std::io::stdout().flush().ok();
    }

    fn finish_progress(&self, result: &str) {
        println!("{}", result);
    }

    fn remote_log(&self, tail: &str) {
        self.status(&self.paint("2", "    --- remote log ---"));
        for line in tail.lines() {
            self.status(&self.paint("2", &format!("    | {}", line)));
        }
    }
}

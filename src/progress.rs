use serde::Serialize;

/// Capability passed explicitly to every orchestrator and component, instead of threaded through
/// a process-global sink. Implementations must not block on anything but their own output.
pub trait ProgressReporter: Send + Sync {
    fn step(&self, index: u32, total: u32, name: &str);
    fn message(&self, text: &str);
    fn warning(&self, text: &str);
    fn error(&self, text: &str);
    fn progress(&self, fraction: f32);
    fn complete(&self, success: bool);
}

/// One line per step, indented messages underneath. The default for an interactive terminal.
pub struct TextProgressReporter;

impl ProgressReporter for TextProgressReporter {
    fn step(&self, index: u32, total: u32, name: &str) {
        println!("Step {index}/{total}: {name}");
    }

    fn message(&self, text: &str) {
        println!("  {text}");
    }

    fn warning(&self, text: &str) {
        eprintln!("  warning: {text}");
    }

    fn error(&self, text: &str) {
        eprintln!("  error: {text}");
    }

    fn progress(&self, fraction: f32) {
        println!("  progress: {:.0}%", fraction * 100.0);
    }

    fn complete(&self, success: bool) {
        println!("{}", if success { "done" } else { "failed" });
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Event<'a> {
    Step { index: u32, total: u32, name: &'a str },
    Message { text: &'a str },
    Warning { text: &'a str },
    Error { text: &'a str },
    Progress { fraction: f32 },
    Complete { success: bool },
}

/// One JSON object per line, for machine consumers (`--json`).
pub struct JsonProgressReporter;

impl JsonProgressReporter {
    fn emit(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("{{\"type\":\"error\",\"text\":\"failed to serialize progress event: {e}\"}}"),
        }
    }
}

impl ProgressReporter for JsonProgressReporter {
    fn step(&self, index: u32, total: u32, name: &str) {
        self.emit(Event::Step { index, total, name });
    }

    fn message(&self, text: &str) {
        self.emit(Event::Message { text });
    }

    fn warning(&self, text: &str) {
        self.emit(Event::Warning { text });
    }

    fn error(&self, text: &str) {
        self.emit(Event::Error { text });
    }

    fn progress(&self, fraction: f32) {
        self.emit(Event::Progress { fraction });
    }

    fn complete(&self, success: bool) {
        self.emit(Event::Complete { success });
    }
}

/// Discards everything. Used by library callers and tests that don't want terminal output.
pub struct NoopProgressReporter;

impl ProgressReporter for NoopProgressReporter {
    fn step(&self, _index: u32, _total: u32, _name: &str) {}
    fn message(&self, _text: &str) {}
    fn warning(&self, _text: &str) {}
    fn error(&self, _text: &str) {}
    fn progress(&self, _fraction: f32) {}
    fn complete(&self, _success: bool) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_reporter_does_not_panic() {
        let reporter = NoopProgressReporter;
        reporter.step(1, 6, "Partition");
        reporter.message("hello");
        reporter.warning("careful");
        reporter.error("oops");
        reporter.progress(0.5);
        reporter.complete(true);
    }
}

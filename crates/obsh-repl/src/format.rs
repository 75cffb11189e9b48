//! Output formatting for the REPL.
//!
//! Items print differently depending on who reads them:
//!
//! - **Interactive** → the display form, job output prefixed with `[N]`
//! - **Piped** → one compact JSON document per line, for other programs

use std::io::IsTerminal;

use obsh_kernel::JobOutput;
use obsh_types::{ErrorValue, JobInfo, JobState, Value};

/// Who reads the shell's standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputContext {
    Interactive,
    Piped,
}

/// Detect the output context based on terminal state.
pub fn detect_context() -> OutputContext {
    if std::io::stdout().is_terminal() {
        OutputContext::Interactive
    } else {
        OutputContext::Piped
    }
}

pub fn format_value(value: &Value, context: OutputContext) -> String {
    match context {
        OutputContext::Interactive => value.to_string(),
        OutputContext::Piped => serde_json::to_string(value).unwrap_or_else(|_| value.to_string()),
    }
}

pub fn format_error(error: &ErrorValue) -> String {
    format!("error: {}", error)
}

/// Format output a job produced.
///
/// Foreground output reads like plain command output; background output
/// names its job so interleaved lines can be told apart.
pub fn format_job_output(output: &JobOutput, foreground: bool, context: OutputContext) -> String {
    let (id, text) = match output {
        JobOutput::Item(id, value) => (id, format_value(value, context)),
        JobOutput::Error(id, error) => (id, format_error(error)),
    };
    if foreground {
        text
    } else {
        format!("[{}] {}", id, text)
    }
}

/// One line of the `jobs` listing.
pub fn format_job(info: &JobInfo) -> String {
    let pid = info.pid.map(|p| format!(" ({})", p)).unwrap_or_default();
    format!("[{}] {:<10}{} {}", info.id, info.state.to_string(), pid, info.command)
}

/// Announcement for a job that finished in the background.
pub fn format_finished(info: &JobInfo) -> String {
    match (info.state, info.exit_code) {
        (JobState::Dead, Some(0)) | (JobState::Dead, None) => format!("[{}] Done      {}", info.id, info.command),
        (_, Some(code)) => format!("[{}] Exit {:<5}{}", info.id, code, info.command),
        (_, None) => format!("[{}] {} {}", info.id, info.state, info.command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsh_types::JobId;

    fn info(state: JobState, exit_code: Option<i64>) -> JobInfo {
        JobInfo {
            id: JobId(2),
            command: "generate | head".to_string(),
            state,
            pid: None,
            exit_code,
        }
    }

    #[test]
    fn test_piped_values_are_json() {
        assert_eq!(format_value(&Value::Int(3), OutputContext::Piped), r#"{"Int":3}"#);
        assert_eq!(format_value(&Value::Int(3), OutputContext::Interactive), "3");
    }

    #[test]
    fn test_background_output_names_job() {
        let output = JobOutput::Item(JobId(4), Value::Int(1));
        assert_eq!(format_job_output(&output, false, OutputContext::Interactive), "[4] 1");
        assert_eq!(format_job_output(&output, true, OutputContext::Interactive), "1");
    }

    #[test]
    fn test_job_error_output() {
        let output = JobOutput::Error(JobId(1), ErrorValue::new("boom"));
        assert!(format_job_output(&output, true, OutputContext::Interactive).starts_with("error: "));
    }

    #[test]
    fn test_finished_announcements() {
        assert_eq!(format_finished(&info(JobState::Dead, Some(0))), "[2] Done      generate | head");
        assert!(format_finished(&info(JobState::Dead, Some(143))).contains("Exit 143"));
    }

    #[test]
    fn test_job_listing() {
        let line = format_job(&info(JobState::Paused, None));
        assert!(line.starts_with("[2] Stopped"));
        assert!(line.ends_with("generate | head"));
    }
}

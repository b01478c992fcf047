use owo_colors::{OwoColorize, Stream, Style};

use crate::types::{RunReport, RunStatus, SweepReport};

/// Format milliseconds as a compact duration: "850ms", "12.4s", "3m05s".
pub fn format_duration_ms(ms: u128) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        let secs = ms / 1000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

fn run_label(run: &RunReport) -> String {
    format!("{} #{}", run.identifier, run.iteration)
}

fn status_cell(status: &RunStatus) -> String {
    let (text, style) = match status {
        RunStatus::Completed { .. } => ("ok", Style::new().green().bold()),
        RunStatus::Failed { .. } => ("failed", Style::new().red().bold()),
        RunStatus::Skipped => ("skipped", Style::new().dimmed()),
    };
    format!("{:<7}", text)
        .if_supports_color(Stream::Stdout, |s| s.style(style))
        .to_string()
}

fn detail(status: &RunStatus) -> String {
    match status {
        RunStatus::Completed {
            samples,
            duration_ms,
            exit_code,
        } => {
            let mut out = format!(
                "{} samples in {}",
                samples,
                format_duration_ms(*duration_ms)
            );
            match exit_code {
                Some(0) => {}
                Some(code) => out.push_str(&format!(" (exit {})", code)),
                None => out.push_str(" (killed by signal)"),
            }
            out
        }
        RunStatus::Failed { reason } => reason.clone(),
        RunStatus::Skipped => "no config file".to_string(),
    }
}

/// Per-run table followed by a totals line.
pub fn format_default(report: &SweepReport) -> String {
    let mut out = String::new();

    let header = "Sweep results:";
    out.push_str(
        &header
            .if_supports_color(Stream::Stdout, |s| s.dimmed())
            .to_string(),
    );
    out.push_str("\n\n");

    if !report.runs.is_empty() {
        let labels: Vec<String> = report.runs.iter().map(run_label).collect();
        let width = labels.iter().map(|l| l.len()).max().unwrap_or(0);

        for (run, label) in report.runs.iter().zip(&labels) {
            let label_padded = format!("{:<width$}", label, width = width);
            out.push_str(&format!(
                "  {}  {}  {}\n",
                status_cell(&run.status),
                label_padded
                    .if_supports_color(Stream::Stdout, |s| s.cyan())
                    .to_string(),
                detail(&run.status)
            ));
        }
        out.push('\n');
    }

    let elapsed = (report.finished_at - report.started_at)
        .num_milliseconds()
        .max(0) as u128;
    let totals = format!(
        "{} completed, {} failed, {} skipped in {}",
        report.completed(),
        report.failed(),
        report.skipped(),
        format_duration_ms(elapsed)
    );
    let totals = if report.failed() > 0 {
        totals
            .if_supports_color(Stream::Stdout, |s| s.red())
            .to_string()
    } else {
        totals
            .if_supports_color(Stream::Stdout, |s| s.dimmed())
            .to_string()
    };
    out.push_str(&totals);
    out.push('\n');

    out
}

pub fn format_json(report: &SweepReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string()) + "\n"
}

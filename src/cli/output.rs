// Output formatting and display for CLI

use crate::config::ProcessSpec;
use crate::ipc::ResponseData;
use crate::process::{ProcessState, ProcessStatus};
use chrono::{DateTime, Local};
use colored::*;
use std::time::{Duration, SystemTime};
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success response to stdout
pub fn print_success(data: &ResponseData) {
    match data {
        ResponseData::Status(status) => print_detailed_status(status),

        ResponseData::ProcessList(processes) => {
            if processes.is_empty() {
                println!("{}", "No processes are configured".yellow());
            } else {
                print_process_table(processes);
            }
        }

        ResponseData::Success(message) => print_success_msg(message),
    }
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a formatted table of processes
fn print_process_table(processes: &[ProcessStatus]) {
    #[derive(Tabled)]
    struct ProcessRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "State")]
        state: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
        #[tabled(rename = "Last exit")]
        last_exit: String,
    }

    let rows: Vec<ProcessRow> = processes
        .iter()
        .map(|p| ProcessRow {
            name: truncate(&p.name, 24),
            state: format_state_colored(&p.state),
            pid: p
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            memory: p
                .memory_usage_bytes
                .map(format_memory)
                .unwrap_or_else(|| "-".to_string()),
            uptime: p
                .uptime()
                .map(|d| format_duration(&d))
                .unwrap_or_else(|| "-".to_string()),
            restarts: p.restart_count.to_string(),
            last_exit: format_last_exit(p),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} process(es)", processes.len())
            .dimmed()
            .italic()
    );
}

/// Print detailed status view for a single process
pub fn print_detailed_status(process: &ProcessStatus) {
    println!("\n{}", "Process Details".bold().underline());
    println!();
    println!("  {:<15} {}", "Name:".bold(), process.name.cyan());
    println!(
        "  {:<15} {}",
        "State:".bold(),
        format_state_colored(&process.state)
    );

    if let Some(pid) = process.pid {
        println!("  {:<15} {}", "PID:".bold(), pid);
    }
    if let Some(bytes) = process.memory_usage_bytes {
        println!("  {:<15} {}", "Memory:".bold(), format_memory(bytes));
    }
    if let Some(uptime) = process.uptime() {
        println!("  {:<15} {}", "Uptime:".bold(), format_duration(&uptime));
    }
    println!("  {:<15} {}", "Restarts:".bold(), process.restart_count);
    println!("  {:<15} {}", "Last exit:".bold(), format_last_exit(process));

    if let Some(started) = process.last_started_at {
        println!("  {:<15} {}", "Started at:".bold(), format_time(started));
    }
    if let Some(exited) = process.last_exited_at {
        println!("  {:<15} {}", "Exited at:".bold(), format_time(exited));
    }

    println!();
}

/// Print the specs a config file resolves to
pub fn print_spec_table(specs: &[std::sync::Arc<ProcessSpec>]) {
    #[derive(Tabled)]
    struct SpecRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Command")]
        command: String,
        #[tabled(rename = "Autorestart")]
        autorestart: String,
        #[tabled(rename = "Memory limit")]
        memory: String,
        #[tabled(rename = "Watch")]
        watch: String,
        #[tabled(rename = "Logs")]
        logs: String,
    }

    let rows: Vec<SpecRow> = specs
        .iter()
        .map(|s| {
            let (program, args) = s.command_line();
            let mut command = program.display().to_string();
            for arg in args {
                command.push(' ');
                command.push_str(&arg);
            }
            SpecRow {
                name: s.name.clone(),
                command: truncate(&command, 40),
                autorestart: yes_no(s.autorestart),
                memory: s
                    .max_memory_bytes
                    .map(format_memory)
                    .unwrap_or_else(|| "-".to_string()),
                watch: yes_no(s.watch_enabled),
                logs: if s.merge_logs {
                    s.stdout_path.display().to_string()
                } else {
                    format!("{}, {}", s.stdout_path.display(), s.stderr_path.display())
                },
            }
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));
    println!("\n{}\n", table);
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

/// Format a process state with color coding
fn format_state_colored(state: &ProcessState) -> String {
    match state {
        ProcessState::Running => state.to_string().green().to_string(),
        ProcessState::Starting => state.to_string().yellow().to_string(),
        ProcessState::RestartBackoff => state.to_string().yellow().to_string(),
        ProcessState::Stopping => state.to_string().yellow().to_string(),
        ProcessState::Stopped => state.to_string().bright_black().to_string(),
        ProcessState::Crashed => state.to_string().red().bold().to_string(),
    }
}

fn format_last_exit(process: &ProcessStatus) -> String {
    match (process.last_exit_code, process.last_signal) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) if process.last_exited_at.is_some() => "unknown".to_string(),
        (None, None) => "-".to_string(),
    }
}

fn format_time(time: SystemTime) -> String {
    let datetime: DateTime<Local> = time.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

/// Truncate a string to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

//! Output formatting for the sss3 client (table, json)

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use sss3_core::{DeviceDescriptor, ReceivedFrame};
use sss3_session::{SessionObserver, SessionSummary, StatusLevel};
use sss3_transport::StatsSnapshot;
use tabled::{Table, Tabled};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Context for output rendering
#[derive(Debug, Clone, Copy)]
pub struct OutputContext {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl OutputContext {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    /// Print a success message (unless in quiet mode)
    pub fn success(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    /// Print an info message (unless in quiet mode)
    pub fn info(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn warn(&self, msg: &str) {
        eprintln!("{}", msg.yellow());
    }

    pub fn error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// Print rows in the configured format
    pub fn print<T: Tabled + Serialize>(&self, data: &[T]) {
        match self.format {
            OutputFormat::Table => {
                if data.is_empty() {
                    if !self.quiet {
                        println!("No data");
                    }
                } else {
                    println!("{}", Table::new(data));
                }
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
                );
            }
        }
    }

    /// Print the offered devices
    pub fn print_devices(&self, devices: &[DeviceDescriptor]) {
        let rows: Vec<DeviceRow> = devices.iter().map(DeviceRow::from).collect();
        self.print(&rows);
    }

    /// Print one received frame
    pub fn print_frame(&self, received: &ReceivedFrame) {
        match self.format {
            OutputFormat::Table => println!(
                "[{}] {}",
                received.received_at_ms.to_string().dimmed(),
                received.frame
            ),
            OutputFormat::Json => {
                if let Ok(json) = serde_json::to_string(received) {
                    println!("{}", json);
                }
            }
        }
    }

    /// Print how the session ended and its data-plane counters
    pub fn print_summary(&self, summary: &SessionSummary) {
        match self.format {
            OutputFormat::Table => {
                if let Some(parameters) = &summary.parameters {
                    println!("{}: {}", "Session".bold(), parameters);
                }
                println!("{}: {:?}", "Ended".bold(), summary.end);
                println!("{}", Table::new(stats_rows(&summary.stats)));
            }
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string())
                );
            }
        }
    }
}

/// Device display for the device list
#[derive(Debug, Tabled, Serialize)]
pub struct DeviceRow {
    #[tabled(rename = "ID")]
    pub id: u32,
    #[tabled(rename = "Type")]
    pub device_type: String,
    #[tabled(rename = "Year")]
    pub year: String,
    #[tabled(rename = "Make")]
    pub make: String,
    #[tabled(rename = "Model")]
    pub model: String,
}

impl From<&DeviceDescriptor> for DeviceRow {
    fn from(device: &DeviceDescriptor) -> Self {
        Self {
            id: device.id,
            device_type: device.device_type.clone(),
            year: device.year.clone(),
            make: device.make.clone(),
            model: device.model.clone(),
        }
    }
}

/// Counter display for the session summary
#[derive(Debug, Tabled, Serialize)]
pub struct StatRow {
    #[tabled(rename = "Counter")]
    pub counter: &'static str,
    #[tabled(rename = "Value")]
    pub value: u64,
}

fn stats_rows(stats: &StatsSnapshot) -> Vec<StatRow> {
    [
        ("Frames received", stats.frames_received),
        ("Frames sent", stats.frames_sent),
        ("Discarded datagrams", stats.discarded),
        ("Dropped messages", stats.dropped_messages),
        ("Timeouts", stats.timeouts),
        ("Sequence gaps", stats.sequence_gaps),
        ("Dropped sends", stats.sends_dropped),
    ]
    .into_iter()
    .map(|(counter, value)| StatRow { counter, value })
    .collect()
}

/// Prints session status lines to the terminal
#[derive(Debug, Clone, Copy)]
pub struct TerminalObserver {
    ctx: OutputContext,
}

impl TerminalObserver {
    pub fn new(ctx: OutputContext) -> Self {
        Self { ctx }
    }
}

impl SessionObserver for TerminalObserver {
    fn status(&self, level: StatusLevel, message: &str) {
        match level {
            StatusLevel::Info => self.ctx.info(message),
            StatusLevel::Success => self.ctx.success(message),
            StatusLevel::Warning => self.ctx.warn(message),
            StatusLevel::Error => self.ctx.error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_device_row_from_descriptor() {
        let device = DeviceDescriptor {
            id: 7,
            device_type: "Engine".into(),
            year: "2019".into(),
            make: "Cummins".into(),
            model: "X15".into(),
        };
        let row = DeviceRow::from(&device);
        assert_eq!(row.id, 7);
        assert_eq!(row.device_type, "Engine");

        let table = Table::new([row]).to_string();
        assert!(table.contains("Cummins"));
        assert!(table.contains("Type"));
    }

    #[test]
    fn test_stats_rows_cover_every_counter() {
        let stats = StatsSnapshot {
            frames_received: 3,
            timeouts: 2,
            ..Default::default()
        };
        let rows = stats_rows(&stats);
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[0].value, 3);
        assert_eq!(rows[4].counter, "Timeouts");
        assert_eq!(rows[4].value, 2);
    }
}

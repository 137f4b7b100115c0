//! Interactive device selection

use std::io::{self, BufRead, Write};

use sss3_core::DeviceDescriptor;
use sss3_session::DeviceSelector;

use crate::output::OutputContext;

/// What the operator typed
#[derive(Debug, PartialEq, Eq)]
pub enum Selection {
    Devices(Vec<u32>),
    Quit,
}

/// Parse a comma-separated list of device ids
///
/// Every id must be one of `devices`. `q` or `quit` gives up.
pub fn parse_selection(line: &str, devices: &[DeviceDescriptor]) -> Result<Selection, String> {
    let line = line.trim();
    if line.eq_ignore_ascii_case("q") || line.eq_ignore_ascii_case("quit") {
        return Ok(Selection::Quit);
    }

    let mut ids = Vec::new();
    for part in line.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let id: u32 = part
            .parse()
            .map_err(|_| format!("'{}' is not a device ID", part))?;
        if !devices.iter().any(|d| d.id == id) {
            return Err(format!("Device {} is not available", id));
        }
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    if ids.is_empty() {
        return Err("Select at least one device".to_string());
    }
    Ok(Selection::Devices(ids))
}

/// Prompts on stdin until a valid selection is entered
pub struct PromptSelector {
    ctx: OutputContext,
}

impl PromptSelector {
    pub fn new(ctx: OutputContext) -> Self {
        Self { ctx }
    }

    fn read_line(&self) -> Option<String> {
        print!("Enter device IDs separated by commas (q to quit): ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }
}

impl DeviceSelector for PromptSelector {
    fn select(&self, devices: &[DeviceDescriptor]) -> Option<Vec<u32>> {
        self.ctx.print_devices(devices);
        loop {
            let line = self.read_line()?;
            match parse_selection(&line, devices) {
                Ok(Selection::Devices(ids)) => return Some(ids),
                Ok(Selection::Quit) => return None,
                Err(msg) => self.ctx.warn(&msg),
            }
        }
    }
}

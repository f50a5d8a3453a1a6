//! Interactive prompts on the controlling terminal.

use colored::Colorize;
use std::io::{self, BufRead, Write};
use vfioprep_core::devices::{Chooser, Device};
use vfioprep_core::{PrepError, Result};

/// Ask a yes/no question. Anything but `y`/`yes` is a no.
pub fn confirm(question: &str) -> io::Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    let answer = input.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// Asks the operator to pick one of several matching GPUs.
pub struct TerminalChooser;

impl Chooser for TerminalChooser {
    fn choose(&mut self, candidates: &[Device]) -> Result<usize> {
        println!("{}", "Multiple matching GPUs found:".bold());
        for (i, device) in candidates.iter().enumerate() {
            let driver = device.driver.as_deref().unwrap_or("-");
            println!(
                "  {}) {} {} (driver: {})",
                i + 1,
                device.address.to_string().cyan(),
                device.display_name(),
                driver.dimmed()
            );
        }

        let stdin = io::stdin();
        loop {
            print!("Select the GPU to pass through [1-{}, q to abort]: ", candidates.len());
            io::stdout().flush().map_err(PrepError::internal)?;

            let mut input = String::new();
            let read = stdin.lock().read_line(&mut input).map_err(PrepError::internal)?;
            let input = input.trim();
            if read == 0 || input.eq_ignore_ascii_case("q") {
                return Err(PrepError::UserAborted { step: "GPU selection".to_string() });
            }

            match input.parse::<usize>() {
                Ok(n) if (1..=candidates.len()).contains(&n) => return Ok(n - 1),
                _ => println!("{} '{}' is not a valid choice", "✗".red().bold(), input),
            }
        }
    }
}

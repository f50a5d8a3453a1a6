//! Standalone shell rendering of a [`ReversalProcedure`].
//!
//! The script is the offline form of [`ReversalProcedure::execute`]: it runs
//! without vfioprep installed, never stops on a failing step, counts warnings
//! and summarises them at the end. `DRY_RUN=true` prints the commands instead
//! of running them.

use crate::error::{PrepError, Result};
use crate::host::{boot_tool_by_name, shell_quote, BootParameterTool, InitramfsRebuilder, InitramfsTool};
use crate::reversal::{ReversalProcedure, ReversalStep};
use chrono::Utc;
use std::fmt::Write as _;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

/// Rendering inputs beyond the procedure itself.
#[derive(Clone, Copy, Default)]
pub struct ScriptOptions<'a> {
    /// Preferred boot-parameter mechanism; looked up by recorded name otherwise.
    pub boot_tool: Option<&'a dyn BootParameterTool>,
    /// Preferred initramfs tool; a detection chain is emitted otherwise.
    pub initramfs: Option<&'a dyn InitramfsRebuilder>,
}

const PRELUDE: &str = r#"DRY_RUN="${DRY_RUN:-false}"
WARNINGS=0

RED='\033[0;31m'
GREEN='\033[0;32m'
YELLOW='\033[1;33m'
BLUE='\033[0;34m'
NC='\033[0m'

log_info() { echo -e "${BLUE}[INFO]${NC} $*"; }
log_ok() { echo -e "${GREEN}[OK]${NC} $*"; }
log_warn() { echo -e "${YELLOW}[WARNING]${NC} $*"; WARNINGS=$((WARNINGS + 1)); }

run() {
  if [ "$DRY_RUN" = true ]; then
    log_info "[dry run] $*"
    return 0
  fi
  "$@"
}

if [ "$DRY_RUN" != true ] && [ "$(id -u)" -ne 0 ]; then
  echo -e "${RED}This script must be run as root (sudo $0), or with DRY_RUN=true.${NC}" >&2
  exit 1
fi
"#;

const SUMMARY: &str = r#"
echo
if [ "$WARNINGS" -gt 0 ]; then
  echo -e "${YELLOW}Finished with $WARNINGS warning(s). Review the messages above; those items need manual attention.${NC}"
else
  log_ok "All steps completed."
fi
log_info "Reboot to finish reverting the passthrough configuration."
[ "$WARNINGS" -eq 0 ]
"#;

impl ReversalProcedure {
    /// Render the procedure as a bash script.
    pub fn render_script(&self, options: &ScriptOptions<'_>) -> String {
        let mut out = String::new();
        out.push_str("#!/usr/bin/env bash\n");
        out.push_str("# Reverts the GPU passthrough configuration recorded by vfioprep.\n");
        let _ = writeln!(out, "# Generated {}.", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
        if let Some(device) = &self.session.selected_device {
            let _ = writeln!(
                out,
                "# Device: {} {}",
                device,
                self.session.device_description.as_deref().unwrap_or("")
            );
        }
        if !self.session.device_ids.is_empty() {
            let _ = writeln!(out, "# Passthrough ids: {}", self.session.device_ids.join(","));
        }
        out.push_str("#\n# Safe to re-run: every step checks whether it is still needed.\n");
        out.push_str("# Run with DRY_RUN=true to see what would happen.\n\n");
        out.push_str(PRELUDE);

        if self.steps.is_empty() {
            out.push_str("\nlog_info \"Nothing was recorded; nothing to revert.\"\n");
        }

        let total = self.steps.len();
        for (index, step) in self.steps.iter().enumerate() {
            let _ = writeln!(out, "\n# [{}/{}] {}", index + 1, total, step);
            render_step(&mut out, step, options);
        }

        out.push_str(SUMMARY);
        out
    }
}

/// Render `procedure` and write it to `path` as an executable script.
pub fn write_script(procedure: &ReversalProcedure, path: &Path, options: &ScriptOptions<'_>) -> Result<()> {
    let io_err = |e| PrepError::IoError { path: path.to_path_buf(), source: e };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| PrepError::IoError { path: parent.to_path_buf(), source: e })?;
    }
    fs::write(path, procedure.render_script(options)).map_err(io_err)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_err)?;

    info!(path = %path.display(), steps = procedure.steps().len(), "Wrote reversal script");
    Ok(())
}

fn render_step(out: &mut String, step: &ReversalStep, options: &ScriptOptions<'_>) {
    match step {
        ReversalStep::RestoreFile { target, backup } => {
            let t = shell_quote(&target.to_string_lossy());
            let b = shell_quote(&backup.to_string_lossy());
            let _ = writeln!(out, "if [ -f {b} ]; then");
            let _ = writeln!(out, "  run mkdir -p \"$(dirname {t})\"");
            let _ = writeln!(out, "  if run cp -p {b} {t}; then");
            let _ = writeln!(out, "    log_ok {}", shell_quote(&format!("Restored {}", target.display())));
            let _ = writeln!(out, "  else");
            let _ = writeln!(out, "    log_warn {}", shell_quote(&format!("Failed to restore {}", target.display())));
            let _ = writeln!(out, "  fi");
            let _ = writeln!(out, "else");
            let _ = writeln!(
                out,
                "  log_warn {}",
                shell_quote(&format!(
                    "Backup {} not found; restore {} by hand",
                    backup.display(),
                    target.display()
                ))
            );
            let _ = writeln!(out, "fi");
        }
        ReversalStep::RemoveFile { target } => {
            let t = shell_quote(&target.to_string_lossy());
            let _ = writeln!(out, "if [ -e {t} ]; then");
            let _ = writeln!(out, "  if run rm -f {t}; then");
            let _ = writeln!(out, "    log_ok {}", shell_quote(&format!("Removed {}", target.display())));
            let _ = writeln!(out, "  else");
            let _ = writeln!(out, "    log_warn {}", shell_quote(&format!("Failed to remove {}", target.display())));
            let _ = writeln!(out, "  fi");
            let _ = writeln!(out, "else");
            let _ = writeln!(out, "  log_info {}", shell_quote(&format!("{} already absent", target.display())));
            let _ = writeln!(out, "fi");
        }
        ReversalStep::RemoveBootParameters { tool, params } => {
            render_boot_parameters(out, tool, params, false, options);
        }
        ReversalStep::AddBootParameters { tool, params } => {
            render_boot_parameters(out, tool, params, true, options);
        }
        ReversalStep::ManualAttention { target, reason } => {
            let _ = writeln!(out, "log_warn {}", shell_quote(&format!("{}: {}", target, reason)));
        }
        ReversalStep::RefreshBootloader { bootloader } => {
            let tool = resolve_tool(bootloader, options);
            match tool.as_ref().and_then(|t| t.refresh_command()) {
                Some(command) => render_guarded(out, &command, &format!("Regenerated {} configuration", bootloader)),
                None if bootloader == "grub" => render_grub_chain(out),
                None => {
                    let _ = writeln!(
                        out,
                        "log_warn {}",
                        shell_quote(&format!("Regenerate the {} configuration by hand", bootloader))
                    );
                }
            }
        }
        ReversalStep::RebuildInitramfs => match options.initramfs {
            Some(rebuilder) => render_guarded(out, &rebuilder.script_command(), "Initramfs rebuilt"),
            None => render_initramfs_chain(out),
        },
        ReversalStep::Notice { message, .. } => {
            let _ = writeln!(out, "log_info {}", shell_quote(message));
        }
    }
}

/// The mechanism named `name`: the one passed in if it matches, else a fresh lookup.
fn resolve_tool<'a>(name: &str, options: &ScriptOptions<'a>) -> Option<ToolRef<'a>> {
    match options.boot_tool {
        Some(tool) if tool.name() == name => Some(ToolRef::Borrowed(tool)),
        _ => boot_tool_by_name(name).map(ToolRef::Owned),
    }
}

enum ToolRef<'a> {
    Borrowed(&'a dyn BootParameterTool),
    Owned(Box<dyn BootParameterTool>),
}

impl<'a> std::ops::Deref for ToolRef<'a> {
    type Target = dyn BootParameterTool + 'a;

    fn deref(&self) -> &Self::Target {
        match self {
            ToolRef::Borrowed(tool) => *tool,
            ToolRef::Owned(tool) => tool.as_ref(),
        }
    }
}

fn render_boot_parameters(out: &mut String, tool_name: &str, params: &[String], add: bool, options: &ScriptOptions<'_>) {
    let tool = resolve_tool(tool_name, options);
    let verb = if add { "add" } else { "remove" };

    for param in params {
        let command = tool
            .as_ref()
            .and_then(|t| if add { t.add_command(param) } else { t.remove_command(param) });
        match command {
            Some(command) => {
                let done = if add {
                    format!("Re-added kernel parameter {}", param)
                } else {
                    format!("Removed kernel parameter {}", param)
                };
                render_guarded(out, &command, &done);
            }
            None => {
                let _ = writeln!(
                    out,
                    "log_warn {}",
                    shell_quote(&format!(
                        "{} is not supported by this script; {} kernel parameter {} by hand",
                        tool_name, verb, param
                    ))
                );
            }
        }
    }
}

/// `command` run only when its program exists, with a warning otherwise.
fn render_guarded(out: &mut String, command: &str, done: &str) {
    let program = command.split_whitespace().next().unwrap_or(command);
    let _ = writeln!(out, "if command -v {} >/dev/null 2>&1; then", program);
    let _ = writeln!(out, "  if run {}; then", command);
    let _ = writeln!(out, "    log_ok {}", shell_quote(done));
    let _ = writeln!(out, "  else");
    let _ = writeln!(out, "    log_warn {}", shell_quote(&format!("'{}' failed", command)));
    let _ = writeln!(out, "  fi");
    let _ = writeln!(out, "else");
    let _ = writeln!(out, "  log_warn {}", shell_quote(&format!("{} not found; run '{}' by hand", program, command)));
    let _ = writeln!(out, "fi");
}

fn render_chain(out: &mut String, commands: &[String], done: &str, missing: &str) {
    for (index, command) in commands.iter().enumerate() {
        let program = command.split_whitespace().next().unwrap_or(command);
        let keyword = if index == 0 { "if" } else { "elif" };
        let _ = writeln!(out, "{} command -v {} >/dev/null 2>&1; then", keyword, program);
        let _ = writeln!(
            out,
            "  run {} && log_ok {} || log_warn {}",
            command,
            shell_quote(done),
            shell_quote(&format!("'{}' failed", command))
        );
    }
    let _ = writeln!(out, "else");
    let _ = writeln!(out, "  log_warn {}", shell_quote(missing));
    let _ = writeln!(out, "fi");
}

fn render_grub_chain(out: &mut String) {
    let commands = [
        "update-grub".to_string(),
        "grub2-mkconfig -o /boot/grub2/grub.cfg".to_string(),
        "grub-mkconfig -o /boot/grub/grub.cfg".to_string(),
    ];
    render_chain(out, &commands, "Regenerated grub configuration", "No GRUB config generator found; regenerate grub.cfg by hand");
}

fn render_initramfs_chain(out: &mut String) {
    let commands: Vec<String> = InitramfsTool::ALL.iter().map(|t| t.script_command()).collect();
    render_chain(out, &commands, "Initramfs rebuilt", "No initramfs tool found; rebuild the initramfs by hand before rebooting");
}

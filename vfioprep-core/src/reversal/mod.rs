//! Reversal of a recorded setup session.
//!
//! [`synthesize`] turns a [`Journal`] into an ordered [`ReversalProcedure`].
//! The order is fixed and independent of recording order:
//!
//! 1. restore modified files from their earliest backup
//! 2. delete files the session created
//! 3. undo boot parameters set through a command tool
//! 4. module-list files, same as 1 and 2, skipping targets already handled
//! 5. regenerate bootloader config for restored bootloader files
//! 6. rebuild the initramfs once
//! 7. informational notes for packages and snapshots
//!
//! File state is settled before anything that bakes it into boot-time images,
//! so the next boot never references a configuration that is no longer on disk.
//!
//! Every step tolerates "already done", so a procedure can be run again after
//! a partial run. Step failures never abort the procedure; they are collected
//! as warnings in the [`ReversalReport`].

mod script;

pub use script::{write_script, ScriptOptions};

use crate::host::{BootParameterTool, InitramfsRebuilder};
use crate::journal::{detail, Action, Category, ChangeRecord, Journal, SessionInfo};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One step of a [`ReversalProcedure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversalStep {
    /// Copy `backup` over `target`.
    RestoreFile { target: PathBuf, backup: PathBuf },
    /// Delete `target`; already absent counts as done.
    RemoveFile { target: PathBuf },
    /// Remove parameters the session added through `tool`.
    RemoveBootParameters { tool: String, params: Vec<String> },
    /// Re-add parameters the session removed through `tool`.
    AddBootParameters { tool: String, params: Vec<String> },
    /// Something the procedure cannot undo on its own.
    ManualAttention { target: String, reason: String },
    /// Regenerate the bootloader's derived configuration.
    RefreshBootloader { bootloader: String },
    RebuildInitramfs,
    /// Informational only; nothing is executed.
    Notice { category: Category, target: String, message: String },
}

impl ReversalStep {
    /// Whether the step changes the host.
    pub fn is_reversing(&self) -> bool {
        matches!(
            self,
            Self::RestoreFile { .. }
                | Self::RemoveFile { .. }
                | Self::RemoveBootParameters { .. }
                | Self::AddBootParameters { .. }
        )
    }
}

impl fmt::Display for ReversalStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestoreFile { target, backup } => {
                write!(f, "Restore {} from {}", target.display(), backup.display())
            }
            Self::RemoveFile { target } => write!(f, "Remove {}", target.display()),
            Self::RemoveBootParameters { tool, params } => {
                write!(f, "Remove kernel parameters via {}: {}", tool, params.join(" "))
            }
            Self::AddBootParameters { tool, params } => {
                write!(f, "Re-add kernel parameters via {}: {}", tool, params.join(" "))
            }
            Self::ManualAttention { target, reason } => {
                write!(f, "Manual attention needed for {}: {}", target, reason)
            }
            Self::RefreshBootloader { bootloader } => {
                write!(f, "Regenerate {} configuration", bootloader)
            }
            Self::RebuildInitramfs => f.write_str("Rebuild initramfs"),
            Self::Notice { message, .. } => f.write_str(message),
        }
    }
}

/// Ordered, idempotent set of steps undoing a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversalProcedure {
    steps: Vec<ReversalStep>,
    session: SessionInfo,
}

/// Collaborators available when executing in-process.
#[derive(Clone, Copy, Default)]
pub struct ReversalContext<'a> {
    pub boot_tool: Option<&'a dyn BootParameterTool>,
    pub initramfs: Option<&'a dyn InitramfsRebuilder>,
    /// Log the steps without touching the host.
    pub dry_run: bool,
}

/// A step that could not be completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReversalWarning {
    pub target: String,
    pub reason: String,
}

impl fmt::Display for ReversalWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, self.reason)
    }
}

/// Outcome of [`ReversalProcedure::execute`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversalReport {
    /// Steps done (or found already done).
    pub completed: Vec<String>,
    pub warnings: Vec<ReversalWarning>,
    pub notices: Vec<String>,
}

impl ReversalReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn done(&mut self, what: impl Into<String>) {
        let what = what.into();
        info!("{}", what);
        self.completed.push(what);
    }

    fn warn(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        let warning = ReversalWarning { target: target.into(), reason: reason.into() };
        warn!(target = %warning.target, "{}", warning.reason);
        self.warnings.push(warning);
    }
}

/// Build the reversal procedure for `journal`. Never fails.
pub fn synthesize(journal: &Journal) -> ReversalProcedure {
    let mut steps = Vec::new();
    let mut bootloaders: Vec<String> = Vec::new();

    let file_edits = journal.records(Category::FileEdit);
    push_file_steps(file_edits, &mut steps, &mut bootloaders);

    // Boot parameters, grouped per tool, removals before re-additions.
    let mut added: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut removed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in journal.records(Category::BootParameterTool) {
        let tool = record.detail(detail::TOOL).unwrap_or("unknown").to_string();
        match record.action {
            Action::Added | Action::Created => added.entry(tool).or_default().push(record.target.clone()),
            Action::Removed => removed.entry(tool).or_default().push(record.target.clone()),
            Action::Modified => steps.push(ReversalStep::ManualAttention {
                target: record.target.clone(),
                reason: format!(
                    "kernel parameter changed via {}; previous value: {}",
                    tool,
                    record.detail(detail::PREVIOUS_VALUE).unwrap_or("unknown")
                ),
            }),
        }
    }
    steps.extend(added.into_iter().map(|(tool, params)| ReversalStep::RemoveBootParameters { tool, params }));
    steps.extend(removed.into_iter().map(|(tool, params)| ReversalStep::AddBootParameters { tool, params }));

    let handled: HashSet<&str> = file_edits.iter().map(|r| r.target.as_str()).collect();
    let module_lists: Vec<ChangeRecord> = journal
        .records(Category::ModuleList)
        .iter()
        .filter(|r| !handled.contains(r.target.as_str()))
        .cloned()
        .collect();
    push_file_steps(&module_lists, &mut steps, &mut bootloaders);

    steps.extend(bootloaders.into_iter().map(|bootloader| ReversalStep::RefreshBootloader { bootloader }));

    if steps.iter().any(ReversalStep::is_reversing) {
        steps.push(ReversalStep::RebuildInitramfs);
    }

    for category in [Category::Package, Category::Snapshot] {
        for record in journal.records(category) {
            steps.push(ReversalStep::Notice {
                category,
                target: record.target.clone(),
                message: notice_for(category, record),
            });
        }
    }

    ReversalProcedure { steps, session: journal.session.clone() }
}

/// Restores first, then removals, for one file-like category.
fn push_file_steps(records: &[ChangeRecord], steps: &mut Vec<ReversalStep>, bootloaders: &mut Vec<String>) {
    let mut removals = Vec::new();

    for record in records {
        let target = PathBuf::from(&record.target);
        let removes = record.originally_absent()
            || matches!(record.action, Action::Created | Action::Added);

        if removes {
            removals.push(ReversalStep::RemoveFile { target });
        } else {
            match record.earliest_backup() {
                Some(backup) => steps.push(ReversalStep::RestoreFile { target, backup }),
                None => {
                    steps.push(ReversalStep::ManualAttention {
                        target: record.target.clone(),
                        reason: "no backup was recorded; restore the original contents by hand"
                            .to_string(),
                    });
                    continue;
                }
            }
        }

        if let Some(bootloader) = record.detail(detail::BOOTLOADER) {
            if !bootloaders.iter().any(|b| b == bootloader) {
                bootloaders.push(bootloader.to_string());
            }
        }
    }

    steps.extend(removals);
}

fn notice_for(category: Category, record: &ChangeRecord) -> String {
    match (category, record.action) {
        (Category::Package, Action::Removed) => {
            format!("Package {} was removed during setup; reinstall it if needed", record.target)
        }
        (Category::Package, _) => format!(
            "Package {} was installed during setup; remove it with your package manager if unwanted",
            record.target
        ),
        (_, Action::Removed) => format!("Snapshot {} was deleted during setup", record.target),
        _ => format!(
            "Snapshot {} was taken before setup; roll back to it if the system misbehaves",
            record.target
        ),
    }
}

impl ReversalProcedure {
    pub fn steps(&self) -> &[ReversalStep] {
        &self.steps
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    /// True when there is nothing to do, not even a notice.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, continuing past failures.
    pub fn execute(&self, ctx: &ReversalContext<'_>) -> ReversalReport {
        let mut report = ReversalReport::default();

        for (index, step) in self.steps.iter().enumerate() {
            info!(step = index + 1, total = self.steps.len(), "{}", step);
            if ctx.dry_run {
                if let ReversalStep::Notice { message, .. } = step {
                    report.notices.push(message.clone());
                } else {
                    report.done(format!("[dry run] {}", step));
                }
                continue;
            }

            match step {
                ReversalStep::RestoreFile { target, backup } => restore_file(target, backup, &mut report),
                ReversalStep::RemoveFile { target } => remove_file(target, &mut report),
                ReversalStep::RemoveBootParameters { tool, params } => {
                    change_boot_parameters(ctx, tool, params, false, &mut report)
                }
                ReversalStep::AddBootParameters { tool, params } => {
                    change_boot_parameters(ctx, tool, params, true, &mut report)
                }
                ReversalStep::ManualAttention { target, reason } => report.warn(target.as_str(), reason.as_str()),
                ReversalStep::RefreshBootloader { bootloader } => match ctx.boot_tool {
                    Some(tool) if tool.name() == bootloader => match tool.refresh() {
                        Ok(()) => report.done(format!("Regenerated {} configuration", bootloader)),
                        Err(e) => report.warn(bootloader.as_str(), e.to_string()),
                    },
                    _ => report.warn(
                        bootloader.as_str(),
                        format!("{} is not available; regenerate its configuration by hand", bootloader),
                    ),
                },
                ReversalStep::RebuildInitramfs => match ctx.initramfs {
                    Some(rebuilder) => match rebuilder.rebuild() {
                        Ok(()) => report.done(format!("Rebuilt initramfs with {}", rebuilder.name())),
                        Err(e) => report.warn("initramfs", e.to_string()),
                    },
                    None => report.warn(
                        "initramfs",
                        "no initramfs tool found; rebuild the initramfs by hand before rebooting",
                    ),
                },
                ReversalStep::Notice { message, .. } => report.notices.push(message.clone()),
            }
        }

        info!(
            completed = report.completed.len(),
            warnings = report.warnings.len(),
            "Reversal procedure finished"
        );
        report
    }
}

fn restore_file(target: &Path, backup: &Path, report: &mut ReversalReport) {
    let target_name = target.display().to_string();
    if !backup.exists() {
        report.warn(
            target_name,
            format!("backup {} not found; restore the original contents by hand", backup.display()),
        );
        return;
    }

    if let Some(parent) = target.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            report.warn(target_name, format!("cannot create {}: {}", parent.display(), e));
            return;
        }
    }

    match fs::copy(backup, target) {
        Ok(_) => report.done(format!("Restored {}", target.display())),
        Err(e) => report.warn(target_name, format!("restore from {} failed: {}", backup.display(), e)),
    }
}

fn remove_file(target: &Path, report: &mut ReversalReport) {
    match fs::remove_file(target) {
        Ok(()) => report.done(format!("Removed {}", target.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            report.done(format!("{} already absent", target.display()))
        }
        Err(e) => report.warn(target.display().to_string(), format!("remove failed: {}", e)),
    }
}

fn change_boot_parameters(
    ctx: &ReversalContext<'_>,
    tool_name: &str,
    params: &[String],
    add: bool,
    report: &mut ReversalReport,
) {
    let target = params.join(" ");
    let Some(tool) = ctx.boot_tool.filter(|t| t.name() == tool_name) else {
        report.warn(
            target,
            format!(
                "{} is not available; {} these kernel parameters by hand",
                tool_name,
                if add { "add" } else { "remove" }
            ),
        );
        return;
    };

    // Adding and removing are idempotent, so an unreadable command line
    // still gets every recorded parameter applied.
    let pending: Vec<String> = match tool.current() {
        Ok(current) => params.iter().filter(|p| current.contains(p) != add).cloned().collect(),
        Err(e) => {
            report.warn(
                target.as_str(),
                format!("could not read current kernel parameters ({}); applying the recorded ones anyway", e),
            );
            params.to_vec()
        }
    };
    if pending.is_empty() {
        report.done(format!("Kernel parameters already {}: {}", if add { "present" } else { "absent" }, target));
        return;
    }

    let result = if add { tool.add(&pending) } else { tool.remove(&pending) };
    match result {
        Ok(()) => report.done(format!(
            "{} kernel parameters via {}: {}",
            if add { "Re-added" } else { "Removed" },
            tool_name,
            pending.join(" ")
        )),
        Err(e) => report.warn(pending.join(" "), e.to_string()),
    }
}

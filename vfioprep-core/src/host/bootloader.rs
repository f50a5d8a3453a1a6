//! Kernel command line mechanisms.

use crate::backup::BackupStore;
use crate::error::{PrepError, Result};
use crate::host::{find_tool, parameter_key, run_tool, run_tool_combined, shell_quote, BootParameterTool};
use crate::journal::{detail, Action, Category, Details, Journal};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// GRUB defaults file.
pub const GRUB_DEFAULT_PATH: &str = "/etc/default/grub";

/// `GRUB_CMDLINE_LINUX_DEFAULT="..."` with either quote style.
static GRUB_CMDLINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^(\s*GRUB_CMDLINE_LINUX_DEFAULT\s*=\s*)(?:"([^"]*)"|'([^']*)')"#)
        .expect("Invalid GRUB cmdline regex")
});

/// Pick the boot-parameter mechanism of this host.
///
/// `None` means the parameters have to be configured by hand.
pub fn detect_boot_tool() -> Option<Box<dyn BootParameterTool>> {
    if Path::new(GRUB_DEFAULT_PATH).exists() {
        info!("Detected GRUB ({})", GRUB_DEFAULT_PATH);
        return Some(Box::new(GrubDefault::new(GRUB_DEFAULT_PATH)));
    }
    if let Some(kernelstub) = Kernelstub::detect() {
        info!("Detected kernelstub");
        return Some(Box::new(kernelstub));
    }
    warn!("No supported boot parameter mechanism found");
    None
}

/// Mechanism recorded in a journal under `name`, for rendering its commands.
pub fn boot_tool_by_name(name: &str) -> Option<Box<dyn BootParameterTool>> {
    match name {
        "kernelstub" => Some(Box::new(Kernelstub::new("kernelstub"))),
        "grub" => Some(Box::new(GrubDefault::new(GRUB_DEFAULT_PATH))),
        _ => None,
    }
}

// --- kernelstub ---

/// Pop!_OS `kernelstub` (systemd-boot).
#[derive(Debug, Clone)]
pub struct Kernelstub {
    binary: PathBuf,
}

impl Kernelstub {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Locate `kernelstub` on `PATH`.
    pub fn detect() -> Option<Self> {
        which::which("kernelstub").ok().map(Self::new)
    }

    /// Extract the boot options from `kernelstub -p` output.
    ///
    /// Options follow a `Kernel Boot Options:` label, either on the same line
    /// or on a following `options ...` line. `None` when there is no label.
    pub fn parse_print_output(output: &str) -> Option<Vec<String>> {
        let mut lines = output.lines();
        while let Some(line) = lines.next() {
            let Some((_, rest)) = line.split_once("Kernel Boot Options:") else {
                continue;
            };
            let inline = rest.trim_start_matches('.').trim();
            if !inline.is_empty() {
                return Some(inline.split_whitespace().map(str::to_string).collect());
            }
            for next in lines.by_ref() {
                if let Some(options) = next.trim().strip_prefix("options ") {
                    return Some(options.split_whitespace().map(str::to_string).collect());
                }
            }
            return Some(Vec::new());
        }
        None
    }
}

impl BootParameterTool for Kernelstub {
    fn name(&self) -> &str {
        "kernelstub"
    }

    // kernelstub logs its configuration to stderr.
    fn current(&self) -> Result<Vec<String>> {
        let output = run_tool_combined(&self.binary, &["-p"])?;
        Self::parse_print_output(&output).ok_or_else(|| PrepError::ToolFailed {
            tool: "kernelstub".to_string(),
            reason: "no Kernel Boot Options in `kernelstub -p` output".to_string(),
        })
    }

    fn add(&self, params: &[String]) -> Result<()> {
        for param in params {
            run_tool(&self.binary, &["--add-options", param])?;
            info!(param = %param, "Added kernel parameter");
        }
        Ok(())
    }

    fn remove(&self, params: &[String]) -> Result<()> {
        for param in params {
            run_tool(&self.binary, &["--delete-options", param])?;
            info!(param = %param, "Removed kernel parameter");
        }
        Ok(())
    }

    fn add_command(&self, param: &str) -> Option<String> {
        Some(format!("kernelstub --add-options {}", shell_quote(param)))
    }

    fn remove_command(&self, param: &str) -> Option<String> {
        Some(format!("kernelstub --delete-options {}", shell_quote(param)))
    }
}

// --- GRUB ---

/// Edits `GRUB_CMDLINE_LINUX_DEFAULT` in `/etc/default/grub`.
#[derive(Debug, Clone)]
pub struct GrubDefault {
    path: PathBuf,
    refresh: Option<Vec<String>>,
}

impl GrubDefault {
    /// Use the GRUB defaults file at `path`, detecting the config generator.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), refresh: detect_grub_refresh() }
    }

    /// Override the config generator command (`None` disables refresh).
    pub fn with_refresh_command(mut self, command: Option<Vec<String>>) -> Self {
        self.refresh = command;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .map_err(|e| PrepError::IoError { path: self.path.clone(), source: e })
    }

    fn rewrite(&self, edit: impl FnOnce(Vec<String>) -> Vec<String>) -> Result<()> {
        let content = self.read()?;
        let updated = edit_cmdline(&content, edit).ok_or_else(|| self.missing_line())?;
        if updated == content {
            debug!(path = %self.path.display(), "GRUB cmdline already up to date");
            return Ok(());
        }
        fs::write(&self.path, updated)
            .map_err(|e| PrepError::IoError { path: self.path.clone(), source: e })?;
        info!(path = %self.path.display(), "Updated GRUB_CMDLINE_LINUX_DEFAULT");
        Ok(())
    }

    fn missing_line(&self) -> PrepError {
        PrepError::ToolFailed {
            tool: "grub".to_string(),
            reason: format!("no GRUB_CMDLINE_LINUX_DEFAULT line in {}", self.path.display()),
        }
    }
}

impl BootParameterTool for GrubDefault {
    fn name(&self) -> &str {
        "grub"
    }

    fn edited_files(&self) -> Vec<PathBuf> {
        vec![self.path.clone()]
    }

    fn current(&self) -> Result<Vec<String>> {
        read_cmdline(&self.read()?).ok_or_else(|| self.missing_line())
    }

    fn add(&self, params: &[String]) -> Result<()> {
        self.rewrite(|current| merge_parameters(&current, params))
    }

    fn remove(&self, params: &[String]) -> Result<()> {
        self.rewrite(|current| without_parameters(&current, params))
    }

    fn refresh(&self) -> Result<()> {
        let command = self.refresh.as_ref().ok_or_else(|| PrepError::ToolNotFound {
            tool: "update-grub".to_string(),
            hint: "Regenerate grub.cfg by hand (grub-mkconfig -o /boot/grub/grub.cfg).".to_string(),
        })?;
        let (program, args) = command.split_first().ok_or_else(|| {
            PrepError::InvalidConfig { reason: "empty GRUB refresh command".to_string() }
        })?;
        let binary = find_tool(program, "Install GRUB tools or regenerate grub.cfg by hand.")?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_tool(&binary, &args)?;
        info!(command = %command.join(" "), "Regenerated GRUB configuration");
        Ok(())
    }

    fn refresh_command(&self) -> Option<String> {
        self.refresh.as_ref().map(|c| c.join(" "))
    }
}

fn detect_grub_refresh() -> Option<Vec<String>> {
    let candidates: [&[&str]; 3] = [
        &["update-grub"],
        &["grub2-mkconfig", "-o", "/boot/grub2/grub.cfg"],
        &["grub-mkconfig", "-o", "/boot/grub/grub.cfg"],
    ];
    candidates
        .iter()
        .find(|c| which::which(c[0]).is_ok())
        .map(|c| c.iter().map(|s| s.to_string()).collect())
}

/// Parameters of the `GRUB_CMDLINE_LINUX_DEFAULT` line, if present.
pub fn read_cmdline(content: &str) -> Option<Vec<String>> {
    let caps = GRUB_CMDLINE_REGEX.captures(content)?;
    let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
    Some(value.split_whitespace().map(str::to_string).collect())
}

/// Rewrite the `GRUB_CMDLINE_LINUX_DEFAULT` value, keeping everything else intact.
fn edit_cmdline(content: &str, edit: impl FnOnce(Vec<String>) -> Vec<String>) -> Option<String> {
    let caps = GRUB_CMDLINE_REGEX.captures(content)?;
    let whole = caps.get(0)?;
    let prefix = &caps[1];
    let quote = if caps.get(2).is_some() { '"' } else { '\'' };
    let current = read_cmdline(content)?;

    let line = format!("{}{}{}{}", prefix, quote, edit(current).join(" "), quote);
    Some(format!("{}{}{}", &content[..whole.start()], line, &content[whole.end()..]))
}

/// `current` plus `add`, dropping existing parameters that share a key with a new one.
pub fn merge_parameters(current: &[String], add: &[String]) -> Vec<String> {
    let keys: HashSet<&str> = add.iter().map(|p| parameter_key(p)).collect();
    let mut merged: Vec<String> =
        current.iter().filter(|p| !keys.contains(parameter_key(p))).cloned().collect();
    for param in add {
        if !merged.contains(param) {
            merged.push(param.clone());
        }
    }
    merged
}

/// `current` without any of `remove`.
pub fn without_parameters(current: &[String], remove: &[String]) -> Vec<String> {
    current.iter().filter(|p| !remove.contains(p)).cloned().collect()
}

/// What [`apply_boot_parameters`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootParameterOutcome {
    pub added: Vec<String>,
    /// Existing parameters replaced because they shared a key with a new one.
    pub replaced: Vec<String>,
    pub already_present: Vec<String>,
}

impl BootParameterOutcome {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.replaced.is_empty()
    }
}

/// Add `params` through `tool`, backing up and journaling first.
///
/// File-based tools get each edited file backed up and recorded as a
/// file-edit. Command tools get one boot-parameter-tool record per parameter.
/// Records are written before the tool runs, so a failing tool still leaves a
/// reversible trail. In dry-run mode nothing is executed.
pub fn apply_boot_parameters(
    tool: &dyn BootParameterTool,
    params: &[String],
    backups: &BackupStore,
    journal: &mut Journal,
) -> Result<BootParameterOutcome> {
    let current = tool.current()?;

    let mut outcome = BootParameterOutcome::default();
    for param in params {
        if current.contains(param) {
            outcome.already_present.push(param.clone());
        } else {
            outcome.added.push(param.clone());
        }
    }
    let new_keys: HashSet<&str> = outcome.added.iter().map(|p| parameter_key(p)).collect();
    outcome.replaced = current
        .iter()
        .filter(|p| new_keys.contains(parameter_key(p)) && !params.contains(p))
        .cloned()
        .collect();

    if !outcome.changed() {
        info!(tool = tool.name(), "Kernel parameters already configured");
        return Ok(outcome);
    }

    journal.session.boot_tool = Some(tool.name().to_string());
    let files = tool.edited_files();

    if files.is_empty() {
        for param in &outcome.replaced {
            journal.record(Category::BootParameterTool, param.as_str(), Action::Removed, tool_details(tool));
        }
        for param in &outcome.added {
            journal.record(Category::BootParameterTool, param.as_str(), Action::Added, tool_details(tool));
        }
    } else {
        for file in &files {
            let mut details = tool_details(tool);
            if let Some(backup) = backups.backup(file)? {
                details.insert(detail::BACKUP_PATH.to_string(), backup.display().to_string());
            }
            details.insert(detail::BOOTLOADER.to_string(), tool.name().to_string());
            details.insert(detail::PREVIOUS_VALUE.to_string(), current.join(" "));
            journal.record(Category::FileEdit, file.display().to_string(), Action::Modified, details);
        }
    }

    if backups.is_dry_run() {
        info!(tool = tool.name(), added = ?outcome.added, replaced = ?outcome.replaced, "[dry run] Would update kernel parameters");
        return Ok(outcome);
    }

    if files.is_empty() && !outcome.replaced.is_empty() {
        tool.remove(&outcome.replaced)?;
    }
    tool.add(&outcome.added)?;
    if !files.is_empty() {
        tool.refresh()?;
    }

    info!(tool = tool.name(), added = ?outcome.added, "Kernel parameters configured");
    Ok(outcome)
}

fn tool_details(tool: &dyn BootParameterTool) -> Details {
    Details::from([(detail::TOOL.to_string(), tool.name().to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    const GRUB: &str = "GRUB_DEFAULT=0\nGRUB_TIMEOUT=5\nGRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash iommu=soft\"\nGRUB_CMDLINE_LINUX=\"\"\n";

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[derive(Default)]
    struct FakeStub {
        params: RefCell<Vec<String>>,
        calls: RefCell<Vec<String>>,
    }

    impl BootParameterTool for FakeStub {
        fn name(&self) -> &str {
            "fakestub"
        }
        fn current(&self) -> Result<Vec<String>> {
            Ok(self.params.borrow().clone())
        }
        fn add(&self, params: &[String]) -> Result<()> {
            self.calls.borrow_mut().push(format!("add {}", params.join(",")));
            self.params.borrow_mut().extend(params.iter().cloned());
            Ok(())
        }
        fn remove(&self, params: &[String]) -> Result<()> {
            self.calls.borrow_mut().push(format!("remove {}", params.join(",")));
            self.params.borrow_mut().retain(|p| !params.contains(p));
            Ok(())
        }
    }

    #[test]
    fn test_read_cmdline_both_quote_styles() {
        assert_eq!(read_cmdline(GRUB), Some(strings(&["quiet", "splash", "iommu=soft"])));
        assert_eq!(
            read_cmdline("GRUB_CMDLINE_LINUX_DEFAULT='quiet'\n"),
            Some(strings(&["quiet"]))
        );
        assert_eq!(read_cmdline("GRUB_TIMEOUT=5\n"), None);
    }

    #[test]
    fn test_merge_replaces_same_key() {
        let merged = merge_parameters(
            &strings(&["quiet", "iommu=soft", "amd_iommu=on"]),
            &strings(&["amd_iommu=on", "iommu=pt"]),
        );
        assert_eq!(merged, strings(&["quiet", "amd_iommu=on", "iommu=pt"]));
    }

    #[test]
    fn test_grub_edit_keeps_other_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grub");
        fs::write(&path, GRUB).unwrap();

        let grub = GrubDefault::new(&path).with_refresh_command(None);
        grub.add(&strings(&["amd_iommu=on", "iommu=pt"])).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("GRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash amd_iommu=on iommu=pt\"\n"));
        assert!(content.starts_with("GRUB_DEFAULT=0\nGRUB_TIMEOUT=5\n"));
        assert!(content.ends_with("GRUB_CMDLINE_LINUX=\"\"\n"));

        grub.remove(&strings(&["iommu=pt"])).unwrap();
        assert_eq!(grub.current().unwrap(), strings(&["quiet", "splash", "amd_iommu=on"]));
    }

    #[test]
    fn test_grub_without_cmdline_line_fails() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grub");
        fs::write(&path, "GRUB_TIMEOUT=5\n").unwrap();

        let grub = GrubDefault::new(&path).with_refresh_command(None);
        assert!(matches!(grub.add(&strings(&["iommu=pt"])), Err(PrepError::ToolFailed { .. })));
    }

    #[test]
    fn test_kernelstub_print_output() {
        let inline = "kernelstub.Config    : INFO     Configuration details: \n   Kernel Boot Options:.... quiet loglevel=0 splash\n";
        assert_eq!(
            Kernelstub::parse_print_output(inline),
            Some(strings(&["quiet", "loglevel=0", "splash"]))
        );

        let block = "Kernel Boot Options:\n        options quiet splash\n";
        assert_eq!(Kernelstub::parse_print_output(block), Some(strings(&["quiet", "splash"])));

        assert_eq!(Kernelstub::parse_print_output("nothing here"), None);
    }

    /// Shell script standing in for `kernelstub`; logs its arguments to `calls`.
    fn fake_kernelstub(dir: &Path, print_output: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let binary = dir.join("kernelstub");
        let calls = dir.join("calls");
        let script = format!(
            "#!/bin/sh\necho \"$*\" >> '{}'\nif [ \"$1\" = \"-p\" ]; then\n  printf '%s\\n' '{}' >&2\nfi\n",
            calls.display(),
            print_output
        );
        fs::write(&binary, script).unwrap();
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
        binary
    }

    #[test]
    fn test_kernelstub_reads_options_from_stderr() {
        let tmp = TempDir::new().unwrap();
        let binary =
            fake_kernelstub(tmp.path(), "Kernel Boot Options:.quiet splash amd_iommu=on iommu=pt");

        let stub = Kernelstub::new(binary);
        assert_eq!(stub.current().unwrap(), strings(&["quiet", "splash", "amd_iommu=on", "iommu=pt"]));
    }

    #[test]
    fn test_kernelstub_unparsable_output_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let binary = fake_kernelstub(tmp.path(), "kernelstub.Config : INFO Looking for configuration");

        let stub = Kernelstub::new(binary);
        assert!(matches!(stub.current(), Err(PrepError::ToolFailed { .. })));

        let mut journal = Journal::new();
        let result = apply_boot_parameters(
            &stub,
            &strings(&["iommu=pt"]),
            &BackupStore::new(tmp.path().join("backups")),
            &mut journal,
        );
        assert!(result.is_err());
        assert!(journal.is_empty());
        assert_eq!(fs::read_to_string(tmp.path().join("calls")).unwrap(), "-p\n-p\n");
    }

    #[test]
    fn test_apply_with_file_tool_backs_up_and_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("grub");
        fs::write(&path, GRUB).unwrap();

        let grub = GrubDefault::new(&path).with_refresh_command(Some(strings(&["true"])));
        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();

        let outcome = apply_boot_parameters(
            &grub,
            &strings(&["amd_iommu=on", "iommu=pt"]),
            &backups,
            &mut journal,
        )
        .unwrap();

        assert_eq!(outcome.added, strings(&["amd_iommu=on", "iommu=pt"]));
        assert_eq!(outcome.replaced, strings(&["iommu=soft"]));

        let record = journal.find(Category::FileEdit, &path.display().to_string()).unwrap();
        assert_eq!(record.action, Action::Modified);
        assert_eq!(record.detail(detail::BOOTLOADER), Some("grub"));
        let backup = record.earliest_backup().unwrap();
        assert_eq!(fs::read_to_string(backup).unwrap(), GRUB);
        assert_eq!(journal.session.boot_tool.as_deref(), Some("grub"));
    }

    #[test]
    fn test_apply_with_command_tool_records_each_parameter() {
        let tmp = TempDir::new().unwrap();
        let stub = FakeStub {
            params: RefCell::new(strings(&["quiet", "iommu=soft", "iommu=pt"])),
            ..Default::default()
        };
        let backups = BackupStore::new(tmp.path().join("backups"));
        let mut journal = Journal::new();

        let outcome = apply_boot_parameters(
            &stub,
            &strings(&["intel_iommu=on", "iommu=pt"]),
            &backups,
            &mut journal,
        )
        .unwrap();

        assert_eq!(outcome.added, strings(&["intel_iommu=on"]));
        assert_eq!(outcome.already_present, strings(&["iommu=pt"]));
        assert!(outcome.replaced.is_empty());
        assert_eq!(journal.records(Category::BootParameterTool).len(), 1);
        assert_eq!(*stub.calls.borrow(), vec!["add intel_iommu=on".to_string()]);
    }

    #[test]
    fn test_apply_dry_run_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let stub = FakeStub::default();
        let backups = BackupStore::new(tmp.path().join("backups")).dry_run(true);
        let mut journal = Journal::new();

        let outcome =
            apply_boot_parameters(&stub, &strings(&["iommu=pt"]), &backups, &mut journal).unwrap();
        assert!(outcome.changed());
        assert!(stub.calls.borrow().is_empty());
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_apply_nothing_to_do() {
        let tmp = TempDir::new().unwrap();
        let stub = FakeStub { params: RefCell::new(strings(&["iommu=pt"])), ..Default::default() };
        let mut journal = Journal::new();

        let outcome = apply_boot_parameters(
            &stub,
            &strings(&["iommu=pt"]),
            &BackupStore::new(tmp.path()),
            &mut journal,
        )
        .unwrap();
        assert!(!outcome.changed());
        assert!(journal.is_empty());
    }
}

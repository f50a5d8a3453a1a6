//! Centralized path configuration for vfioprep.
//!
//! The setup run and a later cleanup run must agree on where the journal,
//! backups and reversal script live, so every path goes through this module.

use std::path::PathBuf;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "VFIOPREP_DATA_DIR";

/// Get the vfioprep data directory.
///
/// Resolution order:
/// 1. `VFIOPREP_DATA_DIR` environment variable
/// 2. The platform data directory (`$XDG_DATA_HOME/vfioprep`, `~/.local/share/vfioprep`)
/// 3. `/var/lib/vfioprep`
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    dirs::data_dir()
        .map(|d| d.join("vfioprep"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/vfioprep"))
}

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    dirs::config_dir().map(|d| d.join("vfioprep")).unwrap_or_else(data_dir)
}

/// Directory holding timestamped file backups.
pub fn backups_dir_in(output_dir: &std::path::Path) -> PathBuf {
    output_dir.join("backups")
}

/// Persisted journal location inside an output directory.
pub fn journal_path_in(output_dir: &std::path::Path) -> PathBuf {
    output_dir.join("changes.json")
}

/// Generated reversal script location inside an output directory.
pub fn reversal_script_path_in(output_dir: &std::path::Path) -> PathBuf {
    output_dir.join("vfio_cleanup.sh")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_derived_paths_share_output_dir() {
        let out = Path::new("/srv/vfio");
        assert_eq!(journal_path_in(out), Path::new("/srv/vfio/changes.json"));
        assert_eq!(backups_dir_in(out), Path::new("/srv/vfio/backups"));
        assert_eq!(reversal_script_path_in(out), Path::new("/srv/vfio/vfio_cleanup.sh"));
    }
}

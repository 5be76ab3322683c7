use std::fs;
use std::path::Path;

use anyhow::{Context, Error};
use nbc_api::config::{LintIssue, LintSeverity};

/// Result of running the lint/extraction verifier over a target root: the issues found plus how
/// many of each severity, and how many were fixed in place (always `0` when `fix` was `false`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LintReport {
    pub issues: Vec<LintIssue>,
    pub errors: usize,
    pub warnings: usize,
    pub fixed: usize,
}

/// Runs every image-hygiene check against `target_root`. When `fix` is `true`, each finding's
/// remediation is applied immediately and counted in `fixed`; the issue is still reported.
pub fn lint_extracted_root(target_root: impl AsRef<Path>, fix: bool) -> Result<LintReport, Error> {
    let target_root = target_root.as_ref();
    let mut report = LintReport::default();

    check_ssh_host_keys(target_root, fix, &mut report)?;
    check_machine_id(target_root, fix, &mut report)?;
    check_random_seed(target_root, fix, &mut report)?;

    Ok(report)
}

fn record(report: &mut LintReport, issue: LintIssue) {
    match issue.severity {
        LintSeverity::Error => report.errors += 1,
        LintSeverity::Warning => report.warnings += 1,
    }
    if issue.was_fixed {
        report.fixed += 1;
    }
    report.issues.push(issue);
}

/// Any baked-in SSH host key is an error: it means every instance extracted from this image would
/// share the same host identity. `fix` deletes the offending file.
fn check_ssh_host_keys(target_root: &Path, fix: bool, report: &mut LintReport) -> Result<(), Error> {
    let ssh_dir = target_root.join("etc/ssh");
    let Ok(entries) = fs::read_dir(&ssh_dir) else {
        return Ok(());
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("ssh_host_") {
            continue;
        }
        let path = entry.path();
        let mut fixed = false;
        if fix {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove baked-in host key '{}'", path.display()))?;
            fixed = true;
        }
        record(
            report,
            LintIssue {
                check_name: "ssh-host-keys".to_string(),
                severity: LintSeverity::Error,
                message: "baked-in SSH host key; every instance from this image would share it"
                    .to_string(),
                target_path: path.strip_prefix(target_root).unwrap_or(&path).to_path_buf(),
                was_fixed: fixed,
            },
        );
    }

    Ok(())
}

/// `/etc/machine-id` must be either absent, empty, or the literal `uninitialized` sentinel. Any
/// other content means a real machine ID was baked into the image. `fix` truncates the file.
fn check_machine_id(target_root: &Path, fix: bool, report: &mut LintReport) -> Result<(), Error> {
    let path = target_root.join("etc/machine-id");
    let Ok(contents) = fs::read_to_string(&path) else {
        return Ok(());
    };
    let trimmed = contents.trim();
    if trimmed.is_empty() || trimmed == "uninitialized" {
        return Ok(());
    }

    let mut fixed = false;
    if fix {
        fs::write(&path, "").context("Failed to truncate baked-in machine-id")?;
        fixed = true;
    }
    record(
        report,
        LintIssue {
            check_name: "machine-id".to_string(),
            severity: LintSeverity::Error,
            message: "contains a real machine ID baked into the image".to_string(),
            target_path: Path::new("etc/machine-id").to_path_buf(),
            was_fixed: fixed,
        },
    );
    Ok(())
}

/// A non-empty random seed baked into the image is only a warning (unlike machine-id, it does not
/// uniquely identify the instance by itself, but it does weaken early-boot entropy). `fix` removes
/// the file.
fn check_random_seed(target_root: &Path, fix: bool, report: &mut LintReport) -> Result<(), Error> {
    for relative in [
        "var/lib/systemd/random-seed",
        "var/lib/random-seed",
    ] {
        let path = target_root.join(relative);
        let Ok(metadata) = fs::metadata(&path) else {
            continue;
        };
        if metadata.len() == 0 {
            continue;
        }

        let mut fixed = false;
        if fix {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove random seed '{}'", path.display()))?;
            fixed = true;
        }
        record(
            report,
            LintIssue {
                check_name: "random-seed".to_string(),
                severity: LintSeverity::Warning,
                message: "non-empty random seed baked into the image".to_string(),
                target_path: Path::new(relative).to_path_buf(),
                was_fixed: fixed,
            },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lint_clean_root_has_no_issues() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc/ssh")).unwrap();
        fs::write(dir.path().join("etc/machine-id"), "uninitialized\n").unwrap();
        let report = lint_extracted_root(dir.path(), false).unwrap();
        assert_eq!(report.errors, 0);
        assert_eq!(report.warnings, 0);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_lint_flags_baked_ssh_host_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc/ssh")).unwrap();
        fs::write(dir.path().join("etc/ssh/ssh_host_rsa_key"), b"secret").unwrap();
        let report = lint_extracted_root(dir.path(), false).unwrap();
        assert_eq!(report.errors, 1);
        assert!(dir.path().join("etc/ssh/ssh_host_rsa_key").exists());
    }

    #[test]
    fn test_lint_fix_removes_baked_ssh_host_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc/ssh")).unwrap();
        fs::write(dir.path().join("etc/ssh/ssh_host_rsa_key"), b"secret").unwrap();
        let report = lint_extracted_root(dir.path(), true).unwrap();
        assert_eq!(report.fixed, 1);
        assert!(!dir.path().join("etc/ssh/ssh_host_rsa_key").exists());
    }

    #[test]
    fn test_lint_flags_real_machine_id() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/machine-id"), "0123456789abcdef0123456789abcdef\n").unwrap();
        let report = lint_extracted_root(dir.path(), false).unwrap();
        assert_eq!(report.errors, 1);
    }

    #[test]
    fn test_lint_warns_on_random_seed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("var/lib/systemd")).unwrap();
        fs::write(dir.path().join("var/lib/systemd/random-seed"), b"entropy").unwrap();
        let report = lint_extracted_root(dir.path(), false).unwrap();
        assert_eq!(report.warnings, 1);
        assert_eq!(report.errors, 0);
    }
}

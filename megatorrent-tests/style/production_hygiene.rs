//! Production Hygiene
//!
//! Production code propagates errors instead of unwrapping them and does not
//! silence dead code warnings. Everything from a file's first `#[cfg(test)]`
//! onward is test code and exempt, as are mock-only modules.

use std::fs;
use std::path::{Path, PathBuf};

const CRATE_PREFIX: &str = "megatorrent-";
const EXEMPT_FILES: &[&str] = &["test_mocks.rs"];

/// A banned pattern found in production code
#[derive(Debug)]
struct HygieneViolation {
    file_path: PathBuf,
    line_number: usize,
    context: String,
}

#[derive(Default)]
struct HygieneChecker {
    violations: Vec<HygieneViolation>,
    files_checked: usize,
}

impl HygieneChecker {
    fn workspace_root() -> PathBuf {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        manifest_dir
            .parent()
            .unwrap_or(manifest_dir)
            .to_path_buf()
    }

    /// Source directories of every production crate in the workspace
    fn source_dirs(root: &Path) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .unwrap()
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy())
                    .is_some_and(|name| name.starts_with(CRATE_PREFIX) && name != "megatorrent-tests")
            })
            .map(|path| path.join("src"))
            .filter(|path| path.is_dir())
            .collect();
        dirs.sort();
        dirs
    }

    fn collect_rust_files(dir: &Path, files: &mut Vec<PathBuf>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                Self::collect_rust_files(&path, files);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                files.push(path);
            }
        }
    }

    fn is_exempt(path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| EXEMPT_FILES.iter().any(|exempt| name == *exempt))
    }

    /// Line numbers and text of banned patterns in production code
    fn scan(content: &str) -> Vec<(usize, String)> {
        let mut found = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("#[cfg(test)]") {
                break;
            }
            if trimmed.starts_with("//") {
                continue;
            }
            let dead_code = trimmed.contains("#[allow(") && trimmed.contains("dead_code");
            let unwrap = trimmed.contains(".unwrap()") || trimmed.contains(".expect(");
            if dead_code || unwrap {
                found.push((index + 1, line.to_string()));
            }
        }
        found
    }

    fn check_workspace(&mut self) {
        let mut files = Vec::new();
        for dir in Self::source_dirs(&Self::workspace_root()) {
            Self::collect_rust_files(&dir, &mut files);
        }

        for file in files {
            if Self::is_exempt(&file) {
                continue;
            }
            let content = fs::read_to_string(&file).unwrap();
            self.files_checked += 1;
            for (line_number, context) in Self::scan(&content) {
                self.violations.push(HygieneViolation {
                    file_path: file.clone(),
                    line_number,
                    context,
                });
            }
        }
    }

    fn report_violations(&self) -> bool {
        if self.violations.is_empty() {
            println!(
                "Production hygiene: {} files checked, no violations found",
                self.files_checked
            );
            return true;
        }

        println!("Production hygiene violations found:");
        for violation in &self.violations {
            println!(
                "{}:{}\n  {}",
                violation.file_path.display(),
                violation.line_number,
                violation.context.trim()
            );
        }
        println!();
        println!("Propagate errors with `?` and remove unused code instead.");
        false
    }
}

#[test]
fn test_scan_stops_at_test_module() {
    let content = r#"
fn parse(input: &str) -> Option<u32> {
    input.parse().ok()
}

#[allow(dead_code)]
fn unused() {}

fn risky() -> u32 {
    "1".parse().unwrap()
}

#[cfg(test)]
mod tests {
    fn helper() -> u32 {
        "2".parse().unwrap()
    }
}
"#;
    let found = HygieneChecker::scan(content);
    let lines: Vec<usize> = found.iter().map(|(line, _)| *line).collect();
    assert_eq!(lines, vec![6, 10]);
}

#[test]
fn test_comments_and_fallbacks_are_allowed() {
    let content = r#"
/// let key = FeedKey::parse(text).unwrap();
fn fallback(value: Option<u32>) -> u32 {
    value.unwrap_or(0)
}
"#;
    assert!(HygieneChecker::scan(content).is_empty());
}

#[test]
fn production_hygiene_enforcement() {
    let mut checker = HygieneChecker::default();
    checker.check_workspace();

    assert!(checker.files_checked > 0, "no production sources found");
    assert!(
        checker.report_violations(),
        "Production hygiene violations found - see output above"
    );
}

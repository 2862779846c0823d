//! Architectural Enforcement Integration Tests
//!
//! This package scans the localsock sources and enforces rules that the
//! compiler cannot:
//! - Every `unsafe` block carries a `// SAFETY:` comment
//! - No `.unwrap()` / `.expect(..)` in production code
//! - No `thread::sleep` in production code
//!
//! "Production code" is everything in a file before its `#[cfg(test)]` module.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// How many lines above an `unsafe` block the `SAFETY:` comment may sit
const SAFETY_COMMENT_WINDOW: usize = 3;

/// One rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub file: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Rule that was broken
    pub rule: &'static str,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.file.display(), self.line, self.rule)
    }
}

/// Root of the localsock crates
#[must_use]
pub fn localsock_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../localsock")
}

/// All `.rs` files under `src/` directories below `root`
#[must_use]
pub fn source_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| path.extension().is_some_and(|ext| ext == "rs"))
        .filter(|path| path.components().any(|c| c.as_os_str() == "src"))
        .collect()
}

/// Lines of `source` that precede its test module
#[must_use]
pub fn production_lines(source: &str) -> Vec<&str> {
    source
        .lines()
        .take_while(|line| line.trim() != "#[cfg(test)]")
        .collect()
}

fn is_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//")
}

/// Check one file's production code against every rule
#[must_use]
pub fn check_source(file: &Path, source: &str) -> Vec<Violation> {
    let lines = production_lines(source);
    let mut violations = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if is_comment(line) {
            continue;
        }
        let violation = |rule| Violation {
            file: file.to_path_buf(),
            line: idx + 1,
            rule,
        };

        if line.contains("unsafe {") {
            let start = idx.saturating_sub(SAFETY_COMMENT_WINDOW);
            let documented = lines[start..idx].iter().any(|l| l.contains("SAFETY:"));
            if !documented {
                violations.push(violation("unsafe block without SAFETY comment"));
            }
        }
        if line.contains(".unwrap()") || line.contains(".expect(") {
            violations.push(violation("unwrap/expect in production code"));
        }
        if line.contains("thread::sleep") {
            violations.push(violation("thread::sleep in production code"));
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scan(root: &Path) -> Vec<Violation> {
        source_files(root)
            .into_iter()
            .flat_map(|file| {
                let source = fs::read_to_string(&file).unwrap();
                check_source(&file, &source)
            })
            .collect()
    }

    #[test]
    fn test_sources_found() {
        let files = source_files(&localsock_root());
        assert!(files.iter().any(|f| f.ends_with("core/src/server.rs")));
        assert!(files.iter().any(|f| f.ends_with("daemon/src/main.rs")));
    }

    #[test]
    fn test_localsock_follows_rules() {
        let violations = scan(&localsock_root());
        let report: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert!(violations.is_empty(), "violations:\n{}", report.join("\n"));
    }

    #[test]
    fn test_detects_undocumented_unsafe() {
        let source = "fn f() {\n    let x = unsafe { libc::getuid() };\n}\n";
        let violations = check_source(Path::new("x.rs"), source);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 2);
    }

    #[test]
    fn test_test_module_is_exempt() {
        let source = "fn f() {}\n\n#[cfg(test)]\nmod tests {\n    fn g() { Some(1).unwrap(); }\n}\n";
        assert!(check_source(Path::new("x.rs"), source).is_empty());
    }

    #[test]
    fn test_detects_unwrap_and_sleep() {
        let source = "fn f() {\n    x.unwrap();\n    std::thread::sleep(d);\n}\n";
        let rules: Vec<_> = check_source(Path::new("x.rs"), source)
            .into_iter()
            .map(|v| v.rule)
            .collect();
        assert_eq!(
            rules,
            vec!["unwrap/expect in production code", "thread::sleep in production code"]
        );
    }
}

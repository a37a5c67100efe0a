// Source hygiene checks for the crate. Every rule scans the crate's own Rust sources
// and fails the build with a per-file report when a violation is found.
use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are scanned. Vendored or reference trees are not ours.
const SCANNED_ROOTS: [&str; 3] = ["src", "tests", "benches"];

// A single hygiene rule: a line-level regex plus a predicate that decides whether a
// matched line really is a violation.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    is_violation: fn(&str) -> bool,
    advice: &'static str,
}

// Collects violating lines from one file for one rule.
struct RuleCollector {
    rule_name: &'static str,
    is_violation: fn(&str) -> bool,
    violations: Vec<String>,
    file_path: PathBuf,
}

impl RuleCollector {
    fn new(rule: &Rule, file_path: &Path) -> Self {
        Self {
            rule_name: rule.name,
            is_violation: rule.is_violation,
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
        }
    }

    fn report(&self, advice: &str) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut msg = format!(
            "\n❌ ERROR: {} violation(s) of rule '{}' in {}:\n",
            self.violations.len(),
            self.rule_name,
            file_name
        );
        for violation in &self.violations {
            msg.push_str(&format!("   {violation}\n"));
        }
        msg.push_str(&format!("\n⚠️ {advice}\n"));
        Some(msg)
    }
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();

        if (self.is_violation)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//")
}

// Returns the text of the comment on this line, if any.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    line.find("/*").map(|idx| {
        let rest = &line[idx + 2..];
        match rest.find("*/") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    })
}

// Underscore-prefixed names hide unused bindings. Comments and string literals are exempt.
fn underscore_binding(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn history_comment(line: &str) -> bool {
    comment_text(line).is_some()
}

fn shouting_comment(line: &str) -> bool {
    match comment_text(line) {
        Some(text) => {
            let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
            letters.peek().is_some() && letters.all(|c| c.is_uppercase())
        }
        None => false,
    }
}

fn always(line: &str) -> bool {
    !line.is_empty()
}

const RULES: [Rule; 4] = [
    Rule {
        name: "underscore-prefixed binding",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        is_violation: underscore_binding,
        advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
    },
    Rule {
        name: "change-log comment",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|NEW|CHANGED|CHANGE|MODIFIED|MODIFY|UPDATED|UPDATE)",
        is_violation: history_comment,
        advice: "Comments describe the code as it is, not how it got there.",
    },
    Rule {
        name: "all-caps comment",
        pattern: r"(//|/\*).*",
        is_violation: shouting_comment,
        advice: "Comments written entirely in capitals are not allowed.",
    },
    Rule {
        name: "allow(dead_code)",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        is_violation: always,
        advice: "Either use the code or delete it. Silencing dead_code is forbidden.",
    },
];

fn rust_sources() -> Vec<PathBuf> {
    SCANNED_ROOTS
        .iter()
        .filter(|root| Path::new(root).exists())
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.path().to_path_buf())
        })
        .collect()
}

fn scan(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for rule in &RULES {
        let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
        for path in sources {
            let mut collector = RuleCollector::new(rule, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(msg) = collector.report(rule.advice) {
                return Err(msg.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for root in SCANNED_ROOTS {
        println!("cargo:rerun-if-changed={root}");
    }

    let sources = rust_sources();
    if let Err(e) = scan(&sources) {
        // The report has to reach cargo's output before the build fails.
        eprintln!("{e}");
        std::process::exit(1);
    }
}

use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed.
const SOURCE_DIRS: [&str; 4] = ["score", "cli", "tests", "benches"];

const FORBIDDEN_COMMENT_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

#[derive(Clone, Copy)]
enum Rule {
    UnderscoreBinding,
    AllowDeadCode,
    ForbiddenCommentWord,
    StarsInComment,
    UppercaseComment,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscoreBinding,
        Rule::AllowDeadCode,
        Rule::ForbiddenCommentWord,
        Rule::StarsInComment,
        Rule::UppercaseComment,
    ];

    fn pattern(self) -> String {
        match self {
            Rule::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            Rule::ForbiddenCommentWord => {
                format!(r"(//|/\*).*(?:{})", FORBIDDEN_COMMENT_WORDS.join("|"))
            }
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::UppercaseComment => r"(//|/\*).*".to_string(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Rule::UnderscoreBinding => {
                "Underscore-prefixed names are not allowed. Use the binding or remove it."
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] is not allowed. Use the code or remove it."
            }
            Rule::ForbiddenCommentWord => {
                "Change-log style markers are not allowed in comments. Describe the code as it is."
            }
            Rule::StarsInComment => "'**' is only allowed in doc comments.",
            Rule::UppercaseComment => {
                "Comments whose letters are all uppercase are not allowed."
            }
        }
    }

    // Decides whether a line matched by `pattern` is a real violation.
    fn is_violation(self, line: &str) -> bool {
        match self {
            Rule::UnderscoreBinding => !is_comment_line(line) && !is_inside_string(line),
            Rule::AllowDeadCode | Rule::ForbiddenCommentWord => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::UppercaseComment => comment_text(line).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(char::is_uppercase)
            }),
        }
    }
}

struct PolicyCollector {
    rule: Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl PolicyCollector {
    fn new(rule: Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }
        let mut message = format!(
            "\n❌ ERROR: {} policy violation(s) in {}:\n",
            self.violations.len(),
            self.file_path.display()
        );
        for violation in &self.violations {
            message.push_str(&format!("   {violation}\n"));
        }
        message.push_str(&format!("\n⚠️ {}\n", self.rule.describe()));
        Some(message)
    }
}

impl Sink for PolicyCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

fn is_comment_line(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*')
}

// Odd-indexed pieces between double quotes are string contents.
fn is_inside_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    for prefix in ["///", "//!", "//"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return Some(rest.trim());
        }
    }
    let start = line.find("/*")? + 2;
    let rest = &line[start..];
    Some(rest.find("*/").map_or(rest, |end| &rest[..end]).trim())
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    SOURCE_DIRS
        .into_iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path())
        })
}

fn enforce(rule: Rule) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        let mut collector = PolicyCollector::new(rule, &path);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(message) = collector.error_message() {
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    for rule in Rule::ALL {
        if let Err(e) = enforce(rule) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

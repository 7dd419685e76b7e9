//! Toolchain registry for compilation and execution

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::info;

use super::request::{Diagnostic, LimitsOverride};

/// Lines of source looked at when guessing a language from content
const DETECTION_SAMPLE_LINES: usize = 10;

/// How serious a validation finding is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

/// Source pattern checked before a request is admitted
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub pattern: Regex,
    pub severity: Severity,
    pub message: String,
}

/// One rule match, with the 1-based line it starts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
    pub line: u32,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// How to build and run one language
#[derive(Debug, Clone)]
pub struct ToolchainSpec {
    /// Canonical (lowercase) language name
    pub name: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// File extensions used for detection, without the dot
    pub extensions: Vec<String>,
    /// Compile command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command
    pub run_command: Vec<String>,
    pub aliases: Vec<String>,
    /// Per-language defaults layered over the service defaults
    pub limits: LimitsOverride,
    /// Whether RLIMIT_AS may be used when no cgroup is available
    pub limit_address_space: bool,
    /// Regex with `message` and optional `line` groups
    pub error_pattern: Option<Regex>,
    /// Each match in the head of unlabelled source scores one point
    pub content_patterns: Vec<Regex>,
    pub validation_rules: Vec<ValidationRule>,
}

impl ToolchainSpec {
    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    /// First error location in compiler output or runtime stderr
    pub fn extract_diagnostic(&self, output: &str) -> Option<Diagnostic> {
        let pattern = self.error_pattern.as_ref()?;
        let captures = pattern.captures(output)?;
        let message = captures.name("message")?.as_str().trim().to_string();
        let line = captures
            .name("line")
            .and_then(|m| m.as_str().parse::<u32>().ok());
        Some(Diagnostic { line, message })
    }

    /// Every rule match in `source`, in rule order
    pub fn validate(&self, source: &str) -> Vec<ValidationIssue> {
        if source.trim().is_empty() {
            return Vec::new();
        }

        let mut issues = Vec::new();
        for rule in &self.validation_rules {
            for found in rule.pattern.find_iter(source) {
                let line = source[..found.start()].matches('\n').count() + 1;
                issues.push(ValidationIssue {
                    severity: rule.severity,
                    message: rule.message.clone(),
                    line: u32::try_from(line).unwrap_or(u32::MAX),
                });
            }
        }
        issues
    }

    /// Number of content patterns matching `sample`
    fn content_score(&self, sample: &str) -> usize {
        self.content_patterns
            .iter()
            .filter(|pattern| pattern.is_match(sample))
            .count()
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawToolchainConfig {
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    limits: LimitsOverride,
    #[serde(default = "default_true")]
    limit_address_space: bool,
    error_pattern: Option<String>,
    #[serde(default)]
    content_patterns: Vec<String>,
    #[serde(default)]
    validation_rules: Vec<RawValidationRule>,
}

#[derive(Debug, Deserialize)]
struct RawValidationRule {
    pattern: String,
    message: String,
    #[serde(default)]
    severity: Severity,
}

fn default_true() -> bool {
    true
}

/// Immutable set of toolchains, keyed by canonical name
#[derive(Debug, Clone, Default)]
pub struct ToolchainRegistry {
    toolchains: HashMap<String, Arc<ToolchainSpec>>,
    /// alias -> canonical name
    aliases: HashMap<String, String>,
}

impl ToolchainRegistry {
    /// Built-in toolchains from `files/languages.toml`
    pub fn load_default() -> anyhow::Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    /// Toolchains from `LANGUAGES_CONFIG` if set, otherwise the built-in set
    pub fn from_env() -> anyhow::Result<Self> {
        match std::env::var("LANGUAGES_CONFIG") {
            Ok(path) => {
                let registry = Self::from_file(&path)?;
                info!("Loaded {} toolchains from {}", registry.len(), path);
                Ok(registry)
            }
            Err(_) => Self::load_default(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read toolchain config {:?}", path))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid toolchain config {:?}", path))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawToolchainConfig> = toml::from_str(content)?;

        let mut registry = Self::default();

        for (name, raw) in raw_configs {
            let name = name.to_lowercase();

            if raw.source_file.is_empty()
                || raw.source_file.contains('/')
                || raw.source_file.starts_with('.')
            {
                anyhow::bail!("Invalid source_file for {}: {:?}", name, raw.source_file);
            }

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for {}", name);
            }

            let compile_command = match raw.compile_command {
                Some(cmd) => {
                    let cmd = into_command(&cmd);
                    if cmd.is_empty() {
                        anyhow::bail!("Empty compile_command for {}", name);
                    }
                    Some(cmd)
                }
                None => None,
            };

            let zero = raw.limits.zero_fields();
            if !zero.is_empty() {
                anyhow::bail!("Zero limits for {}: {}", name, zero.join(", "));
            }

            let error_pattern = match raw.error_pattern {
                Some(pattern) => {
                    let regex = Regex::new(&pattern)
                        .with_context(|| format!("Invalid error_pattern for {}", name))?;
                    if !regex.capture_names().any(|n| n == Some("message")) {
                        anyhow::bail!("error_pattern for {} has no `message` group", name);
                    }
                    Some(regex)
                }
                None => None,
            };

            let content_patterns = raw
                .content_patterns
                .iter()
                .map(|pattern| {
                    source_regex(pattern)
                        .with_context(|| format!("Invalid content pattern for {}", name))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let validation_rules = raw
                .validation_rules
                .into_iter()
                .map(|rule| {
                    Ok(ValidationRule {
                        pattern: source_regex(&rule.pattern)
                            .with_context(|| format!("Invalid validation rule for {}", name))?,
                        severity: rule.severity,
                        message: rule.message,
                    })
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let spec = ToolchainSpec {
                name: name.clone(),
                source_file: raw.source_file,
                extensions: raw
                    .extensions
                    .iter()
                    .map(|e| e.trim_start_matches('.').to_lowercase())
                    .collect(),
                compile_command,
                run_command,
                aliases: raw.aliases.iter().map(|a| a.to_lowercase()).collect(),
                limits: raw.limits,
                limit_address_space: raw.limit_address_space,
                error_pattern,
                content_patterns,
                validation_rules,
            };

            for alias in &spec.aliases {
                if let Some(previous) = registry.aliases.insert(alias.clone(), name.clone()) {
                    anyhow::bail!("Alias {} used by both {} and {}", alias, previous, name);
                }
            }

            registry.toolchains.insert(name, Arc::new(spec));
        }

        if let Some(alias) = registry
            .aliases
            .keys()
            .find(|alias| registry.toolchains.contains_key(*alias))
        {
            anyhow::bail!("Alias {} shadows a language name", alias);
        }

        Ok(registry)
    }

    /// Look up a toolchain by name or alias, case-insensitively
    pub fn get(&self, language: &str) -> Option<Arc<ToolchainSpec>> {
        let key = language.trim().to_lowercase();
        let canonical = self.aliases.get(&key).unwrap_or(&key);
        self.toolchains.get(canonical).cloned()
    }

    /// Resolve a toolchain from a file name's extension
    pub fn detect_by_extension(&self, filename: &str) -> Option<Arc<ToolchainSpec>> {
        let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
        let mut matches: Vec<_> = self
            .toolchains
            .values()
            .filter(|spec| spec.extensions.iter().any(|e| *e == ext))
            .collect();
        // Deterministic pick if two toolchains claim the same extension
        matches.sort_by(|a, b| a.name.cmp(&b.name));
        matches.first().map(|spec| Arc::clone(*spec))
    }

    /// Guess the language of `source` from its first lines. The highest
    /// score wins; ties go to the alphabetically first name.
    pub fn detect_by_content(&self, source: &str) -> Option<Arc<ToolchainSpec>> {
        let sample = source
            .trim()
            .lines()
            .take(DETECTION_SAMPLE_LINES)
            .collect::<Vec<_>>()
            .join("\n");

        let mut scored: Vec<_> = self
            .toolchains
            .values()
            .map(|spec| (spec.content_score(&sample), spec))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|(a, x), (b, y)| b.cmp(a).then_with(|| x.name.cmp(&y.name)));
        scored.first().map(|(_, spec)| Arc::clone(*spec))
    }

    /// Canonical names, sorted
    pub fn languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.toolchains.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.toolchains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.toolchains.is_empty()
    }
}

/// Patterns over source text match case-insensitively, `^`/`$` per line
fn source_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const TEST_CONFIG: &str = r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main main.c"
run_command = "./main"
extensions = [".c"]
error_pattern = 'main\.c:(?P<line>\d+):\d+: error: (?P<message>[^\n]+)'

[python]
source_file = "main.py"
run_command = "python3 main.py"
extensions = ["py"]
aliases = ["py", "Python3"]

[python.limits]
wall_clock_ms = 2000
"#;

    #[test]
    fn test_load_languages() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();

        assert_eq!(registry.languages(), vec!["c", "python"]);

        let python = registry.get("PY").unwrap();
        assert_eq!(python.name, "python");
        assert!(!python.is_compiled());
        assert_eq!(python.run_command, vec!["python3", "main.py"]);
        assert_eq!(python.limits.wall_clock_ms, Some(2000));
        assert!(python.limit_address_space);
        assert!(registry.get("python3").is_some());

        let c = registry.get("c").unwrap();
        assert_eq!(
            c.compile_command.as_deref(),
            Some(&["gcc".to_string(), "-o".into(), "main".into(), "main.c".into()][..])
        );

        assert!(registry.get("cobol").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", TEST_CONFIG).unwrap();

        let registry = ToolchainRegistry::from_file(file.path()).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_detect_by_extension() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();
        assert_eq!(registry.detect_by_extension("solution.PY").unwrap().name, "python");
        assert_eq!(registry.detect_by_extension("a/b/prog.c").unwrap().name, "c");
        assert!(registry.detect_by_extension("Makefile").is_none());
        assert!(registry.detect_by_extension("x.rb").is_none());
    }

    #[test]
    fn test_extract_diagnostic() {
        let registry = ToolchainRegistry::from_toml_str(TEST_CONFIG).unwrap();
        let c = registry.get("c").unwrap();

        let output = "main.c: In function 'main':\n\
                      main.c:4:5: error: 'x' undeclared (first use in this function)\n";
        let diagnostic = c.extract_diagnostic(output).unwrap();
        assert_eq!(diagnostic.line, Some(4));
        assert_eq!(diagnostic.message, "'x' undeclared (first use in this function)");

        assert!(c.extract_diagnostic("ld: cannot find -lfoo").is_none());
        assert!(registry.get("python").unwrap().extract_diagnostic(output).is_none());
    }

    #[test]
    fn test_rejects_bad_configs() {
        let traversal = r#"
[x]
source_file = "../main.c"
run_command = "./main"
"#;
        assert!(ToolchainRegistry::from_toml_str(traversal).is_err());

        let empty_run = r#"
[x]
source_file = "main.x"
run_command = "   "
"#;
        assert!(ToolchainRegistry::from_toml_str(empty_run).is_err());

        let no_message_group = r#"
[x]
source_file = "main.x"
run_command = "./main"
error_pattern = 'line (\d+)'
"#;
        assert!(ToolchainRegistry::from_toml_str(no_message_group).is_err());

        let duplicate_alias = r#"
[x]
source_file = "main.x"
run_command = "./x"
aliases = ["same"]

[y]
source_file = "main.y"
run_command = "./y"
aliases = ["same"]
"#;
        assert!(ToolchainRegistry::from_toml_str(duplicate_alias).is_err());

        let zero_limit = r#"
[x]
source_file = "main.x"
run_command = "./x"

[x.limits]
cpu_secs = 0
"#;
        assert!(ToolchainRegistry::from_toml_str(zero_limit).is_err());
    }

    #[test]
    fn test_builtin_languages() {
        let registry = ToolchainRegistry::load_default().unwrap();
        for name in ["cpp", "c", "python", "java", "javascript", "rust", "go"] {
            assert!(registry.get(name).is_some(), "missing {}", name);
        }
        assert!(registry.get("cpp").unwrap().is_compiled());
        assert!(!registry.get("java").unwrap().limit_address_space);
        assert_eq!(registry.detect_by_extension("main.cc").unwrap().name, "cpp");
    }

    #[test]
    fn test_validation_rules() {
        let config = r#"
[python]
source_file = "main.py"
run_command = "python3 main.py"

[[python.validation_rules]]
pattern = '\beval\s*\('
message = "eval() is not allowed"

[[python.validation_rules]]
pattern = '^import os'
severity = "warning"
message = "os access is restricted"
"#;
        let registry = ToolchainRegistry::from_toml_str(config).unwrap();
        let python = registry.get("python").unwrap();

        let issues = python.validate("import os\nx = 1\nprint(EVAL (\"1\"))\n");
        assert_eq!(
            issues,
            vec![
                ValidationIssue {
                    severity: Severity::Error,
                    message: "eval() is not allowed".to_string(),
                    line: 3,
                },
                ValidationIssue {
                    severity: Severity::Warning,
                    message: "os access is restricted".to_string(),
                    line: 1,
                },
            ]
        );
        assert_eq!(issues[0].to_string(), "line 3: eval() is not allowed");

        assert!(python.validate("").is_empty());
        assert!(python.validate("print(evaluate)").is_empty());

        let bad_rule = r#"
[x]
source_file = "main.x"
run_command = "./x"

[[x.validation_rules]]
pattern = '(unclosed'
message = "never compiles"
"#;
        assert!(ToolchainRegistry::from_toml_str(bad_rule).is_err());
    }

    #[test]
    fn test_detect_by_content() {
        let registry = ToolchainRegistry::load_default().unwrap();
        let detect = |source: &str| registry.detect_by_content(source).map(|s| s.name.clone());

        assert_eq!(
            detect("#include <iostream>\nusing namespace std;\nint main() { cout << 1; }"),
            Some("cpp".to_string())
        );
        assert_eq!(
            detect("import sys\n\ndef solve():\n    print(sys.argv)\n"),
            Some("python".to_string())
        );
        assert_eq!(
            detect("public class Main {\n    public static void main(String[] a) {\n        System.out.println(1);\n    }\n}"),
            Some("java".to_string())
        );
        assert_eq!(
            detect("const n = 3;\nconsole.log(n);"),
            Some("javascript".to_string())
        );
        assert_eq!(detect("package main\n\nfunc main() {}"), Some("go".to_string()));
        assert_eq!(detect("hello world"), None);
        assert_eq!(detect(""), None);
    }

    #[test]
    fn test_builtin_validation_rules() {
        let registry = ToolchainRegistry::load_default().unwrap();

        let cpp = registry.get("cpp").unwrap();
        let issues = cpp.validate("#include <cstdlib>\nint main() {\n  system(\"ls\");\n}\n");
        assert!(issues
            .iter()
            .any(|i| i.severity == Severity::Error && i.line == 3));

        let warning_only = cpp.validate("int main() { exit(0); }");
        assert!(warning_only.iter().all(|i| i.severity == Severity::Warning));
        assert!(!warning_only.is_empty());

        assert!(registry.get("go").unwrap().validation_rules.is_empty());
    }

    #[test]
    fn test_builtin_error_patterns() {
        let registry = ToolchainRegistry::load_default().unwrap();

        let cpp = registry.get("cpp").unwrap();
        let d = cpp
            .extract_diagnostic("main.cpp:3:12: error: expected ';' before '}' token\n")
            .unwrap();
        assert_eq!(d.line, Some(3));
        assert_eq!(d.message, "expected ';' before '}' token");

        let python = registry.get("python").unwrap();
        let traceback = "Traceback (most recent call last):\n  \
                         File \"/tmp/x/main.py\", line 2, in <module>\n    \
                         print(1 / 0)\n\
                         ZeroDivisionError: division by zero\n";
        let d = python.extract_diagnostic(traceback).unwrap();
        assert_eq!(d.line, Some(2));
        assert_eq!(d.message, "ZeroDivisionError: division by zero");

        let rust = registry.get("rust").unwrap();
        let d = rust
            .extract_diagnostic(
                "error[E0425]: cannot find value `x` in this scope\n --> main.rs:2:20\n",
            )
            .unwrap();
        assert_eq!(d.line, Some(2));
        assert_eq!(d.message, "error[E0425]: cannot find value `x` in this scope");
    }
}

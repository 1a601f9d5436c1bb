//! Static permission rules from on-disk settings.
//!
//! The user's agent settings may pre-authorize (or forbid) tools without a
//! dialog. Rules take three forms: a bare tool name (`Bash`), an exact
//! specifier (`Bash(git status)`), or a prefix specifier (`Bash(git:*)`).
//! Global rules come from the user settings file; project rules from two
//! files under the session's working directory. Deny rules are checked
//! before allow rules. Parsed files are cached by mtime.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

/// Relative paths of the project-level settings files.
const PROJECT_SETTINGS: [&str; 2] = [".claude/settings.json", ".claude/settings.local.json"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticDecision {
    Allow,
    Deny,
    NoMatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Specifier {
    Exact(String),
    Prefix(String),
}

#[derive(Clone, Debug)]
pub struct Rule {
    tool: String,
    specifier: Option<Specifier>,
    /// Compiled alternation for tool names like `Read|Grep|Glob`.
    tool_pattern: Option<Regex>,
}

impl Rule {
    /// Parse `Tool`, `Tool(exact)`, or `Tool(prefix:*)`. The tool part may
    /// be an alternation (`Read|Grep`).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (tool, specifier) = match raw.find('(') {
            None => (raw.to_string(), None),
            Some(open) => {
                let close = raw.rfind(')')?;
                if close <= open {
                    return None;
                }
                let inner = &raw[open + 1..close];
                let specifier = if let Some(prefix) = inner.strip_suffix(":*") {
                    Specifier::Prefix(prefix.to_string())
                } else if let Some(prefix) = inner.strip_suffix('*') {
                    Specifier::Prefix(prefix.to_string())
                } else {
                    Specifier::Exact(inner.to_string())
                };
                (raw[..open].trim().to_string(), Some(specifier))
            }
        };

        let tool_pattern = if tool.contains('|') {
            Regex::new(&format!("^(?:{tool})$")).ok()
        } else {
            None
        };

        Some(Self {
            tool,
            specifier,
            tool_pattern,
        })
    }

    fn tool_matches(&self, tool_name: &str) -> bool {
        match &self.tool_pattern {
            Some(pattern) => pattern.is_match(tool_name),
            None => self.tool == tool_name,
        }
    }

    pub fn matches(&self, tool_name: &str, input: &Value) -> bool {
        if !self.tool_matches(tool_name) {
            return false;
        }
        let Some(ref specifier) = self.specifier else {
            return true;
        };

        let Some(subject) = rule_subject(tool_name, input) else {
            return false;
        };

        match specifier {
            Specifier::Exact(expected) => subject == *expected,
            Specifier::Prefix(prefix) => subject.starts_with(prefix.as_str()),
        }
    }
}

/// The string a specifier matches against. For the shell tool this is the
/// first argv word after stripping environment assignments and any path
/// prefix; for other tools, the primary string argument.
fn rule_subject(tool_name: &str, input: &Value) -> Option<String> {
    if tool_name == "Bash" {
        let command = input.get("command")?.as_str()?;
        return Some(shell_command_word(command));
    }
    input
        .get("file_path")
        .or_else(|| input.get("path"))
        .or_else(|| input.get("url"))
        .or_else(|| input.get("command"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// First real word of a shell command: skips `VAR=value` assignments and
/// reduces `/usr/bin/git` to `git`.
pub fn shell_command_word(command: &str) -> String {
    for word in command.split_whitespace() {
        let looks_like_assignment = word
            .split_once('=')
            .is_some_and(|(name, _)| !name.is_empty() && !name.contains('/'));
        if looks_like_assignment {
            continue;
        }
        return word.rsplit('/').next().unwrap_or(word).to_string();
    }
    String::new()
}

// ============================================================================
// Settings files
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    permissions: SettingsPermissions,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsPermissions {
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

#[derive(Clone, Debug, Default)]
struct RuleSet {
    allow: Vec<Rule>,
    deny: Vec<Rule>,
}

#[derive(Clone, Debug)]
struct CachedFile {
    mtime: SystemTime,
    rules: RuleSet,
}

/// Mtime-cached view of the user and project settings files.
pub struct SettingsRules {
    user_settings: PathBuf,
    cache: DashMap<PathBuf, CachedFile>,
}

impl SettingsRules {
    pub fn new(user_settings: PathBuf) -> Self {
        Self {
            user_settings,
            cache: DashMap::new(),
        }
    }

    /// User settings under the agent's config tree.
    pub fn default_user(claude_dir: &Path) -> Self {
        Self::new(claude_dir.join("settings.json"))
    }

    /// Evaluate the static rule cascade for one tool use. Deny wins over
    /// allow; project files are consulted after the user file but their
    /// denies are just as binding.
    pub fn check(&self, cwd: &Path, tool_name: &str, input: &Value) -> StaticDecision {
        let mut files = vec![self.user_settings.clone()];
        for relative in PROJECT_SETTINGS {
            files.push(cwd.join(relative));
        }

        let sets: Vec<RuleSet> = files.iter().map(|path| self.load(path)).collect();

        for set in &sets {
            if set.deny.iter().any(|rule| rule.matches(tool_name, input)) {
                return StaticDecision::Deny;
            }
        }
        for set in &sets {
            if set.allow.iter().any(|rule| rule.matches(tool_name, input)) {
                return StaticDecision::Allow;
            }
        }
        StaticDecision::NoMatch
    }

    fn load(&self, path: &Path) -> RuleSet {
        let Ok(meta) = std::fs::metadata(path) else {
            self.cache.remove(path);
            return RuleSet::default();
        };
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        if let Some(cached) = self.cache.get(path) {
            if cached.mtime == mtime {
                return cached.rules.clone();
            }
        }

        let rules = match std::fs::read_to_string(path) {
            Ok(body) => match serde_json::from_str::<SettingsFile>(&body) {
                Ok(file) => RuleSet {
                    allow: file
                        .permissions
                        .allow
                        .iter()
                        .filter_map(|r| Rule::parse(r))
                        .collect(),
                    deny: file
                        .permissions
                        .deny
                        .iter()
                        .filter_map(|r| Rule::parse(r))
                        .collect(),
                },
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "unparseable settings file");
                    RuleSet::default()
                }
            },
            Err(_) => RuleSet::default(),
        };

        self.cache.insert(
            path.to_path_buf(),
            CachedFile {
                mtime,
                rules: rules.clone(),
            },
        );
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_forms() {
        let bare = Rule::parse("Bash").unwrap();
        assert!(bare.specifier.is_none());

        let exact = Rule::parse("Bash(git status)").unwrap();
        assert_eq!(exact.specifier, Some(Specifier::Exact("git status".into())));

        let prefix = Rule::parse("Bash(git:*)").unwrap();
        assert_eq!(prefix.specifier, Some(Specifier::Prefix("git".into())));

        assert!(Rule::parse("").is_none());
    }

    #[test]
    fn test_alternation_tool_pattern() {
        let rule = Rule::parse("Read|Grep|Glob").unwrap();
        assert!(rule.matches("Read", &Value::Null));
        assert!(rule.matches("Glob", &Value::Null));
        assert!(!rule.matches("Bash", &Value::Null));
        assert!(!rule.matches("ReadX", &Value::Null));
    }

    #[test]
    fn test_shell_command_word() {
        assert_eq!(shell_command_word("git status"), "git");
        assert_eq!(shell_command_word("FOO=1 BAR=2 git push"), "git");
        assert_eq!(shell_command_word("/usr/bin/git log"), "git");
        assert_eq!(shell_command_word("ENV=x /opt/bin/cargo build"), "cargo");
        assert_eq!(shell_command_word(""), "");
    }

    #[test]
    fn test_bash_rule_matches_first_word() {
        let rule = Rule::parse("Bash(git:*)").unwrap();
        assert!(rule.matches("Bash", &json!({"command": "git status"})));
        assert!(rule.matches("Bash", &json!({"command": "PAGER=cat /usr/bin/git log"})));
        assert!(!rule.matches("Bash", &json!({"command": "rm -rf /"})));
        assert!(!rule.matches("Edit", &json!({"command": "git status"})));
    }

    #[test]
    fn test_file_tool_prefix() {
        let rule = Rule::parse("Read(/etc:*)").unwrap();
        assert!(rule.matches("Read", &json!({"file_path": "/etc/passwd"})));
        assert!(!rule.matches("Read", &json!({"file_path": "/home/u/x"})));
    }

    fn write_settings(path: &Path, allow: &[&str], deny: &[&str]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let body = json!({"permissions": {"allow": allow, "deny": deny}});
        std::fs::write(path, body.to_string()).unwrap();
    }

    #[test]
    fn test_deny_checked_before_allow() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("settings.json");
        write_settings(&user, &["Bash"], &["Bash(rm:*)"]);

        let rules = SettingsRules::new(user);
        let cwd = dir.path();
        assert_eq!(
            rules.check(cwd, "Bash", &json!({"command": "ls"})),
            StaticDecision::Allow
        );
        assert_eq!(
            rules.check(cwd, "Bash", &json!({"command": "rm -rf tmp"})),
            StaticDecision::Deny
        );
        assert_eq!(
            rules.check(cwd, "Edit", &json!({"file_path": "/x"})),
            StaticDecision::NoMatch
        );
    }

    #[test]
    fn test_project_rules_consulted() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("project");
        write_settings(
            &cwd.join(".claude/settings.local.json"),
            &["Grep"],
            &[],
        );

        let rules = SettingsRules::new(dir.path().join("no-user-settings.json"));
        assert_eq!(
            rules.check(&cwd, "Grep", &json!({"pattern": "TODO"})),
            StaticDecision::Allow
        );
    }

    #[test]
    fn test_mtime_cache_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("settings.json");
        write_settings(&user, &[], &[]);

        let rules = SettingsRules::new(user.clone());
        assert_eq!(
            rules.check(dir.path(), "Bash", &json!({"command": "ls"})),
            StaticDecision::NoMatch
        );

        write_settings(&user, &["Bash"], &[]);
        // Nudge mtime past filesystem granularity.
        let file = std::fs::File::open(&user).unwrap();
        file.set_modified(SystemTime::now() + std::time::Duration::from_secs(2))
            .unwrap();

        assert_eq!(
            rules.check(dir.path(), "Bash", &json!({"command": "ls"})),
            StaticDecision::Allow
        );
    }
}

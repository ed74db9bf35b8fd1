//! SSH Config Lookup
//!
//! Parses OpenSSH client config files (~/.ssh/config, /etc/ssh/ssh_config)
//! and answers keyword lookups with OpenSSH "first obtained value wins"
//! semantics. Supports:
//! - `Key Value` and `Key=Value` syntax, quoted values
//! - Host blocks with `*`/`?` wildcards and `!` negation
//! - Directives before the first Host line (apply to every host)
//!
//! `Match` blocks are skipped entirely.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

/// SSH config errors
#[derive(Debug, thiserror::Error)]
pub enum SshConfigError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Get default user SSH config path
pub fn default_ssh_config_path() -> Result<PathBuf, SshConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .ok_or(SshConfigError::NoHomeDir)
}

/// Expand a leading `~/` (or a bare `~`) to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// OpenSSH client defaults for the keywords this crate reads.
pub fn default_value(keyword: &str) -> Option<&'static str> {
    match keyword.to_ascii_lowercase().as_str() {
        "port" => Some("22"),
        "batchmode" => Some("no"),
        "pubkeyauthentication" => Some("yes"),
        "passwordauthentication" => Some("yes"),
        "kbdinteractiveauthentication" => Some("yes"),
        "preferredauthentications" => {
            Some("gssapi-with-mic,hostbased,publickey,keyboard-interactive,password")
        }
        "userknownhostsfile" => Some("~/.ssh/known_hosts ~/.ssh/known_hosts2"),
        "globalknownhostsfile" => Some("/etc/ssh/ssh_known_hosts /etc/ssh/ssh_known_hosts2"),
        _ => None,
    }
}

/// Default identity files tried when no IdentityFile directive matches
pub const DEFAULT_IDENTITY_FILES: &[&str] =
    &["~/.ssh/id_rsa", "~/.ssh/id_ecdsa", "~/.ssh/id_ed25519"];

/// Glob match supporting `*` and `?`, case-insensitive (host names).
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    let t: Vec<char> = text.to_ascii_lowercase().chars().collect();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match a host against a pattern list. A matching negated pattern vetoes.
pub fn match_pattern_list<'a>(patterns: impl IntoIterator<Item = &'a str>, host: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if wildcard_match(negated, host) {
                return false;
            }
        } else if wildcard_match(pattern, host) {
            matched = true;
        }
    }
    matched
}

#[derive(Debug, Clone)]
enum BlockSelector {
    /// Directives before the first Host line
    Global,
    Host(Vec<String>),
    /// `Match` blocks: never applied
    Match,
}

#[derive(Debug, Clone)]
struct ConfigBlock {
    selector: BlockSelector,
    /// (lowercased keyword, value)
    directives: Vec<(String, String)>,
}

impl ConfigBlock {
    fn applies_to(&self, host: &str) -> bool {
        match &self.selector {
            BlockSelector::Global => true,
            BlockSelector::Host(patterns) => {
                match_pattern_list(patterns.iter().map(String::as_str), host)
            }
            BlockSelector::Match => false,
        }
    }
}

/// One parsed config file
#[derive(Debug, Clone, Default)]
pub struct SshConfigFile {
    blocks: Vec<ConfigBlock>,
}

/// Split a config line into keyword and value.
fn split_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let key_end = line.find(|c: char| c.is_whitespace() || c == '=')?;
    let key = &line[..key_end];
    let rest = line[key_end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    if rest.is_empty() {
        return None;
    }

    let value = if rest.len() >= 2 && rest.starts_with('"') && rest.ends_with('"') {
        &rest[1..rest.len() - 1]
    } else {
        rest
    };
    Some((key.to_ascii_lowercase(), value.to_string()))
}

impl SshConfigFile {
    pub fn parse(content: &str) -> Self {
        let mut blocks = vec![ConfigBlock {
            selector: BlockSelector::Global,
            directives: Vec::new(),
        }];

        for line in content.lines() {
            let Some((key, value)) = split_line(line) else {
                continue;
            };
            match key.as_str() {
                "host" => blocks.push(ConfigBlock {
                    selector: BlockSelector::Host(
                        value.split_whitespace().map(str::to_string).collect(),
                    ),
                    directives: Vec::new(),
                }),
                "match" => blocks.push(ConfigBlock {
                    selector: BlockSelector::Match,
                    directives: Vec::new(),
                }),
                _ => {
                    if let Some(block) = blocks.last_mut() {
                        block.directives.push((key, value));
                    }
                }
            }
        }

        Self { blocks }
    }

    fn values<'a>(&'a self, host: &'a str, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.blocks
            .iter()
            .filter(move |b| b.applies_to(host))
            .flat_map(move |b| {
                b.directives
                    .iter()
                    .filter(move |(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            })
    }
}

/// Keyword lookup across user and system config files.
#[derive(Debug, Clone, Default)]
pub struct SshConfigLookup {
    /// In precedence order (user file first)
    files: Vec<SshConfigFile>,
}

impl SshConfigLookup {
    /// Load config files in precedence order. Missing files are skipped.
    pub async fn load(paths: &[PathBuf]) -> Result<Self, SshConfigError> {
        let mut files = Vec::new();
        for path in paths {
            match read_config(path).await? {
                Some(content) => files.push(SshConfigFile::parse(&content)),
                None => tracing::debug!("[ssh-config] {:?} not present", path),
            }
        }
        Ok(Self { files })
    }

    pub fn from_contents(contents: &[&str]) -> Self {
        Self {
            files: contents.iter().map(|c| SshConfigFile::parse(c)).collect(),
        }
    }

    /// First value obtained for `key`, if any file sets it.
    pub fn explicit(&self, host: &str, key: &str) -> Option<String> {
        let key = key.to_ascii_lowercase();
        self.files
            .iter()
            .find_map(|f| f.values(host, &key).next().map(str::to_string))
    }

    /// First obtained value, else the OpenSSH default, else empty.
    pub fn get(&self, host: &str, key: &str) -> String {
        self.explicit(host, key)
            .or_else(|| default_value(key).map(str::to_string))
            .unwrap_or_default()
    }

    /// Every value for an accumulating keyword (IdentityFile), in order.
    pub fn get_all(&self, host: &str, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        let values: Vec<String> = self
            .files
            .iter()
            .flat_map(|f| f.values(host, &key).map(str::to_string).collect::<Vec<_>>())
            .collect();

        if values.is_empty() && key == "identityfile" {
            return DEFAULT_IDENTITY_FILES.iter().map(|s| s.to_string()).collect();
        }
        values
    }
}

async fn read_config(path: &Path) -> Result<Option<String>, SshConfigError> {
    match fs::read_to_string(path).await {
        Ok(c) => Ok(Some(c)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SshConfigError::Io(e)),
    }
}

/// A concrete (non-wildcard) Host alias, for listing importable hosts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshConfigHost {
    pub alias: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub identity_files: Vec<String>,
}

impl SshConfigHost {
    pub fn effective_hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.alias)
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(22)
    }
}

/// List concrete Host aliases with their own directives.
pub fn parse_ssh_config_content(content: &str) -> Vec<SshConfigHost> {
    SshConfigFile::parse(content)
        .blocks
        .iter()
        .filter_map(|block| {
            let BlockSelector::Host(patterns) = &block.selector else {
                return None;
            };
            let alias = patterns
                .iter()
                .find(|p| !p.contains('*') && !p.contains('?') && !p.starts_with('!'))?;

            let mut host = SshConfigHost {
                alias: alias.clone(),
                ..Default::default()
            };
            for (key, value) in &block.directives {
                match key.as_str() {
                    "hostname" => host.hostname = Some(value.clone()),
                    "user" => host.user = Some(value.clone()),
                    "port" => host.port = value.parse().ok(),
                    "identityfile" => host
                        .identity_files
                        .push(expand_tilde(value).to_string_lossy().into_owned()),
                    _ => {}
                }
            }
            Some(host)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const USER_CONFIG: &str = r#"
# Comment
Host prod
    HostName prod.example.com
    User admin
    Port=2222
    IdentityFile ~/.ssh/prod_ed25519

Host *.internal !bastion.internal
    User ops
    BatchMode yes

Match host something
    User never

Host *
    IdentityFile "~/.ssh/fallback"
    PreferredAuthentications publickey,password
"#;

    const SYSTEM_CONFIG: &str = r#"
Host *
    User system
    Port 2200
    IdentityFile /etc/ssh/shared_key
"#;

    #[test]
    fn test_first_obtained_value_wins() {
        let lookup = SshConfigLookup::from_contents(&[USER_CONFIG, SYSTEM_CONFIG]);
        assert_eq!(lookup.get("prod", "User"), "admin");
        assert_eq!(lookup.get("prod", "port"), "2222");
        assert_eq!(lookup.get("db.internal", "User"), "ops");
        assert_eq!(lookup.get("other", "User"), "system");
    }

    #[test]
    fn test_negation_vetoes_block() {
        let lookup = SshConfigLookup::from_contents(&[USER_CONFIG]);
        assert_eq!(lookup.get("db.internal", "BatchMode"), "yes");
        assert_eq!(lookup.get("bastion.internal", "BatchMode"), "no");
        assert!(lookup.explicit("bastion.internal", "User").is_none());
    }

    #[test]
    fn test_match_blocks_ignored() {
        let lookup = SshConfigLookup::from_contents(&[USER_CONFIG]);
        assert_ne!(lookup.get("something", "User"), "never");
    }

    #[test]
    fn test_defaults() {
        let lookup = SshConfigLookup::default();
        assert_eq!(lookup.get("any", "Port"), "22");
        assert_eq!(lookup.get("any", "PasswordAuthentication"), "yes");
        assert_eq!(lookup.get("any", "HostName"), "");
        assert_eq!(
            lookup.get_all("any", "IdentityFile"),
            vec!["~/.ssh/id_rsa", "~/.ssh/id_ecdsa", "~/.ssh/id_ed25519"]
        );
    }

    #[test]
    fn test_identity_files_accumulate() {
        let lookup = SshConfigLookup::from_contents(&[USER_CONFIG, SYSTEM_CONFIG]);
        assert_eq!(
            lookup.get_all("prod", "IdentityFile"),
            vec!["~/.ssh/prod_ed25519", "~/.ssh/fallback", "/etc/ssh/shared_key"]
        );
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_match("*.example.com", "A.EXAMPLE.com"));
        assert!(wildcard_match("host?", "host1"));
        assert!(!wildcard_match("host?", "host12"));
        assert!(wildcard_match("*", ""));
        assert!(match_pattern_list(["*", "!secret"], "public"));
        assert!(!match_pattern_list(["*", "!secret"], "secret"));
        assert!(!match_pattern_list(["!secret"], "public"));
    }

    #[test]
    fn test_parse_importable_hosts() {
        let hosts = parse_ssh_config_content(USER_CONFIG);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].alias, "prod");
        assert_eq!(hosts[0].effective_hostname(), "prod.example.com");
        assert_eq!(hosts[0].effective_port(), 2222);
        assert_eq!(hosts[0].identity_files.len(), 1);
    }

    #[tokio::test]
    async fn test_load_skips_missing_files() {
        let temp = tempfile::tempdir().unwrap();
        let present = temp.path().join("config");
        tokio::fs::write(&present, "Host x\n  User bob\n").await.unwrap();

        let lookup = SshConfigLookup::load(&[temp.path().join("absent"), present])
            .await
            .unwrap();
        assert_eq!(lookup.get("x", "user"), "bob");
    }
}

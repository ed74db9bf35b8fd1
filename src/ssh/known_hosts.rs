//! Known hosts management for SSH host key verification
//!
//! Builds one matcher from every readable known_hosts file configured for a
//! host (UserKnownHostsFile / GlobalKnownHostsFile) and drives the
//! trust-on-first-use and key-changed flows through [`UserInteraction`].
//!
//! Supported line syntax:
//! - `host1,host2,[host3]:2222 keytype base64key [comment]`
//! - `*`/`?` wildcards and `!` negation in host patterns
//! - hashed host names `|1|salt|hash` (HMAC-SHA1)
//! - `@revoked` marker (rejects the key for every host)
//! - `@cert-authority` lines are ignored

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use dashmap::DashMap;
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::keywords::SshKeywords;
use crate::config::expand_tilde;
use crate::config::ssh_config::match_pattern_list;
use crate::interaction::{Alert, UserInputRequest, UserInteraction};

/// Appends to the same file are serialized process-wide
static APPEND_LOCKS: LazyLock<DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>> =
    LazyLock::new(DashMap::new);

/// A host key as offered by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedHostKey {
    pub key_type: String,
    pub key_b64: String,
}

impl OfferedHostKey {
    pub fn new(key_type: impl Into<String>, key_b64: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            key_b64: key_b64.into(),
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            key_type: key.algorithm().as_str().to_string(),
            key_b64: BASE64.encode(key.public_key_bytes()),
        }
    }

    pub fn fingerprint(&self) -> String {
        fingerprint_from_b64(&self.key_b64)
    }
}

/// SHA256 fingerprint of a base64 public key blob
pub fn fingerprint_from_b64(key_b64: &str) -> String {
    match BASE64.decode(key_b64) {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let hash = hasher.finalize();
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Host field as written in known_hosts: `host` for port 22, else `[host]:port`
pub fn known_hosts_host(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

#[derive(Debug, Clone)]
enum HostField {
    Patterns(Vec<String>),
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl HostField {
    fn parse(field: &str) -> Option<Self> {
        if let Some(rest) = field.strip_prefix("|1|") {
            let (salt, hash) = rest.split_once('|')?;
            return Some(HostField::Hashed {
                salt: BASE64.decode(salt).ok()?,
                hash: BASE64.decode(hash).ok()?,
            });
        }
        Some(HostField::Patterns(
            field.split(',').map(|s| s.to_lowercase()).collect(),
        ))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            HostField::Patterns(patterns) => {
                match_pattern_list(patterns.iter().map(String::as_str), name)
            }
            HostField::Hashed { salt, hash } => {
                let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, salt);
                ring::hmac::verify(&key, name.as_bytes(), hash).is_ok()
            }
        }
    }
}

#[derive(Debug, Clone)]
struct KnownHostLine {
    revoked: bool,
    hosts: HostField,
    key_type: String,
    key_b64: String,
    path: PathBuf,
}

impl KnownHostLine {
    fn parse(line: &str, path: &Path) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let mut parts = line.split_whitespace().peekable();
        let mut revoked = false;
        if let Some(marker) = parts.peek().and_then(|p| p.strip_prefix('@')) {
            match marker {
                "revoked" => revoked = true,
                // cert-authority and unknown markers
                _ => return None,
            }
            parts.next();
        }

        let hosts = HostField::parse(parts.next()?)?;
        let key_type = parts.next()?.to_string();
        let key_b64 = parts.next()?.to_string();
        Some(Self {
            revoked,
            hosts,
            key_type,
            key_b64,
            path: path.to_path_buf(),
        })
    }

    fn same_key(&self, key: &OfferedHostKey) -> bool {
        self.key_type == key.key_type && self.key_b64 == key.key_b64
    }
}

/// A stored key that conflicts with the offered one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownKey {
    pub path: PathBuf,
    pub key_type: String,
    pub fingerprint: String,
}

/// Result of checking an offered key against the matcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    Verified,
    Revoked,
    /// Host absent from every file
    Unknown,
    /// Host present with different keys
    Changed { want: Vec<KnownKey> },
}

/// Parsed lines from all readable files
#[derive(Debug, Default)]
struct HostKeyMatcher {
    lines: Vec<KnownHostLine>,
}

impl HostKeyMatcher {
    fn add_file(&mut self, path: &Path, content: &str) {
        self.lines
            .extend(content.lines().filter_map(|l| KnownHostLine::parse(l, path)));
    }

    fn check(&self, names: &[String], key: &OfferedHostKey) -> HostKeyVerification {
        if self.lines.iter().any(|l| l.revoked && l.same_key(key)) {
            return HostKeyVerification::Revoked;
        }

        let mut want = Vec::new();
        for line in self.lines.iter().filter(|l| !l.revoked) {
            if !names.iter().any(|n| line.hosts.matches(n)) {
                continue;
            }
            if line.same_key(key) {
                return HostKeyVerification::Verified;
            }
            want.push(KnownKey {
                path: line.path.clone(),
                key_type: line.key_type.clone(),
                fingerprint: fingerprint_from_b64(&line.key_b64),
            });
        }

        if want.is_empty() {
            HostKeyVerification::Unknown
        } else {
            HostKeyVerification::Changed { want }
        }
    }
}

/// Known-hosts locations for the current OS user.
/// root only consults global files; everyone else user files first.
pub fn known_hosts_paths(keywords: &SshKeywords) -> Vec<PathBuf> {
    resolve_paths(
        &keywords.user_known_hosts_files,
        &keywords.global_known_hosts_files,
        whoami::username() == "root",
    )
}

fn resolve_paths(user: &[String], global: &[String], is_root: bool) -> Vec<PathBuf> {
    let files: Vec<&String> = if is_root {
        global.iter().collect()
    } else {
        user.iter().chain(global.iter()).collect()
    };
    files
        .into_iter()
        .filter(|f| !f.is_empty() && f.as_str() != "none")
        .map(|f| expand_tilde(f))
        .collect()
}

#[derive(Debug, Default)]
struct KnownHostsFiles {
    readable: Vec<PathBuf>,
    unreadable: Vec<PathBuf>,
}

/// Host trust decisions for one connection attempt
pub struct HostTrustStore {
    files: RwLock<KnownHostsFiles>,
    matcher: RwLock<HostKeyMatcher>,
    interaction: Arc<dyn UserInteraction>,
    prompt_timeout: Duration,
}

impl HostTrustStore {
    /// Read every configured file. Unreadable files are remembered as
    /// creation targets; no files at all is a configuration error.
    pub async fn load(
        paths: Vec<PathBuf>,
        interaction: Arc<dyn UserInteraction>,
        prompt_timeout: Duration,
    ) -> Result<Self, SshError> {
        if paths.is_empty() {
            return Err(SshError::KnownHostsConfig(
                "no known_hosts files configured".to_string(),
            ));
        }

        let store = Self {
            files: RwLock::new(KnownHostsFiles::default()),
            matcher: RwLock::new(HostKeyMatcher::default()),
            interaction,
            prompt_timeout,
        };

        let mut files = KnownHostsFiles::default();
        let mut matcher = HostKeyMatcher::default();
        for path in paths {
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    matcher.add_file(&path, &content);
                    files.readable.push(path);
                }
                Err(e) => {
                    debug!("[known-hosts] {:?} unreadable: {}", path, e);
                    files.unreadable.push(path);
                }
            }
        }
        info!(
            "[known-hosts] Loaded {} entries from {} files ({} unreadable)",
            matcher.lines.len(),
            files.readable.len(),
            files.unreadable.len()
        );

        *store.files.write() = files;
        *store.matcher.write() = matcher;
        Ok(store)
    }

    pub fn readable_files(&self) -> Vec<PathBuf> {
        self.files.read().readable.clone()
    }

    pub fn unreadable_files(&self) -> Vec<PathBuf> {
        self.files.read().unreadable.clone()
    }

    /// Check without any prompting.
    pub fn check(
        &self,
        hostname: &str,
        port: u16,
        remote_addr: Option<SocketAddr>,
        key: &OfferedHostKey,
    ) -> HostKeyVerification {
        let names = lookup_names(hostname, port, remote_addr);
        self.matcher.read().check(&names, key)
    }

    /// Verify the offered key, prompting for trust-on-first-use.
    pub async fn verify(
        &self,
        hostname: &str,
        port: u16,
        remote_addr: Option<SocketAddr>,
        key: &OfferedHostKey,
    ) -> Result<(), SshError> {
        match self.check(hostname, port, remote_addr, key) {
            HostKeyVerification::Verified => {
                debug!("[known-hosts] Host key verified for {}:{}", hostname, port);
                Ok(())
            }
            HostKeyVerification::Revoked => {
                warn!(
                    "[known-hosts] Revoked {} key offered by {}:{}",
                    key.key_type, hostname, port
                );
                Err(SshError::HostKeyRevoked {
                    host: known_hosts_host(hostname, port),
                })
            }
            HostKeyVerification::Changed { want } => {
                warn!(
                    "[known-hosts] HOST KEY CHANGED for {}:{} (got {})",
                    hostname,
                    port,
                    key.fingerprint()
                );
                self.interaction.alert(self.changed_alert(key, &want));
                Err(SshError::HostKeyChanged {
                    host: known_hosts_host(hostname, port),
                    fingerprint: key.fingerprint(),
                })
            }
            HostKeyVerification::Unknown => {
                self.trust_on_first_use(hostname, port, remote_addr, key)
                    .await?;
                self.reload().await;
                match self.check(hostname, port, remote_addr, key) {
                    HostKeyVerification::Verified => Ok(()),
                    other => Err(SshError::ConnectionFailed(format!(
                        "host key for {} still not trusted after update: {:?}",
                        known_hosts_host(hostname, port),
                        other
                    ))),
                }
            }
        }
    }

    async fn trust_on_first_use(
        &self,
        hostname: &str,
        port: u16,
        remote_addr: Option<SocketAddr>,
        key: &OfferedHostKey,
    ) -> Result<PathBuf, SshError> {
        let line = format!(
            "{} {} {}",
            known_hosts_host(hostname, port),
            key.key_type,
            key.key_b64
        );
        let (readable, unreadable) = {
            let files = self.files.read();
            (files.readable.clone(), files.unreadable.clone())
        };

        for path in &readable {
            let query = self.missing_key_query(hostname, remote_addr, key, path);
            match self
                .confirm_and_append(path, &line, "Known Hosts Key Missing", query)
                .await
            {
                Ok(()) => return Ok(path.clone()),
                Err(e) if e.is_user_cancelled() => return Err(e),
                Err(e) => warn!("[known-hosts] Could not update {:?}: {}", path, e),
            }
        }

        for path in &unreadable {
            let query = self.missing_file_query(hostname, remote_addr, key, path);
            match self
                .confirm_and_append(path, &line, "Known Hosts File Missing", query)
                .await
            {
                Ok(()) => {
                    let mut files = self.files.write();
                    files.unreadable.retain(|p| p != path);
                    files.readable.push(path.clone());
                    return Ok(path.clone());
                }
                Err(e) if e.is_user_cancelled() => return Err(e),
                Err(e) => warn!("[known-hosts] Could not create {:?}: {}", path, e),
            }
        }

        Err(SshError::KnownHostsConfig(format!(
            "unable to add the host key for {} to any known_hosts file",
            known_hosts_host(hostname, port)
        )))
    }

    /// Open for append, ask, then write one line. Holds the per-file lock
    /// for the whole sequence.
    async fn confirm_and_append(
        &self,
        path: &Path,
        line: &str,
        title: &str,
        query: String,
    ) -> Result<(), SshError> {
        let lock = APPEND_LOCKS
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let mut file = open_for_append(path).await?;

        let request = UserInputRequest::confirm(title, query).with_markdown();
        let response = self
            .interaction
            .request_input(request, self.prompt_timeout)
            .await
            .map_err(|e| SshError::from_prompt("host key confirmation", e))?;
        if !response.confirmed() {
            return Err(SshError::UserCancelled(
                "host key was not trusted".to_string(),
            ));
        }

        let needs_newline = match tokio::fs::read(path).await {
            Ok(existing) => existing.last().is_some_and(|b| *b != b'\n'),
            Err(_) => false,
        };
        let mut text = String::new();
        if needs_newline {
            text.push('\n');
        }
        text.push_str(line);
        text.push('\n');
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;

        info!("[known-hosts] Added host key line to {:?}", path);
        Ok(())
    }

    async fn reload(&self) {
        let readable = self.files.read().readable.clone();
        let mut matcher = HostKeyMatcher::default();
        for path in &readable {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => matcher.add_file(path, &content),
                Err(e) => warn!("[known-hosts] Re-reading {:?} failed: {}", path, e),
            }
        }
        *self.matcher.write() = matcher;
    }

    fn missing_key_query(
        &self,
        hostname: &str,
        remote_addr: Option<SocketAddr>,
        key: &OfferedHostKey,
        path: &Path,
    ) -> String {
        format!(
            "The authenticity of host '{}' ({}) can't be established because it **does not exist in any checked known_hosts files**. \
             The host provides this {} key:  \n{}\n\n\
             **Would you like to continue connecting?** If so, the key will be permanently added to `{}`.",
            hostname,
            display_addr(remote_addr),
            key.key_type,
            key.fingerprint(),
            path.display()
        )
    }

    fn missing_file_query(
        &self,
        hostname: &str,
        remote_addr: Option<SocketAddr>,
        key: &OfferedHostKey,
        path: &Path,
    ) -> String {
        format!(
            "None of the known_hosts files could be read. The authenticity of host '{}' ({}) can't be established. \
             The host provides this {} key:  \n{}\n\n\
             **Would you like to continue connecting?** If so, `{}` will be created and the key added to it.",
            hostname,
            display_addr(remote_addr),
            key.key_type,
            key.fingerprint(),
            path.display()
        )
    }

    fn changed_alert(&self, key: &OfferedHostKey, want: &[KnownKey]) -> Alert {
        let files = self.readable_files();
        let mut message = String::from(
            "**WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!**\n\n\
             IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY!\n\
             Someone could be eavesdropping on you right now (man-in-the-middle attack)!\n\
             It is also possible that a host key has just been changed.\n\n",
        );
        message.push_str(&format!(
            "The fingerprint for the {} key sent by the remote host is:  \n{}\n\n",
            key.key_type,
            key.fingerprint()
        ));
        message.push_str("Checked known_hosts files:\n");
        for path in &files {
            message.push_str(&format!("- `{}`\n", path.display()));
        }
        message.push_str("\nOffending keys:\n");
        for known in want {
            message.push_str(&format!(
                "- {} {} in `{}`\n",
                known.key_type,
                known.fingerprint,
                known.path.display()
            ));
        }
        message.push_str("\nRemove the offending keys once the change is verified, then reconnect.");

        Alert {
            title: "Known Hosts Key Changed".to_string(),
            message,
            markdown: true,
        }
    }
}

fn display_addr(remote_addr: Option<SocketAddr>) -> String {
    remote_addr
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown address".to_string())
}

/// Names a known_hosts line may use for this host: the host name and the
/// resolved address, each in `[x]:port` form for non-22 ports.
fn lookup_names(hostname: &str, port: u16, remote_addr: Option<SocketAddr>) -> Vec<String> {
    let mut names = vec![known_hosts_host(hostname, port)];
    if let Some(addr) = remote_addr {
        let addr_name = known_hosts_host(&addr.ip().to_string(), port);
        if !names.contains(&addr_name) {
            names.push(addr_name);
        }
    }
    names
}

async fn open_for_append(path: &Path) -> Result<tokio::fs::File, SshError> {
    if let Some(parent) = path.parent() {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(parent).await?;
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    options.mode(0o644);
    Ok(options.open(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::testing::ScriptedInteraction;
    use crate::interaction::PromptError;
    use tempfile::tempdir;

    fn key(seed: &str) -> OfferedHostKey {
        OfferedHostKey::new("ssh-ed25519", BASE64.encode(seed.as_bytes()))
    }

    async fn store_with(
        paths: Vec<PathBuf>,
        ui: Arc<ScriptedInteraction>,
    ) -> HostTrustStore {
        HostTrustStore::load(paths, ui, Duration::from_secs(1))
            .await
            .unwrap()
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .map(|c| c.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn test_known_hosts_host() {
        assert_eq!(known_hosts_host("GitHub.com", 22), "github.com");
        assert_eq!(known_hosts_host("server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn test_resolve_paths() {
        let user = vec!["/u/known_hosts".to_string()];
        let global = vec!["/etc/ssh/ssh_known_hosts".to_string(), "none".to_string()];
        assert_eq!(
            resolve_paths(&user, &global, false),
            vec![
                PathBuf::from("/u/known_hosts"),
                PathBuf::from("/etc/ssh/ssh_known_hosts")
            ]
        );
        assert_eq!(
            resolve_paths(&user, &global, true),
            vec![PathBuf::from("/etc/ssh/ssh_known_hosts")]
        );
    }

    #[tokio::test]
    async fn test_no_files_is_config_error() {
        let ui = Arc::new(ScriptedInteraction::new());
        let result = HostTrustStore::load(Vec::new(), ui, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SshError::KnownHostsConfig(_))));
    }

    #[tokio::test]
    async fn test_verified_by_pattern_and_port() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let k = key("server-key");
        std::fs::write(
            &path,
            format!(
                "# comment\n*.example.com,!evil.example.com {} {}\n[alt.host]:2222 {} {}\n",
                k.key_type, k.key_b64, k.key_type, k.key_b64
            ),
        )
        .unwrap();

        let ui = Arc::new(ScriptedInteraction::new());
        let store = store_with(vec![path], ui.clone()).await;

        store.verify("web.example.com", 22, None, &k).await.unwrap();
        store.verify("alt.host", 2222, None, &k).await.unwrap();
        assert_eq!(
            store.check("evil.example.com", 22, None, &k),
            HostKeyVerification::Unknown
        );
        assert_eq!(
            store.check("alt.host", 22, None, &k),
            HostKeyVerification::Unknown
        );
        assert_eq!(ui.request_count(), 0);
    }

    #[tokio::test]
    async fn test_verified_by_remote_address() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let k = key("server-key");
        std::fs::write(&path, format!("10.0.0.5 {} {}\n", k.key_type, k.key_b64)).unwrap();

        let ui = Arc::new(ScriptedInteraction::new());
        let store = store_with(vec![path], ui).await;
        let addr: SocketAddr = "10.0.0.5:22".parse().unwrap();
        store.verify("box", 22, Some(addr), &k).await.unwrap();
    }

    #[tokio::test]
    async fn test_hashed_host_name() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let k = key("server-key");

        let salt = b"0123456789abcdefghij";
        let hmac_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, salt);
        let tag = ring::hmac::sign(&hmac_key, b"hashed.example.com");
        std::fs::write(
            &path,
            format!(
                "|1|{}|{} {} {}\n",
                BASE64.encode(salt),
                BASE64.encode(tag.as_ref()),
                k.key_type,
                k.key_b64
            ),
        )
        .unwrap();

        let ui = Arc::new(ScriptedInteraction::new());
        let store = store_with(vec![path], ui).await;
        assert_eq!(
            store.check("hashed.example.com", 22, None, &k),
            HostKeyVerification::Verified
        );
        assert_eq!(
            store.check("other.example.com", 22, None, &k),
            HostKeyVerification::Unknown
        );
    }

    #[tokio::test]
    async fn test_revoked_never_prompts() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let k = key("stolen-key");
        std::fs::write(
            &path,
            format!(
                "@revoked * {} {}\n@cert-authority *.corp ssh-rsa AAAA\n",
                k.key_type, k.key_b64
            ),
        )
        .unwrap();

        let ui = Arc::new(ScriptedInteraction::new());
        ui.push_confirm(true);
        let store = store_with(vec![path.clone()], ui.clone()).await;

        let err = store.verify("anything", 22, None, &k).await.unwrap_err();
        assert!(matches!(err, SshError::HostKeyRevoked { .. }));
        assert_eq!(ui.request_count(), 0);
        assert_eq!(line_count(&path), 2);
    }

    #[tokio::test]
    async fn test_trust_on_first_use_appends_once() {
        let temp = tempdir().unwrap();
        let first = temp.path().join("known_hosts");
        let second = temp.path().join("known_hosts2");
        std::fs::write(&first, "other.host ssh-ed25519 AAAA").unwrap();
        std::fs::write(&second, "").unwrap();
        let k = key("new-key");

        let ui = Arc::new(ScriptedInteraction::new());
        ui.push_confirm(true);
        let store = store_with(vec![first.clone(), second.clone()], ui.clone()).await;

        store.verify("fresh.host", 2222, None, &k).await.unwrap();
        assert_eq!(ui.request_count(), 1);
        {
            let requests = ui.requests.lock();
            assert_eq!(requests[0].title, "Known Hosts Key Missing");
            assert!(requests[0].query_text.contains(&k.fingerprint()));
        }

        let content = std::fs::read_to_string(&first).unwrap();
        assert_eq!(
            content,
            format!(
                "other.host ssh-ed25519 AAAA\n[fresh.host]:2222 {} {}\n",
                k.key_type, k.key_b64
            )
        );
        assert_eq!(line_count(&second), 0);

        // second verification is silent
        store.verify("fresh.host", 2222, None, &k).await.unwrap();
        assert_eq!(ui.request_count(), 1);
    }

    #[tokio::test]
    async fn test_declined_trust_is_user_cancelled() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        std::fs::write(&path, "").unwrap();

        let ui = Arc::new(ScriptedInteraction::new());
        ui.push_confirm(false);
        ui.push_confirm(true);
        let store = store_with(vec![path.clone()], ui.clone()).await;

        let err = store.verify("h", 22, None, &key("k")).await.unwrap_err();
        assert!(err.is_user_cancelled());
        assert_eq!(ui.request_count(), 1);
        assert_eq!(line_count(&path), 0);
    }

    #[tokio::test]
    async fn test_cancelled_prompt_is_user_cancelled() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        std::fs::write(&path, "").unwrap();

        let ui = Arc::new(ScriptedInteraction::new());
        ui.push_error(PromptError::Cancelled);
        let store = store_with(vec![path], ui).await;

        let err = store.verify("h", 22, None, &key("k")).await.unwrap_err();
        assert!(err.is_user_cancelled());
    }

    #[tokio::test]
    async fn test_missing_file_is_created() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ssh").join("known_hosts");

        let ui = Arc::new(ScriptedInteraction::new());
        ui.push_confirm(true);
        let store = store_with(vec![path.clone()], ui.clone()).await;
        assert_eq!(store.unreadable_files(), vec![path.clone()]);

        let k = key("k");
        store.verify("h", 22, None, &k).await.unwrap();
        assert_eq!(ui.requests.lock()[0].title, "Known Hosts File Missing");
        assert_eq!(line_count(&path), 1);
        assert_eq!(store.readable_files(), vec![path]);
    }

    #[tokio::test]
    async fn test_changed_key_alerts_and_fails() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts");
        let old = key("old-key");
        std::fs::write(&path, format!("box {} {}\n", old.key_type, old.key_b64)).unwrap();

        let ui = Arc::new(ScriptedInteraction::new());
        ui.push_confirm(true);
        let store = store_with(vec![path.clone()], ui.clone()).await;

        let new = key("new-key");
        let err = store.verify("box", 22, None, &new).await.unwrap_err();
        assert_eq!(err.to_string(), "remote host identification has changed");
        assert_eq!(ui.request_count(), 0);

        let alerts = ui.alerts.lock();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0]
            .message
            .contains("WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!"));
        assert!(alerts[0].message.contains(&old.fingerprint()));
        assert!(alerts[0].message.contains(&path.display().to_string()));
        assert_eq!(line_count(&path), 1);
    }
}

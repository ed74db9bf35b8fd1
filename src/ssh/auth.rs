//! SSH Authentication Strategies
//!
//! One stateful strategy object per method. Each call advances its own
//! cursor; the negotiator in `client.rs` owns the retry budget and talks to
//! the server.
//!
//! Credential failures (unparsable key, wrong passphrase) are absorbed as
//! [`KeyAttempt::Skip`]. A cancelled or declined prompt is returned as
//! [`SshError::UserCancelled`] and aborts the whole negotiation.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PrivateKey;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::error::SshError;
use super::keywords::{AuthMethodKind, SshKeywords};
use crate::config::expand_tilde;
use crate::interaction::{UserInputRequest, UserInteraction};

/// Attempts for password / keyboard-interactive outside batch mode
pub const INTERACTIVE_RETRIES: usize = 2;
/// Attempts for password / keyboard-interactive in batch mode
pub const BATCH_RETRIES: usize = 1;

/// How many times the negotiator may invoke a method's strategy.
pub fn retry_budget(method: AuthMethodKind, keywords: &SshKeywords) -> usize {
    match method {
        AuthMethodKind::PublicKey => keywords.identity_files.len(),
        AuthMethodKind::KeyboardInteractive | AuthMethodKind::Password => {
            if keywords.batch_mode {
                BATCH_RETRIES
            } else {
                INTERACTIVE_RETRIES
            }
        }
    }
}

/// Shared inputs for every strategy of one connection attempt
pub struct AuthContext {
    /// Remote display name shown in prompts
    pub display_name: String,
    pub user: String,
    pub batch_mode: bool,
    pub stored_password: Option<Zeroizing<String>>,
    pub interaction: Arc<dyn UserInteraction>,
    pub prompt_timeout: Duration,
}

impl AuthContext {
    async fn ask_text(&self, title: &str, query: String) -> Result<Zeroizing<String>, SshError> {
        let response = self
            .interaction
            .request_input(UserInputRequest::text(title, query), self.prompt_timeout)
            .await
            .map_err(|e| SshError::from_prompt(title, e))?;
        Ok(Zeroizing::new(response.text.unwrap_or_default()))
    }
}

/// Outcome of advancing the publickey cursor
pub enum KeyAttempt {
    /// Offer this key to the server
    Key { path: PathBuf, key: PrivateKey },
    /// This identity cannot be used; counts as a spent attempt
    Skip { path: PathBuf, reason: String },
}

/// Publickey strategy: a queue of identity files consumed one per attempt.
pub struct PublicKeyStrategy {
    /// (path, file contents), unreadable files already dropped
    identities: VecDeque<(PathBuf, Zeroizing<String>)>,
    ctx: Arc<AuthContext>,
}

impl PublicKeyStrategy {
    pub async fn load(identity_files: &[String], ctx: Arc<AuthContext>) -> Self {
        let mut identities = VecDeque::new();
        for file in identity_files {
            let path = expand_tilde(file);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => identities.push_back((path, Zeroizing::new(content))),
                Err(e) => debug!("[ssh-auth] Dropping identity {:?}: {}", path, e),
            }
        }
        Self { identities, ctx }
    }

    pub fn remaining(&self) -> usize {
        self.identities.len()
    }

    /// Pull the next identity. `Ok(None)` means the queue is exhausted.
    pub async fn next_key(&mut self) -> Result<Option<KeyAttempt>, SshError> {
        let Some((path, pem)) = self.identities.pop_front() else {
            return Ok(None);
        };

        let err = match russh::keys::decode_secret_key(&pem, None) {
            Ok(key) => return Ok(Some(KeyAttempt::Key { path, key })),
            Err(e) => e,
        };

        if !needs_passphrase(&pem, &err) {
            warn!("[ssh-auth] Skipping identity {:?}: {}", path, err);
            return Ok(Some(KeyAttempt::Skip {
                path,
                reason: err.to_string(),
            }));
        }

        // The stored password often doubles as the key passphrase
        if let Some(stored) = &self.ctx.stored_password {
            if let Ok(key) = russh::keys::decode_secret_key(&pem, Some(stored.as_str())) {
                debug!("[ssh-auth] Stored secret unlocked {:?}", path);
                return Ok(Some(KeyAttempt::Key { path, key }));
            }
        }

        if self.ctx.batch_mode {
            return Ok(Some(KeyAttempt::Skip {
                path,
                reason: "passphrase required in batch mode".to_string(),
            }));
        }

        let passphrase = self
            .ctx
            .ask_text(
                "Publickey Auth + Passphrase",
                format!("Enter passphrase for the SSH key: {}", path.display()),
            )
            .await?;

        match russh::keys::decode_secret_key(&pem, Some(passphrase.as_str())) {
            Ok(key) => Ok(Some(KeyAttempt::Key { path, key })),
            Err(e) => {
                warn!("[ssh-auth] Passphrase rejected for {:?}: {}", path, e);
                Ok(Some(KeyAttempt::Skip {
                    path,
                    reason: e.to_string(),
                }))
            }
        }
    }
}

fn needs_passphrase(pem: &str, err: &russh::keys::Error) -> bool {
    matches!(err, russh::keys::Error::KeyIsEncrypted) || pem.contains("ENCRYPTED")
}

/// Password strategy: stored password once, then interactive prompts.
pub struct PasswordStrategy {
    ctx: Arc<AuthContext>,
    stored_used: bool,
}

impl PasswordStrategy {
    pub fn new(ctx: Arc<AuthContext>) -> Self {
        Self {
            ctx,
            stored_used: false,
        }
    }

    /// `Ok(None)` when nothing more can be offered.
    pub async fn next_password(&mut self) -> Result<Option<Zeroizing<String>>, SshError> {
        if !self.stored_used {
            self.stored_used = true;
            if let Some(stored) = &self.ctx.stored_password {
                return Ok(Some(stored.clone()));
            }
        }

        if self.ctx.batch_mode {
            return Ok(None);
        }

        let password = self
            .ctx
            .ask_text(
                "Password Authentication",
                format!(
                    "Password for {}@{}:",
                    self.ctx.user, self.ctx.display_name
                ),
            )
            .await?;
        Ok(Some(password))
    }
}

/// One keyboard-interactive question
#[derive(Debug, Clone)]
pub struct KbiQuestion {
    pub prompt: String,
    pub echo: bool,
}

/// Keyboard-interactive strategy.
///
/// The first round answers with the stored password for password-like
/// questions and empty strings for the rest; later rounds ask the user.
pub struct KeyboardInteractiveStrategy {
    ctx: Arc<AuthContext>,
    stored_used: bool,
}

impl KeyboardInteractiveStrategy {
    pub fn new(ctx: Arc<AuthContext>) -> Self {
        Self {
            ctx,
            stored_used: false,
        }
    }

    /// Answers for one info request; `Ok(None)` when nothing more can be offered.
    pub async fn answer(
        &mut self,
        name: &str,
        instructions: &str,
        questions: &[KbiQuestion],
    ) -> Result<Option<Vec<String>>, SshError> {
        if questions.is_empty() {
            return Ok(Some(Vec::new()));
        }

        if !self.stored_used {
            self.stored_used = true;
            if let Some(stored) = &self.ctx.stored_password {
                let answers = questions
                    .iter()
                    .map(|q| {
                        if q.prompt.to_lowercase().contains("password") {
                            stored.to_string()
                        } else {
                            String::new()
                        }
                    })
                    .collect();
                return Ok(Some(answers));
            }
        }

        if self.ctx.batch_mode {
            return Ok(None);
        }

        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            let mut query = String::new();
            for part in [name, instructions] {
                if !part.is_empty() {
                    query.push_str(part);
                    query.push('\n');
                }
            }
            query.push_str(&question.prompt);

            let answer = self
                .ctx
                .ask_text("Keyboard Interactive Authentication", query)
                .await?;
            answers.push(answer.to_string());
        }
        Ok(Some(answers))
    }
}

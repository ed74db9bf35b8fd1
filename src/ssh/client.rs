//! SSH Session Negotiator using russh
//!
//! Resolves keywords, loads the host-trust store, opens the transport and
//! walks the enabled authentication methods in preferred order, each with
//! its own retry budget.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use russh::*;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::auth::{
    retry_budget, AuthContext, KbiQuestion, KeyAttempt, KeyboardInteractiveStrategy,
    PasswordStrategy, PublicKeyStrategy,
};
use super::error::SshError;
use super::keywords::{combine_keywords, find_config_keywords, AuthMethodKind, SshKeywords};
use super::known_hosts::{known_hosts_paths, HostTrustStore, OfferedHostKey};
use crate::config::{
    Keychain, KeychainError, RemoteDefinition, RemoteSettings, SecretStore, SshConfigLookup,
};
use crate::interaction::UserInteraction;

/// An authenticated SSH connection
pub struct SshTransport {
    handle: client::Handle<ClientHandler>,
    keywords: SshKeywords,
}

impl SshTransport {
    pub fn keywords(&self) -> &SshKeywords {
        &self.keywords
    }

    /// Open a session channel and start `command` on it.
    pub async fn exec(&self, command: &str) -> Result<Channel<client::Msg>, SshError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(e.to_string()))?;
        debug!("[ssh] exec started: {}", command);
        Ok(channel)
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("[ssh] disconnect: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// Produces authenticated transports for ssh remotes
pub struct SshNegotiator {
    settings: Arc<RemoteSettings>,
    interaction: Arc<dyn UserInteraction>,
    secrets: Arc<dyn SecretStore>,
}

impl SshNegotiator {
    pub fn new(settings: Arc<RemoteSettings>, interaction: Arc<dyn UserInteraction>) -> Self {
        Self {
            settings,
            interaction,
            secrets: Arc::new(Keychain::new()),
        }
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretStore>) -> Self {
        self.secrets = secrets;
        self
    }

    /// The remote's stored password: in memory if just entered, otherwise
    /// from the keychain. A keychain failure means prompting instead.
    pub fn stored_password(&self, remote: &RemoteDefinition) -> Option<Zeroizing<String>> {
        if let Some(password) = &remote.password {
            return Some(Zeroizing::new(password.clone()));
        }
        let id = remote.password_keychain_id.as_deref()?;
        match self.secrets.get(id) {
            Ok(secret) => Some(Zeroizing::new(secret)),
            Err(KeychainError::NotFound(_)) => {
                warn!("[ssh-auth] Stored password for '{}' is gone", remote.name);
                None
            }
            Err(e) => {
                warn!("[ssh-auth] Keychain lookup for '{}' failed: {}", remote.name, e);
                None
            }
        }
    }

    /// Merge keywords for `remote` from the configured ssh_config files.
    pub async fn resolve_keywords(
        &self,
        remote: &RemoteDefinition,
    ) -> Result<SshKeywords, SshError> {
        let lookup = SshConfigLookup::load(&self.settings.ssh_config_files())
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("reading ssh config: {}", e)))?;
        Ok(combine_keywords(remote, find_config_keywords(&lookup, &remote.host)))
    }

    /// Open and authenticate a transport to `remote`.
    pub async fn connect(
        &self,
        remote: &RemoteDefinition,
        display_name: &str,
    ) -> Result<SshTransport, SshError> {
        let keywords = self.resolve_keywords(remote).await?;
        let port = keywords.port_number().ok_or_else(|| {
            SshError::ConnectionFailed(format!("invalid port '{}'", keywords.port))
        })?;

        let trust = Arc::new(
            HostTrustStore::load(
                known_hosts_paths(&keywords),
                self.interaction.clone(),
                self.settings.prompt_timeout(),
            )
            .await?,
        );

        info!(
            "[ssh] Connecting to {}@{}:{} ({})",
            keywords.user, keywords.hostname, port, display_name
        );

        let socket_addr = tokio::net::lookup_host((keywords.hostname.as_str(), port))
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let stream = tokio::time::timeout(
            self.settings.ssh_connect_timeout(),
            tokio::net::TcpStream::connect(socket_addr),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler {
            trust,
            host: keywords.hostname.clone(),
            port,
            remote_addr: Some(socket_addr),
        };

        // Host key prompts run inside the handshake, so no timeout here
        let mut handle = client::connect_stream(Arc::new(ssh_config), stream, handler).await?;
        debug!("[ssh] Handshake completed");

        let ctx = Arc::new(AuthContext {
            display_name: display_name.to_string(),
            user: keywords.user.clone(),
            batch_mode: keywords.batch_mode,
            stored_password: self.stored_password(remote),
            interaction: self.interaction.clone(),
            prompt_timeout: self.settings.prompt_timeout(),
        });

        authenticate(&mut handle, &keywords, ctx).await?;
        info!("[ssh] Authenticated to {} as {}", display_name, keywords.user);

        Ok(SshTransport { handle, keywords })
    }
}

/// What the server said to one keyboard-interactive step
pub enum KbiStep {
    Success,
    Failure,
    Info {
        name: String,
        instructions: String,
        questions: Vec<KbiQuestion>,
    },
}

impl From<client::KeyboardInteractiveAuthResponse> for KbiStep {
    fn from(response: client::KeyboardInteractiveAuthResponse) -> Self {
        match response {
            client::KeyboardInteractiveAuthResponse::Success => KbiStep::Success,
            client::KeyboardInteractiveAuthResponse::Failure { .. } => KbiStep::Failure,
            client::KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => KbiStep::Info {
                name,
                instructions,
                questions: prompts
                    .into_iter()
                    .map(|p| KbiQuestion {
                        prompt: p.prompt,
                        echo: p.echo,
                    })
                    .collect(),
            },
        }
    }
}

/// Server side of user authentication
#[async_trait]
pub trait AuthSession: Send {
    /// True when the server accepted the key
    async fn publickey(&mut self, user: &str, key: PrivateKey) -> Result<bool, SshError>;
    async fn password(&mut self, user: &str, password: &str) -> Result<bool, SshError>;
    async fn kbi_start(&mut self, user: &str) -> Result<KbiStep, SshError>;
    async fn kbi_respond(&mut self, answers: Vec<String>) -> Result<KbiStep, SshError>;
}

#[async_trait]
impl AuthSession for client::Handle<ClientHandler> {
    async fn publickey(&mut self, user: &str, key: PrivateKey) -> Result<bool, SshError> {
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        Ok(self.authenticate_publickey(user, key).await?.success())
    }

    async fn password(&mut self, user: &str, password: &str) -> Result<bool, SshError> {
        Ok(self.authenticate_password(user, password).await?.success())
    }

    async fn kbi_start(&mut self, user: &str) -> Result<KbiStep, SshError> {
        let response = self
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;
        Ok(response.into())
    }

    async fn kbi_respond(&mut self, answers: Vec<String>) -> Result<KbiStep, SshError> {
        let response = self
            .authenticate_keyboard_interactive_respond(answers)
            .await?;
        Ok(response.into())
    }
}

/// Try every enabled method until one succeeds.
pub async fn authenticate(
    session: &mut dyn AuthSession,
    keywords: &SshKeywords,
    ctx: Arc<AuthContext>,
) -> Result<(), SshError> {
    let methods = keywords.enabled_methods();
    if methods.is_empty() {
        return Err(SshError::AuthenticationFailed(
            "no supported authentication methods enabled".to_string(),
        ));
    }

    for method in methods {
        let budget = retry_budget(method, keywords);
        debug!("[ssh-auth] Trying {} ({} attempts)", method.as_str(), budget);

        let ok = match method {
            AuthMethodKind::PublicKey => {
                try_publickey(session, &keywords.user, ctx.clone(), keywords, budget).await?
            }
            AuthMethodKind::Password => {
                try_password(session, &keywords.user, ctx.clone(), budget).await?
            }
            AuthMethodKind::KeyboardInteractive => {
                try_keyboard_interactive(session, &keywords.user, ctx.clone(), budget).await?
            }
        };
        if ok {
            info!("[ssh-auth] {} succeeded", method.as_str());
            return Ok(());
        }
        debug!("[ssh-auth] {} exhausted", method.as_str());
    }

    Err(SshError::AuthenticationFailed(
        "all authentication methods exhausted".to_string(),
    ))
}

async fn try_publickey(
    session: &mut dyn AuthSession,
    user: &str,
    ctx: Arc<AuthContext>,
    keywords: &SshKeywords,
    budget: usize,
) -> Result<bool, SshError> {
    let mut strategy = PublicKeyStrategy::load(&keywords.identity_files, ctx).await;
    for _ in 0..budget {
        match strategy.next_key().await? {
            None => break,
            Some(KeyAttempt::Skip { path, reason }) => {
                debug!("[ssh-auth] Identity {:?} skipped: {}", path, reason);
            }
            Some(KeyAttempt::Key { path, key }) => {
                if session.publickey(user, key).await? {
                    return Ok(true);
                }
                debug!("[ssh-auth] Server rejected identity {:?}", path);
            }
        }
    }
    Ok(false)
}

async fn try_password(
    session: &mut dyn AuthSession,
    user: &str,
    ctx: Arc<AuthContext>,
    budget: usize,
) -> Result<bool, SshError> {
    let mut strategy = PasswordStrategy::new(ctx);
    for _ in 0..budget {
        let Some(password) = strategy.next_password().await? else {
            break;
        };
        if session.password(user, password.as_str()).await? {
            return Ok(true);
        }
        warn!("[ssh-auth] Password rejected for {}", user);
    }
    Ok(false)
}

async fn try_keyboard_interactive(
    session: &mut dyn AuthSession,
    user: &str,
    ctx: Arc<AuthContext>,
    budget: usize,
) -> Result<bool, SshError> {
    let mut strategy = KeyboardInteractiveStrategy::new(ctx);
    for _ in 0..budget {
        let mut step = session.kbi_start(user).await?;
        loop {
            match step {
                KbiStep::Success => return Ok(true),
                KbiStep::Failure => break,
                KbiStep::Info {
                    name,
                    instructions,
                    questions,
                } => {
                    let Some(answers) = strategy.answer(&name, &instructions, &questions).await?
                    else {
                        return Ok(false);
                    };
                    step = session.kbi_respond(answers).await?;
                }
            }
        }
    }
    Ok(false)
}

/// russh callbacks for one connection attempt
pub struct ClientHandler {
    trust: Arc<HostTrustStore>,
    host: String,
    port: u16,
    remote_addr: Option<SocketAddr>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let offered = OfferedHostKey::from_public_key(server_public_key);
        self.trust
            .verify(&self.host, self.port, self.remote_addr, &offered)
            .await?;
        Ok(true)
    }
}

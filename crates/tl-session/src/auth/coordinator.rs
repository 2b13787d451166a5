//! Authentication coordinator
//!
//! Drives password, public-key, agent and keyboard-interactive
//! authentication on a link. Keyboard-interactive rounds that need a human become pending
//! challenges: the prompts go out on the event bus and the transport stays
//! suspended until the UI answers, cancels, or the deadline passes. Jump
//! chains reuse the same machinery to ask which target account to use.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use zeroize::Zeroizing;

use tl_core::error::{ChallengeError, TransportError};
use tl_core::traits::{KeyboardInteractiveReply, SshLink};
use tl_core::types::{AuthMethod, AuthState, RejectReason};
use tl_protocol::{
    AuthEvent, AuthStatus, ChallengeId, CoreEvent, Prompt, SelectionCandidate, SelectionEvent,
    SelectionId, SessionId,
};

use super::pending::{PendingTable, Resolution};
use crate::agent::AgentManager;
use crate::events::EventBus;

/// Upper bound on keyboard-interactive rounds for one authentication
const MAX_INTERACTIVE_ROUNDS: usize = 16;

/// Notified while authentication waits on the user
pub trait AuthObserver: Send + Sync {
    /// `true` when a challenge or selection goes out, `false` once resolved
    fn awaiting_user(&self, waiting: bool);
}

impl AuthObserver for () {
    fn awaiting_user(&self, _waiting: bool) {}
}

/// Who is authenticating
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Session the transport belongs to
    pub session_id: SessionId,
    /// Hop index inside a jump chain
    pub hop: Option<usize>,
    /// Host being authenticated against
    pub host: String,
}

impl AuthContext {
    /// Context for a direct connection
    pub fn direct(session_id: SessionId, host: impl Into<String>) -> Self {
        Self {
            session_id,
            hop: None,
            host: host.into(),
        }
    }

    /// Context for one hop of a chain
    pub fn hop(session_id: SessionId, index: usize, host: impl Into<String>) -> Self {
        Self {
            session_id,
            hop: Some(index),
            host: host.into(),
        }
    }

    /// Key identifying the transport for the one-challenge-at-a-time rule
    pub fn owner(&self) -> String {
        format!("{}#{}", self.session_id, self.hop.unwrap_or(0))
    }
}

/// Drives authentication and owns the pending challenge tables
pub struct AuthCoordinator {
    challenges: PendingTable<ChallengeId, Zeroizing<Vec<String>>>,
    selections: PendingTable<SelectionId, String>,
    events: EventBus,
    challenge_timeout: Duration,
    selection_timeout: Duration,
    agent: Arc<AgentManager>,
}

impl AuthCoordinator {
    /// Create a new coordinator
    pub fn new(
        events: EventBus,
        challenge_timeout: Duration,
        selection_timeout: Duration,
        agent: Arc<AgentManager>,
    ) -> Self {
        Self {
            challenges: PendingTable::new(),
            selections: PendingTable::new(),
            events,
            challenge_timeout,
            selection_timeout,
            agent,
        }
    }

    /// Authenticate `link` as `username`.
    ///
    /// `state` is the transport's auth state; the coordinator is its only
    /// writer.
    pub async fn authenticate(
        &self,
        link: &mut dyn SshLink,
        state: &watch::Sender<AuthState>,
        ctx: &AuthContext,
        username: &str,
        method: &AuthMethod,
        observer: &dyn AuthObserver,
    ) -> Result<(), TransportError> {
        tracing::debug!(
            "Authenticating {}@{} with {}",
            username,
            ctx.host,
            method.name()
        );

        let outcome = match method {
            AuthMethod::Password { password } => link
                .auth_password(username, password.expose())
                .await
                .map(verdict),
            AuthMethod::PublicKey {
                private_key,
                passphrase,
            } => link
                .auth_publickey(
                    username,
                    private_key.expose(),
                    passphrase.as_ref().map(|p| p.expose()),
                )
                .await
                .map(verdict),
            AuthMethod::Agent => match self.agent.auth_socket().await {
                Ok(socket) => link.auth_agent(username, &socket).await.map(verdict),
                Err(e) => {
                    tracing::warn!("No agent for {}@{}: {}", username, ctx.host, e);
                    Ok(Err(RejectReason::AgentUnavailable))
                }
            },
            AuthMethod::KeyboardInteractive { password } => {
                self.keyboard_interactive(
                    link,
                    state,
                    ctx,
                    username,
                    password.as_ref().map(|p| p.expose()),
                    observer,
                )
                .await
            }
        };

        match outcome {
            Ok(Ok(())) => {
                state.send_replace(AuthState::Authenticated);
                tracing::info!("Authenticated {}@{}", username, ctx.host);
                Ok(())
            }
            Ok(Err(reason)) => {
                state.send_replace(AuthState::Rejected(reason));
                tracing::warn!("Authentication of {}@{} rejected: {}", username, ctx.host, reason);
                Err(TransportError::AuthRejected(reason))
            }
            Err(e) => {
                // Link failure, not a verdict on the credentials.
                state.send_replace(AuthState::Interrupted);
                tracing::warn!("Authentication of {}@{} interrupted: {}", username, ctx.host, e);
                Err(e)
            }
        }
    }

    async fn keyboard_interactive(
        &self,
        link: &mut dyn SshLink,
        state: &watch::Sender<AuthState>,
        ctx: &AuthContext,
        username: &str,
        password: Option<&str>,
        observer: &dyn AuthObserver,
    ) -> Result<Result<(), RejectReason>, TransportError> {
        let mut reply = link.auth_keyboard_interactive_start(username).await?;
        let mut last_challenge: Option<ChallengeId> = None;

        for _ in 0..MAX_INTERACTIVE_ROUNDS {
            let (name, instructions, prompts) = match reply {
                KeyboardInteractiveReply::Success => {
                    self.report(ctx, last_challenge, AuthStatus::Success);
                    return Ok(Ok(()));
                }
                KeyboardInteractiveReply::Failure => {
                    self.report(ctx, last_challenge, AuthStatus::Failed);
                    return Ok(Err(RejectReason::BadCredentials));
                }
                KeyboardInteractiveReply::Prompts {
                    name,
                    instructions,
                    prompts,
                } => (name, instructions, prompts),
            };

            let answers = if prompts.is_empty() {
                Zeroizing::new(Vec::new())
            } else if let Some(answers) = auto_answer(&prompts, password) {
                tracing::debug!("Answering password prompt for {} automatically", ctx.host);
                answers
            } else {
                let challenge_id = ChallengeId::generate();
                last_challenge = Some(challenge_id.clone());
                state.send_replace(AuthState::AwaitingFactor(prompts.clone()));

                observer.awaiting_user(true);
                let resolution = self
                    .ask(ctx, challenge_id.clone(), name, instructions, prompts)
                    .await;
                observer.awaiting_user(false);

                match resolution? {
                    Resolution::Answered(answers) => answers,
                    Resolution::Cancelled => {
                        tracing::info!("Challenge {} cancelled", challenge_id);
                        self.report(ctx, last_challenge, AuthStatus::Failed);
                        return Ok(Err(RejectReason::UserCancelled));
                    }
                    Resolution::TimedOut => {
                        tracing::warn!("Challenge {} timed out", challenge_id);
                        self.events.emit(CoreEvent::Auth(AuthEvent::Timeout {
                            challenge_id: challenge_id.clone(),
                            session_id: ctx.session_id.clone(),
                        }));
                        self.report(ctx, last_challenge, AuthStatus::Failed);
                        return Ok(Err(RejectReason::Timeout));
                    }
                }
            };

            reply = link
                .auth_keyboard_interactive_respond(answers.to_vec())
                .await?;
        }

        tracing::warn!("Too many keyboard-interactive rounds from {}", ctx.host);
        self.report(ctx, last_challenge, AuthStatus::Failed);
        Ok(Err(RejectReason::BadCredentials))
    }

    async fn ask(
        &self,
        ctx: &AuthContext,
        challenge_id: ChallengeId,
        name: String,
        instructions: String,
        prompts: Vec<Prompt>,
    ) -> Result<Resolution<Zeroizing<Vec<String>>>, TransportError> {
        let ticket = self
            .challenges
            .open(&ctx.owner(), challenge_id.clone())
            .map_err(|e| {
                tracing::error!("Cannot open challenge for {}: {}", ctx.host, e);
                TransportError::RemoteRejected(e.to_string())
            })?;

        tracing::info!(
            "Challenge {} for {} ({} prompts)",
            challenge_id,
            ctx.host,
            prompts.len()
        );
        self.events.emit(CoreEvent::Auth(AuthEvent::Request {
            challenge_id,
            session_id: ctx.session_id.clone(),
            hop: ctx.hop,
            host: ctx.host.clone(),
            name,
            instructions,
            prompts,
        }));

        Ok(self.challenges.wait(ticket, self.challenge_timeout).await)
    }

    fn report(&self, ctx: &AuthContext, challenge: Option<ChallengeId>, status: AuthStatus) {
        if let Some(challenge_id) = challenge {
            self.events.emit(CoreEvent::Auth(AuthEvent::Result {
                challenge_id,
                session_id: ctx.session_id.clone(),
                status,
            }));
        }
    }

    /// Ask the user which target account to use behind a jump server
    pub async fn select_account(
        &self,
        ctx: &AuthContext,
        candidates: &[SelectionCandidate],
        observer: &dyn AuthObserver,
    ) -> Result<SelectionCandidate, RejectReason> {
        let selection_id = SelectionId::generate();
        let ticket = self
            .selections
            .open(&ctx.owner(), selection_id.clone())
            .map_err(|_| RejectReason::UserCancelled)?;

        tracing::info!(
            "Selection {} for {} ({} accounts)",
            selection_id,
            ctx.host,
            candidates.len()
        );
        self.events.emit(CoreEvent::UserSelection(SelectionEvent::Request {
            selection_id: selection_id.clone(),
            session_id: ctx.session_id.clone(),
            hop: ctx.hop.unwrap_or(0),
            host: ctx.host.clone(),
            candidates: candidates.to_vec(),
        }));

        observer.awaiting_user(true);
        let resolution = self.selections.wait(ticket, self.selection_timeout).await;
        observer.awaiting_user(false);

        match resolution {
            Resolution::Answered(account_id) => candidates
                .iter()
                .find(|c| c.id == account_id)
                .cloned()
                .ok_or_else(|| {
                    tracing::warn!(
                        "Selection {} answered with unknown account {}",
                        selection_id,
                        account_id
                    );
                    RejectReason::UserCancelled
                }),
            Resolution::Cancelled => Err(RejectReason::UserCancelled),
            Resolution::TimedOut => {
                self.events.emit(CoreEvent::UserSelection(SelectionEvent::Timeout {
                    selection_id,
                    session_id: ctx.session_id.clone(),
                }));
                Err(RejectReason::Timeout)
            }
        }
    }

    /// Deliver answers to a keyboard-interactive challenge
    pub fn respond(
        &self,
        challenge_id: &ChallengeId,
        answers: Vec<String>,
    ) -> Result<(), ChallengeError> {
        self.challenges.answer(challenge_id, Zeroizing::new(answers))
    }

    /// Cancel a keyboard-interactive challenge
    pub fn cancel(&self, challenge_id: &ChallengeId) -> Result<(), ChallengeError> {
        self.challenges.cancel(challenge_id)
    }

    /// Deliver a target account choice
    pub fn respond_selection(
        &self,
        selection_id: &SelectionId,
        account_id: String,
    ) -> Result<(), ChallengeError> {
        self.selections.answer(selection_id, account_id)
    }

    /// Cancel a target account selection
    pub fn cancel_selection(&self, selection_id: &SelectionId) -> Result<(), ChallengeError> {
        self.selections.cancel(selection_id)
    }

    /// Cancel anything pending for a session's transports
    pub fn cancel_session(&self, session_id: &SessionId, hops: usize) {
        for hop in 0..hops.max(1) {
            let owner = format!("{}#{}", session_id, hop);
            self.challenges.cancel_owner(&owner);
            self.selections.cancel_owner(&owner);
        }
    }

    /// Whether a challenge is still waiting
    pub fn is_pending(&self, challenge_id: &ChallengeId) -> bool {
        self.challenges.is_pending(challenge_id)
    }

    /// Number of outstanding challenges and selections
    pub fn outstanding(&self) -> usize {
        self.challenges.len() + self.selections.len()
    }
}

fn verdict(accepted: bool) -> Result<(), RejectReason> {
    if accepted {
        Ok(())
    } else {
        Err(RejectReason::BadCredentials)
    }
}

/// Answers for a round that only asks for the password
fn auto_answer(prompts: &[Prompt], password: Option<&str>) -> Option<Zeroizing<Vec<String>>> {
    let password = password?;
    let all_password = prompts
        .iter()
        .all(|p| !p.echo && p.text.to_lowercase().contains("password"));
    if !all_password {
        return None;
    }
    Some(Zeroizing::new(
        prompts.iter().map(|_| password.to_string()).collect(),
    ))
}

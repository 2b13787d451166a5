//! Jump chain resolution
//!
//! Hops are built strictly in order. Hop 0 connects over TCP; every later hop
//! runs over a direct-tcpip channel opened on the hop before it, so tunneled
//! and direct transports share one implementation. The first failure aborts
//! the chain and closes whatever was built, innermost hop first.

use std::sync::Arc;
use std::time::Duration;

use tl_core::error::TransportError;
use tl_core::traits::{Connector, StreamRequest};
use tl_core::types::{HopSpec, RejectReason};
use tl_protocol::{ChainStage, CoreEvent, SessionEvent, SessionId};

use super::plan::{host_target, JumpChainPlan};
use crate::auth::{AuthContext, AuthCoordinator, AuthObserver};
use crate::events::EventBus;
use crate::transport::Transport;

/// Builds the transport chain of a plan
pub struct ChainResolver<'a> {
    connector: &'a dyn Connector,
    coordinator: &'a AuthCoordinator,
    events: &'a EventBus,
    connect_timeout: Duration,
    max_channels: usize,
}

impl<'a> ChainResolver<'a> {
    /// Create a resolver
    pub fn new(
        connector: &'a dyn Connector,
        coordinator: &'a AuthCoordinator,
        events: &'a EventBus,
        connect_timeout: Duration,
        max_channels: usize,
    ) -> Self {
        Self {
            connector,
            coordinator,
            events,
            connect_timeout,
            max_channels,
        }
    }

    /// Connect and authenticate every hop, returning the final transport.
    ///
    /// A direct plan reports connect and auth errors as they are; a chained
    /// plan wraps them in `HopUnreachable` / `HopAuthFailed` with the index of
    /// the failing hop.
    pub async fn resolve(
        &self,
        plan: JumpChainPlan,
        observer: &dyn AuthObserver,
    ) -> Result<Arc<Transport>, TransportError> {
        let chained = plan.is_chained();
        let (session_id, hops) = plan.into_hops();
        let mut previous: Option<Arc<Transport>> = None;
        let mut next_username: Option<String> = None;

        for (index, hop) in hops.iter().enumerate() {
            let step = Step {
                session_id: &session_id,
                index,
                hop,
                chained,
            };
            let username = next_username.take().unwrap_or_else(|| hop.username.clone());

            let transport = match self.build_hop(&step, previous.as_ref(), &username, observer).await
            {
                Ok(transport) => transport,
                Err(e) => {
                    self.progress(&step, ChainStage::Failed);
                    if let Some(previous) = &previous {
                        previous.close().await;
                    }
                    return Err(e);
                }
            };

            if index + 1 < hops.len() {
                match self.pick_account(&step, observer).await {
                    Ok(account) => next_username = account,
                    Err(reason) => {
                        self.progress(&step, ChainStage::Failed);
                        transport.close().await;
                        return Err(step.auth_error(TransportError::AuthRejected(reason)));
                    }
                }
            }

            self.progress(&step, ChainStage::Established);
            previous = Some(transport);
        }

        previous.ok_or_else(|| TransportError::HandshakeFailed("empty jump chain".to_string()))
    }

    async fn build_hop(
        &self,
        step: &Step<'_>,
        previous: Option<&Arc<Transport>>,
        username: &str,
        observer: &dyn AuthObserver,
    ) -> Result<Arc<Transport>, TransportError> {
        let target = host_target(step.hop);
        self.progress(step, ChainStage::Connecting);

        let connected = match previous {
            None => {
                Transport::connect(self.connector, target, self.connect_timeout, self.max_channels)
                    .await
            }
            Some(previous) => {
                tracing::debug!(
                    "Opening tunnel to {} through {}",
                    target.address(),
                    previous.label()
                );
                let tunnel = previous
                    .open_stream(StreamRequest::DirectTcpip {
                        host: target.host.clone(),
                        port: target.port,
                    })
                    .await
                    .map_err(|e| step.unreachable(e))?;
                Transport::connect_over(
                    self.connector,
                    tunnel,
                    target,
                    self.connect_timeout,
                    self.max_channels,
                    previous.clone(),
                )
                .await
            }
        };
        let mut transport = connected.map_err(|e| step.unreachable(e))?;

        self.progress(step, ChainStage::Authenticating);
        let ctx = if step.chained {
            AuthContext::hop(step.session_id.clone(), step.index, &step.hop.host)
        } else {
            AuthContext::direct(step.session_id.clone(), &step.hop.host)
        };

        if let Err(e) = transport
            .authenticate(self.coordinator, &ctx, username, &step.hop.auth, observer)
            .await
        {
            tracing::warn!("Authentication to {} failed: {}", transport.label(), e);
            // Closes this hop, then every hop below it.
            transport.close().await;
            return Err(step.auth_error(e));
        }

        tracing::info!("Hop {} established: {}", step.index, transport.label());
        Ok(Arc::new(transport))
    }

    /// Login name to use on the next hop, if this hop decides it
    async fn pick_account(
        &self,
        step: &Step<'_>,
        observer: &dyn AuthObserver,
    ) -> Result<Option<String>, RejectReason> {
        match step.hop.target_accounts.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.username.clone())),
            candidates => {
                let ctx = AuthContext::hop(step.session_id.clone(), step.index, &step.hop.host);
                let chosen = self
                    .coordinator
                    .select_account(&ctx, candidates, observer)
                    .await?;
                tracing::info!("Continuing as {} after {}", chosen.username, step.hop.host);
                Ok(Some(chosen.username))
            }
        }
    }

    fn progress(&self, step: &Step<'_>, stage: ChainStage) {
        if !step.chained {
            return;
        }
        self.events
            .emit(CoreEvent::Session(SessionEvent::ChainProgress {
                session_id: step.session_id.clone(),
                hop: step.index,
                host: step.hop.host.clone(),
                stage,
            }));
    }
}

struct Step<'a> {
    session_id: &'a SessionId,
    index: usize,
    hop: &'a HopSpec,
    chained: bool,
}

impl Step<'_> {
    fn unreachable(&self, e: TransportError) -> TransportError {
        if !self.chained {
            return e;
        }
        TransportError::HopUnreachable {
            index: self.index,
            host: self.hop.host.clone(),
            reason: e.to_string(),
        }
    }

    fn auth_error(&self, e: TransportError) -> TransportError {
        match e {
            TransportError::AuthRejected(reason) if self.chained => TransportError::HopAuthFailed {
                index: self.index,
                host: self.hop.host.clone(),
                reason,
            },
            TransportError::AuthRejected(_) => e,
            other => self.unreachable(other),
        }
    }
}

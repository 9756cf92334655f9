//! The engine facade.
//!
//! [`Engine::start`] wires the interceptor chain onto the pipeline,
//! spawns the pipeline task, and hands back a clonable [`EngineHandle`].
//! The handle is the only surface a host needs: queue actions, submit
//! remote operator requests, and read the store.

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

use crate::action::Action;
use crate::assignment::AssignmentInterceptor;
use crate::broadcast::BroadcastInterceptor;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::loads::LoadsInterceptor;
use crate::messaging::MessagingInterceptor;
use crate::operator::OperatorId;
use crate::pipeline::{Inflight, Ingress, Interceptor, Pipeline};
use crate::presence::PresenceInterceptor;
use crate::remote::RemoteRequest;
use crate::scheduler::Scheduler;
use crate::scope::ScopeInterceptor;
use crate::store::Store;
use crate::transport::Transport;

pub struct Engine;

impl Engine {
    /// Boot an engine instance. The pipeline task runs until the handle's
    /// [`EngineHandle::shutdown`] is called or the runtime goes away.
    pub fn start(config: EngineConfig, transport: Arc<dyn Transport>) -> EngineHandle {
        let store = Arc::new(RwLock::new(Store::new(&config)));
        let (pipeline, ingress) = Pipeline::build(store.clone(), |ingress| {
            let scheduler = Scheduler::new(ingress.clone());
            // Order matters: scope normalization first, broadcast last so
            // it diffs the fully settled store.
            let chain: Vec<Box<dyn Interceptor>> = vec![
                Box::new(ScopeInterceptor),
                Box::new(PresenceInterceptor::new(
                    transport.clone(),
                    scheduler,
                    &config,
                )),
                Box::new(MessagingInterceptor::new(
                    transport.clone(),
                    config.log_capacity,
                )),
                Box::new(AssignmentInterceptor::new(
                    transport.clone(),
                    config.join_timeout,
                )),
                Box::new(LoadsInterceptor),
                Box::new(BroadcastInterceptor::new(transport)),
            ];
            chain
        });
        let task = tokio::spawn(pipeline.run());
        info!(
            default_locale = %config.default_locale,
            locales = config.supported_locales.len(),
            groups = config.groups.len(),
            accept_customers = config.accept_customers,
            "switchboard engine started"
        );

        let inflight = ingress.inflight();
        EngineHandle {
            ingress,
            inflight,
            store,
            task: Arc::new(task),
        }
    }
}

/// Clonable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    ingress: Ingress,
    inflight: Arc<Inflight>,
    store: Arc<RwLock<Store>>,
    task: Arc<JoinHandle<()>>,
}

impl EngineHandle {
    /// Queue an action for processing.
    pub fn dispatch(&self, action: Action) -> Result<(), EngineError> {
        if self.ingress.dispatch(action) {
            Ok(())
        } else {
            Err(EngineError::Stopped)
        }
    }

    /// Wait until every queued action, cascade, and spawned attempt has
    /// finished.
    pub async fn settle(&self) {
        self.inflight.wait_idle().await;
    }

    pub async fn dispatch_and_settle(&self, action: Action) -> Result<(), EngineError> {
        self.dispatch(action)?;
        self.settle().await;
        Ok(())
    }

    /// Submit an operator-originated request through the allow-list gate.
    pub fn submit_remote(
        &self,
        request: RemoteRequest,
        submitted_by: &OperatorId,
    ) -> Result<(), EngineError> {
        request.authorize(submitted_by)?;
        self.dispatch(request.into_action())
    }

    /// Parse and submit a raw remote payload, as received from the wire.
    pub fn submit_remote_json(
        &self,
        payload: &serde_json::Value,
        submitted_by: &OperatorId,
    ) -> Result<(), EngineError> {
        let request = RemoteRequest::parse(payload)?;
        self.submit_remote(request, submitted_by)
    }

    /// Run a closure against a read snapshot of the store.
    pub async fn with_store<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        let store = self.store.read().await;
        f(&store)
    }

    /// Abort the pipeline task. Subsequent dispatches return
    /// [`EngineError::Stopped`].
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatId, ChatSession, ChatStatus, Locale};
    use crate::testing::RecordingTransport;
    use crate::transport::events;

    fn session() -> ChatSession {
        ChatSession {
            customer_id: "cust-1".into(),
            display_name: "Sam".into(),
            email: None,
            locale: Locale::from("en"),
            groups: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_processes_actions_and_exposes_store() {
        let transport = Arc::new(RecordingTransport::new());
        let handle = Engine::start(EngineConfig::default(), transport.clone());

        handle
            .dispatch_and_settle(Action::CustomerMessage {
                chat_id: ChatId::from("c1"),
                session: session(),
                body: "hello".into(),
            })
            .await
            .unwrap();

        let status = handle
            .with_store(|store| store.chat(&ChatId::from("c1")).map(|c| c.status))
            .await;
        assert_eq!(status, Some(ChatStatus::Pending));
        assert!(!transport.emits_named(events::STATE_PATCH).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_dispatch() {
        let transport = Arc::new(RecordingTransport::new());
        let handle = Engine::start(EngineConfig::default(), transport);

        handle.shutdown();
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }

        let err = handle
            .dispatch(Action::CustomerTyping {
                chat_id: ChatId::from("c1"),
                typing: true,
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_remote_gates_on_identity() {
        let transport = Arc::new(RecordingTransport::new());
        let handle = Engine::start(EngineConfig::default(), transport);

        let err = handle
            .submit_remote(
                RemoteRequest::SetRequestingChat {
                    operator_id: OperatorId::from("op-2"),
                    requesting: true,
                },
                &OperatorId::from("op-1"),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Remote(_)));

        handle
            .submit_remote_json(
                &serde_json::json!({ "type": "setAcceptsCustomers", "accepts": false }),
                &OperatorId::from("op-1"),
            )
            .unwrap();
        handle.settle().await;
        let accepts = handle.with_store(|store| store.accepts_customers).await;
        assert!(!accepts);
    }
}

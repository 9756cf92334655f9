//! First stage: normalize the locale and group tags a customer session
//! arrives with, so everything downstream sees a canonical scope.

use async_trait::async_trait;
use tracing::warn;

use crate::action::Action;
use crate::group::GroupId;
use crate::pipeline::{InterceptCtx, Interceptor};
use crate::store::Store;

pub struct ScopeInterceptor;

#[async_trait]
impl Interceptor for ScopeInterceptor {
    fn name(&self) -> &'static str {
        "scope"
    }

    async fn before(&mut self, store: &Store, action: &mut Action, _ctx: &mut InterceptCtx) {
        let session = match action {
            Action::CustomerMessage { session, .. } | Action::CustomerJoin { session, .. } => {
                session
            }
            _ => return,
        };

        if !store.locales.is_supported(&session.locale) {
            let fallback = store.locales.resolve(&session.locale);
            warn!(
                requested = %session.locale,
                fallback = %fallback,
                "unsupported locale on session"
            );
            session.locale = fallback;
        }

        let before = session.groups.len();
        session
            .groups
            .retain(|id| store.groups.contains_key(id));
        if session.groups.len() != before {
            warn!(dropped = before - session.groups.len(), "unknown group tags on session");
        }
        if session.groups.is_empty() {
            session.groups = vec![GroupId::default_group()];
        }
    }
}

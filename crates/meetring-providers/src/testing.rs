//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meetring_core::BoxFuture;

use crate::error::AuthError;
use crate::oauth::{Authorizer, TokenGrant};

/// Replays scripted results; answers `Required` once the script runs out.
pub(crate) struct ScriptedAuthorizer {
    script: Mutex<VecDeque<Result<TokenGrant, AuthError>>>,
    calls: AtomicUsize,
    delay: Duration,
    pub(crate) seen_refresh_tokens: Mutex<Vec<Option<String>>>,
    pub(crate) seen_interactive: Mutex<Vec<bool>>,
}

impl ScriptedAuthorizer {
    pub(crate) fn new(script: Vec<Result<TokenGrant, AuthError>>) -> Arc<Self> {
        Self::slow(script, Duration::ZERO)
    }

    pub(crate) fn slow(script: Vec<Result<TokenGrant, AuthError>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            delay,
            seen_refresh_tokens: Mutex::new(Vec::new()),
            seen_interactive: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authorizer for ScriptedAuthorizer {
    fn authorize<'a>(
        &'a self,
        interactive: bool,
        refresh_token: Option<&'a str>,
    ) -> BoxFuture<'a, Result<TokenGrant, AuthError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_interactive.lock().unwrap().push(interactive);
            self.seen_refresh_tokens
                .lock()
                .unwrap()
                .push(refresh_token.map(str::to_string));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AuthError::Required))
        })
    }
}

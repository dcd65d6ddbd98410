use std::sync::Arc;

use crate::auth::token::TokenVerifier;
use crate::broker::Broker;
use crate::directory::Directory;
use crate::engine::notifications::Notifier;
use crate::engine::presence::PresenceManager;

/// Shared state injected into every handler. Constructed once in the
/// composition root; tests build it with fakes.
pub struct AppState {
    pub directory: Arc<dyn Directory>,
    pub broker: Broker,
    pub presence: Arc<PresenceManager>,
    pub notifier: Notifier,
    pub verifier: TokenVerifier,
}

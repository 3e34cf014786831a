//! Shared application state.
//!
//! A single `Arc<AppContext>` is cloned into every axum handler; the heavy
//! lifting lives on [`crate::call::core::CallSessionCore`], which this just
//! wraps alongside the config needed for webhook signature verification.

use std::sync::Arc;

use crate::call::core::CallSessionCore;
use crate::config::Config;

pub struct AppContext {
    pub core: CallSessionCore,
    pub config: Arc<Config>,
}

pub type AppState = Arc<AppContext>;

//! Shared process state handed to every axum handler (spec §9 "pass as
//! explicit collaborators into each component; no singletons beyond the
//! process entry point").

use std::sync::Arc;

use crate::capture::{CaptureBuffer, CaptureMode};
use crate::policy::PolicyEngine;
use crate::router::BackendRouter;
use crate::session::SessionManager;
use crate::voice::VoiceConfig;

pub struct AppState {
    pub router: BackendRouter,
    pub sessions: Arc<SessionManager>,
    pub policy: Option<PolicyEngine>,
    pub capture: Option<CaptureBuffer>,
    pub capture_mode: CaptureMode,
    pub session_header: String,
    pub voice: VoiceConfig,
}

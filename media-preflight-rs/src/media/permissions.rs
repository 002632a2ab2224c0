//! Consent tracking per capture kind.
//!
//! States only move forward (`Unknown -> Prompting -> Granted | Denied`);
//! only an explicit request can take `Denied` back to `Prompting`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::device::{CaptureKind, MediaError, PermissionState};
use super::host::{HostPermission, MediaHost};

/// Requests and remembers consent for video and audio capture.
pub struct PermissionGate {
    host: Arc<dyn MediaHost>,
    states: Mutex<HashMap<CaptureKind, PermissionState>>,
    /// One prompt at a time per gate
    prompt: tokio::sync::Mutex<()>,
}

impl PermissionGate {
    pub fn new(host: Arc<dyn MediaHost>) -> Self {
        Self {
            host,
            states: Mutex::new(HashMap::new()),
            prompt: tokio::sync::Mutex::new(()),
        }
    }

    /// Current state for a kind.
    pub fn state(&self, kind: CaptureKind) -> PermissionState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    fn set_state(&self, kind: CaptureKind, state: PermissionState) {
        debug!(%kind, ?state, "permission state");
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, state);
    }

    /// Learn already-decided consent without prompting.
    ///
    /// Only `Unknown` kinds are updated; a host answer of "prompt" leaves them `Unknown`.
    pub async fn sync_with_host(&self) -> HashMap<CaptureKind, PermissionState> {
        let _prompt = self.prompt.lock().await;
        let mut result = HashMap::new();
        for kind in CaptureKind::ALL {
            if self.state(kind) == PermissionState::Unknown {
                match self.host.query_permission(kind).await {
                    Ok(HostPermission::Granted) => self.set_state(kind, PermissionState::Granted),
                    Ok(HostPermission::Denied) => self.set_state(kind, PermissionState::Denied),
                    Ok(HostPermission::Prompt) => {}
                    Err(e) => debug!(%kind, error = %e, "permission query unsupported"),
                }
            }
            result.insert(kind, self.state(kind));
        }
        result
    }

    /// Ask for consent to capture `kind`.
    ///
    /// Already `Granted` returns immediately without touching the host. A
    /// refusal leaves the state `Denied` and fails with `AccessDenied`.
    pub async fn request_access(&self, kind: CaptureKind) -> Result<PermissionState, MediaError> {
        if self.state(kind) == PermissionState::Granted {
            return Ok(PermissionState::Granted);
        }

        let _prompt = self.prompt.lock().await;
        // Another request may have settled it while we waited
        if self.state(kind) == PermissionState::Granted {
            return Ok(PermissionState::Granted);
        }

        let previous = self.state(kind);
        self.set_state(kind, PermissionState::Prompting);

        match self.host.request_permission(kind).await {
            Ok(HostPermission::Granted) => {
                info!(%kind, "access granted");
                self.set_state(kind, PermissionState::Granted);
                Ok(PermissionState::Granted)
            }
            Ok(HostPermission::Denied) | Ok(HostPermission::Prompt) => {
                warn!(%kind, "access denied");
                self.set_state(kind, PermissionState::Denied);
                Err(MediaError::AccessDenied { kind })
            }
            Err(e) => {
                warn!(%kind, error = %e, "permission request failed");
                let settled = match previous {
                    PermissionState::Prompting => PermissionState::Unknown,
                    other => other,
                };
                self.set_state(kind, settled);
                Err(MediaError::Host(e.to_string()))
            }
        }
    }

    /// Record consent learned as a side effect of opening a track.
    pub(crate) fn observe(&self, kind: CaptureKind, granted: bool) {
        let current = self.state(kind);
        match (granted, current) {
            (true, PermissionState::Granted) => {}
            (true, _) => self.set_state(kind, PermissionState::Granted),
            (false, PermissionState::Unknown | PermissionState::Prompting) => {
                self.set_state(kind, PermissionState::Denied)
            }
            (false, _) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    #[tokio::test]
    async fn granted_request_is_idempotent() {
        let host = Arc::new(FakeHost::new());
        let gate = PermissionGate::new(host.clone());

        assert_eq!(gate.state(CaptureKind::Video), PermissionState::Unknown);
        assert_eq!(
            gate.request_access(CaptureKind::Video).await.unwrap(),
            PermissionState::Granted
        );

        // A host that would now refuse is never consulted again
        host.set_prompt_answer(CaptureKind::Video, HostPermission::Denied);
        assert_eq!(
            gate.request_access(CaptureKind::Video).await.unwrap(),
            PermissionState::Granted
        );
    }

    #[tokio::test]
    async fn denial_then_regrant_on_explicit_request() {
        let host = Arc::new(FakeHost::new());
        host.set_prompt_answer(CaptureKind::Audio, HostPermission::Denied);
        let gate = PermissionGate::new(host.clone());

        let err = gate.request_access(CaptureKind::Audio).await.unwrap_err();
        assert_eq!(err, MediaError::AccessDenied { kind: CaptureKind::Audio });
        assert_eq!(gate.state(CaptureKind::Audio), PermissionState::Denied);

        host.set_prompt_answer(CaptureKind::Audio, HostPermission::Granted);
        assert_eq!(
            gate.request_access(CaptureKind::Audio).await.unwrap(),
            PermissionState::Granted
        );
    }

    #[tokio::test]
    async fn permanent_denial_stays_denied() {
        let host = Arc::new(FakeHost::new());
        host.block_reprompt(CaptureKind::Video);
        let gate = PermissionGate::new(host);

        assert!(gate.request_access(CaptureKind::Video).await.is_err());
        assert!(gate.request_access(CaptureKind::Video).await.is_err());
        assert_eq!(gate.state(CaptureKind::Video), PermissionState::Denied);
    }

    #[tokio::test]
    async fn sync_only_fills_unknown_states() {
        let host = Arc::new(FakeHost::new());
        host.set_permission(CaptureKind::Video, HostPermission::Granted);
        let gate = PermissionGate::new(host.clone());

        let states = gate.sync_with_host().await;
        assert_eq!(states[&CaptureKind::Video], PermissionState::Granted);
        assert_eq!(states[&CaptureKind::Audio], PermissionState::Unknown);

        // Never regresses a known state
        host.set_permission(CaptureKind::Video, HostPermission::Denied);
        gate.sync_with_host().await;
        assert_eq!(gate.state(CaptureKind::Video), PermissionState::Granted);
    }
}

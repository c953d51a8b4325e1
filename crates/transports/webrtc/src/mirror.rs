//! Local user state mirrored to every peer

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::allocation::ActiveStreams;

/// What this node shows to the rest of the mesh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MirrorState {
    pub user_name: String,
    pub user_avatar: String,
    pub is_in_chat: bool,
    pub is_input_muted: bool,
    pub is_output_muted: bool,
    pub is_sharing_screen: bool,
    pub is_sharing_audio: bool,
}

impl MirrorState {
    /// Streams this state implies we are sending
    pub fn active_streams(&self) -> ActiveStreams {
        ActiveStreams {
            microphone: self.is_in_chat,
            system_audio: self.is_sharing_audio,
            screen: self.is_sharing_screen,
        }
    }
}

/// The single shared instance; written by the bridge, read everywhere else
#[derive(Debug, Default)]
pub struct SharedMirror {
    state: RwLock<MirrorState>,
}

impl SharedMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> MirrorState {
        self.state.read().clone()
    }

    /// Replace the state; returns `true` if it changed
    pub fn replace(&self, state: MirrorState) -> bool {
        let mut current = self.state.write();
        let changed = *current != state;
        *current = state;
        changed
    }

    pub fn active_streams(&self) -> ActiveStreams {
        self.state.read().active_streams()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camel_case_wire_shape() {
        let state = MirrorState {
            user_name: "ada".to_string(),
            is_in_chat: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["userName"], "ada");
        assert_eq!(value["isInChat"], true);
        assert_eq!(value["isSharingScreen"], false);
    }

    #[test]
    fn test_partial_state_uses_defaults() {
        let state: MirrorState = serde_json::from_str(r#"{"isSharingAudio": true}"#).unwrap();
        assert!(state.is_sharing_audio);
        assert!(state.user_name.is_empty());
        assert!(state.active_streams().system_audio);
        assert!(!state.active_streams().microphone);
    }

    #[test]
    fn test_replace_reports_change() {
        let mirror = SharedMirror::new();
        let state = MirrorState {
            is_in_chat: true,
            ..Default::default()
        };
        assert!(mirror.replace(state.clone()));
        assert!(!mirror.replace(state));
        assert!(mirror.active_streams().microphone);
    }
}

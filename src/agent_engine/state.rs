/// Lifecycle states of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingSetupAck,
    Active,
    Closing,
    Failed,
}

impl ConnectionState {
    /// Whether `self -> next` is an edge of the connection state machine.
    ///
    /// An aborted connect attempt (`Connecting`/`AwaitingSetupAck`) may fall
    /// back to `Disconnected` while reconnect attempts remain; `Failed` is
    /// reachable from anywhere and is terminal.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Disconnected, Connecting)
            | (Connecting, AwaitingSetupAck)
            | (Connecting, Disconnected)
            | (AwaitingSetupAck, Active)
            | (AwaitingSetupAck, Disconnected)
            | (Active, Closing)
            | (Closing, Disconnected) => true,
            _ => false,
        }
    }
}

/// How a reconnect sequence ended.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconnectOutcome {
    Restored { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

/// Notifications from the engine to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    ModelText(String),
    ModelAudio { mime_type: String, data: Vec<u8> },
    TurnComplete,
    ActionReported { call_id: String, success: bool, error: Option<String> },
    Reconnect(ReconnectOutcome),
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn happy_path_edges_are_allowed() {
        let path = [Disconnected, Connecting, AwaitingSetupAck, Active, Closing, Disconnected];
        for w in path.windows(2) {
            assert!(w[0].can_transition(w[1]), "{:?} -> {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn shortcuts_and_exits_from_failed_are_rejected() {
        assert!(!Disconnected.can_transition(Active));
        assert!(!Active.can_transition(Connecting));
        assert!(!Failed.can_transition(Connecting));
        assert!(Active.can_transition(Failed));
        assert!(Connecting.can_transition(Failed));
    }
}

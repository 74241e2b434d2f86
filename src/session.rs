use std::fmt;

/// Lifecycle state of one shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether the heartbeat loop may run in this state
    pub fn heartbeats(self) -> bool {
        matches!(
            self,
            ConnectionState::AwaitingHello
                | ConnectionState::Identifying
                | ConnectionState::Resuming
                | ConnectionState::Connected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingHello => "awaiting-hello",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Resuming => "resuming",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Which handshake to send after Hello
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Identify,
    Resume { session_id: String, last_sequence: u64 },
}

/// Resumable session bookkeeping for one shard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    session_id: Option<String>,
    last_sequence: u64,
    resume_endpoint: Option<String>,
}

impl Session {
    /// Current session id
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Last dispatch sequence observed
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Alternate endpoint for reconnects
    pub fn resume_endpoint(&self) -> Option<&str> {
        self.resume_endpoint.as_deref()
    }

    /// Record a dispatch sequence. Never moves backwards.
    pub fn observe_sequence(&mut self, sequence: u64) {
        if sequence > self.last_sequence {
            self.last_sequence = sequence;
        }
    }

    /// Store the session granted by `READY`
    pub fn establish(&mut self, session_id: String, resume_endpoint: Option<String>) {
        self.session_id = Some(session_id);
        if resume_endpoint.is_some() {
            self.resume_endpoint = resume_endpoint;
        }
    }

    /// Forget the session after a non-resumable invalidation
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.last_sequence = 0;
    }

    /// Forget everything, including the resume endpoint
    pub fn clear(&mut self) {
        self.invalidate();
        self.resume_endpoint = None;
    }

    /// Whether the next handshake will be a resume
    pub fn is_resumable(&self) -> bool {
        self.session_id.is_some()
    }

    /// Handshake to send after Hello
    pub fn handshake(&self) -> Handshake {
        match &self.session_id {
            Some(session_id) => Handshake::Resume {
                session_id: session_id.clone(),
                last_sequence: self.last_sequence,
            },
            None => Handshake::Identify,
        }
    }
}

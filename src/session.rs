use crate::protocol::CloseAction;

/// What a shard sends after Hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Identify,
    Resume { session_id: String, sequence: u64 },
}

/// Session bookkeeping for one shard, kept across reconnects.
#[derive(Debug, Default, Clone)]
pub struct SessionState {
    session_id: Option<String>,
    sequence: Option<u64>,
    close_sequence: Option<u64>,
    resume_url: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// Record the sequence of an incoming dispatch. Never moves backwards.
    pub fn record_sequence(&mut self, seq: u64) {
        if self.sequence.map_or(true, |current| seq > current) {
            self.sequence = Some(seq);
        }
    }

    /// Store the identifiers from READY.
    pub fn establish(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        if resume_url.is_some() {
            self.resume_url = resume_url;
        }
    }

    pub fn clear_resume_url(&mut self) {
        self.resume_url = None;
    }

    /// Apply the outcome of a close.
    pub fn on_close(&mut self, action: CloseAction) {
        self.close_sequence = self.sequence;
        if action != CloseAction::Resume {
            self.reset();
        }
    }

    /// Forget the session so the next handshake is a fresh identify.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.close_sequence = None;
        self.resume_url = None;
    }

    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }

    pub fn next_handshake(&self) -> Handshake {
        match (&self.session_id, self.sequence) {
            (Some(session_id), Some(sequence)) => Handshake::Resume {
                session_id: session_id.clone(),
                sequence,
            },
            _ => Handshake::Identify,
        }
    }

    /// Events replayed by a RESUMED since the last close.
    pub fn replayed(&self) -> u64 {
        match (self.sequence, self.close_sequence) {
            (Some(seq), Some(closed)) => seq.saturating_sub(closed),
            _ => 0,
        }
    }
}

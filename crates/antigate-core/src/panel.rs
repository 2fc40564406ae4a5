use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use antigate_storage::unix_ms;

const SESSION_TTL: Duration = Duration::from_secs(12 * 3600);

/// Opaque panel tokens with expiry. Pool and log mutations accept a valid
/// token as their authorization capability.
#[derive(Debug, Default)]
pub struct PanelSessions {
    sessions: Mutex<HashMap<String, i64>>,
}

impl PanelSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let mut sessions = self.sessions.lock().expect("panel session map poisoned");
        let now = unix_ms();
        sessions.retain(|_, expiry| *expiry > now);
        sessions.insert(token.clone(), now + SESSION_TTL.as_millis() as i64);
        token
    }

    pub fn validate(&self, token: &str) -> bool {
        let sessions = self.sessions.lock().expect("panel session map poisoned");
        sessions
            .get(token)
            .map(|expiry| *expiry > unix_ms())
            .unwrap_or(false)
    }

    pub fn revoke(&self, token: &str) {
        self.sessions
            .lock()
            .expect("panel session map poisoned")
            .remove(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_validate_and_revoke() {
        let sessions = PanelSessions::new();
        let token = sessions.issue();
        assert!(sessions.validate(&token));
        assert!(!sessions.validate("unknown"));
        sessions.revoke(&token);
        assert!(!sessions.validate(&token));
    }
}

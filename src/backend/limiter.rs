use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::*;

pub use crate::config::DEFAULT_SESSION_LIMIT;

/// Counts live sessions per user and refuses new ones beyond a limit.
///
/// One limiter may be shared by several backends so that a user's sessions
/// are counted across all of them.
#[derive(Debug)]
pub struct SessionLimiter {
    limit: usize,
    sessions: Mutex<HashMap<String, usize>>,
}

impl Default for SessionLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_LIMIT)
    }
}

impl SessionLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Takes a session slot for `user`. Anonymous sessions are not limited.
    pub fn try_acquire(&self, user: Option<&str>) -> bool {
        let user = match user {
            Some(user) => user,
            None => return true,
        };
        let mut sessions = self.lock();
        let count = sessions.entry(user.to_owned()).or_insert(0);
        if *count < self.limit {
            *count += 1;
            true
        } else {
            if *count == 0 {
                sessions.remove(user);
            }
            false
        }
    }

    /// Returns a slot taken by [`SessionLimiter::try_acquire`].
    pub fn release(&self, user: Option<&str>) {
        let user = match user {
            Some(user) => user,
            None => return,
        };
        let mut sessions = self.lock();
        match sessions.get_mut(user) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                sessions.remove(user);
            }
            None => warn!("released a session of {} that was never acquired", user),
        }
    }

    pub fn count(&self, user: &str) -> usize {
        self.lock().get(user).copied().unwrap_or(0)
    }
}

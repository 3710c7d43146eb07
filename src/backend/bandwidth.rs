//! Fair sharing of a global bandwidth limit between sessions.
//!
//! Every interval each session is allowed `budget / n` bytes. What sessions
//! below their share leave unused is split evenly between the sessions above
//! it, for that interval only.
use std::time::Duration;

/// Bytes each session may have moved this interval, given what each did move.
pub fn allocate(budget: u64, used: &[u64]) -> Vec<u64> {
    if used.is_empty() {
        return vec![];
    }
    let share = budget / used.len() as u64;
    let slack: u64 = used.iter().map(|&u| share.saturating_sub(u)).sum();
    let over = used.iter().filter(|&&u| u > share).count() as u64;
    let bonus = if over > 0 { slack / over } else { 0 };
    used.iter()
        .map(|&u| if u > share { share + bonus } else { share })
        .collect()
}

/// How long to pause a session that moved `used` bytes while allowed
/// `allowed`, so that it falls back to its share. Never longer than one
/// interval.
pub fn pause_for(used: u64, allowed: u64, interval: Duration) -> Option<Duration> {
    if used <= allowed {
        return None;
    }
    if allowed == 0 {
        return Some(interval);
    }
    let excess = (used - allowed) as f64 / allowed as f64;
    Some(interval.mul_f64(excess.min(1.0)))
}

//! Process identity and identifier sanitization.
//!
//! Process identity and the per-process local-sequence counter live on a
//! single `RuntimeContext`, constructed once and shared via `Arc`, rather
//! than as `static`/`lazy_static` globals.

use std::sync::atomic::{AtomicU32, Ordering};

/// Lowercases ASCII alphanumerics, maps every other code point to `-`.
/// Length-preserving and deterministic. `safe("")` is `""`.
pub fn safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// `safe()` lifted over `Option`: `safe_opt(None) == None`.
pub fn safe_opt(name: Option<&str>) -> Option<String> {
    name.map(safe)
}

/// Same as `safe`, but capitalizes the first alphanumeric character of each
/// contiguous alphanumeric run and substitutes `x` for non-alphanumerics, so
/// the result is a valid component of a stricter identifier alphabet (e.g.
/// table names, which must start with a letter and contain only
/// alphanumerics).
pub fn table_safe(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_run_start = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if at_run_start {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c.to_ascii_lowercase());
            }
            at_run_start = false;
        } else {
            out.push('x');
            at_run_start = true;
        }
    }
    out
}

/// Process identity: `<sanitized-hostname>-<pid>`, computed once.
fn compute_process_identity() -> String {
    let hostname = hostname_best_effort();
    format!("{}-{}", safe(&hostname), std::process::id())
}

fn hostname_best_effort() -> String {
    #[cfg(unix)]
    {
        if let Ok(h) = std::env::var("HOSTNAME") {
            if !h.is_empty() {
                return h;
            }
        }
    }
    rustix_gethostname().unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(unix)]
fn rustix_gethostname() -> Option<String> {
    // Avoid an extra dependency: libc-free hostname retrieval via /proc on
    // Linux, falling back to None (caller substitutes a default).
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(not(unix))]
fn rustix_gethostname() -> Option<String> {
    None
}

/// Shared, process-wide runtime state: identity string and the per-process
/// monotonically increasing local-sequence counter used as a same-source
/// tie-breaker in the message ordering comparator (see `Message::cmp_order`).
#[derive(Debug)]
pub struct RuntimeContext {
    identity: String,
    local_sequence: AtomicU32,
}

impl RuntimeContext {
    /// Construct a new runtime context with a freshly computed process
    /// identity. Call this once at library initialization and share the
    /// result via `Arc<RuntimeContext>`.
    pub fn new() -> Self {
        Self {
            identity: compute_process_identity(),
            local_sequence: AtomicU32::new(0),
        }
    }

    /// Construct with an explicit identity (tests, or operator override).
    pub fn with_identity(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            local_sequence: AtomicU32::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Allocate the next local sequence number for a message created by this
    /// process.
    pub fn next_local_sequence(&self) -> u32 {
        self.local_sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_lowercases_and_maps_non_alnum() {
        assert_eq!(safe("Order-Events_2024!"), "order-events-2024-");
        assert_eq!(safe(""), "");
    }

    #[test]
    fn safe_opt_passes_through_none() {
        assert_eq!(safe_opt(None), None);
        assert_eq!(safe_opt(Some("")), Some("".to_string()));
    }

    #[test]
    fn table_safe_capitalizes_run_starts() {
        assert_eq!(table_safe("order-events"), "OrderxEvents");
        assert_eq!(table_safe("abc"), "Abc");
        assert_eq!(table_safe(""), "");
        assert_eq!(table_safe("2fast"), "2fast");
    }

    #[test]
    fn local_sequence_is_monotonic() {
        let ctx = RuntimeContext::with_identity("host-1");
        let a = ctx.next_local_sequence();
        let b = ctx.next_local_sequence();
        assert!(b > a);
    }
}

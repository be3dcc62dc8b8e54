//! Latency-windowed round-robin proxy selection.
//!
//! Selection is restricted to connected proxies whose last ismaster
//! round-trip sits within `min_latency + local_threshold`, then rotates
//! across the survivors. Ties break on insertion order because the proxy
//! sets preserve it.

use std::time::Duration;

use crate::proxy::ProxyHandle;

/// Pick one eligible proxy, advancing the rotation cursor.
///
/// Returns `None` when no connected proxy passes the latency window.
pub(crate) fn pick<'a>(
    connected: &'a [ProxyHandle],
    min_latency: Option<Duration>,
    local_threshold: Duration,
    index: &mut usize,
) -> Option<&'a ProxyHandle> {
    let floor = min_latency.unwrap_or(Duration::MAX);
    let window = floor.saturating_add(local_threshold);

    let eligible: Vec<&ProxyHandle> = connected
        .iter()
        .filter(|h| {
            h.last_rtt.map(|rtt| rtt <= window).unwrap_or(false) && h.transport.is_connected()
        })
        .collect();

    if eligible.is_empty() {
        return None;
    }

    let chosen = eligible[*index % eligible.len()];
    *index = (*index + 1) % eligible.len();
    Some(chosen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::proxy::{ProxyAddress, ProxySet};
    use crate::testkit::proxy::ScriptedProxy;

    fn connected_handle(name: &str, rtt_ms: u64) -> ProxyHandle {
        let address: ProxyAddress = name.parse().unwrap();
        let proxy = Arc::new(ScriptedProxy::new(address.clone()));
        proxy.force_connected();
        let mut handle = ProxyHandle::new(address, proxy);
        handle.last_rtt = Some(Duration::from_millis(rtt_ms));
        handle
    }

    fn set(handles: Vec<ProxyHandle>) -> ProxySet {
        let mut set = ProxySet::default();
        for h in handles {
            set.push(h);
        }
        set
    }

    #[test]
    fn slow_proxies_fall_outside_the_window() {
        let set = set(vec![
            connected_handle("a:1", 5),
            connected_handle("b:2", 8),
            connected_handle("c:3", 40),
        ]);
        let mut index = 0;

        let mut picked = Vec::new();
        for _ in 0..10 {
            let handle = pick(
                set.as_slice(),
                Some(Duration::from_millis(5)),
                Duration::from_millis(15),
                &mut index,
            )
            .unwrap();
            picked.push(handle.name().to_string());
        }

        assert!(!picked.iter().any(|n| n == "c:3"));
        assert_eq!(picked.iter().filter(|n| *n == "a:1").count(), 5);
        assert_eq!(picked.iter().filter(|n| *n == "b:2").count(), 5);
    }

    #[test]
    fn rotation_is_fair_over_the_eligible_set() {
        let set = set(vec![
            connected_handle("a:1", 5),
            connected_handle("b:2", 6),
            connected_handle("c:3", 7),
        ]);
        let mut index = 0;

        let names: Vec<String> = (0..9)
            .map(|_| {
                pick(
                    set.as_slice(),
                    Some(Duration::from_millis(5)),
                    Duration::from_millis(15),
                    &mut index,
                )
                .unwrap()
                .name()
                .to_string()
            })
            .collect();

        for chunk in names.chunks(3) {
            assert_eq!(chunk, ["a:1", "b:2", "c:3"]);
        }
    }

    #[test]
    fn disconnected_transports_are_skipped() {
        let alive = connected_handle("a:1", 5);
        let address: ProxyAddress = "b:2".parse().unwrap();
        let dead_proxy = Arc::new(ScriptedProxy::new(address.clone()));
        let mut dead = ProxyHandle::new(address, dead_proxy);
        dead.last_rtt = Some(Duration::from_millis(5));

        let set = set(vec![alive, dead]);
        let mut index = 0;
        for _ in 0..4 {
            let handle = pick(
                set.as_slice(),
                Some(Duration::from_millis(5)),
                Duration::from_millis(15),
                &mut index,
            )
            .unwrap();
            assert_eq!(handle.name(), "a:1");
        }
    }

    #[test]
    fn empty_window_yields_none() {
        let set = set(vec![connected_handle("a:1", 100)]);
        let mut index = 0;
        assert!(pick(
            set.as_slice(),
            Some(Duration::from_millis(5)),
            Duration::from_millis(15),
            &mut index,
        )
        .is_none());
    }

    #[test]
    fn unknown_floor_admits_everything_connected() {
        // Before any latency sample exists the floor is +inf and the window
        // saturates, so every connected proxy with a sample is eligible.
        let set = set(vec![connected_handle("a:1", 500)]);
        let mut index = 0;
        assert!(pick(set.as_slice(), None, Duration::from_millis(15), &mut index).is_some());
    }
}

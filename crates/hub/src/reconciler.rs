//! Viewport reconciler (C7, spec §4.7): derives the PTY dimensions from the
//! set of currently attached viewers.
//!
//! Policy is **min-over-viewers** — spec's explicit Open Question 2
//! resolution, independently corroborated by the `jss826-den` donor
//! example's `recalculate_size`, which is exactly
//! `clients.iter().map(|c| c.cols).min()`. This module is that function,
//! generalised from a single-process local registry to the Hub's per-room
//! viewer map; it returns the computed size for the caller to debounce and
//! send to the agent as a `resize` command, since the Agent (not the Hub)
//! owns the PTY.

use std::collections::HashMap;

use nexus_protocol::ClientId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub cols: u16,
    pub rows: u16,
}

/// Given the current viewer set, compute the dimensions the PTY should be
/// resized to. Returns `None` when the viewer set is empty — the caller
/// retains whatever size was last applied (spec §4.7: "If no viewer is
/// attached, retain the last applied size").
pub fn reconcile(viewers: &HashMap<ClientId, Viewport>) -> Option<Viewport> {
    if viewers.is_empty() {
        return None;
    }
    let cols = viewers.values().map(|v| v.cols).min()?;
    let rows = viewers.values().map(|v| v.rows).min()?;
    Some(Viewport { cols, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn empty_viewer_set_has_no_reconciled_size() {
        let viewers = HashMap::new();
        assert_eq!(reconcile(&viewers), None);
    }

    #[test]
    fn single_viewer_size_is_applied_directly() {
        let mut viewers = HashMap::new();
        viewers.insert(Uuid::new_v4(), Viewport { cols: 80, rows: 24 });
        assert_eq!(reconcile(&viewers), Some(Viewport { cols: 80, rows: 24 }));
    }

    #[test]
    fn two_viewers_take_the_minimum_of_each_dimension() {
        let mut viewers = HashMap::new();
        viewers.insert(Uuid::new_v4(), Viewport { cols: 80, rows: 24 });
        viewers.insert(Uuid::new_v4(), Viewport { cols: 100, rows: 40 });
        assert_eq!(reconcile(&viewers), Some(Viewport { cols: 80, rows: 24 }));
    }

    #[test]
    fn minimum_is_taken_per_dimension_independently() {
        // A narrower-but-taller viewer and a wider-but-shorter viewer should
        // combine into the narrowest cols and the shortest rows, not either
        // viewer's size as a whole (spec §4.7's "min-over-viewers" is
        // per-axis, mirroring typical terminal multiplexer behaviour).
        let mut viewers = HashMap::new();
        viewers.insert(Uuid::new_v4(), Viewport { cols: 60, rows: 50 });
        viewers.insert(Uuid::new_v4(), Viewport { cols: 120, rows: 20 });
        assert_eq!(reconcile(&viewers), Some(Viewport { cols: 60, rows: 20 }));
    }

    #[test]
    fn removing_the_larger_viewer_keeps_remaining_size() {
        let mut viewers = HashMap::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        viewers.insert(a, Viewport { cols: 80, rows: 24 });
        viewers.insert(b, Viewport { cols: 100, rows: 40 });
        assert_eq!(reconcile(&viewers), Some(Viewport { cols: 80, rows: 24 }));

        viewers.remove(&b);
        assert_eq!(reconcile(&viewers), Some(Viewport { cols: 80, rows: 24 }));
    }

    #[test]
    fn resize_is_idempotent_under_a_fixed_viewer_set() {
        let mut viewers = HashMap::new();
        viewers.insert(Uuid::new_v4(), Viewport { cols: 80, rows: 24 });
        let first = reconcile(&viewers);
        let second = reconcile(&viewers);
        assert_eq!(first, second);
    }
}

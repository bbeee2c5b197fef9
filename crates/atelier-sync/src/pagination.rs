//! Backward-in-time page loading and scroll-anchor preservation.
//!
//! The cursor is the `created_at` of the oldest loaded row; each page asks
//! for strictly older rows. A short page is definitive proof history is
//! exhausted; an exactly-full page just means "more likely".

use chrono::{DateTime, Utc};

use crate::viewport::ViewportMetrics;

/// Drives backward page loads for one conversation. Reset on switch.
#[derive(Debug)]
pub struct Paginator {
    page_size: u32,
    cursor: Option<DateTime<Utc>>,
    has_more: bool,
    in_flight: bool,
}

impl Paginator {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            cursor: None,
            has_more: true,
            in_flight: false,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight
    }

    /// True when a scroll near the top should issue a fetch: history left
    /// and no load already in flight.
    pub fn should_load_older(&self) -> bool {
        self.has_more && !self.in_flight
    }

    /// Mark a fetch as issued. Returns `(before, limit)` for the store call.
    pub fn begin(&mut self) -> (Option<DateTime<Utc>>, u32) {
        self.in_flight = true;
        (self.cursor, self.page_size)
    }

    /// Record a completed fetch. `oldest_loaded` is the timeline's oldest
    /// durable timestamp after the merge; `returned` is the raw row count
    /// the store handed back (pre-dedup — a full page of overlap still
    /// means more history may exist).
    pub fn complete(&mut self, oldest_loaded: Option<DateTime<Utc>>, returned: usize) {
        self.in_flight = false;
        self.cursor = oldest_loaded;
        // Pagination stops permanently for this conversation on the first
        // short page.
        if returned < self.page_size as usize {
            self.has_more = false;
        }
    }

    /// Record a failed fetch: clear the loading indicator, leave `has_more`
    /// alone. The next scroll trigger retries.
    pub fn fail(&mut self) {
        self.in_flight = false;
    }
}

/// Captures the scroll geometry before a prepend so the visual position of
/// already-visible rows doesn't jump.
///
/// Protocol: capture before mutating, commit the prepend, let the render
/// layer measure the new scroll height (measurement must come from a pass
/// that already reflects the inserted rows — in practice two coalesced
/// layout passes), then apply [`ScrollAnchor::restore`] as the new offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollAnchor {
    old_height: f32,
    old_offset: f32,
}

impl ScrollAnchor {
    pub fn capture(metrics: &ViewportMetrics) -> Self {
        Self {
            old_height: metrics.scroll_height,
            old_offset: metrics.scroll_offset,
        }
    }

    /// New scroll offset after the prepend: `new_height - old_height +
    /// old_offset`.
    pub fn restore(&self, new_height: f32) -> f32 {
        new_height - self.old_height + self.old_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn short_page_stops_pagination_permanently() {
        let mut p = Paginator::new(30);
        assert!(p.should_load_older());

        let (before, limit) = p.begin();
        assert_eq!(before, None);
        assert_eq!(limit, 30);
        assert!(!p.should_load_older()); // in flight

        // 12 rows when 30 were requested: no more history.
        p.complete(Some(Utc::now()), 12);
        assert!(!p.has_more());
        assert!(!p.should_load_older());
    }

    #[test]
    fn full_page_keeps_going_and_advances_cursor() {
        let mut p = Paginator::new(30);
        let oldest = Utc::now();

        p.begin();
        p.complete(Some(oldest), 30);
        assert!(p.has_more());

        let older = oldest - Duration::minutes(5);
        let (before, _) = p.begin();
        assert_eq!(before, Some(oldest));
        p.complete(Some(older), 30);
        assert_eq!(p.begin().0, Some(older));
    }

    #[test]
    fn failed_fetch_clears_indicator_but_not_has_more() {
        let mut p = Paginator::new(30);
        p.begin();
        assert!(p.is_loading());

        p.fail();
        assert!(!p.is_loading());
        assert!(p.has_more());
        // Retried on the next trigger.
        assert!(p.should_load_older());
    }

    #[test]
    fn anchor_restores_visual_position() {
        let metrics = ViewportMetrics {
            scroll_offset: 48.0,
            scroll_height: 2400.0,
            viewport_height: 800.0,
        };
        let anchor = ScrollAnchor::capture(&metrics);

        // 30 older rows added ~1800px above the fold.
        let new_height = 4200.0;
        assert_eq!(
            anchor.restore(new_height),
            48.0 + (new_height - 2400.0)
        );
    }
}

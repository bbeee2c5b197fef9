//! Viewport state reported in by the embedding UI.
//!
//! The engine never reads ambient layout globals; the shell reports scroll
//! geometry explicitly and gets explicit signals back (auto-scroll vs
//! "new messages" badge), so all of this is testable without a real view.

/// Scroll geometry of the timeline view, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMetrics {
    /// Distance scrolled from the top of the content.
    pub scroll_offset: f32,
    /// Total content height.
    pub scroll_height: f32,
    /// Visible height.
    pub viewport_height: f32,
}

impl ViewportMetrics {
    /// Within `threshold` px of the top of the rendered timeline.
    pub fn near_top(&self, threshold: f32) -> bool {
        self.scroll_offset <= threshold
    }

    /// At (or within `slack` px of) the bottom.
    pub fn at_bottom(&self, slack: f32) -> bool {
        self.scroll_offset + self.viewport_height >= self.scroll_height - slack
    }
}

/// What the UI should do about a newly arrived peer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalAction {
    /// Viewport is at the bottom: follow the conversation.
    AutoScroll,
    /// Scrolled away: show the "new messages" affordance instead. Carries
    /// the updated unread count.
    Badge(u32),
}

/// Tracks where the viewport is and how many peer messages arrived below it.
#[derive(Debug)]
pub struct ViewTracker {
    metrics: Option<ViewportMetrics>,
    unread: u32,
    bottom_slack: f32,
}

impl ViewTracker {
    pub fn new(bottom_slack: f32) -> Self {
        Self {
            metrics: None,
            unread: 0,
            bottom_slack,
        }
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub fn metrics(&self) -> Option<ViewportMetrics> {
        self.metrics
    }

    /// Record the latest scroll geometry. Scrolling back to the bottom
    /// clears the unread counter.
    pub fn update(&mut self, metrics: ViewportMetrics) {
        if metrics.at_bottom(self.bottom_slack) {
            self.unread = 0;
        }
        self.metrics = Some(metrics);
    }

    /// A peer message arrived. Before the first metrics report the view is
    /// treated as at-bottom (a fresh conversation opens scrolled to the
    /// newest message).
    pub fn on_peer_message(&mut self) -> ArrivalAction {
        let at_bottom = self
            .metrics
            .map(|m| m.at_bottom(self.bottom_slack))
            .unwrap_or(true);
        if at_bottom {
            ArrivalAction::AutoScroll
        } else {
            self.unread += 1;
            ArrivalAction::Badge(self.unread)
        }
    }

    /// The user jumped to the latest messages (clicked the badge);
    /// counter resets.
    pub fn caught_up(&mut self) {
        self.unread = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(offset: f32, height: f32, viewport: f32) -> ViewportMetrics {
        ViewportMetrics {
            scroll_offset: offset,
            scroll_height: height,
            viewport_height: viewport,
        }
    }

    #[test]
    fn at_bottom_inserts_auto_scroll_and_never_count() {
        let mut view = ViewTracker::new(40.0);
        view.update(metrics(1600.0, 2400.0, 800.0));

        assert_eq!(view.on_peer_message(), ArrivalAction::AutoScroll);
        assert_eq!(view.unread(), 0);
    }

    #[test]
    fn scrolled_away_inserts_accumulate_badge() {
        let mut view = ViewTracker::new(40.0);
        view.update(metrics(200.0, 2400.0, 800.0));

        assert_eq!(view.on_peer_message(), ArrivalAction::Badge(1));
        assert_eq!(view.on_peer_message(), ArrivalAction::Badge(2));
        assert_eq!(view.unread(), 2);

        // Scrolling back to the bottom clears the counter.
        view.update(metrics(1600.0, 2400.0, 800.0));
        assert_eq!(view.unread(), 0);
    }

    #[test]
    fn fresh_view_counts_as_at_bottom() {
        let mut view = ViewTracker::new(40.0);
        assert_eq!(view.on_peer_message(), ArrivalAction::AutoScroll);
    }
}

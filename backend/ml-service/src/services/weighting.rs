// ============================================
// Weighting & Decay Policy
// ============================================
//
// Converts raw events, ratings and reviews into signed interaction weights.
// Every graph builder goes through this type so the three engines see the
// same numbers for the same records.

use crate::config::WeightingConfig;
use crate::models::{BehaviorEvent, EventKind, RatingRecord, ReviewRecord};
use crate::utils::exponential_decay;
use chrono::{DateTime, Utc};

pub const MIN_STARS: i32 = 1;
pub const MAX_STARS: i32 = 5;

#[derive(Debug, Clone, Default)]
pub struct WeightPolicy {
    config: WeightingConfig,
}

impl WeightPolicy {
    pub fn new(config: WeightingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WeightingConfig {
        &self.config
    }

    /// Base weight of a behavioral event. Play events grow with the log of
    /// the session length; unknown kinds contribute zero.
    pub fn event_weight(&self, kind: EventKind, duration_secs: Option<f64>) -> f64 {
        match kind {
            EventKind::Impression => self.config.impression_weight,
            EventKind::Click => self.config.click_weight,
            EventKind::Play => match duration_secs {
                Some(d) if d > 0.0 => self.config.play_weight + (d + 1.0).ln(),
                _ => self.config.play_weight,
            },
            EventKind::Unknown => 0.0,
        }
    }

    /// Linear interpolation between the low anchor (1 star) and the high
    /// anchor (5 stars). Out-of-range stars are clamped.
    pub fn rating_weight(&self, stars: i32) -> f64 {
        let stars = stars.clamp(MIN_STARS, MAX_STARS);
        let span = self.config.rating_high_anchor - self.config.rating_low_anchor;
        let t = f64::from(stars - MIN_STARS) / f64::from(MAX_STARS - MIN_STARS);
        self.config.rating_low_anchor + span * t
    }

    pub fn review_weight(&self, stars: i32, sentiment: Option<f64>) -> f64 {
        let base = self.rating_weight(stars);
        match sentiment {
            Some(s) => base * (1.0 + s * self.config.review_sentiment_factor),
            None => base,
        }
    }

    pub fn behavior_decay(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        exponential_decay(elapsed_secs(at, now), self.config.behavior_half_life_days)
    }

    pub fn rating_decay(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        exponential_decay(elapsed_secs(at, now), self.config.rating_half_life_days)
    }

    pub fn decayed_event(&self, event: &BehaviorEvent, now: DateTime<Utc>) -> f64 {
        self.event_weight(event.kind, event.duration_secs) * self.behavior_decay(event.timestamp, now)
    }

    pub fn decayed_rating(&self, rating: &RatingRecord, now: DateTime<Utc>) -> f64 {
        self.rating_weight(rating.stars) * self.rating_decay(rating.timestamp, now)
    }

    pub fn decayed_review(&self, review: &ReviewRecord, now: DateTime<Utc>) -> f64 {
        self.review_weight(review.stars, review.sentiment) * self.rating_decay(review.timestamp, now)
    }
}

fn elapsed_secs(at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - at).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy() -> WeightPolicy {
        WeightPolicy::default()
    }

    #[test]
    fn test_rating_anchors() {
        let p = policy();
        assert!((p.rating_weight(1) - -6.0).abs() < 1e-9);
        assert!((p.rating_weight(5) - 8.0).abs() < 1e-9);
        assert!((p.rating_weight(3) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rating_monotonic() {
        let p = policy();
        let weights: Vec<f64> = (1..=5).map(|s| p.rating_weight(s)).collect();
        assert!(weights.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_rating_clamped() {
        let p = policy();
        assert_eq!(p.rating_weight(0), p.rating_weight(1));
        assert_eq!(p.rating_weight(9), p.rating_weight(5));
    }

    #[test]
    fn test_event_weights() {
        let p = policy();
        assert!((p.event_weight(EventKind::Impression, None) - 0.2).abs() < 1e-9);
        assert!((p.event_weight(EventKind::Click, None) - 1.0).abs() < 1e-9);
        assert!((p.event_weight(EventKind::Play, None) - 2.0).abs() < 1e-9);
        assert!((p.event_weight(EventKind::Play, Some(0.0)) - 2.0).abs() < 1e-9);

        let long_play = p.event_weight(EventKind::Play, Some(599.0));
        assert!((long_play - (2.0 + 600.0_f64.ln())).abs() < 1e-9);

        assert_eq!(p.event_weight(EventKind::Unknown, Some(100.0)), 0.0);
    }

    #[test]
    fn test_review_sentiment_scaling() {
        let p = policy();
        assert!((p.review_weight(5, Some(1.0)) - 12.0).abs() < 1e-9);
        assert!((p.review_weight(5, Some(-1.0)) - 4.0).abs() < 1e-9);
        assert!((p.review_weight(5, None) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_half_lives() {
        let p = policy();
        let now = Utc::now();
        let week_ago = now - Duration::days(7);
        assert!((p.behavior_decay(week_ago, now) - 0.5).abs() < 1e-6);

        let quarter_ago = now - Duration::days(90);
        assert!((p.rating_decay(quarter_ago, now) - 0.5).abs() < 1e-6);
    }
}

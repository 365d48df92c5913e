//! C5: Reward Calculator. Turns raw interactions into a scalar reward, binary or scaled.

use crate::events::RecommendationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardMode {
    Binary,
    Scaled,
}

#[derive(Debug, Clone, Copy)]
pub struct RewardCalculator {
    pub mode: RewardMode,
    pub binary_threshold: f64,
    pub rating_threshold_positive: f64,
    pub rating_threshold_negative: f64,
}

impl RewardCalculator {
    pub fn new(
        mode: RewardMode,
        binary_threshold: f64,
        rating_threshold_positive: f64,
        rating_threshold_negative: f64,
    ) -> Self {
        Self {
            mode,
            binary_threshold,
            rating_threshold_positive,
            rating_threshold_negative,
        }
    }

    /// Pure function of `(event, interactions)`: recomputation with unchanged inputs
    /// always yields the same value.
    ///
    /// `interactions` is every event for the same `(user, item)` observed within the
    /// attribution window, which may or may not include `event` itself — both the
    /// triggering event and any later re-serves carry interaction flags that count.
    pub fn compute(&self, event: &RecommendationEvent, interactions: &[RecommendationEvent]) -> f64 {
        match self.mode {
            RewardMode::Binary => self.compute_binary(event, interactions),
            RewardMode::Scaled => self.compute_scaled(event, interactions),
        }
    }

    fn compute_binary(&self, event: &RecommendationEvent, interactions: &[RecommendationEvent]) -> f64 {
        let mut clicked = event.clicked;
        let mut thumbs_up = event.thumbs_up;
        let mut thumbs_down = event.thumbs_down;
        let mut favorite = event.added_to_favorites;
        let mut watchlist = event.added_to_watchlist;
        let mut rating: Option<f64> = event.rating_value;
        let mut watched_fraction = event.watched_fraction;

        for i in interactions {
            clicked |= i.clicked;
            thumbs_up |= i.thumbs_up;
            thumbs_down |= i.thumbs_down;
            favorite |= i.added_to_favorites;
            watchlist |= i.added_to_watchlist;
            rating = rating.or(i.rating_value);
            watched_fraction = watched_fraction.or(i.watched_fraction);
        }

        if clicked
            || thumbs_up
            || favorite
            || rating.map(|r| r >= self.rating_threshold_positive).unwrap_or(false)
            || watched_fraction.map(|w| w >= self.binary_threshold).unwrap_or(false)
        {
            return 1.0;
        }
        if thumbs_down || rating.map(|r| r <= self.rating_threshold_negative).unwrap_or(false) {
            return 0.0;
        }
        if watchlist {
            return 0.7;
        }
        0.0
    }

    fn compute_scaled(&self, event: &RecommendationEvent, interactions: &[RecommendationEvent]) -> f64 {
        let mut total = 0.0;

        if event.clicked || interactions.iter().any(|i| i.clicked) {
            total += 0.3;
        }
        if event.thumbs_up || interactions.iter().any(|i| i.thumbs_up) {
            total += 0.4;
        }
        if event.thumbs_down || interactions.iter().any(|i| i.thumbs_down) {
            total -= 0.3;
        }
        if event.added_to_favorites || interactions.iter().any(|i| i.added_to_favorites) {
            total += 0.5;
        }
        if event.added_to_watchlist || interactions.iter().any(|i| i.added_to_watchlist) {
            total += 0.2;
        }
        if let Some(r) = event.rating_value {
            total += ((r - 1.0) / 4.0) * 0.6;
        } else if let Some(r) = interactions.iter().find_map(|i| i.rating_value) {
            total += ((r - 1.0) / 4.0) * 0.4;
        }
        if let Some(wf) = interactions.iter().find_map(|i| i.watched_fraction) {
            total += wf * 0.3;
        } else if let Some(wf) = event.watched_fraction {
            total += wf * 0.3;
        }

        total.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_event() -> RecommendationEvent {
        RecommendationEvent {
            id: 1,
            user_id: 1,
            movie_id: Some(1),
            algorithm: "thompson".to_string(),
            position: Some(0),
            score: Some(1.0),
            clicked: false,
            clicked_at: None,
            rated: false,
            rated_at: None,
            rating_value: None,
            thumbs_up: false,
            thumbs_up_at: None,
            thumbs_down: false,
            thumbs_down_at: None,
            added_to_watchlist: false,
            added_to_watchlist_at: None,
            added_to_favorites: false,
            added_to_favorites_at: None,
            watched_fraction: None,
            experiment_id: None,
            policy: None,
            arm_id: None,
            p_score: None,
            latency_ms: None,
            reward: None,
            served_at: Utc::now(),
            created_at: Utc::now(),
            context: None,
        }
    }

    #[test]
    fn click_yields_positive_binary_reward_and_is_idempotent() {
        let calc = RewardCalculator::new(RewardMode::Binary, 0.5, 4.0, 2.0);
        let mut event = base_event();
        event.clicked = true;
        let r1 = calc.compute(&event, &[]);
        let r2 = calc.compute(&event, &[]);
        assert_eq!(r1, 1.0);
        assert_eq!(r1, r2);
    }

    #[test]
    fn click_outweighs_a_thumbs_down_on_the_same_event() {
        let calc = RewardCalculator::new(RewardMode::Binary, 0.5, 4.0, 2.0);
        let mut event = base_event();
        event.clicked = true;
        event.thumbs_down = true;
        assert_eq!(calc.compute(&event, &[]), 1.0);
    }

    #[test]
    fn thumbs_down_alone_yields_zero() {
        let calc = RewardCalculator::new(RewardMode::Binary, 0.5, 4.0, 2.0);
        let mut event = base_event();
        event.thumbs_down = true;
        assert_eq!(calc.compute(&event, &[]), 0.0);
    }

    #[test]
    fn watchlist_only_is_point_seven() {
        let calc = RewardCalculator::new(RewardMode::Binary, 0.5, 4.0, 2.0);
        let mut event = base_event();
        event.added_to_watchlist = true;
        assert_eq!(calc.compute(&event, &[]), 0.7);
    }

    #[test]
    fn mid_range_rating_alone_contributes_nothing() {
        let calc = RewardCalculator::new(RewardMode::Binary, 0.5, 4.0, 2.0);
        let mut event = base_event();
        event.rating_value = Some(3.0);
        assert_eq!(calc.compute(&event, &[]), 0.0);
    }

    #[test]
    fn scaled_mode_clamps_to_unit_interval() {
        let calc = RewardCalculator::new(RewardMode::Scaled, 0.5, 4.0, 2.0);
        let mut event = base_event();
        event.clicked = true;
        event.thumbs_up = true;
        event.added_to_favorites = true;
        event.added_to_watchlist = true;
        event.rating_value = Some(5.0);
        let reward = calc.compute(&event, &[]);
        assert!(reward <= 1.0);
    }
}

//! Subscriber selection for targeted publications.

use skein_core::RandomProvider;

/// Chooses which subscribers receive a targeted publication.
pub trait PublishStrategy {
    /// Pick the addresses to send to from the current subscribers.
    fn select(&self, subscribers: &[String]) -> Vec<String>;
}

/// Every subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct Broadcast;

impl PublishStrategy for Broadcast {
    fn select(&self, subscribers: &[String]) -> Vec<String> {
        subscribers.to_vec()
    }
}

/// One subscriber chosen uniformly at random.
#[derive(Debug, Clone)]
pub struct PickOne<R: RandomProvider> {
    random: R,
}

impl<R: RandomProvider> PickOne<R> {
    /// Strategy drawing from `random`.
    pub fn new(random: R) -> Self {
        Self { random }
    }
}

impl<R: RandomProvider> PublishStrategy for PickOne<R> {
    fn select(&self, subscribers: &[String]) -> Vec<String> {
        if subscribers.is_empty() {
            return Vec::new();
        }
        let index = self.random.random_range(0..subscribers.len());
        subscribers.get(index).cloned().into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::TokioRandomProvider;

    fn subscribers() -> Vec<String> {
        vec!["a:1".into(), "b:2".into(), "c:3".into()]
    }

    #[test]
    fn test_broadcast_selects_all() {
        assert_eq!(Broadcast.select(&subscribers()), subscribers());
    }

    #[test]
    fn test_pick_one() {
        let strategy = PickOne::new(TokioRandomProvider::new());
        for _ in 0..20 {
            let picked = strategy.select(&subscribers());
            assert_eq!(picked.len(), 1);
            assert!(subscribers().contains(&picked[0]));
        }
        assert!(strategy.select(&[]).is_empty());
    }
}

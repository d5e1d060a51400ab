use crate::domain::task::TaskPrice;
use rand::Rng;
use std::ops::Range;

/// Decides what a freshly seen task costs and pays.
pub trait PricingPolicy: Send + Sync {
    fn price(&self, task_public_id: &str) -> TaskPrice;
}

/// Uniformly random prices, cost in `[10, 20)` and reward in `[20, 40)` by default.
#[derive(Debug, Clone)]
pub struct RandomPricing {
    cost: Range<u64>,
    reward: Range<u64>,
}

impl RandomPricing {
    pub fn new(cost: Range<u64>, reward: Range<u64>) -> Self {
        Self { cost, reward }
    }
}

impl Default for RandomPricing {
    fn default() -> Self {
        Self::new(10..20, 20..40)
    }
}

impl PricingPolicy for RandomPricing {
    fn price(&self, _task_public_id: &str) -> TaskPrice {
        let mut rng = rand::thread_rng();
        TaskPrice {
            cost_of_assignment: rng.gen_range(self.cost.clone()),
            completion_reward: rng.gen_range(self.reward.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedPricing(pub TaskPrice);

impl FixedPricing {
    pub fn new(cost_of_assignment: u64, completion_reward: u64) -> Self {
        Self(TaskPrice {
            cost_of_assignment,
            completion_reward,
        })
    }
}

impl PricingPolicy for FixedPricing {
    fn price(&self, _task_public_id: &str) -> TaskPrice {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_pricing_stays_in_range() {
        let pricing = RandomPricing::default();
        for i in 0..500 {
            let price = pricing.price(&format!("t-{i}"));
            assert!((10..20).contains(&price.cost_of_assignment));
            assert!((20..40).contains(&price.completion_reward));
        }
    }

    #[test]
    fn test_fixed_pricing() {
        let price = FixedPricing::new(12, 30).price("t-1");
        assert_eq!(price.cost_of_assignment, 12);
        assert_eq!(price.completion_reward, 30);
    }
}

use std::fmt;

use crate::{model::ThreadDocument, pipeline_config::BatchingConfig};

/// Size class of a thread by estimated token cost of its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        };
        write!(f, "{}", name)
    }
}

impl Tier {
    pub fn for_tokens(tokens: usize, cfg: &BatchingConfig) -> Self {
        if tokens < cfg.small_max_tokens {
            Tier::Small
        } else if tokens < cfg.medium_max_tokens {
            Tier::Medium
        } else {
            Tier::Large
        }
    }

    pub fn item_cap(&self, cfg: &BatchingConfig) -> usize {
        let cap = match self {
            Tier::Small => cfg.small_batch_items,
            Tier::Medium => cfg.medium_batch_items,
            Tier::Large => cfg.large_batch_items,
        };
        cap.max(1)
    }

    /// `None` means unbounded.
    pub fn token_budget(&self, cfg: &BatchingConfig) -> Option<usize> {
        match self {
            Tier::Small => Some(cfg.small_batch_tokens),
            Tier::Medium => Some(cfg.medium_batch_tokens),
            Tier::Large => cfg.large_batch_tokens,
        }
    }
}

/// One thread as the classifier sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitItem {
    pub thread_id: String,
    pub sender: String,
    pub subject: String,
    pub text: String,
    pub tokens: usize,
}

impl UnitItem {
    pub fn from_document(document: &ThreadDocument) -> Self {
        Self {
            thread_id: document.thread_id.clone(),
            sender: document.sender.clone(),
            subject: document.subject.clone(),
            text: document.text.clone(),
            tokens: tokenizer::token_count(&document.text),
        }
    }
}

/// The input to one classification call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationUnit {
    pub tier: Tier,
    pub items: Vec<UnitItem>,
    pub estimated_tokens: usize,
}

impl ClassificationUnit {
    fn open(tier: Tier) -> Self {
        Self {
            tier,
            items: Vec::new(),
            estimated_tokens: 0,
        }
    }

    pub fn thread_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.thread_id.clone()).collect()
    }

    fn accepts(&self, item: &UnitItem, cfg: &BatchingConfig) -> bool {
        if self.items.is_empty() {
            return true;
        }
        if self.items.len() + 1 > self.tier.item_cap(cfg) {
            return false;
        }
        match self.tier.token_budget(cfg) {
            Some(budget) => self.estimated_tokens + item.tokens <= budget,
            None => true,
        }
    }

    fn push(&mut self, item: UnitItem) {
        self.estimated_tokens += item.tokens;
        self.items.push(item);
    }
}

/// Pack thread documents into classification units.
pub fn pack(documents: &[ThreadDocument], cfg: &BatchingConfig) -> Vec<ClassificationUnit> {
    pack_items(documents.iter().map(UnitItem::from_document).collect(), cfg)
}

/// Greedy packing per tier, in input order.
///
/// Items are partitioned into small, medium and large tiers. Within a tier a
/// unit is closed as soon as the next item would exceed the tier's item cap or
/// token budget. An item above its tier's budget still gets a unit of its own,
/// which only happens for the large tier when a budget is configured.
pub fn pack_items(items: Vec<UnitItem>, cfg: &BatchingConfig) -> Vec<ClassificationUnit> {
    let mut units = Vec::new();

    for tier in [Tier::Small, Tier::Medium, Tier::Large] {
        let mut current = ClassificationUnit::open(tier);
        for item in items
            .iter()
            .filter(|item| Tier::for_tokens(item.tokens, cfg) == tier)
        {
            if !current.accepts(item, cfg) {
                units.push(std::mem::replace(&mut current, ClassificationUnit::open(tier)));
            }
            current.push(item.clone());
        }
        if !current.items.is_empty() {
            units.push(current);
        }
    }

    tracing::debug!(
        "Packed {} threads into {} units ({} small, {} medium, {} large)",
        items.len(),
        units.len(),
        units.iter().filter(|u| u.tier == Tier::Small).count(),
        units.iter().filter(|u| u.tier == Tier::Medium).count(),
        units.iter().filter(|u| u.tier == Tier::Large).count(),
    );
    units
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn item(id: &str, tokens: usize) -> UnitItem {
        UnitItem {
            thread_id: id.to_string(),
            sender: String::new(),
            subject: String::new(),
            text: String::new(),
            tokens,
        }
    }

    #[test]
    fn test_tier_boundaries() {
        let cfg = BatchingConfig::default();
        assert_eq!(Tier::for_tokens(0, &cfg), Tier::Small);
        assert_eq!(Tier::for_tokens(4_999, &cfg), Tier::Small);
        assert_eq!(Tier::for_tokens(5_000, &cfg), Tier::Medium);
        assert_eq!(Tier::for_tokens(14_999, &cfg), Tier::Medium);
        assert_eq!(Tier::for_tokens(15_000, &cfg), Tier::Large);
    }

    #[test]
    fn test_small_items_close_on_item_cap() {
        let cfg = BatchingConfig::default();
        let items = (0..23).map(|i| item(&format!("t{}", i), 100)).collect();
        let units = pack_items(items, &cfg);
        let sizes: Vec<usize> = units.iter().map(|u| u.items.len()).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(units[0].items[0].thread_id, "t0");
        assert_eq!(units[2].items[2].thread_id, "t22");
    }

    #[test]
    fn test_small_items_close_on_token_budget() {
        let cfg = BatchingConfig::default();
        let items = vec![item("a", 4_000), item("b", 4_000), item("c", 4_000)];
        let units = pack_items(items, &cfg);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].estimated_tokens, 8_000);
        assert_eq!(units[1].thread_ids(), vec!["c".to_string()]);
    }

    #[test]
    fn test_tiers_are_never_mixed() {
        let cfg = BatchingConfig::default();
        let items = vec![
            item("s1", 10),
            item("l1", 20_000),
            item("m1", 6_000),
            item("s2", 10),
            item("l2", 90_000),
        ];
        let units = pack_items(items, &cfg);
        assert_eq!(units.len(), 4);
        assert_eq!(units[0].tier, Tier::Small);
        assert_eq!(units[0].thread_ids(), vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(units[1].tier, Tier::Medium);
        assert_eq!(units[2].thread_ids(), vec!["l1".to_string()]);
        assert_eq!(units[3].thread_ids(), vec!["l2".to_string()]);
    }

    #[test]
    fn test_empty_input() {
        assert!(pack_items(Vec::new(), &BatchingConfig::default()).is_empty());
    }

    #[test]
    fn test_packing_bounds_hold_for_random_costs() {
        let cfg = BatchingConfig::default();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for round in 0..200 {
            let count = rng.gen_range(0..60);
            let items: Vec<UnitItem> = (0..count)
                .map(|i| {
                    let tokens = match rng.gen_range(0..10) {
                        0..=5 => rng.gen_range(0..5_000),
                        6..=8 => rng.gen_range(5_000..15_000),
                        _ => rng.gen_range(15_000..120_000),
                    };
                    item(&format!("r{}-{}", round, i), tokens)
                })
                .collect();

            let units = pack_items(items.clone(), &cfg);

            for unit in &units {
                assert!(!unit.items.is_empty());
                assert!(unit.items.len() <= unit.tier.item_cap(&cfg));
                let summed: usize = unit.items.iter().map(|i| i.tokens).sum();
                assert_eq!(summed, unit.estimated_tokens);
                if let Some(budget) = unit.tier.token_budget(&cfg) {
                    assert!(summed <= budget, "{} > {} in {:?}", summed, budget, unit.tier);
                }
                for i in &unit.items {
                    assert_eq!(Tier::for_tokens(i.tokens, &cfg), unit.tier);
                }
            }

            let packed: HashSet<String> = units
                .iter()
                .flat_map(|u| u.thread_ids())
                .collect();
            assert_eq!(packed.len(), items.len());
        }
    }
}

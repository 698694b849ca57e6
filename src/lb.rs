//! Tag-aware load balancing over the live target set

use rand::Rng;

use crate::instancer::TagMap;
use crate::CallError;

/// Selects one address from the live set for a `(uri, method)` call.
pub trait LoadBalancer: Send + Sync {
    fn select(
        &self,
        uri: &str,
        method: &str,
        addrs: &[String],
        tags: &TagMap,
    ) -> Result<String, CallError>;
}

/// Weighted random selection.
///
/// Weights come from instance tags: the default is 100, `stg` drains an
/// instance to 1, and `weight_<N>` pins the weight to N clamped into
/// `[0, 100]`. The last matching tag wins. Fairness holds in expectation
/// only; no determinism is promised.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandom;

impl WeightedRandom {
    pub fn new() -> Self {
        Self
    }
}

fn weight_of(tags: &[String]) -> u64 {
    let mut weight = 100u64;
    for tag in tags {
        if tag == "stg" {
            weight = 1;
        } else if let Some(raw) = tag.strip_prefix("weight_") {
            if let Ok(value) = raw.parse::<i64>() {
                weight = value.clamp(0, 100) as u64;
            }
        }
    }
    weight
}

impl LoadBalancer for WeightedRandom {
    fn select(
        &self,
        uri: &str,
        method: &str,
        addrs: &[String],
        tags: &TagMap,
    ) -> Result<String, CallError> {
        if addrs.is_empty() {
            return Err(CallError::NoEndpoint { uri: uri.into(), method: method.into() });
        }
        if addrs.len() == 1 {
            return Ok(addrs[0].clone());
        }

        let mut steps = Vec::with_capacity(addrs.len());
        let mut total = 0u64;
        for addr in addrs {
            total += tags.get(addr).map(|t| weight_of(t)).unwrap_or(100);
            steps.push(total);
        }
        if total == 0 {
            // Every live instance is pinned to weight_0; nothing selectable.
            return Err(CallError::NoEndpoint { uri: uri.into(), method: method.into() });
        }

        let draw = rand::rng().random_range(0..total);
        let idx = steps.iter().position(|step| draw < *step).unwrap_or(0);
        Ok(addrs[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_set_is_no_endpoint() {
        let lb = WeightedRandom::new();
        let err = lb.select("/x", "GET", &[], &TagMap::new()).unwrap_err();
        assert!(err.is_no_endpoint());
    }

    #[test]
    fn single_target_fast_path_skips_weighting() {
        let lb = WeightedRandom::new();
        let mut tags = TagMap::new();
        tags.insert("a".into(), vec!["weight_0".into()]);
        let picked = lb.select("/x", "GET", &addrs(&["a"]), &tags).unwrap();
        assert_eq!(picked, "a");
    }

    #[test]
    fn weight_tag_parses_and_clamps() {
        assert_eq!(weight_of(&[]), 100);
        assert_eq!(weight_of(&["stg".into()]), 1);
        assert_eq!(weight_of(&["weight_25".into()]), 25);
        assert_eq!(weight_of(&["weight_-5".into()]), 0);
        assert_eq!(weight_of(&["weight_900".into()]), 100);
        assert_eq!(weight_of(&["weight_bogus".into()]), 100);
        // Last matching tag wins.
        assert_eq!(weight_of(&["stg".into(), "weight_40".into()]), 40);
        assert_eq!(weight_of(&["weight_40".into(), "stg".into()]), 1);
    }

    #[test]
    fn all_zero_weights_is_no_endpoint() {
        let lb = WeightedRandom::new();
        let mut tags = TagMap::new();
        tags.insert("a".into(), vec!["weight_0".into()]);
        tags.insert("b".into(), vec!["weight_0".into()]);
        let err = lb.select("/x", "GET", &addrs(&["a", "b"]), &tags).unwrap_err();
        assert!(err.is_no_endpoint());
    }

    #[test]
    fn weight_25_lands_in_expected_band() {
        let lb = WeightedRandom::new();
        let mut tags = TagMap::new();
        tags.insert("b".into(), vec!["weight_25".into()]);
        let set = addrs(&["a", "b"]);

        let mut count = 0;
        for _ in 0..1000 {
            if lb.select("/x", "GET", &set, &tags).unwrap() == "b" {
                count += 1;
            }
        }
        // E[count] = 200, sd ≈ 12.6; the band is ±3 sd.
        assert!((160..=240).contains(&count), "b selected {} times", count);
    }

    #[test]
    fn stg_tag_drains_to_one_percent() {
        let lb = WeightedRandom::new();
        let mut tags = TagMap::new();
        tags.insert("b".into(), vec!["stg".into()]);
        let set = addrs(&["a", "b"]);

        let mut count = 0;
        for _ in 0..1000 {
            if lb.select("/x", "GET", &set, &tags).unwrap() == "b" {
                count += 1;
            }
        }
        // E[count] ≈ 10 of 1000.
        assert!((2..=25).contains(&count), "b selected {} times", count);
    }
}

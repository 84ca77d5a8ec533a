//! Value reducers: pure functions that fold member values into one group value.

use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;

use super::types::AverageMethod;
use super::types::FeatureStrategy;
use super::types::Features;
use super::types::RoundMode;

/// Default tolerance for comparing temperatures and humidities.
pub const FLOAT_TOLERANCE: f64 = 0.1;

/// Combine numeric values. Returns `None` for an empty input.
pub fn average(values: &[f64], method: AverageMethod) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let value = match method {
        AverageMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AverageMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AverageMethod::Mean => values.iter().sum::<f64>() / values.len() as f64,
        AverageMethod::Median => {
            let mut sorted = values.to_vec();
            sorted.sort_by(f64::total_cmp);
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            }
        }
    };

    Some(value)
}

/// Round to the nearest half or whole unit. Ties go to the even neighbour so
/// that repeated aggregation does not drift upwards.
pub fn round_value(value: f64, mode: RoundMode) -> f64 {
    match mode {
        RoundMode::None => value,
        RoundMode::Half => (value * 2.0).round_ties_even() / 2.0,
        RoundMode::Integer => value.round_ties_even(),
    }
}

/// Intersect or union mode lists.
///
/// Empty lists come from members that do not report the attribute and do not
/// restrict the result. Output keeps first-seen order; callers sort.
pub fn reduce_modes<T>(lists: &[Vec<T>], strategy: FeatureStrategy) -> Vec<T>
where
    T: Clone + Eq + Hash,
{
    let mut lists = lists.iter().filter(|l| !l.is_empty());
    let Some(first) = lists.next() else {
        return Vec::new();
    };

    let mut result: Vec<T> = Vec::new();
    let mut seen = HashSet::new();
    for item in first {
        if seen.insert(item.clone()) {
            result.push(item.clone());
        }
    }

    for list in lists {
        match strategy {
            FeatureStrategy::Intersection => {
                let other: HashSet<&T> = list.iter().collect();
                result.retain(|item| other.contains(item));
            }
            FeatureStrategy::Union => {
                for item in list {
                    if seen.insert(item.clone()) {
                        result.push(item.clone());
                    }
                }
            }
        }
    }

    result
}

/// Bitwise AND (intersection) or OR (union) of feature masks.
pub fn reduce_features(masks: &[Features], strategy: FeatureStrategy) -> Option<Features> {
    masks.iter().copied().reduce(|acc, f| match strategy {
        FeatureStrategy::Intersection => acc & f,
        FeatureStrategy::Union => acc | f,
    })
}

/// Statistical mode; ties are won by the value encountered first.
pub fn most_frequent<T, I>(values: I) -> Option<T>
where
    T: Clone + Eq + Hash,
    I: IntoIterator<Item = T>,
{
    let mut counts: HashMap<T, usize> = HashMap::new();
    let mut order: Vec<T> = Vec::new();
    for value in values {
        let count = counts.entry(value.clone()).or_insert(0);
        if *count == 0 {
            order.push(value);
        }
        *count += 1;
    }

    let mut best: Option<(T, usize)> = None;
    for value in order {
        let count = counts[&value];
        if best.as_ref().is_none_or(|(_, c)| count > *c) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

/// Whether two numbers are closer than `tolerance`.
pub fn within_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    (a - b).abs() < tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_methods() {
        let values = [21.0, 23.0, 19.0, 25.0];
        assert_eq!(average(&values, AverageMethod::Mean), Some(22.0));
        assert_eq!(average(&values, AverageMethod::Min), Some(19.0));
        assert_eq!(average(&values, AverageMethod::Max), Some(25.0));
        assert_eq!(average(&values, AverageMethod::Median), Some(22.0));
        assert_eq!(average(&[3.0, 1.0, 2.0], AverageMethod::Median), Some(2.0));
    }

    #[test]
    fn test_average_empty() {
        assert_eq!(average(&[], AverageMethod::Mean), None);
        assert_eq!(average(&[], AverageMethod::Median), None);
    }

    #[test]
    fn test_round_half() {
        assert_eq!(round_value(21.65, RoundMode::Half), 21.5);
        assert_eq!(round_value(22.0, RoundMode::Half), 22.0);
        assert_eq!(round_value(21.8, RoundMode::Half), 22.0);
        assert_eq!(round_value(21.3, RoundMode::Half), 21.5);
        for raw in [18.01, 19.26, 20.74, 23.33, 24.99] {
            let r = round_value(raw, RoundMode::Half);
            assert_eq!((r * 2.0).fract(), 0.0, "{raw} -> {r}");
        }
    }

    #[test]
    fn test_round_integer_and_none() {
        assert_eq!(round_value(21.65, RoundMode::Integer), 22.0);
        assert_eq!(round_value(21.4, RoundMode::Integer), 21.0);
        assert_eq!(round_value(21.65, RoundMode::None), 21.65);
    }

    #[test]
    fn test_reduce_modes_intersection_subset_of_union() {
        let a = vec!["low".to_string(), "high".to_string(), "auto".to_string()];
        let b = vec!["high".to_string(), "auto".to_string(), "turbo".to_string()];
        let lists = vec![a, b];

        let inter = reduce_modes(&lists, FeatureStrategy::Intersection);
        let union = reduce_modes(&lists, FeatureStrategy::Union);

        assert_eq!(inter, vec!["high".to_string(), "auto".to_string()]);
        assert_eq!(union.len(), 4);
        assert!(inter.iter().all(|m| union.contains(m)));
    }

    #[test]
    fn test_reduce_modes_ignores_empty_lists() {
        let lists = vec![vec![], vec!["eco".to_string()]];
        assert_eq!(
            reduce_modes(&lists, FeatureStrategy::Intersection),
            vec!["eco".to_string()]
        );
        let none: Vec<Vec<String>> = vec![vec![], vec![]];
        assert!(reduce_modes(&none, FeatureStrategy::Union).is_empty());
    }

    #[test]
    fn test_reduce_features() {
        let masks = [Features(0b1011), Features(0b0110)];
        assert_eq!(
            reduce_features(&masks, FeatureStrategy::Intersection),
            Some(Features(0b0010))
        );
        assert_eq!(
            reduce_features(&masks, FeatureStrategy::Union),
            Some(Features(0b1111))
        );
        assert_eq!(reduce_features(&[], FeatureStrategy::Union), None);
    }

    #[test]
    fn test_most_frequent_first_wins_ties() {
        assert_eq!(most_frequent(["b", "a", "a", "b"]), Some("b"));
        assert_eq!(most_frequent(["b", "a", "a"]), Some("a"));
        assert_eq!(most_frequent(Vec::<&str>::new()), None);
    }
}

//! K-out-of-N winner rule and the winner cap.

use crate::types::UserSet;
use rand::Rng;
use rand::seq::IteratorRandom;

/// Users who were correct in every round of at least one `required`-sized
/// combination of `rounds`, i.e. correct in at least `required` rounds.
///
/// With one round (or none) the result is a copy of that round's winners.
/// `required` is clamped into `1..=rounds.len()`.
pub fn calculate_winners(rounds: &[UserSet], required: usize) -> UserSet {
    if rounds.len() <= 1 {
        return rounds.first().cloned().unwrap_or_default();
    }
    let required = required.clamp(1, rounds.len());

    let mut winners = UserSet::new();
    for combination in Combinations::new(rounds.len(), required) {
        winners.extend(intersection(rounds, &combination));
    }
    winners
}

fn intersection(rounds: &[UserSet], combination: &[usize]) -> UserSet {
    let Some((&first, rest)) = combination.split_first() else {
        return UserSet::new();
    };
    rounds[first]
        .iter()
        .filter(|user| rest.iter().all(|&i| rounds[i].contains(*user)))
        .cloned()
        .collect()
}

/// Uniformly samples `cap` distinct winners when there are more than `cap`;
/// otherwise returns the set untouched.
pub fn down_select<R: Rng + ?Sized>(winners: UserSet, cap: usize, rng: &mut R) -> UserSet {
    if winners.len() <= cap {
        return winners;
    }
    winners.into_iter().choose_multiple(rng, cap).into_iter().collect()
}

/// Lexicographic `k`-combinations of `0..n`.
#[derive(Debug, Clone)]
pub struct Combinations {
    n: usize,
    indices: Vec<usize>,
    started: bool,
    done: bool,
}

impl Combinations {
    pub fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            indices: (0..k).collect(),
            started: false,
            done: k > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.indices.clone());
        }

        let k = self.indices.len();
        // rightmost index that can still move right
        let Some(i) = (0..k).rev().find(|&i| self.indices[i] < self.n - k + i) else {
            self.done = true;
            return None;
        };
        self.indices[i] += 1;
        for j in i + 1..k {
            self.indices[j] = self.indices[j - 1] + 1;
        }
        Some(self.indices.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn set(users: &[&str]) -> UserSet {
        users.iter().map(|u| u.to_string()).collect()
    }

    #[test]
    fn test_combinations_in_lexicographic_order() {
        let all: Vec<_> = Combinations::new(4, 2).collect();
        assert_eq!(
            all,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
        assert_eq!(Combinations::new(5, 3).count(), 10);
        assert_eq!(Combinations::new(3, 3).count(), 1);
        assert_eq!(Combinations::new(2, 3).count(), 0);
    }

    #[test]
    fn test_two_of_three_rounds() {
        let rounds = vec![set(&["A", "B"]), set(&["A", "C"]), set(&["B", "C"])];
        assert_eq!(calculate_winners(&rounds, 2), set(&["A", "B", "C"]));
    }

    #[test]
    fn test_all_rounds_required_is_plain_intersection() {
        let rounds = vec![set(&["A", "B", "C"]), set(&["A", "C"]), set(&["C", "D"])];
        assert_eq!(calculate_winners(&rounds, 3), set(&["C"]));
    }

    #[test]
    fn test_one_round_required_is_union() {
        let rounds = vec![set(&["A"]), set(&["B"]), set(&[])];
        assert_eq!(calculate_winners(&rounds, 1), set(&["A", "B"]));
    }

    #[test]
    fn test_single_round_ignores_required() {
        let rounds = vec![set(&["A", "B"])];
        assert_eq!(calculate_winners(&rounds, 5), set(&["A", "B"]));
        assert!(calculate_winners(&[], 2).is_empty());
    }

    #[test]
    fn test_required_is_clamped_to_round_count() {
        let rounds = vec![set(&["A", "B"]), set(&["A"])];
        assert_eq!(calculate_winners(&rounds, 9), set(&["A"]));
        assert_eq!(calculate_winners(&rounds, 0), set(&["A", "B"]));
    }

    #[test]
    fn test_matches_correct_count_rule() {
        let rounds = vec![
            set(&["A", "B", "C", "D"]),
            set(&["A", "C"]),
            set(&["B", "C", "E"]),
            set(&["A", "E"]),
            set(&["C"]),
        ];
        for required in 1..=rounds.len() {
            let expected: UserSet = ["A", "B", "C", "D", "E"]
                .into_iter()
                .filter(|user| rounds.iter().filter(|r| r.contains(*user)).count() >= required)
                .map(String::from)
                .collect();
            assert_eq!(calculate_winners(&rounds, required), expected, "K={required}");
        }
    }

    #[test]
    fn test_down_select_keeps_small_sets_untouched() {
        let mut rng = StdRng::seed_from_u64(7);
        let winners = set(&["A", "B"]);
        assert_eq!(down_select(winners.clone(), 2, &mut rng), winners);
        assert_eq!(down_select(winners.clone(), 10, &mut rng), winners);
    }

    #[test]
    fn test_down_select_caps_without_duplicates() {
        let mut rng = StdRng::seed_from_u64(42);
        let winners: UserSet = (0..50).map(|i| format!("user-{i}")).collect();
        for cap in [0, 1, 7, 49] {
            let chosen = down_select(winners.clone(), cap, &mut rng);
            assert_eq!(chosen.len(), cap);
            assert!(chosen.is_subset(&winners));
        }
    }
}

//! Multi-objective archive of accepted candidates: Pareto ranking, novelty
//! scoring over normalised metric vectors, ageing and mixture sampling.

use crate::config::Direction;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub cand_id: String,
    pub metrics: BTreeMap<String, f64>,
    pub created_at: String,
    pub novelty: f64,
    pub age: i64,
    pub rank: usize,
    /// Insertion order, the deterministic tie-breaker.
    order: u64,
}

impl ArchiveEntry {
    pub fn insertion_order(&self) -> u64 {
        self.order
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Pareto rank the candidate held right after ranking.
    pub rank_at_insertion: usize,
    /// Member evicted to make room, if any.
    pub evicted: Option<String>,
    /// False when the inserted candidate itself was the eviction victim.
    pub retained: bool,
}

pub struct Archive {
    capacity: usize,
    k_novelty: usize,
    ageing_threshold: i64,
    directions: BTreeMap<String, Direction>,
    entries: Vec<ArchiveEntry>,
    next_order: u64,
}

impl Archive {
    pub fn new(
        capacity: usize,
        k_novelty: usize,
        ageing_threshold: i64,
        directions: BTreeMap<String, Direction>,
    ) -> Self {
        Self {
            capacity,
            k_novelty,
            ageing_threshold,
            directions,
            entries: Vec::new(),
            next_order: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, cand_id: &str) -> bool {
        self.entries.iter().any(|e| e.cand_id == cand_id)
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    /// Insert an accepted candidate. Ages every existing member, recomputes
    /// novelty and ranks, then evicts the worst member if over capacity.
    pub fn insert(
        &mut self,
        cand_id: String,
        metrics: BTreeMap<String, f64>,
        created_at: String,
    ) -> InsertOutcome {
        for e in &mut self.entries {
            e.age += 1;
        }
        self.entries.push(ArchiveEntry {
            cand_id: cand_id.clone(),
            metrics,
            created_at,
            novelty: 0.0,
            age: 0,
            rank: 0,
            order: self.next_order,
        });
        self.next_order += 1;

        self.recompute_novelty();
        self.recompute_ranks();

        let rank_at_insertion = self
            .entries
            .iter()
            .find(|e| e.cand_id == cand_id)
            .map(|e| e.rank)
            .unwrap_or(0);

        let mut evicted = None;
        if self.entries.len() > self.capacity {
            let victim = self.eviction_victim();
            evicted = Some(self.entries.remove(victim).cand_id);
            self.recompute_novelty();
            self.recompute_ranks();
        }

        let retained = evicted.as_deref() != Some(cand_id.as_str());
        InsertOutcome {
            rank_at_insertion,
            evicted,
            retained,
        }
    }

    /// True iff `a` is no worse than `b` on every objective and strictly
    /// better on at least one, under the configured directions.
    fn dominates(&self, a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> bool {
        let mut strictly_better = false;
        for (name, dir) in &self.directions {
            let (av, bv) = match (a.get(name), b.get(name)) {
                (Some(av), Some(bv)) => (*av, *bv),
                // A missing objective can never dominate.
                _ => return false,
            };
            let (av, bv) = match dir {
                Direction::Maximize => (av, bv),
                Direction::Minimize => (-av, -bv),
            };
            if av < bv {
                return false;
            }
            if av > bv {
                strictly_better = true;
            }
        }
        strictly_better
    }

    /// Non-dominated sorting: rank 0 is the Pareto front, subsequent ranks
    /// are computed by removing the previous front and repeating.
    fn recompute_ranks(&mut self) {
        let n = self.entries.len();
        let mut assigned = vec![false; n];
        let mut remaining = n;
        let mut rank = 0usize;
        while remaining > 0 {
            let mut front = Vec::new();
            for i in 0..n {
                if assigned[i] {
                    continue;
                }
                let dominated = (0..n).any(|j| {
                    j != i
                        && !assigned[j]
                        && self.dominates(&self.entries[j].metrics, &self.entries[i].metrics)
                });
                if !dominated {
                    front.push(i);
                }
            }
            // A cycle cannot happen with a strict partial order, but guard
            // against an empty front so malformed metrics cannot loop forever.
            if front.is_empty() {
                for i in 0..n {
                    if !assigned[i] {
                        front.push(i);
                    }
                }
            }
            for i in front {
                self.entries[i].rank = rank;
                assigned[i] = true;
                remaining -= 1;
            }
            rank += 1;
        }
    }

    /// Novelty: mean Euclidean distance to the `k_novelty` nearest
    /// neighbours, over metric vectors min-max-normalised with the archive's
    /// current extrema.
    fn recompute_novelty(&mut self) {
        let n = self.entries.len();
        if n == 0 {
            return;
        }
        if n == 1 {
            self.entries[0].novelty = 0.0;
            return;
        }

        let objectives: Vec<&String> = self.directions.keys().collect();
        let mut extrema: Vec<(f64, f64)> = Vec::with_capacity(objectives.len());
        for name in &objectives {
            let mut lo = f64::INFINITY;
            let mut hi = f64::NEG_INFINITY;
            for e in &self.entries {
                let v = e.metrics.get(*name).copied().unwrap_or(0.0);
                lo = lo.min(v);
                hi = hi.max(v);
            }
            extrema.push((lo, hi));
        }

        let normalised: Vec<Vec<f64>> = self
            .entries
            .iter()
            .map(|e| {
                objectives
                    .iter()
                    .zip(&extrema)
                    .map(|(name, (lo, hi))| {
                        let v = e.metrics.get(*name).copied().unwrap_or(0.0);
                        if hi > lo {
                            (v - lo) / (hi - lo)
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect();

        for i in 0..n {
            let mut dists: Vec<f64> = (0..n)
                .filter(|&j| j != i)
                .map(|j| euclidean(&normalised[i], &normalised[j]))
                .collect();
            dists.sort_by(f64::total_cmp);
            let k = self.k_novelty.min(dists.len()).max(1);
            self.entries[i].novelty = dists[..k].iter().sum::<f64>() / k as f64;
        }
    }

    /// Worst member: aged non-front members first, then any non-front
    /// member, by (highest rank, lowest novelty, oldest). A rank-0 member is
    /// only ever evicted when the whole archive is rank-0.
    fn eviction_victim(&self) -> usize {
        let all_rank0 = self.entries.iter().all(|e| e.rank == 0);
        let pool: Vec<usize> = if all_rank0 {
            (0..self.entries.len()).collect()
        } else {
            let aged: Vec<usize> = (0..self.entries.len())
                .filter(|&i| {
                    self.entries[i].rank > 0 && self.entries[i].age > self.ageing_threshold
                })
                .collect();
            if aged.is_empty() {
                (0..self.entries.len())
                    .filter(|&i| self.entries[i].rank > 0)
                    .collect()
            } else {
                aged
            }
        };

        pool.into_iter()
            .max_by(|&a, &b| {
                let ea = &self.entries[a];
                let eb = &self.entries[b];
                ea.rank
                    .cmp(&eb.rank)
                    .then_with(|| eb.novelty.total_cmp(&ea.novelty))
                    .then_with(|| eb.created_at.cmp(&ea.created_at))
                    .then_with(|| eb.order.cmp(&ea.order))
            })
            .expect("eviction pool is never empty")
    }

    /// Draw the parent mixture: `elite` members by lowest rank, `novel` by
    /// highest novelty, `young` by lowest age. Weighted random without
    /// replacement within each category; the union is deduplicated
    /// preserving first appearance.
    pub fn sample_mixture(
        &self,
        elite: usize,
        novel: usize,
        young: usize,
        rng: &mut StdRng,
    ) -> Vec<String> {
        let mut picked: Vec<String> = Vec::new();
        let weights_elite = |e: &ArchiveEntry| 1.0 / (1.0 + e.rank as f64);
        let weights_novel = |e: &ArchiveEntry| e.novelty + 1e-9;
        let weights_young = |e: &ArchiveEntry| 1.0 / (1.0 + e.age as f64);

        for id in self.draw_category(elite, rng, weights_elite) {
            if !picked.contains(&id) {
                picked.push(id);
            }
        }
        for id in self.draw_category(novel, rng, weights_novel) {
            if !picked.contains(&id) {
                picked.push(id);
            }
        }
        for id in self.draw_category(young, rng, weights_young) {
            if !picked.contains(&id) {
                picked.push(id);
            }
        }
        picked
    }

    fn draw_category<F>(&self, count: usize, rng: &mut StdRng, weight: F) -> Vec<String>
    where
        F: Fn(&ArchiveEntry) -> f64,
    {
        // Fixed candidate order keeps draws deterministic for a given seed.
        let mut pool: Vec<&ArchiveEntry> = self.entries.iter().collect();
        pool.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.cand_id.cmp(&b.cand_id)));

        let mut out = Vec::new();
        for _ in 0..count {
            if pool.is_empty() {
                break;
            }
            let total: f64 = pool.iter().map(|e| weight(e)).sum();
            if total <= 0.0 {
                let e = pool.remove(0);
                out.push(e.cand_id.clone());
                continue;
            }
            let mut roll = rng.gen_range(0.0..total);
            let mut chosen = pool.len() - 1;
            for (i, e) in pool.iter().enumerate() {
                let w = weight(e);
                if roll < w {
                    chosen = i;
                    break;
                }
                roll -= w;
            }
            let e = pool.remove(chosen);
            out.push(e.cand_id.clone());
        }
        out
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn metrics(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn dirs() -> BTreeMap<String, Direction> {
        let mut m = BTreeMap::new();
        m.insert("acc".to_string(), Direction::Maximize);
        m.insert("t".to_string(), Direction::Minimize);
        m
    }

    #[test]
    fn domination_respects_directions() {
        let a = Archive::new(8, 3, 4, dirs());
        assert!(a.dominates(
            &metrics(&[("acc", 1.0), ("t", 5.0)]),
            &metrics(&[("acc", 0.9), ("t", 10.0)])
        ));
        assert!(!a.dominates(
            &metrics(&[("acc", 1.0), ("t", 10.0)]),
            &metrics(&[("acc", 0.9), ("t", 5.0)])
        ));
        // equal vectors dominate in neither direction
        let m = metrics(&[("acc", 1.0), ("t", 5.0)]);
        assert!(!a.dominates(&m, &m));
    }

    #[test]
    fn rank_zero_is_an_antichain() {
        let mut a = Archive::new(8, 3, 4, dirs());
        a.insert("a".into(), metrics(&[("acc", 1.0), ("t", 10.0)]), "t0".into());
        a.insert("b".into(), metrics(&[("acc", 0.9), ("t", 5.0)]), "t1".into());
        a.insert("c".into(), metrics(&[("acc", 0.8), ("t", 20.0)]), "t2".into());
        let front: Vec<&ArchiveEntry> =
            a.entries().iter().filter(|e| e.rank == 0).collect();
        for x in &front {
            for y in &front {
                if x.cand_id != y.cand_id {
                    assert!(!a.dominates(&x.metrics, &y.metrics));
                }
            }
        }
        // c is dominated by both a and b
        assert_eq!(
            a.entries().iter().find(|e| e.cand_id == "c").unwrap().rank,
            1
        );
    }

    #[test]
    fn dominated_insert_into_full_archive_is_evicted_immediately() {
        let mut a = Archive::new(2, 3, 4, dirs());
        a.insert("a".into(), metrics(&[("acc", 1.0), ("t", 10.0)]), "t0".into());
        a.insert("b".into(), metrics(&[("acc", 0.9), ("t", 5.0)]), "t1".into());
        let out = a.insert("c".into(), metrics(&[("acc", 0.8), ("t", 20.0)]), "t2".into());
        assert_eq!(out.evicted.as_deref(), Some("c"));
        assert!(!out.retained);
        assert_eq!(a.len(), 2);
        assert!(a.contains("a") && a.contains("b"));
    }

    #[test]
    fn rank_zero_member_survives_ageing_pressure() {
        let mut a = Archive::new(4, 3, 3, dirs());
        a.insert("m".into(), metrics(&[("acc", 1.0), ("t", 1.0)]), "t0".into());
        for i in 0..4 {
            // dominated but mutually non-dominating members
            let out = a.insert(
                format!("r{}", i),
                metrics(&[("acc", 0.5 - 0.1 * i as f64), ("t", 10.0 - i as f64)]),
                format!("t{}", i + 1),
            );
            if a.len() == 4 || out.evicted.is_some() {
                assert_ne!(out.evicted.as_deref(), Some("m"));
            }
        }
        assert!(a.contains("m"));
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn novelty_is_positive_for_distinct_members() {
        let mut a = Archive::new(8, 3, 4, dirs());
        a.insert("a".into(), metrics(&[("acc", 1.0), ("t", 10.0)]), "t0".into());
        a.insert("b".into(), metrics(&[("acc", 0.5), ("t", 5.0)]), "t1".into());
        for e in a.entries() {
            assert!(e.novelty > 0.0);
        }
    }

    #[test]
    fn ages_increment_on_each_insertion() {
        let mut a = Archive::new(8, 3, 4, dirs());
        a.insert("a".into(), metrics(&[("acc", 1.0), ("t", 10.0)]), "t0".into());
        a.insert("b".into(), metrics(&[("acc", 0.9), ("t", 5.0)]), "t1".into());
        a.insert("c".into(), metrics(&[("acc", 0.95), ("t", 7.0)]), "t2".into());
        let age_of = |id: &str| a.entries().iter().find(|e| e.cand_id == id).unwrap().age;
        assert_eq!(age_of("a"), 2);
        assert_eq!(age_of("b"), 1);
        assert_eq!(age_of("c"), 0);
    }

    #[test]
    fn mixture_sampling_is_deterministic_and_deduplicated() {
        let mut a = Archive::new(8, 3, 4, dirs());
        a.insert("a".into(), metrics(&[("acc", 1.0), ("t", 10.0)]), "t0".into());
        a.insert("b".into(), metrics(&[("acc", 0.9), ("t", 5.0)]), "t1".into());
        a.insert("c".into(), metrics(&[("acc", 0.8), ("t", 20.0)]), "t2".into());

        let mut rng1 = StdRng::seed_from_u64(7);
        let mut rng2 = StdRng::seed_from_u64(7);
        let s1 = a.sample_mixture(2, 2, 1, &mut rng1);
        let s2 = a.sample_mixture(2, 2, 1, &mut rng2);
        assert_eq!(s1, s2);

        let mut seen = std::collections::HashSet::new();
        for id in &s1 {
            assert!(seen.insert(id.clone()), "duplicate parent {}", id);
        }
    }
}

//! Co-evolving instruction templates: tournament selection, deterministic
//! surface mutations and EMA fitness attribution.

use crate::config::MetaPromptConfig;
use crate::errors::EvolveError;
use crate::model::{meta_prompt_id, now_rfc3339, MetaPrompt};
use crate::storage::Store;
use rand::rngs::StdRng;
use rand::Rng;

/// EMA weight for fitness attribution.
const FITNESS_ALPHA: f64 = 0.2;

pub const SEED_TEMPLATES: &[&str] = &[
    "You are an expert software engineer. Optimise for correctness first, then speed. Provide concise diffs.",
    "Act as a performance specialist. Prefer aggressive refactors and explain reasoning briefly before the diff.",
    "Adopt a test-driven mindset. Outline failing tests you expect to pass after the change, then provide the patch.",
    "Balance exploration and exploitation: propose a bold modification but ensure compatibility with existing tests.",
];

/// Directive sentences a mutation may append.
const DIRECTIVES: &[&str] = &[
    "Focus on micro-optimisations and data-structure tuning.",
    "Include one unconventional idea or alternative approach.",
    "List quick checks or tests before writing the patch.",
    "Keep explanations under three sentences.",
    "Limit edits to the most relevant blocks and avoid broad refactors.",
];

/// Emphasis rewrites applied to the first matching phrase.
const REWORDINGS: &[(&str, &str)] = &[
    ("Optimise", "Aggressively optimise"),
    ("Prefer", "Strongly prefer"),
    ("propose", "always propose"),
    ("Provide", "Always provide"),
];

pub struct MetaPromptPool {
    store: Store,
    run_id: String,
    cfg: MetaPromptConfig,
    active: Vec<MetaPrompt>,
}

impl MetaPromptPool {
    /// Load the pool for a run, seeding the built-in templates on first use.
    pub fn bootstrap(
        store: Store,
        run_id: String,
        cfg: MetaPromptConfig,
    ) -> Result<Self, EvolveError> {
        let mut existing = store.list_meta_prompts(&run_id)?;
        if existing.is_empty() {
            for (i, template) in SEED_TEMPLATES.iter().enumerate() {
                let now = now_rfc3339();
                let mp = MetaPrompt {
                    meta_prompt_id: meta_prompt_id(&run_id, &format!("seed_{}", i), template),
                    run_id: run_id.clone(),
                    template: template.to_string(),
                    parent_ids: Vec::new(),
                    created_at: now.clone(),
                    last_used: now,
                    fitness: 0.0,
                };
                store.insert_meta_prompt(&mp)?;
                existing.push(mp);
            }
        }
        let mut pool = Self {
            store,
            run_id,
            cfg,
            active: existing,
        };
        pool.enforce_population();
        Ok(pool)
    }

    pub fn active(&self) -> &[MetaPrompt] {
        &self.active
    }

    /// Pick one template for a slot. With probability `mutation_prob` a new
    /// template is bred from a tournament winner; otherwise the winner itself
    /// is used. `last_used` is persisted either way.
    pub fn sample(&mut self, rng: &mut StdRng) -> Result<MetaPrompt, EvolveError> {
        let parent = self.tournament(rng);
        let chosen = if rng.gen_bool(self.cfg.mutation_prob) {
            let template = mutate_template(&parent.template, rng);
            let mp = MetaPrompt {
                meta_prompt_id: meta_prompt_id(&self.run_id, &parent.meta_prompt_id, &template),
                run_id: self.run_id.clone(),
                template,
                parent_ids: vec![parent.meta_prompt_id.clone()],
                created_at: now_rfc3339(),
                last_used: now_rfc3339(),
                fitness: parent.fitness,
            };
            // Mutating the same parent twice can produce the same template;
            // reuse the existing row in that case.
            if !self
                .active
                .iter()
                .any(|m| m.meta_prompt_id == mp.meta_prompt_id)
            {
                self.store.insert_meta_prompt(&mp)?;
                self.active.push(mp.clone());
                self.enforce_population();
            }
            mp
        } else {
            parent
        };
        self.touch(&chosen.meta_prompt_id)?;
        Ok(chosen)
    }

    /// Size-two tournament over the top `selection_top_k` by fitness.
    fn tournament(&self, rng: &mut StdRng) -> MetaPrompt {
        let mut ranked: Vec<&MetaPrompt> = self.active.iter().collect();
        ranked.sort_by(|a, b| {
            b.fitness
                .total_cmp(&a.fitness)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.meta_prompt_id.cmp(&b.meta_prompt_id))
        });
        let k = self.cfg.selection_top_k.min(ranked.len()).max(1);
        let a = rng.gen_range(0..k);
        let b = rng.gen_range(0..k);
        let winner = if ranked[a].fitness >= ranked[b].fitness {
            ranked[a]
        } else {
            ranked[b]
        };
        winner.clone()
    }

    /// Attribute downstream reward to a template: `1/(1+rank)` for accepted
    /// candidates, 0 for rejected or failed ones. Stored as an EMA.
    pub fn attribute(&mut self, meta_prompt_id: &str, reward: f64) -> Result<(), EvolveError> {
        let Some(mp) = self
            .active
            .iter_mut()
            .find(|m| m.meta_prompt_id == meta_prompt_id)
        else {
            return Ok(());
        };
        mp.fitness = (1.0 - FITNESS_ALPHA) * mp.fitness + FITNESS_ALPHA * reward;
        let fitness = mp.fitness;
        self.store.update_meta_prompt_fitness(meta_prompt_id, fitness)
    }

    fn touch(&mut self, meta_prompt_id: &str) -> Result<(), EvolveError> {
        if let Some(mp) = self
            .active
            .iter_mut()
            .find(|m| m.meta_prompt_id == meta_prompt_id)
        {
            mp.last_used = now_rfc3339();
        }
        self.store.touch_meta_prompt(meta_prompt_id)
    }

    /// Retire templates beyond the population bound: lowest fitness, then
    /// oldest `last_used`. Retired rows stay in the store; they just stop
    /// being sampled.
    fn enforce_population(&mut self) {
        while self.active.len() > self.cfg.population {
            let worst = self
                .active
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.fitness
                        .total_cmp(&b.fitness)
                        .then_with(|| a.last_used.cmp(&b.last_used))
                        .then_with(|| a.meta_prompt_id.cmp(&b.meta_prompt_id))
                })
                .map(|(i, _)| i)
                .expect("active pool is non-empty");
            self.active.remove(worst);
        }
    }
}

/// One deterministic surface mutation: append a directive, drop the last
/// sentence, or reword for emphasis. The op and its operand are fully
/// determined by the RNG stream.
pub fn mutate_template(template: &str, rng: &mut StdRng) -> String {
    match rng.gen_range(0..3u32) {
        0 => {
            let directive = DIRECTIVES[rng.gen_range(0..DIRECTIVES.len())];
            if template.contains(directive) {
                return template.to_string();
            }
            format!("{}\n{}", template.trim_end(), directive)
        }
        1 => {
            let sentences: Vec<&str> = template
                .split_inclusive(". ")
                .filter(|s| !s.trim().is_empty())
                .collect();
            if sentences.len() <= 1 {
                return template.to_string();
            }
            sentences[..sentences.len() - 1].concat().trim().to_string()
        }
        _ => {
            for (from, to) in REWORDINGS {
                if template.contains(from) {
                    return template.replacen(from, to, 1);
                }
            }
            format!("Above all: be precise. {}", template)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn pool(cfg: MetaPromptConfig) -> MetaPromptPool {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        store.create_run("r1", "{}").unwrap();
        MetaPromptPool::bootstrap(store, "r1".into(), cfg).unwrap()
    }

    #[test]
    fn bootstrap_seeds_builtin_templates_once() {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        store.create_run("r1", "{}").unwrap();
        let p = MetaPromptPool::bootstrap(store.clone(), "r1".into(), MetaPromptConfig::default())
            .unwrap();
        assert_eq!(p.active().len(), SEED_TEMPLATES.len());
        // second bootstrap loads rather than reseeding
        let p2 = MetaPromptPool::bootstrap(store, "r1".into(), MetaPromptConfig::default()).unwrap();
        assert_eq!(p2.active().len(), SEED_TEMPLATES.len());
    }

    #[test]
    fn mutation_is_deterministic_for_a_seed() {
        let mut rng1 = StdRng::seed_from_u64(11);
        let mut rng2 = StdRng::seed_from_u64(11);
        assert_eq!(
            mutate_template(SEED_TEMPLATES[0], &mut rng1),
            mutate_template(SEED_TEMPLATES[0], &mut rng2)
        );
    }

    #[test]
    fn attribution_is_an_ema() {
        let mut p = pool(MetaPromptConfig::default());
        let id = p.active()[0].meta_prompt_id.clone();
        p.attribute(&id, 1.0).unwrap();
        let f1 = p
            .active()
            .iter()
            .find(|m| m.meta_prompt_id == id)
            .unwrap()
            .fitness;
        assert!((f1 - 0.2).abs() < 1e-12);
        p.attribute(&id, 0.0).unwrap();
        let f2 = p
            .active()
            .iter()
            .find(|m| m.meta_prompt_id == id)
            .unwrap()
            .fitness;
        assert!((f2 - 0.16).abs() < 1e-12);
    }

    #[test]
    fn population_bound_is_enforced() {
        let cfg = MetaPromptConfig {
            population: 4,
            mutation_prob: 1.0,
            selection_top_k: 3,
        };
        let mut p = pool(cfg);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..16 {
            p.sample(&mut rng).unwrap();
        }
        assert!(p.active().len() <= 4);
        // every sampled template is persisted even after retirement
        assert!(p.store.list_meta_prompts("r1").unwrap().len() >= 4);
    }

    #[test]
    fn sampling_sequence_is_deterministic() {
        let cfg = MetaPromptConfig::default();
        let mut p1 = pool(cfg.clone());
        let mut p2 = pool(cfg);
        let mut r1 = StdRng::seed_from_u64(9);
        let mut r2 = StdRng::seed_from_u64(9);
        for _ in 0..8 {
            let a = p1.sample(&mut r1).unwrap();
            let b = p2.sample(&mut r2).unwrap();
            assert_eq!(a.template, b.template);
        }
    }
}

use crate::errors::EvolveError;
use crate::model::{
    decode_parents, encode_parents, now_rfc3339, Candidate, EvalRow, MetaPrompt, Run,
};
use rusqlite::{params, Connection, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// SQLite-backed program database. Concurrent readers via WAL; all writes
/// flow through the single mutex-guarded connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, EvolveError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EvolveError::Store(format!("failed to create db dir: {}", e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| EvolveError::Store(format!("failed to open sqlite db: {}", e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn memory() -> Result<Self, EvolveError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EvolveError::Store(format!("failed to open in-memory db: {}", e)))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn init_schema(&self) -> Result<(), EvolveError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(super::schema::DDL)?;
        Ok(())
    }

    pub fn create_run(&self, run_id: &str, config_json: &str) -> Result<(), EvolveError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO runs(run_id, started_at, config_json) VALUES (?1, ?2, ?3)",
            params![run_id, now_rfc3339(), config_json],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                EvolveError::Store(format!("run '{}' already exists", run_id))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, EvolveError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT run_id, started_at, config_json FROM runs WHERE run_id = ?1")?;
        let mut rows = stmt.query(params![run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Run {
                run_id: row.get(0)?,
                started_at: row.get(1)?,
                config_json: row.get(2)?,
            })),
            None => Ok(None),
        }
    }

    /// Persist a candidate and all of its evaluation rows atomically, so a
    /// resumed run never observes a candidate with a missing metric.
    pub fn insert_candidate_with_evals(
        &self,
        cand: &Candidate,
        evals: &[EvalRow],
    ) -> Result<(), EvolveError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO candidates(
                cand_id, run_id, parent_ids, meta_prompt_id, filepath, patch,
                code_snapshot, gen, novelty, age, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                cand.cand_id,
                cand.run_id,
                encode_parents(&cand.parent_ids),
                cand.meta_prompt_id,
                cand.filepath,
                cand.patch,
                cand.code_snapshot,
                cand.gen,
                cand.novelty,
                cand.age,
                cand.created_at,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO evaluations(cand_id, metric, value, passed, cost_ms, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in evals {
                stmt.execute(params![
                    cand.cand_id,
                    row.metric,
                    row.value,
                    row.passed as i64,
                    row.cost_ms,
                    row.error,
                    cand.created_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_candidates(
        &self,
        run_id: &str,
        gen: Option<i64>,
    ) -> Result<Vec<Candidate>, EvolveError> {
        let conn = self.conn.lock().unwrap();
        let mut out = Vec::new();
        match gen {
            Some(g) => {
                let mut stmt = conn.prepare(
                    "SELECT cand_id, run_id, parent_ids, meta_prompt_id, filepath, patch,
                            code_snapshot, gen, novelty, age, created_at
                     FROM candidates WHERE run_id = ?1 AND gen = ?2
                     ORDER BY created_at, cand_id",
                )?;
                let mut rows = stmt.query(params![run_id, g])?;
                while let Some(row) = rows.next()? {
                    out.push(candidate_from_row(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT cand_id, run_id, parent_ids, meta_prompt_id, filepath, patch,
                            code_snapshot, gen, novelty, age, created_at
                     FROM candidates WHERE run_id = ?1
                     ORDER BY gen, created_at, cand_id",
                )?;
                let mut rows = stmt.query(params![run_id])?;
                while let Some(row) = rows.next()? {
                    out.push(candidate_from_row(row)?);
                }
            }
        }
        Ok(out)
    }

    pub fn get_candidate(&self, cand_id: &str) -> Result<Option<Candidate>, EvolveError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT cand_id, run_id, parent_ids, meta_prompt_id, filepath, patch,
                    code_snapshot, gen, novelty, age, created_at
             FROM candidates WHERE cand_id = ?1",
        )?;
        let mut rows = stmt.query(params![cand_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(candidate_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn latest_generation(&self, run_id: &str) -> Result<Option<i64>, EvolveError> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(gen) FROM candidates WHERE run_id = ?1",
            params![run_id],
            |r| r.get(0),
        )?;
        Ok(max)
    }

    /// Metric value table for the given candidates, keyed by cand_id.
    pub fn candidate_evals(
        &self,
        cand_ids: &[String],
    ) -> Result<HashMap<String, Vec<EvalRow>>, EvolveError> {
        let conn = self.conn.lock().unwrap();
        let mut table: HashMap<String, Vec<EvalRow>> = HashMap::new();
        let mut stmt = conn.prepare(
            "SELECT eval_id, cand_id, metric, value, passed, cost_ms, error, created_at
             FROM evaluations WHERE cand_id = ?1 ORDER BY eval_id",
        )?;
        for cand_id in cand_ids {
            let mut rows = stmt.query(params![cand_id])?;
            while let Some(row) = rows.next()? {
                let eval = EvalRow {
                    eval_id: row.get(0)?,
                    cand_id: row.get(1)?,
                    metric: row.get(2)?,
                    value: row.get(3)?,
                    passed: row.get::<_, i64>(4)? != 0,
                    cost_ms: row.get(5)?,
                    error: row.get(6)?,
                    created_at: row.get(7)?,
                };
                table.entry(cand_id.clone()).or_default().push(eval);
            }
        }
        Ok(table)
    }

    /// Accepted candidates of a run (at least one evaluation row, all
    /// passed), with their metric vectors, in Archive insertion order.
    pub fn accepted_candidates(
        &self,
        run_id: &str,
    ) -> Result<Vec<(Candidate, HashMap<String, f64>)>, EvolveError> {
        let cands = self.list_candidates(run_id, None)?;
        let ids: Vec<String> = cands.iter().map(|c| c.cand_id.clone()).collect();
        let evals = self.candidate_evals(&ids)?;
        let mut out = Vec::new();
        for cand in cands {
            let Some(rows) = evals.get(&cand.cand_id) else {
                continue;
            };
            if rows.is_empty() || rows.iter().any(|r| !r.passed) {
                continue;
            }
            let metrics = rows
                .iter()
                .map(|r| (r.metric.clone(), r.value))
                .collect::<HashMap<_, _>>();
            out.push((cand, metrics));
        }
        Ok(out)
    }

    /// Recent failed candidates for the prompt sampler's counter-example
    /// pool. Ordered by (gen DESC, cand_id) so assembly is reproducible.
    pub fn recent_failures(
        &self,
        run_id: &str,
        limit: usize,
    ) -> Result<Vec<(Candidate, String)>, EvolveError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.cand_id, c.run_id, c.parent_ids, c.meta_prompt_id, c.filepath, c.patch,
                    c.code_snapshot, c.gen, c.novelty, c.age, c.created_at,
                    (SELECT error FROM evaluations e2
                     WHERE e2.cand_id = c.cand_id AND e2.passed = 0 AND e2.error IS NOT NULL
                     ORDER BY e2.eval_id LIMIT 1)
             FROM candidates c
             WHERE c.run_id = ?1
               AND EXISTS (SELECT 1 FROM evaluations e WHERE e.cand_id = c.cand_id AND e.passed = 0)
             ORDER BY c.gen DESC, c.cand_id
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![run_id, limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let cand = candidate_from_row(row)?;
            let error: Option<String> = row.get(11)?;
            out.push((cand, error.unwrap_or_else(|| "unknown".to_string())));
        }
        Ok(out)
    }

    /// Opportunistic persistence of the Archive's in-memory view.
    pub fn update_archive_view(
        &self,
        cand_id: &str,
        novelty: f64,
        age: i64,
    ) -> Result<(), EvolveError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE candidates SET novelty = ?1, age = ?2 WHERE cand_id = ?3",
            params![novelty, age, cand_id],
        )?;
        Ok(())
    }

    pub fn insert_meta_prompt(&self, mp: &MetaPrompt) -> Result<(), EvolveError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO meta_prompts(meta_prompt_id, run_id, template, parent_ids,
                                      created_at, last_used, fitness)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                mp.meta_prompt_id,
                mp.run_id,
                mp.template,
                encode_parents(&mp.parent_ids),
                mp.created_at,
                mp.last_used,
                mp.fitness,
            ],
        )?;
        Ok(())
    }

    pub fn update_meta_prompt_fitness(
        &self,
        meta_prompt_id: &str,
        fitness: f64,
    ) -> Result<(), EvolveError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE meta_prompts SET fitness = ?1 WHERE meta_prompt_id = ?2",
            params![fitness, meta_prompt_id],
        )?;
        Ok(())
    }

    pub fn touch_meta_prompt(&self, meta_prompt_id: &str) -> Result<(), EvolveError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE meta_prompts SET last_used = ?1 WHERE meta_prompt_id = ?2",
            params![now_rfc3339(), meta_prompt_id],
        )?;
        Ok(())
    }

    pub fn list_meta_prompts(&self, run_id: &str) -> Result<Vec<MetaPrompt>, EvolveError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT meta_prompt_id, run_id, template, parent_ids, created_at, last_used, fitness
             FROM meta_prompts WHERE run_id = ?1
             ORDER BY fitness DESC, created_at, meta_prompt_id",
        )?;
        let mut rows = stmt.query(params![run_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(MetaPrompt {
                meta_prompt_id: row.get(0)?,
                run_id: row.get(1)?,
                template: row.get(2)?,
                parent_ids: decode_parents(&row.get::<_, String>(3)?),
                created_at: row.get(4)?,
                last_used: row.get(5)?,
                fitness: row.get(6)?,
            });
        }
        Ok(out)
    }
}

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<Candidate> {
    Ok(Candidate {
        cand_id: row.get(0)?,
        run_id: row.get(1)?,
        parent_ids: decode_parents(&row.get::<_, String>(2)?),
        meta_prompt_id: row.get(3)?,
        filepath: row.get(4)?,
        patch: row.get(5)?,
        code_snapshot: row.get(6)?,
        gen: row.get(7)?,
        novelty: row.get(8)?,
        age: row.get(9)?,
        created_at: row.get(10)?,
    })
}

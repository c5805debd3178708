use std::path::Path;

use anyhow::{anyhow, Context, Result};
use peer_kernel_core::{
    ExerciseConfig, Stage, StageAnswer, Stats, StudentItemKey, StudentResponseRecord,
    SubmissionStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS student_answers (
  course_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  student_id TEXT NOT NULL,
  stage TEXT NOT NULL CHECK (stage IN ('original','revised')),
  choice TEXT NOT NULL,
  rationale TEXT NOT NULL,
  submitted_at TEXT NOT NULL,
  PRIMARY KEY (course_id, item_id, student_id, stage)
);

CREATE TABLE IF NOT EXISTS exercise_configs (
  course_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (course_id, item_id)
);

CREATE INDEX IF NOT EXISTS idx_student_answers_item
  ON student_answers(course_id, item_id, submitted_at);
";

/// SQLite-backed persistence for student response records and exercise
/// configurations, addressed by the (student, course, item) key.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// One durable stage submission, as stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredAnswer {
    pub student_id: String,
    pub stage: Stage,
    pub choice: String,
    pub rationale: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

impl SqliteStore {
    /// Open the store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or a migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Load the response record for one student, empty when absent. Never
    /// fails for a valid key and is idempotent between writes.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_answers_for_student(&self, key: &StudentItemKey) -> Result<StudentResponseRecord> {
        load_record(&self.conn, key)
    }

    /// Append an answer to the slot matching the claimed status, inside one
    /// transaction. Replays and out-of-order submissions are rejected with
    /// the core out-of-order error, preserved in the error chain.
    ///
    /// # Errors
    /// Returns [`peer_kernel_core::ExerciseError::OutOfOrder`] (wrapped)
    /// when the claimed status does not match the next empty slot, or a
    /// storage error when the write fails.
    pub fn add_answer_for_student(
        &mut self,
        key: &StudentItemKey,
        status: SubmissionStatus,
        choice: &str,
        rationale: &str,
        submitted_at: OffsetDateTime,
    ) -> Result<Stage> {
        let tx = self.conn.transaction().context("failed to start write transaction")?;

        let mut record = load_record(&tx, key)?;
        let stage = record
            .record_answer(status, choice, rationale, submitted_at)
            .map_err(anyhow::Error::new)?;

        tx.execute(
            "INSERT INTO student_answers(
                course_id, item_id, student_id, stage, choice, rationale, submitted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key.course_id,
                key.item_id,
                key.student_id,
                stage.as_str(),
                choice,
                rationale,
                rfc3339(submitted_at)?,
            ],
        )
        .context("failed to insert student answer")?;

        tx.commit().context("failed to commit write transaction")?;

        tracing::debug!(
            key = %key.storage_key(),
            stage = stage.as_str(),
            choice,
            "student answer recorded"
        );
        Ok(stage)
    }

    /// Load every stored submission for one exercise item, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_answers_for_item(
        &self,
        course_id: &str,
        item_id: &str,
    ) -> Result<Vec<StoredAnswer>> {
        let mut stmt = self.conn.prepare(
            "SELECT student_id, stage, choice, rationale, submitted_at
             FROM student_answers
             WHERE course_id = ?1 AND item_id = ?2
             ORDER BY submitted_at ASC, student_id ASC, stage ASC",
        )?;

        let mut rows = stmt.query(params![course_id, item_id])?;
        let mut answers = Vec::new();

        while let Some(row) = rows.next()? {
            let stage_raw: String = row.get(1)?;
            answers.push(StoredAnswer {
                student_id: row.get(0)?,
                stage: Stage::parse(&stage_raw)
                    .ok_or_else(|| anyhow!("unknown stage in student_answers: {stage_raw}"))?,
                choice: row.get(2)?,
                rationale: row.get(3)?,
                submitted_at: parse_rfc3339(&row.get::<_, String>(4)?)?,
            });
        }

        Ok(answers)
    }

    /// Recompute per-option submission counts for one exercise item from
    /// the durable rows.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn stats_for_item(&self, course_id: &str, item_id: &str) -> Result<Stats> {
        let mut stmt = self.conn.prepare(
            "SELECT stage, choice, COUNT(*)
             FROM student_answers
             WHERE course_id = ?1 AND item_id = ?2
             GROUP BY stage, choice",
        )?;

        let mut rows = stmt.query(params![course_id, item_id])?;
        let mut stats = Stats::default();

        while let Some(row) = rows.next()? {
            let stage_raw: String = row.get(0)?;
            let choice: String = row.get(1)?;
            let count: i64 = row.get(2)?;
            let stage = Stage::parse(&stage_raw)
                .ok_or_else(|| anyhow!("unknown stage in student_answers: {stage_raw}"))?;
            let counts = match stage {
                Stage::Original => &mut stats.original,
                Stage::Revised => &mut stats.revised,
            };
            counts.insert(choice, u64::try_from(count).unwrap_or(0));
        }

        Ok(stats)
    }

    /// Replace the stored exercise configuration for one item wholesale.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn save_config(
        &mut self,
        course_id: &str,
        item_id: &str,
        config: &ExerciseConfig,
        updated_at: OffsetDateTime,
    ) -> Result<()> {
        let config_json =
            serde_json::to_string(config).context("failed to serialize exercise config")?;

        self.conn
            .execute(
                "INSERT INTO exercise_configs(course_id, item_id, config_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(course_id, item_id) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![course_id, item_id, config_json, rfc3339(updated_at)?],
            )
            .context("failed to upsert exercise config")?;

        tracing::debug!(course_id, item_id, "exercise config replaced");
        Ok(())
    }

    /// Remove every stored submission for one exercise item. Part of
    /// wholesale reconfiguration: responses to the old question are not
    /// meaningful against the new one.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_answers_for_item(&mut self, course_id: &str, item_id: &str) -> Result<usize> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM student_answers WHERE course_id = ?1 AND item_id = ?2",
                params![course_id, item_id],
            )
            .context("failed to delete student answers")?;
        if deleted > 0 {
            tracing::debug!(course_id, item_id, deleted, "student answers cleared");
        }
        Ok(deleted)
    }

    /// Fetch the stored exercise configuration for one item, if any.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_config(&self, course_id: &str, item_id: &str) -> Result<Option<ExerciseConfig>> {
        let config_json: Option<String> = self
            .conn
            .query_row(
                "SELECT config_json FROM exercise_configs
                 WHERE course_id = ?1 AND item_id = ?2",
                params![course_id, item_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query exercise config")?;

        match config_json {
            Some(config_json) => {
                let config = serde_json::from_str(&config_json)
                    .context("failed to deserialize exercise config")?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }
}

fn load_record(conn: &Connection, key: &StudentItemKey) -> Result<StudentResponseRecord> {
    let mut stmt = conn.prepare(
        "SELECT stage, choice, rationale, submitted_at
         FROM student_answers
         WHERE course_id = ?1 AND item_id = ?2 AND student_id = ?3",
    )?;

    let mut rows = stmt.query(params![key.course_id, key.item_id, key.student_id])?;
    let mut record = StudentResponseRecord::default();

    while let Some(row) = rows.next()? {
        let stage_raw: String = row.get(0)?;
        let stage = Stage::parse(&stage_raw)
            .ok_or_else(|| anyhow!("unknown stage in student_answers: {stage_raw}"))?;
        let answer = StageAnswer {
            choice: row.get(1)?,
            rationale: row.get(2)?,
            submitted_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
        };
        match stage {
            Stage::Original => record.original = Some(answer),
            Stage::Revised => record.revised = Some(answer),
        }
    }

    Ok(record)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()
        .context("failed to read schema version")?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format timestamp as RFC 3339")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("failed to parse timestamp: {value}"))
}

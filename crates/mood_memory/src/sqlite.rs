use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use mood_calibration::HistoryJournal;
use mood_core::{
    AdjustmentType, AnalysisMetadata, CalibrationRecord, CalibrationStatus, ConversationalUnit,
    DeltaPattern, DeltaType, Direction, FactorType, MemoryStore, Message, MoodDelta, MoodError,
    MoodFactor, MoodResult, MoodScore, Participant, ParticipantRole, PatternMember, PatternType,
    TurningPoint, TurningPointType, ValidationMethod, ValidationResult, ValidationStatus,
};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamps are stored as fixed-width RFC 3339 text so lexical order is
/// chronological order.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {}", raw))?
        .with_timezone(&Utc))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid id: {}", raw))
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(anyhow::Error::msg)
}

#[derive(Clone)]
pub struct SqliteMoodStore {
    pool: Pool<Sqlite>,
}

impl SqliteMoodStore {
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA foreign_keys = ON").execute(conn).await?;
                    Ok(())
                })
            })
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        // Mirror of the units owned by the memory store
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS units (
                id TEXT PRIMARY KEY,
                conversation_id TEXT,
                content TEXT NOT NULL,
                messages_json TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create units table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS unit_participants (
                unit_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (unit_id, participant_id),
                FOREIGN KEY(unit_id) REFERENCES units(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create unit_participants table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_unit_participants_participant ON unit_participants(participant_id)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create unit_participants index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mood_scores (
                id TEXT PRIMARY KEY,
                unit_id TEXT NOT NULL,
                score REAL NOT NULL,
                confidence REAL NOT NULL,
                descriptors_json TEXT NOT NULL,
                algorithm_version TEXT NOT NULL,
                weights_version INTEGER NOT NULL,
                processing_time_ms INTEGER NOT NULL,
                observed_at TEXT NOT NULL,
                calculated_at TEXT NOT NULL,
                FOREIGN KEY(unit_id) REFERENCES units(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create mood_scores table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mood_scores_unit ON mood_scores(unit_id, calculated_at)")
            .execute(&self.pool)
            .await
            .context("Failed to create mood_scores index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mood_factors (
                score_id TEXT NOT NULL,
                factor_type TEXT NOT NULL,
                weight REAL NOT NULL,
                description TEXT NOT NULL,
                evidence_json TEXT NOT NULL,
                internal_score REAL,
                PRIMARY KEY (score_id, factor_type),
                FOREIGN KEY(score_id) REFERENCES mood_scores(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create mood_factors table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_metadata (
                score_id TEXT PRIMARY KEY,
                unit_id TEXT NOT NULL,
                processing_duration_ms INTEGER NOT NULL,
                confidence REAL NOT NULL,
                quality_json TEXT NOT NULL,
                issues_json TEXT NOT NULL,
                FOREIGN KEY(score_id) REFERENCES mood_scores(id),
                FOREIGN KEY(unit_id) REFERENCES units(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create analysis_metadata table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mood_deltas (
                id TEXT PRIMARY KEY,
                unit_id TEXT NOT NULL,
                previous_score_id TEXT NOT NULL,
                current_score_id TEXT NOT NULL,
                subject_id TEXT,
                conversation_id TEXT,
                delta_sequence INTEGER NOT NULL,
                previous_score REAL NOT NULL,
                current_score REAL NOT NULL,
                magnitude REAL NOT NULL,
                direction TEXT NOT NULL,
                delta_type TEXT NOT NULL,
                confidence REAL NOT NULL,
                significance REAL NOT NULL,
                factors_json TEXT NOT NULL,
                temporal_json TEXT NOT NULL,
                previous_at TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                FOREIGN KEY(unit_id) REFERENCES units(id),
                FOREIGN KEY(previous_score_id) REFERENCES mood_scores(id),
                FOREIGN KEY(current_score_id) REFERENCES mood_scores(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create mood_deltas table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mood_deltas_subject ON mood_deltas(subject_id, occurred_at)")
            .execute(&self.pool)
            .await
            .context("Failed to create mood_deltas index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delta_patterns (
                id TEXT PRIMARY KEY,
                pattern_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                subject_id TEXT,
                significance REAL NOT NULL,
                confidence REAL NOT NULL,
                duration_secs INTEGER NOT NULL,
                average_magnitude REAL NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                first_delta_id TEXT NOT NULL,
                last_delta_id TEXT NOT NULL,
                UNIQUE (subject_id, first_delta_id, last_delta_id),
                FOREIGN KEY(first_delta_id) REFERENCES mood_deltas(id),
                FOREIGN KEY(last_delta_id) REFERENCES mood_deltas(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create delta_patterns table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_members (
                pattern_id TEXT NOT NULL,
                delta_id TEXT NOT NULL,
                sequence_order INTEGER NOT NULL,
                PRIMARY KEY (pattern_id, delta_id),
                FOREIGN KEY(pattern_id) REFERENCES delta_patterns(id),
                FOREIGN KEY(delta_id) REFERENCES mood_deltas(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create pattern_members table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turning_points (
                id TEXT PRIMARY KEY,
                delta_id TEXT,
                unit_id TEXT NOT NULL,
                subject_id TEXT,
                timestamp TEXT NOT NULL,
                turning_type TEXT NOT NULL,
                magnitude REAL NOT NULL,
                significance REAL NOT NULL,
                confidence REAL NOT NULL,
                temporal_json TEXT NOT NULL,
                FOREIGN KEY(delta_id) REFERENCES mood_deltas(id),
                FOREIGN KEY(unit_id) REFERENCES units(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create turning_points table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS validation_results (
                id TEXT PRIMARY KEY,
                unit_id TEXT NOT NULL,
                score_id TEXT NOT NULL,
                validator_id TEXT NOT NULL,
                method TEXT NOT NULL,
                status TEXT NOT NULL,
                human_score REAL,
                algorithm_score REAL NOT NULL,
                agreement REAL,
                discrepancy REAL,
                factor_samples_json TEXT NOT NULL,
                weights_version INTEGER NOT NULL,
                bias_json TEXT NOT NULL,
                accuracy_json TEXT NOT NULL,
                validated_at TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY(unit_id) REFERENCES units(id),
                FOREIGN KEY(score_id) REFERENCES mood_scores(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create validation_results table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calibration_history (
                id TEXT PRIMARY KEY,
                cycle_id TEXT NOT NULL,
                adjustment_type TEXT NOT NULL,
                target_component TEXT NOT NULL,
                previous_value_json TEXT NOT NULL,
                new_value_json TEXT NOT NULL,
                previous_version INTEGER NOT NULL,
                new_version INTEGER,
                performance_json TEXT NOT NULL,
                status TEXT NOT NULL,
                reason TEXT,
                recorded_at TEXT NOT NULL,
                applied_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create calibration_history table")?;

        Ok(())
    }

    // ========================================================================
    // Units
    // ========================================================================

    /// Mirror a unit from the memory store. Re-recording an existing unit is a
    /// no-op.
    pub async fn record_unit(&self, unit: &ConversationalUnit) -> Result<()> {
        let messages_json = serde_json::to_string(&unit.messages)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR IGNORE INTO units (id, conversation_id, content, messages_json, timestamp) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(unit.id.to_string())
        .bind(&unit.conversation_id)
        .bind(&unit.content)
        .bind(&messages_json)
        .bind(ts(&unit.timestamp))
        .execute(&mut *tx)
        .await
        .context("Failed to insert unit")?;

        for p in &unit.participants {
            sqlx::query(
                "INSERT OR IGNORE INTO unit_participants (unit_id, participant_id, role) VALUES (?, ?, ?)",
            )
            .bind(unit.id.to_string())
            .bind(&p.id)
            .bind(p.role.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to insert unit participant")?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn unit_from_row(&self, row: &SqliteRow) -> Result<ConversationalUnit> {
        let id: String = row.get("id");
        let messages_json: String = row.get("messages_json");
        let timestamp: String = row.get("timestamp");

        let participants = sqlx::query(
            "SELECT participant_id, role FROM unit_participants WHERE unit_id = ? ORDER BY rowid",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch unit participants")?
        .into_iter()
        .map(|r| Participant {
            id: r.get("participant_id"),
            role: ParticipantRole::parse(r.get::<String, _>("role").as_str()),
        })
        .collect();

        Ok(ConversationalUnit {
            id: parse_id(&id)?,
            conversation_id: row.get("conversation_id"),
            participants,
            content: row.get("content"),
            messages: serde_json::from_str::<Vec<Message>>(&messages_json)
                .context("Failed to decode unit messages")?,
            timestamp: parse_ts(&timestamp)?,
        })
    }

    // ========================================================================
    // Scores
    // ========================================================================

    /// Write one unit's scoring cycle: the score, its factors and metadata,
    /// and the deltas and turning points it produced. All or nothing; the
    /// unit must already be recorded.
    pub async fn save_scoring(
        &self,
        score: &MoodScore,
        metadata: &AnalysisMetadata,
        deltas: &[MoodDelta],
        turning_points: &[TurningPoint],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM units WHERE id = ?")
            .bind(score.unit_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context("Failed to check unit")?;
        if exists.is_none() {
            return Err(MoodError::UnitNotFound(score.unit_id).into());
        }

        insert_score(&mut tx, score).await?;

        sqlx::query(
            "INSERT INTO analysis_metadata (score_id, unit_id, processing_duration_ms, confidence, quality_json, issues_json) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(metadata.score_id.to_string())
        .bind(metadata.unit_id.to_string())
        .bind(metadata.processing_duration_ms as i64)
        .bind(metadata.confidence)
        .bind(serde_json::to_string(&metadata.quality)?)
        .bind(serde_json::to_string(&metadata.issues)?)
        .execute(&mut *tx)
        .await
        .context("Failed to insert analysis metadata")?;

        for delta in deltas {
            insert_delta(&mut tx, delta).await?;
        }
        for tp in turning_points {
            insert_turning_point(&mut tx, tp).await?;
        }

        tx.commit().await.context("Failed to commit scoring cycle")?;
        tracing::debug!(
            score = %score.id,
            deltas = deltas.len(),
            turning_points = turning_points.len(),
            "Persisted scoring cycle"
        );
        Ok(())
    }

    async fn factors_for(&self, score_id: &str) -> Result<Vec<MoodFactor>> {
        let rows = sqlx::query(
            "SELECT factor_type, weight, description, evidence_json, internal_score FROM mood_factors WHERE score_id = ? ORDER BY rowid",
        )
        .bind(score_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch mood factors")?;

        rows.iter()
            .map(|row| -> Result<MoodFactor> {
                let factor_type: String = row.get("factor_type");
                let evidence_json: String = row.get("evidence_json");
                Ok(MoodFactor {
                    factor_type: parse_enum::<FactorType>(&factor_type)?,
                    weight: row.get("weight"),
                    description: row.get("description"),
                    evidence: serde_json::from_str(&evidence_json)?,
                    internal_score: row.get("internal_score"),
                })
            })
            .collect()
    }

    async fn score_from_row(&self, row: &SqliteRow) -> Result<MoodScore> {
        let id: String = row.get("id");
        let unit_id: String = row.get("unit_id");
        let descriptors_json: String = row.get("descriptors_json");
        let observed_at: String = row.get("observed_at");
        let calculated_at: String = row.get("calculated_at");
        let factors = self.factors_for(&id).await?;

        Ok(MoodScore {
            id: parse_id(&id)?,
            unit_id: parse_id(&unit_id)?,
            score: row.get("score"),
            confidence: row.get("confidence"),
            descriptors: serde_json::from_str(&descriptors_json)?,
            algorithm_version: row.get("algorithm_version"),
            weights_version: row.get::<i64, _>("weights_version") as u64,
            processing_time_ms: row.get::<i64, _>("processing_time_ms") as u64,
            observed_at: parse_ts(&observed_at)?,
            calculated_at: parse_ts(&calculated_at)?,
            factors,
        })
    }

    pub async fn get_score(&self, score_id: Uuid) -> Result<Option<MoodScore>> {
        let row = sqlx::query("SELECT * FROM mood_scores WHERE id = ?")
            .bind(score_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch mood score")?;
        match row {
            Some(row) => Ok(Some(self.score_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    /// Most recently calculated score for a unit.
    pub async fn latest_score_for_unit(&self, unit_id: Uuid) -> Result<Option<MoodScore>> {
        let row = sqlx::query(
            "SELECT * FROM mood_scores WHERE unit_id = ? ORDER BY calculated_at DESC, rowid DESC LIMIT 1",
        )
        .bind(unit_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest mood score")?;
        match row {
            Some(row) => Ok(Some(self.score_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn analysis_metadata(&self, score_id: Uuid) -> Result<Option<AnalysisMetadata>> {
        let row = sqlx::query("SELECT * FROM analysis_metadata WHERE score_id = ?")
            .bind(score_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch analysis metadata")?;
        let Some(row) = row else {
            return Ok(None);
        };

        let unit_id: String = row.get("unit_id");
        let quality_json: String = row.get("quality_json");
        let issues_json: String = row.get("issues_json");
        let duration: i64 = row.get("processing_duration_ms");
        Ok(Some(AnalysisMetadata {
            unit_id: parse_id(&unit_id)?,
            score_id,
            processing_duration_ms: duration.max(0) as u64,
            confidence: row.get("confidence"),
            quality: serde_json::from_str(&quality_json).context("Failed to decode quality metrics")?,
            issues: serde_json::from_str(&issues_json).context("Failed to decode analysis issues")?,
        }))
    }

    // ========================================================================
    // Deltas, patterns, turning points
    // ========================================================================

    /// Next free delta sequence number for a subject.
    pub async fn next_delta_sequence(&self, subject_id: &str) -> Result<u32> {
        let row = sqlx::query("SELECT MAX(delta_sequence) AS seq FROM mood_deltas WHERE subject_id = ?")
            .bind(subject_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to fetch delta sequence")?;
        let max: Option<i64> = row.get("seq");
        Ok(max.map_or(0, |m| m as u32 + 1))
    }

    pub async fn deltas_for_participant(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<MoodDelta>> {
        let rows = sqlx::query(
            "SELECT * FROM mood_deltas WHERE subject_id = ? AND occurred_at >= ? AND occurred_at <= ? ORDER BY occurred_at ASC, delta_sequence ASC",
        )
        .bind(subject_id)
        .bind(ts(&since))
        .bind(ts(&until))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch mood deltas")?;
        rows.iter().map(delta_from_row).collect()
    }

    pub async fn turning_points_for_participant(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<TurningPoint>> {
        let rows = sqlx::query(
            "SELECT * FROM turning_points WHERE subject_id = ? AND timestamp >= ? AND timestamp <= ? ORDER BY timestamp ASC",
        )
        .bind(subject_id)
        .bind(ts(&since))
        .bind(ts(&until))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch turning points")?;
        rows.iter().map(turning_point_from_row).collect()
    }

    /// Replace the stored view of an analysed window: deltas are rewritten
    /// with their recomputed values, their turning points are rebuilt, and
    /// patterns are upserted by their first and last delta. One transaction.
    pub async fn save_analysis(
        &self,
        deltas: &[MoodDelta],
        patterns: &[DeltaPattern],
        turning_points: &[TurningPoint],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for delta in deltas {
            upsert_delta(&mut tx, delta).await?;
            sqlx::query("DELETE FROM turning_points WHERE delta_id = ?")
                .bind(delta.id.to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to clear turning points")?;
        }
        for tp in turning_points {
            insert_turning_point(&mut tx, tp).await?;
        }
        for pattern in patterns {
            let (first, last) = match (pattern.members.first(), pattern.members.last()) {
                (Some(f), Some(l)) => (f.delta_id, l.delta_id),
                _ => continue,
            };
            sqlx::query(
                r#"
                INSERT INTO delta_patterns
                    (id, pattern_type, direction, subject_id, significance, confidence,
                     duration_secs, average_magnitude, started_at, ended_at, first_delta_id, last_delta_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    significance = excluded.significance,
                    confidence = excluded.confidence
                "#,
            )
            .bind(pattern.id.to_string())
            .bind(pattern.pattern_type.as_str())
            .bind(pattern.direction.as_str())
            .bind(&pattern.subject_id)
            .bind(pattern.significance)
            .bind(pattern.confidence)
            .bind(pattern.duration_secs)
            .bind(pattern.average_magnitude)
            .bind(ts(&pattern.started_at))
            .bind(ts(&pattern.ended_at))
            .bind(first.to_string())
            .bind(last.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to upsert delta pattern")?;

            for member in &pattern.members {
                sqlx::query(
                    "INSERT OR IGNORE INTO pattern_members (pattern_id, delta_id, sequence_order) VALUES (?, ?, ?)",
                )
                .bind(pattern.id.to_string())
                .bind(member.delta_id.to_string())
                .bind(member.sequence_order as i64)
                .execute(&mut *tx)
                .await
                .context("Failed to insert pattern member")?;
            }
        }
        tx.commit().await.context("Failed to commit trajectory analysis")?;
        Ok(())
    }

    pub async fn patterns_for_participant(
        &self,
        subject_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<DeltaPattern>> {
        let rows = sqlx::query(
            "SELECT * FROM delta_patterns WHERE subject_id = ? AND ended_at >= ? AND started_at <= ? ORDER BY started_at ASC",
        )
        .bind(subject_id)
        .bind(ts(&since))
        .bind(ts(&until))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch delta patterns")?;

        let mut patterns = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.get("id");
            let members = sqlx::query(
                "SELECT delta_id, sequence_order FROM pattern_members WHERE pattern_id = ? ORDER BY sequence_order",
            )
            .bind(&id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch pattern members")?
            .iter()
            .map(|m| -> Result<PatternMember> {
                let delta_id: String = m.get("delta_id");
                Ok(PatternMember {
                    delta_id: parse_id(&delta_id)?,
                    sequence_order: m.get::<i64, _>("sequence_order") as u32,
                })
            })
            .collect::<Result<Vec<_>>>()?;

            let pattern_type: String = row.get("pattern_type");
            let direction: String = row.get("direction");
            let started_at: String = row.get("started_at");
            let ended_at: String = row.get("ended_at");
            patterns.push(DeltaPattern {
                id: parse_id(&id)?,
                pattern_type: parse_enum::<PatternType>(&pattern_type)?,
                direction: parse_enum::<Direction>(&direction)?,
                subject_id: row.get("subject_id"),
                significance: row.get("significance"),
                confidence: row.get("confidence"),
                duration_secs: row.get("duration_secs"),
                average_magnitude: row.get("average_magnitude"),
                started_at: parse_ts(&started_at)?,
                ended_at: parse_ts(&ended_at)?,
                members,
            });
        }
        Ok(patterns)
    }

    // ========================================================================
    // Validation
    // ========================================================================

    pub async fn save_validation(&self, result: &ValidationResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO validation_results
                (id, unit_id, score_id, validator_id, method, status, human_score, algorithm_score,
                 agreement, discrepancy, factor_samples_json, weights_version, bias_json, accuracy_json, validated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.unit_id.to_string())
        .bind(result.score_id.to_string())
        .bind(&result.validator_id)
        .bind(result.method.as_str())
        .bind(result.status.as_str())
        .bind(result.human_score)
        .bind(result.algorithm_score)
        .bind(result.agreement)
        .bind(result.discrepancy)
        .bind(serde_json::to_string(&result.factor_samples)?)
        .bind(result.weights_version as i64)
        .bind(serde_json::to_string(&result.bias_indicators)?)
        .bind(serde_json::to_string(&result.accuracy_metrics)?)
        .bind(ts(&result.validated_at))
        .execute(&self.pool)
        .await
        .context("Failed to save validation result")?;
        Ok(())
    }

    /// The slice of stored results needed to resume validation: the newest
    /// `window_size` complete results per validator plus up to
    /// `pending_capacity` of the newest unconsumed ones, oldest first.
    pub async fn load_validations(
        &self,
        window_size: usize,
        pending_capacity: usize,
    ) -> Result<Vec<(ValidationResult, bool)>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT v.*,
                       v.rowid AS seq,
                       ROW_NUMBER() OVER (PARTITION BY v.validator_id ORDER BY v.rowid DESC) AS recent_rank,
                       ROW_NUMBER() OVER (PARTITION BY v.consumed ORDER BY v.rowid DESC) AS pending_rank
                FROM validation_results v
                WHERE v.status = ?
            )
            WHERE recent_rank <= ? OR (consumed = 0 AND pending_rank <= ?)
            ORDER BY seq ASC
            "#,
        )
        .bind(ValidationStatus::Complete.as_str())
        .bind(window_size as i64)
        .bind(pending_capacity as i64)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch validation results")?;

        rows.iter()
            .map(|row| -> Result<(ValidationResult, bool)> {
                let consumed: i64 = row.get("consumed");
                Ok((validation_from_row(row)?, consumed != 0))
            })
            .collect()
    }

    /// Append calibration history and mark the validations it used up, in one
    /// transaction.
    pub async fn commit_calibration(
        &self,
        records: &[CalibrationRecord],
        consumed: &[Uuid],
    ) -> Result<()> {
        if records.is_empty() && consumed.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO calibration_history
                    (id, cycle_id, adjustment_type, target_component, previous_value_json, new_value_json,
                     previous_version, new_version, performance_json, status, reason, recorded_at, applied_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(r.id.to_string())
            .bind(r.cycle_id.to_string())
            .bind(r.adjustment_type.as_str())
            .bind(&r.target_component)
            .bind(serde_json::to_string(&r.previous_value)?)
            .bind(serde_json::to_string(&r.new_value)?)
            .bind(r.previous_version as i64)
            .bind(r.new_version.map(|v| v as i64))
            .bind(serde_json::to_string(&r.performance)?)
            .bind(r.status.as_str())
            .bind(&r.reason)
            .bind(ts(&r.recorded_at))
            .bind(r.applied_at.as_ref().map(ts))
            .execute(&mut *tx)
            .await
            .context("Failed to append calibration history")?;
        }

        if !consumed.is_empty() {
            let placeholders: String = consumed.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let query = format!(
                "UPDATE validation_results SET consumed = 1 WHERE id IN ({})",
                placeholders
            );
            let mut q = sqlx::query(&query);
            for id in consumed {
                q = q.bind(id.to_string());
            }
            q.execute(&mut *tx)
                .await
                .context("Failed to mark validations consumed")?;
        }

        tx.commit().await.context("Failed to commit calibration history")?;
        Ok(())
    }

    pub async fn calibration_history(&self) -> Result<Vec<CalibrationRecord>> {
        let rows = sqlx::query("SELECT * FROM calibration_history ORDER BY rowid ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch calibration history")?;
        rows.iter().map(calibration_from_row).collect()
    }
}

// ============================================================================
// Row helpers
// ============================================================================

async fn insert_score(tx: &mut Transaction<'_, Sqlite>, score: &MoodScore) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO mood_scores
            (id, unit_id, score, confidence, descriptors_json, algorithm_version, weights_version,
             processing_time_ms, observed_at, calculated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(score.id.to_string())
    .bind(score.unit_id.to_string())
    .bind(score.score)
    .bind(score.confidence)
    .bind(serde_json::to_string(&score.descriptors)?)
    .bind(&score.algorithm_version)
    .bind(score.weights_version as i64)
    .bind(score.processing_time_ms as i64)
    .bind(ts(&score.observed_at))
    .bind(ts(&score.calculated_at))
    .execute(&mut **tx)
    .await
    .context("Failed to insert mood score")?;

    for f in &score.factors {
        sqlx::query(
            "INSERT INTO mood_factors (score_id, factor_type, weight, description, evidence_json, internal_score) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(score.id.to_string())
        .bind(f.factor_type.as_str())
        .bind(f.weight)
        .bind(&f.description)
        .bind(serde_json::to_string(&f.evidence)?)
        .bind(f.internal_score)
        .execute(&mut **tx)
        .await
        .context("Failed to insert mood factor")?;
    }
    Ok(())
}

async fn insert_delta(tx: &mut Transaction<'_, Sqlite>, d: &MoodDelta) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO mood_deltas
            (id, unit_id, previous_score_id, current_score_id, subject_id, conversation_id, delta_sequence,
             previous_score, current_score, magnitude, direction, delta_type, confidence, significance,
             factors_json, temporal_json, previous_at, occurred_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(d.id.to_string())
    .bind(d.unit_id.to_string())
    .bind(d.previous_score_id.to_string())
    .bind(d.current_score_id.to_string())
    .bind(&d.subject_id)
    .bind(&d.conversation_id)
    .bind(d.delta_sequence as i64)
    .bind(d.previous_score)
    .bind(d.current_score)
    .bind(d.magnitude)
    .bind(d.direction.as_str())
    .bind(d.delta_type.as_str())
    .bind(d.confidence)
    .bind(d.significance)
    .bind(serde_json::to_string(&d.factors)?)
    .bind(serde_json::to_string(&d.temporal_context)?)
    .bind(ts(&d.previous_at))
    .bind(ts(&d.occurred_at))
    .execute(&mut **tx)
    .await
    .context("Failed to insert mood delta")?;
    Ok(())
}

/// Insert a delta, or overwrite the sequence-dependent fields of the stored
/// one. The stored sequence number is kept.
async fn upsert_delta(tx: &mut Transaction<'_, Sqlite>, d: &MoodDelta) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO mood_deltas
            (id, unit_id, previous_score_id, current_score_id, subject_id, conversation_id, delta_sequence,
             previous_score, current_score, magnitude, direction, delta_type, confidence, significance,
             factors_json, temporal_json, previous_at, occurred_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            conversation_id = excluded.conversation_id,
            delta_type = excluded.delta_type,
            confidence = excluded.confidence,
            significance = excluded.significance,
            temporal_json = excluded.temporal_json
        "#,
    )
    .bind(d.id.to_string())
    .bind(d.unit_id.to_string())
    .bind(d.previous_score_id.to_string())
    .bind(d.current_score_id.to_string())
    .bind(&d.subject_id)
    .bind(&d.conversation_id)
    .bind(d.delta_sequence as i64)
    .bind(d.previous_score)
    .bind(d.current_score)
    .bind(d.magnitude)
    .bind(d.direction.as_str())
    .bind(d.delta_type.as_str())
    .bind(d.confidence)
    .bind(d.significance)
    .bind(serde_json::to_string(&d.factors)?)
    .bind(serde_json::to_string(&d.temporal_context)?)
    .bind(ts(&d.previous_at))
    .bind(ts(&d.occurred_at))
    .execute(&mut **tx)
    .await
    .context("Failed to upsert mood delta")?;
    Ok(())
}

async fn insert_turning_point(tx: &mut Transaction<'_, Sqlite>, tp: &TurningPoint) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO turning_points
            (id, delta_id, unit_id, subject_id, timestamp, turning_type, magnitude, significance,
             confidence, temporal_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(tp.id.to_string())
    .bind(tp.delta_id.map(|id| id.to_string()))
    .bind(tp.unit_id.to_string())
    .bind(&tp.subject_id)
    .bind(ts(&tp.timestamp))
    .bind(tp.turning_type.as_str())
    .bind(tp.magnitude)
    .bind(tp.significance)
    .bind(tp.confidence)
    .bind(serde_json::to_string(&tp.temporal_context)?)
    .execute(&mut **tx)
    .await
    .context("Failed to insert turning point")?;
    Ok(())
}

fn delta_from_row(row: &SqliteRow) -> Result<MoodDelta> {
    let id: String = row.get("id");
    let unit_id: String = row.get("unit_id");
    let previous_score_id: String = row.get("previous_score_id");
    let current_score_id: String = row.get("current_score_id");
    let direction: String = row.get("direction");
    let delta_type: String = row.get("delta_type");
    let factors_json: String = row.get("factors_json");
    let temporal_json: String = row.get("temporal_json");
    let previous_at: String = row.get("previous_at");
    let occurred_at: String = row.get("occurred_at");

    Ok(MoodDelta {
        id: parse_id(&id)?,
        unit_id: parse_id(&unit_id)?,
        previous_score_id: parse_id(&previous_score_id)?,
        current_score_id: parse_id(&current_score_id)?,
        subject_id: row.get("subject_id"),
        conversation_id: row.get("conversation_id"),
        delta_sequence: row.get::<i64, _>("delta_sequence") as u32,
        previous_score: row.get("previous_score"),
        current_score: row.get("current_score"),
        magnitude: row.get("magnitude"),
        direction: parse_enum::<Direction>(&direction)?,
        delta_type: parse_enum::<DeltaType>(&delta_type)?,
        confidence: row.get("confidence"),
        significance: row.get("significance"),
        factors: serde_json::from_str(&factors_json).context("Failed to decode delta factors")?,
        temporal_context: serde_json::from_str(&temporal_json)
            .context("Failed to decode delta temporal context")?,
        previous_at: parse_ts(&previous_at)?,
        occurred_at: parse_ts(&occurred_at)?,
    })
}

fn turning_point_from_row(row: &SqliteRow) -> Result<TurningPoint> {
    let id: String = row.get("id");
    let delta_id: Option<String> = row.get("delta_id");
    let unit_id: String = row.get("unit_id");
    let timestamp: String = row.get("timestamp");
    let turning_type: String = row.get("turning_type");
    let temporal_json: String = row.get("temporal_json");

    Ok(TurningPoint {
        id: parse_id(&id)?,
        delta_id: delta_id.as_deref().map(parse_id).transpose()?,
        unit_id: parse_id(&unit_id)?,
        subject_id: row.get("subject_id"),
        timestamp: parse_ts(&timestamp)?,
        turning_type: parse_enum::<TurningPointType>(&turning_type)?,
        magnitude: row.get("magnitude"),
        significance: row.get("significance"),
        confidence: row.get("confidence"),
        temporal_context: serde_json::from_str(&temporal_json)
            .context("Failed to decode turning point temporal context")?,
    })
}

fn validation_from_row(row: &SqliteRow) -> Result<ValidationResult> {
    let id: String = row.get("id");
    let unit_id: String = row.get("unit_id");
    let score_id: String = row.get("score_id");
    let method: String = row.get("method");
    let status: String = row.get("status");
    let factor_samples_json: String = row.get("factor_samples_json");
    let bias_json: String = row.get("bias_json");
    let accuracy_json: String = row.get("accuracy_json");
    let validated_at: String = row.get("validated_at");

    Ok(ValidationResult {
        id: parse_id(&id)?,
        unit_id: parse_id(&unit_id)?,
        score_id: parse_id(&score_id)?,
        validator_id: row.get("validator_id"),
        method: parse_enum::<ValidationMethod>(&method)?,
        status: parse_enum::<ValidationStatus>(&status)?,
        human_score: row.get("human_score"),
        algorithm_score: row.get("algorithm_score"),
        agreement: row.get("agreement"),
        discrepancy: row.get("discrepancy"),
        factor_samples: serde_json::from_str(&factor_samples_json)?,
        weights_version: row.get::<i64, _>("weights_version") as u64,
        bias_indicators: serde_json::from_str(&bias_json)?,
        accuracy_metrics: serde_json::from_str(&accuracy_json)?,
        validated_at: parse_ts(&validated_at)?,
    })
}

fn calibration_from_row(row: &SqliteRow) -> Result<CalibrationRecord> {
    let id: String = row.get("id");
    let cycle_id: String = row.get("cycle_id");
    let adjustment_type: String = row.get("adjustment_type");
    let previous_value_json: String = row.get("previous_value_json");
    let new_value_json: String = row.get("new_value_json");
    let new_version: Option<i64> = row.get("new_version");
    let performance_json: String = row.get("performance_json");
    let status: String = row.get("status");
    let recorded_at: String = row.get("recorded_at");
    let applied_at: Option<String> = row.get("applied_at");

    Ok(CalibrationRecord {
        id: parse_id(&id)?,
        cycle_id: parse_id(&cycle_id)?,
        adjustment_type: parse_enum::<AdjustmentType>(&adjustment_type)?,
        target_component: row.get("target_component"),
        previous_value: serde_json::from_str(&previous_value_json)?,
        new_value: serde_json::from_str(&new_value_json)?,
        previous_version: row.get::<i64, _>("previous_version") as u64,
        new_version: new_version.map(|v| v as u64),
        performance: serde_json::from_str(&performance_json)?,
        status: parse_enum::<CalibrationStatus>(&status)?,
        reason: row.get("reason"),
        recorded_at: parse_ts(&recorded_at)?,
        applied_at: applied_at.as_deref().map(parse_ts).transpose()?,
    })
}

#[async_trait]
impl MemoryStore for SqliteMoodStore {
    async fn get_unit(&self, id: Uuid) -> Result<Option<ConversationalUnit>> {
        let row = sqlx::query("SELECT * FROM units WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch unit")?;
        match row {
            Some(row) => Ok(Some(self.unit_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_recent_units(
        &self,
        participant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConversationalUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT u.* FROM units u
            JOIN unit_participants p ON p.unit_id = u.id
            WHERE p.participant_id = ? AND u.timestamp >= ?
            ORDER BY u.timestamp ASC
            "#,
        )
        .bind(participant_id)
        .bind(ts(&since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent units")?;

        let mut units = Vec::with_capacity(rows.len());
        for row in &rows {
            units.push(self.unit_from_row(row).await?);
        }
        Ok(units)
    }
}

#[async_trait]
impl HistoryJournal for SqliteMoodStore {
    async fn commit(&self, records: &[CalibrationRecord], consumed: &[Uuid]) -> MoodResult<()> {
        self.commit_calibration(records, consumed)
            .await
            .map_err(|e| MoodError::HistoryPersistence(format!("{:#}", e)))
    }
}

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{Duration, Local};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use super::{MatchStore, ReadMode, SettingsStore, TeamStore, TeamTx};
use crate::answers::{plan_answers, AnswerInput, SaveOutcome};
use crate::config::{Settings, STEP_2_END_AT, STEP_2_START_AT, TEAM_MAX_STUDENT_COUNT};
use crate::models::{
    DataType, Gender, MatchingScore, QuestionnaireAnswer, QuestionnaireItem, RecordStatus,
    Respondent, Student, StudentId, Team, TeamId, TeamInvitation, TeamRequest, TeamRoster,
};
use crate::team::{Effect, PendingProbe, PendingScope};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Loads a small questionnaire, a handful of students and a matching window around today.
pub async fn seed(store: &PgStore) -> anyhow::Result<()> {
    let pool = &store.pool;
    let items = [
        ("bedtime", "When do you usually go to sleep?", DataType::Time, 2.0, false, 1),
        ("wake_up", "When do you usually get up?", DataType::Time, 1.0, false, 2),
        ("tidiness", "How tidy do you keep your room (1-5)?", DataType::Number, 1.5, false, 3),
        ("noise", "How much noise can you tolerate (1-5)?", DataType::Number, 1.0, false, 4),
        ("smoking", "Do you smoke (0/1)?", DataType::Number, -3.0, false, 5),
        ("study_hours", "Preferred study hours", DataType::TimeArray, 1.0, false, 6),
        ("interests", "Pick your interests", DataType::TextArray, 1.0, false, 7),
        ("about", "Describe your ideal roommate", DataType::Text, 1.0, true, 8),
    ];
    for (id, title, data_type, weight, embed, display_index) in items {
        sqlx::query(
            r#"
            INSERT INTO roommate_match.questionnaire_items
            (id, title, data_type, weight, embed, display_index)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title, data_type = EXCLUDED.data_type,
                weight = EXCLUDED.weight, embed = EXCLUDED.embed,
                display_index = EXCLUDED.display_index
            "#,
        )
        .bind(id)
        .bind(title)
        .bind(data_type.as_str())
        .bind(weight)
        .bind(embed)
        .bind(display_index)
        .execute(pool)
        .await?;
    }

    let students = [
        (20230001_i64, "Lin Hao", Gender::Male, "lin.hao@dorm.example"),
        (20230002, "Zhou Kai", Gender::Male, "zhou.kai@dorm.example"),
        (20230003, "Wang Lei", Gender::Male, "wang.lei@dorm.example"),
        (20230004, "Chen Yu", Gender::Female, "chen.yu@dorm.example"),
        (20230005, "Li Na", Gender::Female, "li.na@dorm.example"),
    ];
    for (id, name, gender, contact) in students {
        sqlx::query(
            r#"
            INSERT INTO roommate_match.students (id, name, gender, contact)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, gender = EXCLUDED.gender, contact = EXCLUDED.contact
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(gender.code())
        .bind(contact)
        .execute(pool)
        .await?;
    }

    let now = Local::now().naive_local();
    let settings = [
        (STEP_2_START_AT, (now - Duration::days(1)).format("%Y-%m-%d %H:%M:%S").to_string()),
        (STEP_2_END_AT, (now + Duration::days(30)).format("%Y-%m-%d %H:%M:%S").to_string()),
        (TEAM_MAX_STUDENT_COUNT, "4".to_string()),
    ];
    for (key, value) in settings {
        sqlx::query(
            r#"
            INSERT INTO roommate_match.system_settings (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(pool)
        .await?;
    }

    let answers = [
        (20230001_i64, [("bedtime", "23:30"), ("tidiness", "4"), ("noise", "2"), ("about", "quiet, likes reading and early mornings")]),
        (20230002, [("bedtime", "00:30"), ("tidiness", "3"), ("noise", "4"), ("about", "gamer, stays up late, friendly")]),
        (20230003, [("bedtime", "23:00"), ("tidiness", "5"), ("noise", "1"), ("about", "reads a lot and keeps things quiet")]),
        (20230004, [("bedtime", "22:45"), ("tidiness", "4"), ("noise", "2"), ("about", "early riser who enjoys yoga")]),
        (20230005, [("bedtime", "01:00"), ("tidiness", "2"), ("noise", "5"), ("about", "music student, practices in the evening")]),
    ];
    for (student, pairs) in answers {
        let inputs: Vec<AnswerInput> = pairs
            .iter()
            .map(|(item_id, answer)| AnswerInput {
                item_id: item_id.to_string(),
                answer: answer.to_string(),
                weight: None,
            })
            .collect();
        store.save_answers(student, &inputs).await?;
    }

    Ok(())
}

/// Imports `student_id,item_id,answer,weight` rows, one submission per student.
pub async fn import_csv<S: MatchStore + ?Sized>(
    store: &S,
    csv_path: &Path,
) -> anyhow::Result<ImportSummary> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        student_id: StudentId,
        item_id: String,
        answer: String,
        weight: Option<f64>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut grouped: Vec<(StudentId, Vec<AnswerInput>)> = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        let input = AnswerInput {
            item_id: row.item_id,
            answer: row.answer,
            weight: row.weight,
        };
        match grouped.iter_mut().find(|(id, _)| *id == row.student_id) {
            Some((_, inputs)) => inputs.push(input),
            None => grouped.push((row.student_id, vec![input])),
        }
    }

    let mut summary = ImportSummary::default();
    for (student, inputs) in grouped {
        let outcome = store
            .save_answers(student, &inputs)
            .await
            .with_context(|| format!("importing answers for student {student}"))?;
        if !outcome.unknown_items.is_empty() {
            warn!("student {student}: ignored unknown items {:?}", outcome.unknown_items);
        }
        summary.students += 1;
        summary.saved += outcome.saved;
        summary.scores_invalidated += outcome.scores_invalidated;
    }
    Ok(summary)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub students: usize,
    pub saved: usize,
    pub scores_invalidated: u64,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const STUDENT_COLUMNS: &str = "id, name, gender, contact, team_id";

fn student_from_row(row: &PgRow) -> Student {
    Student {
        id: row.get("id"),
        name: row.get("name"),
        gender: Gender::from_code(row.get("gender")),
        contact: row.get("contact"),
        team_id: row.get("team_id"),
    }
}

fn team_from_row(row: &PgRow) -> Team {
    Team {
        id: row.get("id"),
        gender: Gender::from_code(row.get("gender")),
        description: row.get("description"),
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn settings(&self) -> anyhow::Result<Settings> {
        let rows = sqlx::query("SELECT key, value FROM roommate_match.system_settings")
            .fetch_all(&self.pool)
            .await?;
        let pairs: HashMap<String, String> = rows
            .iter()
            .filter_map(|row| {
                let value: Option<String> = row.get("value");
                value.map(|value| (row.get("key"), value))
            })
            .collect();
        Ok(Settings::from_pairs(&pairs))
    }
}

#[async_trait]
impl MatchStore for PgStore {
    async fn items(&self) -> anyhow::Result<Vec<QuestionnaireItem>> {
        let rows = sqlx::query(
            "SELECT id, title, data_type, weight, embed, display_index \
             FROM roommate_match.questionnaire_items ORDER BY display_index, id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.get("data_type");
            items.push(QuestionnaireItem {
                id: row.get("id"),
                title: row.get("title"),
                data_type: raw.parse().map_err(anyhow::Error::msg)?,
                weight: row.get("weight"),
                embed: row.get("embed"),
                display_index: row.get("display_index"),
            });
        }
        Ok(items)
    }

    async fn respondents(&self) -> anyhow::Result<Vec<Respondent>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.name, s.gender, s.contact, s.team_id,
                   a.id AS answer_id, a.item_id, a.answer, a.weight, a.embedding
            FROM roommate_match.students s
            JOIN roommate_match.questionnaire_answers a ON a.student_id = s.id
            ORDER BY s.id, a.item_id COLLATE "C"
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut respondents: Vec<Respondent> = Vec::new();
        for row in rows {
            let answer = QuestionnaireAnswer {
                id: row.get("answer_id"),
                student_id: row.get("id"),
                item_id: row.get("item_id"),
                answer: row.get("answer"),
                weight: row.get("weight"),
                embedding: row.get("embedding"),
            };
            if let Some(current) = respondents
                .last_mut()
                .filter(|r| r.student.id == answer.student_id)
            {
                current.answers.push(answer);
            } else {
                respondents.push(Respondent {
                    student: student_from_row(&row),
                    answers: vec![answer],
                });
            }
        }
        Ok(respondents)
    }

    async fn scored_targets(&self, from: StudentId) -> anyhow::Result<HashSet<StudentId>> {
        let rows = sqlx::query(
            "SELECT to_student_id FROM roommate_match.matching_scores WHERE from_student_id = $1",
        )
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("to_student_id")).collect())
    }

    async fn save_scores(
        &self,
        scores: &[MatchingScore],
        embeddings: &[(i64, Vec<f32>)],
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        for (answer_id, vector) in embeddings {
            sqlx::query("UPDATE roommate_match.questionnaire_answers SET embedding = $2 WHERE id = $1")
                .bind(answer_id)
                .bind(vector)
                .execute(&mut *tx)
                .await?;
        }

        if !scores.is_empty() {
            let from: Vec<StudentId> = scores.iter().map(|s| s.from_student_id).collect();
            let to: Vec<StudentId> = scores.iter().map(|s| s.to_student_id).collect();
            let value: Vec<f64> = scores.iter().map(|s| s.score).collect();
            let inserted = sqlx::query(
                r#"
                INSERT INTO roommate_match.matching_scores (from_student_id, to_student_id, score)
                SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::DOUBLE PRECISION[])
                ON CONFLICT (from_student_id, to_student_id) DO NOTHING
                "#,
            )
            .bind(&from)
            .bind(&to)
            .bind(&value)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if inserted < scores.len() as u64 {
                debug!("{} scores already present, kept existing rows", scores.len() as u64 - inserted);
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_answers(
        &self,
        student: StudentId,
        answers: &[AnswerInput],
    ) -> anyhow::Result<SaveOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent submissions for the same student.
        let exists = sqlx::query("SELECT id FROM roommate_match.students WHERE id = $1 FOR UPDATE")
            .bind(student)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            bail!("student {student} not found");
        }

        let items = self.items().await?;
        let existing: Vec<QuestionnaireAnswer> = sqlx::query(
            "SELECT id, student_id, item_id, answer, weight, embedding \
             FROM roommate_match.questionnaire_answers WHERE student_id = $1",
        )
        .bind(student)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| QuestionnaireAnswer {
            id: row.get("id"),
            student_id: row.get("student_id"),
            item_id: row.get("item_id"),
            answer: row.get("answer"),
            weight: row.get("weight"),
            embedding: row.get("embedding"),
        })
        .collect();

        let plan = plan_answers(&items, &existing, answers);
        let mut outcome = SaveOutcome {
            saved: plan.upserts.len(),
            unknown_items: plan.unknown_items.clone(),
            scores_invalidated: 0,
        };
        if !plan.changes_anything() {
            return Ok(outcome);
        }

        for upsert in &plan.upserts {
            sqlx::query(
                r#"
                INSERT INTO roommate_match.questionnaire_answers (student_id, item_id, answer, weight)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (student_id, item_id) DO UPDATE
                SET answer = EXCLUDED.answer,
                    weight = EXCLUDED.weight,
                    embedding = CASE WHEN $5 THEN NULL ELSE questionnaire_answers.embedding END,
                    updated_at = now()
                "#,
            )
            .bind(student)
            .bind(&upsert.item_id)
            .bind(&upsert.answer)
            .bind(upsert.weight)
            .bind(upsert.clear_embedding)
            .execute(&mut *tx)
            .await?;
        }

        outcome.scores_invalidated = sqlx::query(
            "DELETE FROM roommate_match.matching_scores \
             WHERE from_student_id = $1 OR to_student_id = $1",
        )
        .bind(student)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        info!(
            "student {student}: saved {} answers, dropped {} scores",
            outcome.saved, outcome.scores_invalidated
        );
        Ok(outcome)
    }

    async fn student(&self, id: StudentId) -> anyhow::Result<Option<Student>> {
        let row = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM roommate_match.students WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(student_from_row))
    }

    async fn students_by_gender(&self, gender: Gender) -> anyhow::Result<Vec<Student>> {
        let rows = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM roommate_match.students WHERE gender = $1 ORDER BY id"
        ))
        .bind(gender.code())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(student_from_row).collect())
    }

    async fn scores_toward(&self, to: StudentId) -> anyhow::Result<Vec<MatchingScore>> {
        let rows = sqlx::query(
            "SELECT from_student_id, to_student_id, score \
             FROM roommate_match.matching_scores WHERE to_student_id = $1",
        )
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| MatchingScore {
                from_student_id: row.get("from_student_id"),
                to_student_id: row.get("to_student_id"),
                score: row.get("score"),
            })
            .collect())
    }
}

#[async_trait]
impl TeamStore for PgStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn TeamTx + '_>> {
        let tx = self.pool.begin().await.context("failed to open team transaction")?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn rosters(&self) -> anyhow::Result<Vec<TeamRoster>> {
        let teams = sqlx::query("SELECT id, gender, description FROM roommate_match.teams ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        let members = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM roommate_match.students \
             WHERE team_id IS NOT NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut by_team: HashMap<TeamId, Vec<Student>> = HashMap::new();
        for row in &members {
            let student = student_from_row(row);
            if let Some(team) = student.team_id {
                by_team.entry(team).or_default().push(student);
            }
        }
        Ok(teams
            .iter()
            .map(|row| {
                let team = team_from_row(row);
                let members = by_team.remove(&team.id).unwrap_or_default();
                TeamRoster { team, members }
            })
            .collect())
    }
}

/// Team transaction over one pooled connection; rows read here stay locked until commit.
struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn lock_clause(mode: ReadMode) -> &'static str {
    match mode {
        ReadMode::Snapshot => "",
        ReadMode::ForUpdate => " FOR UPDATE",
    }
}

#[async_trait]
impl TeamTx for PgTx {
    async fn student(&mut self, id: StudentId, mode: ReadMode) -> anyhow::Result<Option<Student>> {
        let row = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM roommate_match.students WHERE id = $1{}",
            lock_clause(mode)
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(student_from_row))
    }

    async fn students(&mut self, ids: &[StudentId]) -> anyhow::Result<Vec<Student>> {
        let rows = sqlx::query(&format!(
            "SELECT {STUDENT_COLUMNS} FROM roommate_match.students \
             WHERE id = ANY($1) ORDER BY id FOR UPDATE"
        ))
        .bind(ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows.iter().map(student_from_row).collect())
    }

    async fn team(&mut self, id: TeamId, mode: ReadMode) -> anyhow::Result<Option<Team>> {
        let row = sqlx::query(&format!(
            "SELECT id, gender, description FROM roommate_match.teams WHERE id = $1{}",
            lock_clause(mode)
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.as_ref().map(team_from_row))
    }

    async fn member_ids(&mut self, team: TeamId) -> anyhow::Result<Vec<StudentId>> {
        let rows = sqlx::query("SELECT id FROM roommate_match.students WHERE team_id = $1 ORDER BY id")
            .bind(team)
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn invitation(&mut self, id: i64, mode: ReadMode) -> anyhow::Result<Option<TeamInvitation>> {
        let row = sqlx::query(&format!(
            "SELECT id, from_student_id, to_student_id, team_id, status, reason \
             FROM roommate_match.team_invitations WHERE id = $1{}",
            lock_clause(mode)
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|row| TeamInvitation {
            id: row.get("id"),
            from_student_id: row.get("from_student_id"),
            to_student_id: row.get("to_student_id"),
            team_id: row.get("team_id"),
            status: RecordStatus::from_code(row.get("status")),
            reason: row.get("reason"),
        }))
    }

    async fn request(&mut self, id: i64, mode: ReadMode) -> anyhow::Result<Option<TeamRequest>> {
        let row = sqlx::query(&format!(
            "SELECT id, student_id, team_id, status, reason \
             FROM roommate_match.team_requests WHERE id = $1{}",
            lock_clause(mode)
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row.map(|row| TeamRequest {
            id: row.get("id"),
            student_id: row.get("student_id"),
            team_id: row.get("team_id"),
            status: RecordStatus::from_code(row.get("status")),
            reason: row.get("reason"),
        }))
    }

    async fn has_pending(&mut self, probe: PendingProbe) -> anyhow::Result<bool> {
        let row = match probe {
            PendingProbe::Invitation { from, to, team } => {
                sqlx::query(
                    r#"
                    SELECT EXISTS (
                        SELECT 1 FROM roommate_match.team_invitations
                        WHERE status = 0
                          AND to_student_id = $1
                          AND team_id IS NOT DISTINCT FROM $2
                          AND ($3::BIGINT IS NULL OR from_student_id = $3)
                    ) AS pending
                    "#,
                )
                .bind(to)
                .bind(team)
                .bind(from)
                .fetch_one(&mut *self.tx)
                .await?
            }
            PendingProbe::Request { student, team } => {
                sqlx::query(
                    r#"
                    SELECT EXISTS (
                        SELECT 1 FROM roommate_match.team_requests
                        WHERE status = 0 AND student_id = $1 AND team_id = $2
                    ) AS pending
                    "#,
                )
                .bind(student)
                .bind(team)
                .fetch_one(&mut *self.tx)
                .await?
            }
        };
        Ok(row.get("pending"))
    }

    async fn insert_team(&mut self, gender: Gender, description: Option<&str>) -> anyhow::Result<TeamId> {
        let row = sqlx::query(
            "INSERT INTO roommate_match.teams (gender, description) VALUES ($1, $2) RETURNING id",
        )
        .bind(gender.code())
        .bind(description)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.get("id"))
    }

    async fn insert_invitation(
        &mut self,
        from: StudentId,
        to: StudentId,
        team: Option<TeamId>,
    ) -> anyhow::Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO roommate_match.team_invitations (from_student_id, to_student_id, team_id)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(team)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.get("id"))
    }

    async fn insert_request(&mut self, student: StudentId, team: TeamId) -> anyhow::Result<i64> {
        let row = sqlx::query(
            "INSERT INTO roommate_match.team_requests (student_id, team_id) VALUES ($1, $2) RETURNING id",
        )
        .bind(student)
        .bind(team)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(row.get("id"))
    }

    async fn apply(&mut self, effect: &Effect) -> anyhow::Result<u64> {
        let result = match effect {
            Effect::AssignTeam { student, team } => {
                sqlx::query("UPDATE roommate_match.students SET team_id = $2 WHERE id = $1")
                    .bind(student)
                    .bind(team)
                    .execute(&mut *self.tx)
                    .await?
            }
            Effect::Invalidate { scope, reason } => {
                let (table, column, id) = match *scope {
                    PendingScope::InvitationsFrom(id) => ("team_invitations", "from_student_id", id),
                    PendingScope::InvitationsTo(id) => ("team_invitations", "to_student_id", id),
                    PendingScope::InvitationsForTeam(id) => ("team_invitations", "team_id", id),
                    PendingScope::RequestsBy(id) => ("team_requests", "student_id", id),
                    PendingScope::RequestsForTeam(id) => ("team_requests", "team_id", id),
                };
                sqlx::query(&format!(
                    "UPDATE roommate_match.{table} \
                     SET status = $2, reason = $3, updated_at = now() \
                     WHERE {column} = $1 AND status = 0"
                ))
                .bind(id)
                .bind(RecordStatus::Invalidated.code())
                .bind(reason)
                .execute(&mut *self.tx)
                .await?
            }
            Effect::ResolveInvitation { id, status, reason } => {
                sqlx::query(
                    "UPDATE roommate_match.team_invitations \
                     SET status = $2, reason = $3, updated_at = now() WHERE id = $1",
                )
                .bind(id)
                .bind(status.code())
                .bind(reason)
                .execute(&mut *self.tx)
                .await?
            }
            Effect::ResolveRequest { id, status, reason } => {
                sqlx::query(
                    "UPDATE roommate_match.team_requests \
                     SET status = $2, reason = $3, updated_at = now() WHERE id = $1",
                )
                .bind(id)
                .bind(status.code())
                .bind(reason)
                .execute(&mut *self.tx)
                .await?
            }
            Effect::DeleteTeam { team } => {
                sqlx::query("DELETE FROM roommate_match.teams WHERE id = $1")
                    .bind(team)
                    .execute(&mut *self.tx)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

//! Persistence seams for the matching engine and the team state machine.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::answers::{AnswerInput, SaveOutcome};
use crate::config::Settings;
use crate::models::{
    Gender, MatchingScore, QuestionnaireItem, Respondent, Student, StudentId, Team, TeamId,
    TeamInvitation, TeamRequest, TeamRoster,
};
use crate::team::{Effect, PendingProbe};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn settings(&self) -> anyhow::Result<Settings>;
}

#[async_trait]
pub trait MatchStore: SettingsStore {
    async fn items(&self) -> anyhow::Result<Vec<QuestionnaireItem>>;

    /// Students with at least one answer; answers sorted by item id.
    async fn respondents(&self) -> anyhow::Result<Vec<Respondent>>;

    async fn scored_targets(&self, from: StudentId) -> anyhow::Result<HashSet<StudentId>>;

    /// Inserts scores and persists freshly computed embeddings in one transaction.
    async fn save_scores(
        &self,
        scores: &[MatchingScore],
        embeddings: &[(i64, Vec<f32>)],
    ) -> anyhow::Result<()>;

    /// Upserts answers; when anything changed, drops every score touching the student.
    async fn save_answers(
        &self,
        student: StudentId,
        answers: &[AnswerInput],
    ) -> anyhow::Result<SaveOutcome>;

    async fn student(&self, id: StudentId) -> anyhow::Result<Option<Student>>;

    async fn students_by_gender(&self, gender: Gender) -> anyhow::Result<Vec<Student>>;

    async fn scores_toward(&self, to: StudentId) -> anyhow::Result<Vec<MatchingScore>>;
}

#[async_trait]
pub trait TeamStore: SettingsStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn TeamTx + '_>>;

    async fn rosters(&self) -> anyhow::Result<Vec<TeamRoster>>;
}

/// Whether a read inside a team transaction takes the row lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Snapshot,
    ForUpdate,
}

/// One open team transaction. Dropping it without [`TeamTx::commit`] rolls back.
///
/// Locks are always taken in one order: the team row, then student rows by
/// ascending id, then invitation and request rows. Rows are snapshot-read to
/// learn which locks are needed and re-checked once locked.
#[async_trait]
pub trait TeamTx: Send {
    async fn student(&mut self, id: StudentId, mode: ReadMode) -> anyhow::Result<Option<Student>>;

    /// Locks the existing rows among `ids` in ascending id order.
    async fn students(&mut self, ids: &[StudentId]) -> anyhow::Result<Vec<Student>>;

    async fn team(&mut self, id: TeamId, mode: ReadMode) -> anyhow::Result<Option<Team>>;

    /// Not locked: membership only changes while the team row is held.
    async fn member_ids(&mut self, team: TeamId) -> anyhow::Result<Vec<StudentId>>;

    async fn invitation(&mut self, id: i64, mode: ReadMode) -> anyhow::Result<Option<TeamInvitation>>;

    async fn request(&mut self, id: i64, mode: ReadMode) -> anyhow::Result<Option<TeamRequest>>;

    async fn has_pending(&mut self, probe: PendingProbe) -> anyhow::Result<bool>;

    async fn insert_team(&mut self, gender: Gender, description: Option<&str>) -> anyhow::Result<TeamId>;

    async fn insert_invitation(
        &mut self,
        from: StudentId,
        to: StudentId,
        team: Option<TeamId>,
    ) -> anyhow::Result<i64>;

    async fn insert_request(&mut self, student: StudentId, team: TeamId) -> anyhow::Result<i64>;

    /// Returns the number of rows the effect touched.
    async fn apply(&mut self, effect: &Effect) -> anyhow::Result<u64>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
}

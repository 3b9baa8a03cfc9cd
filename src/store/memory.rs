//! In-process store.
//!
//! A team transaction holds the state lock for its whole life and works on a
//! copy, publishing it on commit. Transactions are therefore fully serialized.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{MatchStore, ReadMode, SettingsStore, TeamStore, TeamTx};
use crate::answers::{plan_answers, AnswerInput, SaveOutcome};
use crate::config::Settings;
use crate::models::{
    Gender, ItemId, MatchingScore, QuestionnaireAnswer, QuestionnaireItem, RecordStatus,
    Respondent, Student, StudentId, Team, TeamId, TeamInvitation, TeamRequest, TeamRoster,
};
use crate::team::{Effect, PendingProbe, PendingScope};

#[derive(Debug, Clone, Default)]
struct State {
    settings: HashMap<String, String>,
    students: BTreeMap<StudentId, Student>,
    items: BTreeMap<ItemId, QuestionnaireItem>,
    answers: BTreeMap<(StudentId, ItemId), QuestionnaireAnswer>,
    teams: BTreeMap<TeamId, Team>,
    invitations: BTreeMap<i64, TeamInvitation>,
    requests: BTreeMap<i64, TeamRequest>,
    scores: BTreeMap<(StudentId, StudentId), f64>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn invalidate(&mut self, scope: PendingScope, reason: &str) -> u64 {
        let mut touched = 0;
        let close = |status: &mut RecordStatus, slot: &mut Option<String>| {
            *status = RecordStatus::Invalidated;
            *slot = Some(reason.to_string());
        };
        match scope {
            PendingScope::InvitationsFrom(_)
            | PendingScope::InvitationsTo(_)
            | PendingScope::InvitationsForTeam(_) => {
                for invitation in self.invitations.values_mut() {
                    let hit = match scope {
                        PendingScope::InvitationsFrom(id) => invitation.from_student_id == id,
                        PendingScope::InvitationsTo(id) => invitation.to_student_id == id,
                        PendingScope::InvitationsForTeam(id) => invitation.team_id == Some(id),
                        _ => false,
                    };
                    if hit && invitation.status == RecordStatus::Pending {
                        close(&mut invitation.status, &mut invitation.reason);
                        touched += 1;
                    }
                }
            }
            PendingScope::RequestsBy(_) | PendingScope::RequestsForTeam(_) => {
                for request in self.requests.values_mut() {
                    let hit = match scope {
                        PendingScope::RequestsBy(id) => request.student_id == id,
                        PendingScope::RequestsForTeam(id) => request.team_id == Some(id),
                        _ => false,
                    };
                    if hit && request.status == RecordStatus::Pending {
                        close(&mut request.status, &mut request.reason);
                        touched += 1;
                    }
                }
            }
        }
        touched
    }

    fn apply(&mut self, effect: &Effect) -> anyhow::Result<u64> {
        match effect {
            Effect::AssignTeam { student, team } => match self.students.get_mut(student) {
                Some(row) => {
                    row.team_id = *team;
                    Ok(1)
                }
                None => bail!("student {student} vanished mid-transaction"),
            },
            Effect::Invalidate { scope, reason } => Ok(self.invalidate(*scope, reason)),
            Effect::ResolveInvitation { id, status, reason } => {
                match self.invitations.get_mut(id) {
                    Some(row) => {
                        row.status = *status;
                        row.reason = reason.clone();
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            Effect::ResolveRequest { id, status, reason } => match self.requests.get_mut(id) {
                Some(row) => {
                    row.status = *status;
                    row.reason = reason.clone();
                    Ok(1)
                }
                None => Ok(0),
            },
            Effect::DeleteTeam { team } => {
                // Mirrors the ON DELETE SET NULL foreign keys.
                for student in self.students.values_mut() {
                    if student.team_id == Some(*team) {
                        student.team_id = None;
                    }
                }
                for invitation in self.invitations.values_mut() {
                    if invitation.team_id == Some(*team) {
                        invitation.team_id = None;
                    }
                }
                for request in self.requests.values_mut() {
                    if request.team_id == Some(*team) {
                        request.team_id = None;
                    }
                }
                Ok(u64::from(self.teams.remove(team).is_some()))
            }
        }
    }

    fn member_ids(&self, team: TeamId) -> Vec<StudentId> {
        self.students
            .values()
            .filter(|s| s.team_id == Some(team))
            .map(|s| s.id)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_student(&self, student: Student) {
        self.state.lock().await.students.insert(student.id, student);
    }

    pub async fn insert_item(&self, item: QuestionnaireItem) {
        self.state.lock().await.items.insert(item.id.clone(), item);
    }

    pub async fn put_setting(&self, key: &str, value: &str) {
        self.state
            .lock()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
    }

    /// Sets a team reference directly, skipping every validation and cascade.
    pub async fn force_team(&self, student: StudentId, team: Option<TeamId>) {
        if let Some(row) = self.state.lock().await.students.get_mut(&student) {
            row.team_id = team;
        }
    }

    pub async fn student(&self, id: StudentId) -> Option<Student> {
        self.state.lock().await.students.get(&id).cloned()
    }

    pub async fn team(&self, id: TeamId) -> Option<Team> {
        self.state.lock().await.teams.get(&id).cloned()
    }

    pub async fn team_count(&self) -> usize {
        self.state.lock().await.teams.len()
    }

    pub async fn members(&self, team: TeamId) -> Vec<StudentId> {
        self.state.lock().await.member_ids(team)
    }

    pub async fn invitation(&self, id: i64) -> Option<TeamInvitation> {
        self.state.lock().await.invitations.get(&id).cloned()
    }

    pub async fn request(&self, id: i64) -> Option<TeamRequest> {
        self.state.lock().await.requests.get(&id).cloned()
    }

    pub async fn answer(&self, student: StudentId, item: &str) -> Option<QuestionnaireAnswer> {
        self.state
            .lock()
            .await
            .answers
            .get(&(student, item.to_string()))
            .cloned()
    }

    pub async fn scores(&self) -> Vec<MatchingScore> {
        self.state
            .lock()
            .await
            .scores
            .iter()
            .map(|(&(from, to), &score)| MatchingScore {
                from_student_id: from,
                to_student_id: to,
                score,
            })
            .collect()
    }

    pub async fn score(&self, from: StudentId, to: StudentId) -> Option<f64> {
        self.state.lock().await.scores.get(&(from, to)).copied()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn settings(&self) -> anyhow::Result<Settings> {
        Ok(Settings::from_pairs(&self.state.lock().await.settings))
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn items(&self) -> anyhow::Result<Vec<QuestionnaireItem>> {
        Ok(self.state.lock().await.items.values().cloned().collect())
    }

    async fn respondents(&self) -> anyhow::Result<Vec<Respondent>> {
        let state = self.state.lock().await;
        let mut grouped: BTreeMap<StudentId, Vec<QuestionnaireAnswer>> = BTreeMap::new();
        // Keys sort by (student, item), so each group is already in item order.
        for ((student, _), answer) in state.answers.iter() {
            grouped.entry(*student).or_default().push(answer.clone());
        }
        Ok(grouped
            .into_iter()
            .filter_map(|(id, answers)| {
                state.students.get(&id).map(|student| Respondent {
                    student: student.clone(),
                    answers,
                })
            })
            .collect())
    }

    async fn scored_targets(&self, from: StudentId) -> anyhow::Result<HashSet<StudentId>> {
        Ok(self
            .state
            .lock()
            .await
            .scores
            .range((from, StudentId::MIN)..=(from, StudentId::MAX))
            .map(|(&(_, to), _)| to)
            .collect())
    }

    async fn save_scores(
        &self,
        scores: &[MatchingScore],
        embeddings: &[(i64, Vec<f32>)],
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        for (answer_id, vector) in embeddings {
            if let Some(answer) = state.answers.values_mut().find(|a| a.id == *answer_id) {
                answer.embedding = Some(vector.clone());
            }
        }
        for score in scores {
            state
                .scores
                .entry((score.from_student_id, score.to_student_id))
                .or_insert(score.score);
        }
        Ok(())
    }

    async fn save_answers(
        &self,
        student: StudentId,
        answers: &[AnswerInput],
    ) -> anyhow::Result<SaveOutcome> {
        let mut state = self.state.lock().await;
        if !state.students.contains_key(&student) {
            bail!("student {student} not found");
        }
        let items: Vec<QuestionnaireItem> = state.items.values().cloned().collect();
        let existing: Vec<QuestionnaireAnswer> = state
            .answers
            .values()
            .filter(|a| a.student_id == student)
            .cloned()
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

        for upsert in plan.upserts {
            let id = match upsert.existing_id {
                Some(id) => id,
                None => state.next_id(),
            };
            let key = (student, upsert.item_id.clone());
            let embedding = match state.answers.get(&key) {
                Some(current) if !upsert.clear_embedding => current.embedding.clone(),
                _ => None,
            };
            state.answers.insert(
                key,
                QuestionnaireAnswer {
                    id,
                    student_id: student,
                    item_id: upsert.item_id,
                    answer: upsert.answer,
                    weight: upsert.weight,
                    embedding,
                },
            );
        }

        let before = state.scores.len();
        state
            .scores
            .retain(|&(from, to), _| from != student && to != student);
        outcome.scores_invalidated = (before - state.scores.len()) as u64;
        Ok(outcome)
    }

    async fn student(&self, id: StudentId) -> anyhow::Result<Option<Student>> {
        Ok(self.state.lock().await.students.get(&id).cloned())
    }

    async fn students_by_gender(&self, gender: Gender) -> anyhow::Result<Vec<Student>> {
        Ok(self
            .state
            .lock()
            .await
            .students
            .values()
            .filter(|s| s.gender == gender)
            .cloned()
            .collect())
    }

    async fn scores_toward(&self, to: StudentId) -> anyhow::Result<Vec<MatchingScore>> {
        Ok(self
            .state
            .lock()
            .await
            .scores
            .iter()
            .filter(|(key, _)| key.1 == to)
            .map(|(&(from, to), &score)| MatchingScore {
                from_student_id: from,
                to_student_id: to,
                score,
            })
            .collect())
    }
}

#[async_trait]
impl TeamStore for MemoryStore {
    async fn begin(&self) -> anyhow::Result<Box<dyn TeamTx + '_>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn rosters(&self) -> anyhow::Result<Vec<TeamRoster>> {
        let state = self.state.lock().await;
        Ok(state
            .teams
            .values()
            .map(|team| TeamRoster {
                team: team.clone(),
                members: state
                    .students
                    .values()
                    .filter(|s| s.team_id == Some(team.id))
                    .cloned()
                    .collect(),
            })
            .collect())
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl TeamTx for MemoryTx {
    async fn student(&mut self, id: StudentId, _mode: ReadMode) -> anyhow::Result<Option<Student>> {
        Ok(self.working.students.get(&id).cloned())
    }

    async fn students(&mut self, ids: &[StudentId]) -> anyhow::Result<Vec<Student>> {
        let mut rows: Vec<Student> = ids
            .iter()
            .filter_map(|id| self.working.students.get(id).cloned())
            .collect();
        rows.sort_by_key(|student| student.id);
        rows.dedup_by_key(|student| student.id);
        Ok(rows)
    }

    async fn team(&mut self, id: TeamId, _mode: ReadMode) -> anyhow::Result<Option<Team>> {
        Ok(self.working.teams.get(&id).cloned())
    }

    async fn member_ids(&mut self, team: TeamId) -> anyhow::Result<Vec<StudentId>> {
        Ok(self.working.member_ids(team))
    }

    async fn invitation(&mut self, id: i64, _mode: ReadMode) -> anyhow::Result<Option<TeamInvitation>> {
        Ok(self.working.invitations.get(&id).cloned())
    }

    async fn request(&mut self, id: i64, _mode: ReadMode) -> anyhow::Result<Option<TeamRequest>> {
        Ok(self.working.requests.get(&id).cloned())
    }

    async fn has_pending(&mut self, probe: PendingProbe) -> anyhow::Result<bool> {
        Ok(match probe {
            PendingProbe::Invitation { from, to, team } => {
                self.working.invitations.values().any(|inv| {
                    inv.status == RecordStatus::Pending
                        && inv.to_student_id == to
                        && inv.team_id == team
                        && from.map_or(true, |from| inv.from_student_id == from)
                })
            }
            PendingProbe::Request { student, team } => self.working.requests.values().any(|req| {
                req.status == RecordStatus::Pending
                    && req.student_id == student
                    && req.team_id == Some(team)
            }),
        })
    }

    async fn insert_team(&mut self, gender: Gender, description: Option<&str>) -> anyhow::Result<TeamId> {
        let id = self.working.next_id();
        self.working.teams.insert(
            id,
            Team {
                id,
                gender,
                description: description.map(str::to_string),
            },
        );
        Ok(id)
    }

    async fn insert_invitation(
        &mut self,
        from: StudentId,
        to: StudentId,
        team: Option<TeamId>,
    ) -> anyhow::Result<i64> {
        let id = self.working.next_id();
        self.working.invitations.insert(
            id,
            TeamInvitation {
                id,
                from_student_id: from,
                to_student_id: to,
                team_id: team,
                status: RecordStatus::Pending,
                reason: None,
            },
        );
        Ok(id)
    }

    async fn insert_request(&mut self, student: StudentId, team: TeamId) -> anyhow::Result<i64> {
        let id = self.working.next_id();
        self.working.requests.insert(
            id,
            TeamRequest {
                id,
                student_id: student,
                team_id: Some(team),
                status: RecordStatus::Pending,
                reason: None,
            },
        );
        Ok(id)
    }

    async fn apply(&mut self, effect: &Effect) -> anyhow::Result<u64> {
        self.working.apply(effect)
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

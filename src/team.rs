//! Team membership and the lifecycle of join requests and invitations.
//!
//! Every operation opens one store transaction, validates against rows read
//! inside it, then applies an explicit ordered list of [`Effect`]s. Nothing is
//! committed unless every step succeeded, so a failed cascade leaves no trace.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::TeamPolicy;
use crate::error::{Entity, TeamError, TeamResult};
use crate::models::{Gender, RecordStatus, Student, StudentId, Team, TeamId, TeamInvitation};
use crate::store::{ReadMode, TeamStore, TeamTx};

pub const REASON_INVITER_JOINED: &str = "the inviter has joined another team";
pub const REASON_INVITEE_JOINED: &str = "the invitee has joined another team";
pub const REASON_REQUESTER_JOINED: &str = "the requester has joined another team";
pub const REASON_TEAM_FULL: &str = "the target team is now full";
pub const REASON_TEAM_DISSOLVED: &str = "the team was dissolved because too few members remained";
pub const REASON_TEAM_DELETED: &str = "the team was deleted by an administrator";
pub const REASON_TEAM_CREATED: &str = "a new team was created";

/// Pending records a cascade sweeps into the invalidated state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingScope {
    InvitationsFrom(StudentId),
    InvitationsTo(StudentId),
    RequestsBy(StudentId),
    InvitationsForTeam(TeamId),
    RequestsForTeam(TeamId),
}

/// A pending record whose existence blocks creating another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingProbe {
    /// `from: None` matches any inviter; `team` is matched exactly, `None` included.
    Invitation {
        from: Option<StudentId>,
        to: StudentId,
        team: Option<TeamId>,
    },
    Request { student: StudentId, team: TeamId },
}

/// One write inside a team transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AssignTeam {
        student: StudentId,
        team: Option<TeamId>,
    },
    Invalidate {
        scope: PendingScope,
        reason: String,
    },
    ResolveInvitation {
        id: i64,
        status: RecordStatus,
        reason: Option<String>,
    },
    ResolveRequest {
        id: i64,
        status: RecordStatus,
        reason: Option<String>,
    },
    DeleteTeam {
        team: TeamId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinPlan {
    AlreadyMember,
    Apply(Vec<Effect>),
}

/// Validates a join and lists its writes: the assignment, then the cascades.
pub fn plan_join(
    student: &Student,
    team: &Team,
    member_count: usize,
    capacity: usize,
    policy: &TeamPolicy,
) -> TeamResult<JoinPlan> {
    match student.team_id {
        Some(current) if current == team.id => return Ok(JoinPlan::AlreadyMember),
        Some(current) => {
            return Err(TeamError::AlreadyInTeam {
                student: student.id,
                team: current,
            })
        }
        None => {}
    }
    if student.gender != team.gender {
        return Err(TeamError::GenderMismatch);
    }
    if member_count >= capacity {
        return Err(TeamError::TeamFull(team.id));
    }

    let mut effects = vec![
        Effect::AssignTeam {
            student: student.id,
            team: Some(team.id),
        },
        Effect::Invalidate {
            scope: PendingScope::InvitationsFrom(student.id),
            reason: REASON_INVITER_JOINED.to_string(),
        },
        Effect::Invalidate {
            scope: PendingScope::InvitationsTo(student.id),
            reason: REASON_INVITEE_JOINED.to_string(),
        },
        Effect::Invalidate {
            scope: PendingScope::RequestsBy(student.id),
            reason: REASON_REQUESTER_JOINED.to_string(),
        },
    ];

    // This join takes the last free slot.
    if policy.lock_when_nearly_full && member_count + 1 == capacity {
        effects.push(Effect::Invalidate {
            scope: PendingScope::InvitationsForTeam(team.id),
            reason: REASON_TEAM_FULL.to_string(),
        });
        effects.push(Effect::Invalidate {
            scope: PendingScope::RequestsForTeam(team.id),
            reason: REASON_TEAM_FULL.to_string(),
        });
    }

    Ok(JoinPlan::Apply(effects))
}

/// Clears every member, invalidates the team's pending records, deletes the row.
pub fn plan_dissolve(team: TeamId, members: &[StudentId], reason: &str) -> Vec<Effect> {
    let mut effects: Vec<Effect> = members
        .iter()
        .map(|&student| Effect::AssignTeam {
            student,
            team: None,
        })
        .collect();
    effects.push(Effect::Invalidate {
        scope: PendingScope::InvitationsForTeam(team),
        reason: reason.to_string(),
    });
    effects.push(Effect::Invalidate {
        scope: PendingScope::RequestsForTeam(team),
        reason: reason.to_string(),
    });
    effects.push(Effect::DeleteTeam { team });
    effects
}

pub fn plan_leave(
    student: StudentId,
    team: TeamId,
    members: &[StudentId],
    policy: &TeamPolicy,
) -> Vec<Effect> {
    if members.len() <= policy.min_team_size {
        plan_dissolve(team, members, REASON_TEAM_DISSOLVED)
    } else {
        vec![Effect::AssignTeam {
            student,
            team: None,
        }]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined { team: TeamId, invalidated: u64 },
    AlreadyMember { team: TeamId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    NotInTeam,
    Left { team: TeamId },
    Dissolved { team: TeamId, released: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Withdrawn,
    Rejected,
    Joined { team: TeamId, created_team: bool },
}

pub struct TeamStateMachine<S> {
    store: Arc<S>,
    policy: TeamPolicy,
}

impl<S: TeamStore> TeamStateMachine<S> {
    pub fn new(store: Arc<S>, policy: TeamPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn create_team(&self, gender: Gender, description: Option<&str>) -> TeamResult<TeamId> {
        let mut tx = self.store.begin().await?;
        let team = tx.insert_team(gender, description).await?;
        tx.commit().await?;
        info!(team, %gender, "team created");
        Ok(team)
    }

    pub async fn join(&self, student: StudentId, team: TeamId) -> TeamResult<JoinOutcome> {
        let capacity = self.store.settings().await?.team_capacity;
        let mut tx = self.store.begin().await?;
        let outcome = self.join_in(tx.as_mut(), student, team, capacity).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn leave(&self, student: StudentId) -> TeamResult<LeaveOutcome> {
        let mut tx = self.store.begin().await?;
        let current = load_student(tx.as_mut(), student, ReadMode::Snapshot).await?;
        let Some(team) = current.team_id else {
            return Ok(LeaveOutcome::NotInTeam);
        };
        // A team deleted since the snapshot has already released its members.
        if tx.team(team, ReadMode::ForUpdate).await?.is_none() {
            return Ok(LeaveOutcome::NotInTeam);
        }
        let members = tx.member_ids(team).await?;
        if !members.contains(&student) {
            return Err(changed_concurrently(student));
        }
        tx.students(&members).await?;

        let effects = plan_leave(student, team, &members, &self.policy);
        let dissolved = effects.iter().any(|e| matches!(e, Effect::DeleteTeam { .. }));
        let invalidated = apply_all(tx.as_mut(), &effects).await?;
        tx.commit().await?;

        if dissolved {
            info!(student, team, invalidated, "team dissolved after member left");
            Ok(LeaveOutcome::Dissolved {
                team,
                released: members.len(),
            })
        } else {
            info!(student, team, "student left team");
            Ok(LeaveOutcome::Left { team })
        }
    }

    /// Administrative removal of a team and everything pending against it.
    pub async fn delete_team(&self, team: TeamId) -> TeamResult<usize> {
        let mut tx = self.store.begin().await?;
        load_team(tx.as_mut(), team).await?;
        let members = tx.member_ids(team).await?;
        tx.students(&members).await?;
        let invalidated = apply_all(tx.as_mut(), &plan_dissolve(team, &members, REASON_TEAM_DELETED)).await?;
        tx.commit().await?;
        info!(team, released = members.len(), invalidated, "team deleted");
        Ok(members.len())
    }

    /// Invites an unaffiliated student into the inviter's team, or into a new one.
    pub async fn invite(&self, actor: StudentId, target: StudentId) -> TeamResult<i64> {
        if actor == target {
            return Err(TeamError::SelfReference);
        }
        let capacity = self.store.settings().await?.team_capacity;
        let mut tx = self.store.begin().await?;
        let inviter_team = load_student(tx.as_mut(), actor, ReadMode::Snapshot).await?.team_id;
        let team = match inviter_team {
            Some(team_id) => Some(load_team(tx.as_mut(), team_id).await?),
            None => None,
        };
        let (inviter, invitee) = lock_pair(tx.as_mut(), actor, target).await?;
        if inviter.team_id != inviter_team {
            return Err(changed_concurrently(actor));
        }

        if inviter.gender != invitee.gender {
            return Err(TeamError::GenderMismatch);
        }
        if let Some(team) = invitee.team_id {
            return Err(TeamError::AlreadyInTeam {
                student: invitee.id,
                team,
            });
        }

        match team {
            Some(team) => {
                if team.gender != invitee.gender {
                    return Err(TeamError::GenderMismatch);
                }
                if tx.member_ids(team.id).await?.len() >= capacity {
                    return Err(TeamError::TeamFull(team.id));
                }
                let invited = PendingProbe::Invitation {
                    from: None,
                    to: invitee.id,
                    team: Some(team.id),
                };
                if tx.has_pending(invited).await? {
                    return Err(TeamError::DuplicatePending(Entity::Invitation));
                }
                let requested = PendingProbe::Request {
                    student: invitee.id,
                    team: team.id,
                };
                if tx.has_pending(requested).await? {
                    return Err(TeamError::DuplicatePending(Entity::Request));
                }
            }
            None => {
                let probes = [
                    PendingProbe::Invitation {
                        from: Some(inviter.id),
                        to: invitee.id,
                        team: None,
                    },
                    PendingProbe::Invitation {
                        from: Some(invitee.id),
                        to: inviter.id,
                        team: None,
                    },
                ];
                for probe in probes {
                    if tx.has_pending(probe).await? {
                        return Err(TeamError::DuplicatePending(Entity::Invitation));
                    }
                }
            }
        }

        let id = tx.insert_invitation(inviter.id, invitee.id, inviter.team_id).await?;
        tx.commit().await?;
        info!(invitation = id, from = actor, to = target, team = ?inviter.team_id, "invitation sent");
        Ok(id)
    }

    /// Asks to join an existing team.
    pub async fn request(&self, actor: StudentId, team_id: TeamId) -> TeamResult<i64> {
        let capacity = self.store.settings().await?.team_capacity;
        let mut tx = self.store.begin().await?;
        let team = load_team(tx.as_mut(), team_id).await?;
        let student = load_student(tx.as_mut(), actor, ReadMode::ForUpdate).await?;
        if let Some(team) = student.team_id {
            return Err(TeamError::AlreadyInTeam {
                student: actor,
                team,
            });
        }
        if team.gender != student.gender {
            return Err(TeamError::GenderMismatch);
        }
        if tx.member_ids(team_id).await?.len() >= capacity {
            return Err(TeamError::TeamFull(team_id));
        }

        let invited = PendingProbe::Invitation {
            from: None,
            to: actor,
            team: Some(team_id),
        };
        if tx.has_pending(invited).await? {
            return Err(TeamError::DuplicatePending(Entity::Invitation));
        }
        let requested = PendingProbe::Request {
            student: actor,
            team: team_id,
        };
        if tx.has_pending(requested).await? {
            return Err(TeamError::DuplicatePending(Entity::Request));
        }

        let id = tx.insert_request(actor, team_id).await?;
        tx.commit().await?;
        info!(request = id, student = actor, team = team_id, "team request sent");
        Ok(id)
    }

    pub async fn process_invitation(
        &self,
        actor: StudentId,
        invitation_id: i64,
        accept: bool,
    ) -> TeamResult<ProcessOutcome> {
        let capacity = self.store.settings().await?.team_capacity;
        let mut tx = self.store.begin().await?;
        let seen = tx
            .invitation(invitation_id, ReadMode::Snapshot)
            .await?
            .ok_or(TeamError::NotFound(Entity::Invitation, invitation_id))?;

        let is_inviter = seen.from_student_id == actor;
        if !is_inviter && seen.to_student_id != actor {
            return Err(TeamError::Forbidden(actor));
        }
        if seen.status.is_terminal() {
            return Err(TeamError::AlreadyProcessed(Entity::Invitation, invitation_id));
        }

        if !accept {
            let actor_row = load_student(tx.as_mut(), actor, ReadMode::Snapshot).await?;
            lock_open_invitation(tx.as_mut(), invitation_id).await?;
            let (status, outcome, verb) = if is_inviter {
                (RecordStatus::Invalidated, ProcessOutcome::Withdrawn, "withdrawn")
            } else {
                (RecordStatus::Rejected, ProcessOutcome::Rejected, "rejected")
            };
            tx.apply(&Effect::ResolveInvitation {
                id: invitation_id,
                status,
                reason: Some(format!("{verb} by {}", actor_row.name)),
            })
            .await?;
            tx.commit().await?;
            info!(invitation = invitation_id, actor, verb, "invitation closed");
            return Ok(outcome);
        }
        if is_inviter {
            return Err(TeamError::Forbidden(actor));
        }

        if let Some(team) = seen.team_id {
            load_team(tx.as_mut(), team).await?;
        }
        let (invitee, _) = lock_pair(tx.as_mut(), seen.to_student_id, seen.from_student_id).await?;
        let invitation = lock_open_invitation(tx.as_mut(), invitation_id).await?;
        if invitation.team_id != seen.team_id {
            return Err(TeamError::AlreadyProcessed(Entity::Invitation, invitation_id));
        }

        let outcome = match invitation.team_id {
            None => {
                tx.apply(&Effect::ResolveInvitation {
                    id: invitation_id,
                    status: RecordStatus::Accepted,
                    reason: Some(REASON_TEAM_CREATED.to_string()),
                })
                .await?;
                let team = tx.insert_team(invitee.gender, None).await?;
                self.join_in(tx.as_mut(), invitation.to_student_id, team, capacity).await?;
                self.join_in(tx.as_mut(), invitation.from_student_id, team, capacity).await?;
                ProcessOutcome::Joined {
                    team,
                    created_team: true,
                }
            }
            Some(team) => {
                tx.apply(&Effect::ResolveInvitation {
                    id: invitation_id,
                    status: RecordStatus::Accepted,
                    reason: None,
                })
                .await?;
                self.join_in(tx.as_mut(), invitation.to_student_id, team, capacity).await?;
                ProcessOutcome::Joined {
                    team,
                    created_team: false,
                }
            }
        };

        tx.commit().await?;
        info!(invitation = invitation_id, actor, outcome = ?outcome, "invitation accepted");
        Ok(outcome)
    }

    pub async fn process_request(
        &self,
        actor: StudentId,
        request_id: i64,
        accept: bool,
    ) -> TeamResult<ProcessOutcome> {
        let capacity = self.store.settings().await?.team_capacity;
        let mut tx = self.store.begin().await?;
        let seen = tx
            .request(request_id, ReadMode::Snapshot)
            .await?
            .ok_or(TeamError::NotFound(Entity::Request, request_id))?;

        let is_requester = seen.student_id == actor;
        if accept && is_requester {
            return Err(TeamError::Forbidden(actor));
        }
        let actor_row = if accept {
            if let Some(team) = seen.team_id {
                load_team(tx.as_mut(), team).await?;
            }
            let (actor_row, _) = lock_pair(tx.as_mut(), actor, seen.student_id).await?;
            actor_row
        } else {
            load_student(tx.as_mut(), actor, ReadMode::Snapshot).await?
        };
        let is_member = actor_row.team_id.is_some() && actor_row.team_id == seen.team_id;
        if !is_requester && !is_member {
            return Err(TeamError::Forbidden(actor));
        }

        let request = tx
            .request(request_id, ReadMode::ForUpdate)
            .await?
            .ok_or(TeamError::NotFound(Entity::Request, request_id))?;
        if request.status.is_terminal() || request.team_id != seen.team_id {
            return Err(TeamError::AlreadyProcessed(Entity::Request, request_id));
        }

        if !accept {
            let (status, outcome, verb) = if is_requester {
                (RecordStatus::Invalidated, ProcessOutcome::Withdrawn, "withdrawn")
            } else {
                (RecordStatus::Rejected, ProcessOutcome::Rejected, "rejected")
            };
            tx.apply(&Effect::ResolveRequest {
                id: request_id,
                status,
                reason: Some(format!("{verb} by {}", actor_row.name)),
            })
            .await?;
            tx.commit().await?;
            info!(request = request_id, actor, verb, "team request closed");
            return Ok(outcome);
        }

        let team = request
            .team_id
            .ok_or(TeamError::NotFound(Entity::Team, request_id))?;
        tx.apply(&Effect::ResolveRequest {
            id: request_id,
            status: RecordStatus::Accepted,
            reason: Some(format!("accepted by {}", actor_row.name)),
        })
        .await?;
        self.join_in(tx.as_mut(), request.student_id, team, capacity).await?;
        tx.commit().await?;

        info!(request = request_id, actor, team, "team request accepted");
        Ok(ProcessOutcome::Joined {
            team,
            created_team: false,
        })
    }

    /// Locks the team, then the student. Callers already holding student rows
    /// must have locked the team before them.
    async fn join_in(
        &self,
        tx: &mut (dyn TeamTx + '_),
        student: StudentId,
        team: TeamId,
        capacity: usize,
    ) -> TeamResult<JoinOutcome> {
        let team_row = load_team(tx, team).await?;
        let student_row = load_student(tx, student, ReadMode::ForUpdate).await?;
        let members = tx.member_ids(team).await?;

        match plan_join(&student_row, &team_row, members.len(), capacity, &self.policy)? {
            JoinPlan::AlreadyMember => {
                debug!(student, team, "join is a no-op, already a member");
                Ok(JoinOutcome::AlreadyMember { team })
            }
            JoinPlan::Apply(effects) => {
                let invalidated = apply_all(tx, &effects).await?;
                info!(student, team, invalidated, "student joined team");
                Ok(JoinOutcome::Joined { team, invalidated })
            }
        }
    }
}

async fn load_student(tx: &mut (dyn TeamTx + '_), id: StudentId, mode: ReadMode) -> TeamResult<Student> {
    tx.student(id, mode)
        .await?
        .ok_or(TeamError::NotFound(Entity::Student, id))
}

/// Locks the team row.
async fn load_team(tx: &mut (dyn TeamTx + '_), id: TeamId) -> TeamResult<Team> {
    tx.team(id, ReadMode::ForUpdate)
        .await?
        .ok_or(TeamError::NotFound(Entity::Team, id))
}

/// Locks both students in ascending id order and returns them as `(a, b)`.
async fn lock_pair(
    tx: &mut (dyn TeamTx + '_),
    a: StudentId,
    b: StudentId,
) -> TeamResult<(Student, Student)> {
    let rows = tx.students(&[a, b]).await?;
    let pick = |id: StudentId| {
        rows.iter()
            .find(|row| row.id == id)
            .cloned()
            .ok_or(TeamError::NotFound(Entity::Student, id))
    };
    Ok((pick(a)?, pick(b)?))
}

async fn lock_open_invitation(tx: &mut (dyn TeamTx + '_), id: i64) -> TeamResult<TeamInvitation> {
    let invitation = tx
        .invitation(id, ReadMode::ForUpdate)
        .await?
        .ok_or(TeamError::NotFound(Entity::Invitation, id))?;
    if invitation.status.is_terminal() {
        return Err(TeamError::AlreadyProcessed(Entity::Invitation, id));
    }
    Ok(invitation)
}

fn changed_concurrently(student: StudentId) -> TeamError {
    TeamError::Persistence(anyhow::anyhow!("student {student} changed team concurrently, retry"))
}

/// Applies effects in order; returns how many pending records were invalidated.
async fn apply_all(tx: &mut (dyn TeamTx + '_), effects: &[Effect]) -> TeamResult<u64> {
    let mut invalidated = 0;
    for effect in effects {
        let affected = tx.apply(effect).await?;
        if matches!(effect, Effect::Invalidate { .. }) {
            invalidated += affected;
        }
    }
    Ok(invalidated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TEAM_MAX_STUDENT_COUNT;
    use crate::error::ErrorKind;
    use crate::store::memory::MemoryStore;

    fn student(id: StudentId, gender: Gender, team_id: Option<TeamId>) -> Student {
        Student {
            id,
            name: format!("student-{id}"),
            gender,
            contact: None,
            team_id,
        }
    }

    fn team(id: TeamId, gender: Gender) -> Team {
        Team {
            id,
            gender,
            description: None,
        }
    }

    async fn fixture(ids: &[(StudentId, Gender)]) -> (Arc<MemoryStore>, TeamStateMachine<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for &(id, gender) in ids {
            store.insert_student(student(id, gender, None)).await;
        }
        let machine = TeamStateMachine::new(store.clone(), TeamPolicy::default());
        (store, machine)
    }

    #[test]
    fn plan_join_validates_in_order() {
        let policy = TeamPolicy::default();
        let t = team(10, Gender::Male);

        let member = student(1, Gender::Male, Some(10));
        assert_eq!(plan_join(&member, &t, 2, 4, &policy).unwrap(), JoinPlan::AlreadyMember);

        let elsewhere = student(1, Gender::Male, Some(11));
        assert!(matches!(
            plan_join(&elsewhere, &t, 2, 4, &policy),
            Err(TeamError::AlreadyInTeam { team: 11, .. })
        ));

        let female = student(2, Gender::Female, None);
        assert!(matches!(plan_join(&female, &t, 0, 4, &policy), Err(TeamError::GenderMismatch)));

        let free = student(3, Gender::Male, None);
        assert!(matches!(plan_join(&free, &t, 4, 4, &policy), Err(TeamError::TeamFull(10))));
    }

    #[test]
    fn plan_join_locks_team_on_last_slot() {
        let free = student(3, Gender::Male, None);
        let t = team(10, Gender::Male);

        let JoinPlan::Apply(roomy) = plan_join(&free, &t, 1, 4, &TeamPolicy::default()).unwrap() else {
            panic!("expected effects");
        };
        assert_eq!(roomy.len(), 4);
        assert_eq!(
            roomy[0],
            Effect::AssignTeam {
                student: 3,
                team: Some(10)
            }
        );

        let JoinPlan::Apply(filling) = plan_join(&free, &t, 3, 4, &TeamPolicy::default()).unwrap() else {
            panic!("expected effects");
        };
        assert!(filling.contains(&Effect::Invalidate {
            scope: PendingScope::RequestsForTeam(10),
            reason: REASON_TEAM_FULL.to_string(),
        }));

        let unlocked = TeamPolicy {
            lock_when_nearly_full: false,
            ..TeamPolicy::default()
        };
        let JoinPlan::Apply(open) = plan_join(&free, &t, 3, 4, &unlocked).unwrap() else {
            panic!("expected effects");
        };
        assert_eq!(open.len(), 4);
    }

    #[test]
    fn plan_leave_dissolves_small_teams() {
        let policy = TeamPolicy::default();
        let effects = plan_leave(1, 10, &[1, 2], &policy);
        assert_eq!(effects.last(), Some(&Effect::DeleteTeam { team: 10 }));
        assert!(effects.contains(&Effect::AssignTeam { student: 2, team: None }));

        let effects = plan_leave(1, 10, &[1, 2, 3], &policy);
        assert_eq!(effects, vec![Effect::AssignTeam { student: 1, team: None }]);
    }

    #[tokio::test]
    async fn join_checks_existence_and_gender() {
        let (_store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Female)]).await;
        let err = machine.join(1, 99).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let team = machine.create_team(Gender::Male, Some("quiet floor")).await.unwrap();
        assert!(matches!(machine.join(2, team).await, Err(TeamError::GenderMismatch)));
        assert!(matches!(
            machine.join(1, team).await.unwrap(),
            JoinOutcome::Joined { .. }
        ));
        assert_eq!(
            machine.join(1, team).await.unwrap(),
            JoinOutcome::AlreadyMember { team }
        );
    }

    #[tokio::test]
    async fn join_invalidates_outgoing_overtures() {
        let (store, machine) =
            fixture(&[(1, Gender::Male), (2, Gender::Male), (3, Gender::Male), (4, Gender::Male)]).await;
        let to_two = machine.invite(3, 1).await.unwrap();
        let to_four = machine.invite(3, 4).await.unwrap();
        let team = machine.create_team(Gender::Male, None).await.unwrap();

        machine.join(3, team).await.unwrap();

        for id in [to_two, to_four] {
            let invitation = store.invitation(id).await.unwrap();
            assert_eq!(invitation.status, RecordStatus::Invalidated);
            assert_eq!(invitation.reason.as_deref(), Some(REASON_INVITER_JOINED));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_joins_respect_capacity() {
        let (store, machine) = fixture(&[
            (1, Gender::Female),
            (2, Gender::Female),
            (3, Gender::Female),
            (4, Gender::Female),
            (5, Gender::Female),
        ])
        .await;
        let machine = Arc::new(machine);
        let team = machine.create_team(Gender::Female, None).await.unwrap();
        for id in 1..=3 {
            machine.join(id, team).await.unwrap();
        }

        let first = tokio::spawn({
            let machine = machine.clone();
            async move { machine.join(4, team).await }
        });
        let second = tokio::spawn({
            let machine = machine.clone();
            async move { machine.join(5, team).await }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];

        let joined = results.iter().filter(|r| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|r| matches!(r, Err(TeamError::TeamFull(t)) if *t == team))
            .count();
        assert_eq!((joined, full), (1, 1));
        assert_eq!(store.members(team).await.len(), 4);
    }

    #[tokio::test]
    async fn leaving_a_pair_dissolves_the_team() {
        let (store, machine) =
            fixture(&[(1, Gender::Male), (2, Gender::Male), (3, Gender::Male), (4, Gender::Male)]).await;
        let team = machine.create_team(Gender::Male, None).await.unwrap();
        machine.join(1, team).await.unwrap();
        machine.join(2, team).await.unwrap();
        let request = machine.request(3, team).await.unwrap();
        let invitation = machine.invite(1, 4).await.unwrap();

        let outcome = machine.leave(2).await.unwrap();

        assert_eq!(outcome, LeaveOutcome::Dissolved { team, released: 2 });
        assert!(store.team(team).await.is_none());
        assert!(store.members(team).await.is_empty());
        assert_eq!(store.student(1).await.unwrap().team_id, None);
        let request = store.request(request).await.unwrap();
        assert_eq!(request.status, RecordStatus::Invalidated);
        assert_eq!(request.reason.as_deref(), Some(REASON_TEAM_DISSOLVED));
        assert_eq!(
            store.invitation(invitation).await.unwrap().status,
            RecordStatus::Invalidated
        );
    }

    #[tokio::test]
    async fn leaving_a_larger_team_only_detaches() {
        let (store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Male), (3, Gender::Male)]).await;
        let team = machine.create_team(Gender::Male, None).await.unwrap();
        for id in 1..=3 {
            machine.join(id, team).await.unwrap();
        }

        assert_eq!(machine.leave(3).await.unwrap(), LeaveOutcome::Left { team });
        assert_eq!(store.members(team).await.len(), 2);
        assert_eq!(machine.leave(3).await.unwrap(), LeaveOutcome::NotInTeam);
    }

    #[tokio::test]
    async fn accepting_a_teamless_invitation_creates_a_team() {
        let (store, machine) = fixture(&[(1, Gender::Female), (2, Gender::Female)]).await;
        let invitation = machine.invite(1, 2).await.unwrap();

        let outcome = machine.process_invitation(2, invitation, true).await.unwrap();

        let ProcessOutcome::Joined { team, created_team } = outcome else {
            panic!("expected a join, got {outcome:?}");
        };
        assert!(created_team);
        assert_eq!(store.student(1).await.unwrap().team_id, Some(team));
        assert_eq!(store.student(2).await.unwrap().team_id, Some(team));
        assert_eq!(store.team(team).await.unwrap().gender, Gender::Female);
        assert_eq!(
            store.invitation(invitation).await.unwrap().status,
            RecordStatus::Accepted
        );
    }

    #[tokio::test]
    async fn failed_second_join_rolls_back_team_creation() {
        let (store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Male)]).await;
        let invitation = machine.invite(1, 2).await.unwrap();
        let elsewhere = machine.create_team(Gender::Male, None).await.unwrap();
        // Raw write that bypasses the cascade, leaving the invitation pending.
        store.force_team(1, Some(elsewhere)).await;
        let teams_before = store.team_count().await;

        let err = machine.process_invitation(2, invitation, true).await.unwrap_err();

        assert!(matches!(err, TeamError::AlreadyInTeam { student: 1, .. }));
        assert_eq!(store.student(2).await.unwrap().team_id, None);
        assert_eq!(store.team_count().await, teams_before);
        assert_eq!(
            store.invitation(invitation).await.unwrap().status,
            RecordStatus::Pending
        );
    }

    #[tokio::test]
    async fn invitation_creation_rules() {
        let (_store, machine) = fixture(&[
            (1, Gender::Male),
            (2, Gender::Male),
            (3, Gender::Female),
            (4, Gender::Male),
        ])
        .await;

        assert!(matches!(machine.invite(1, 1).await, Err(TeamError::SelfReference)));
        assert!(matches!(machine.invite(1, 3).await, Err(TeamError::GenderMismatch)));
        assert!(matches!(
            machine.invite(1, 42).await,
            Err(TeamError::NotFound(Entity::Student, 42))
        ));

        machine.invite(1, 2).await.unwrap();
        assert!(matches!(
            machine.invite(1, 2).await,
            Err(TeamError::DuplicatePending(Entity::Invitation))
        ));
        assert!(matches!(
            machine.invite(2, 1).await,
            Err(TeamError::DuplicatePending(Entity::Invitation))
        ));

        let team = machine.create_team(Gender::Male, None).await.unwrap();
        machine.join(4, team).await.unwrap();
        assert!(matches!(
            machine.invite(1, 4).await,
            Err(TeamError::AlreadyInTeam { student: 4, .. })
        ));
    }

    #[tokio::test]
    async fn team_invitations_and_requests_block_each_other() {
        let (_store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Male), (3, Gender::Male)]).await;
        let team = machine.create_team(Gender::Male, None).await.unwrap();
        machine.join(1, team).await.unwrap();

        machine.request(2, team).await.unwrap();
        assert!(matches!(
            machine.invite(1, 2).await,
            Err(TeamError::DuplicatePending(Entity::Request))
        ));
        assert!(matches!(
            machine.request(2, team).await,
            Err(TeamError::DuplicatePending(Entity::Request))
        ));

        machine.invite(1, 3).await.unwrap();
        assert!(matches!(
            machine.request(3, team).await,
            Err(TeamError::DuplicatePending(Entity::Invitation))
        ));
        assert!(matches!(
            machine.request(1, team).await,
            Err(TeamError::AlreadyInTeam { .. })
        ));
    }

    #[tokio::test]
    async fn processing_enforces_standing_and_terminal_states() {
        let (store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Male), (3, Gender::Male)]).await;
        let first = machine.invite(1, 2).await.unwrap();

        assert!(matches!(
            machine.process_invitation(3, first, false).await,
            Err(TeamError::Forbidden(3))
        ));
        assert!(matches!(
            machine.process_invitation(1, first, true).await,
            Err(TeamError::Forbidden(1))
        ));

        assert_eq!(
            machine.process_invitation(2, first, false).await.unwrap(),
            ProcessOutcome::Rejected
        );
        let rejected = store.invitation(first).await.unwrap();
        assert_eq!(rejected.status, RecordStatus::Rejected);
        assert_eq!(rejected.reason.as_deref(), Some("rejected by student-2"));
        assert!(matches!(
            machine.process_invitation(2, first, true).await,
            Err(TeamError::AlreadyProcessed(Entity::Invitation, _))
        ));

        let second = machine.invite(1, 2).await.unwrap();
        assert_eq!(
            machine.process_invitation(1, second, false).await.unwrap(),
            ProcessOutcome::Withdrawn
        );
        assert_eq!(
            store.invitation(second).await.unwrap().status,
            RecordStatus::Invalidated
        );
        assert!(matches!(
            machine.process_invitation(1, 404, false).await,
            Err(TeamError::NotFound(Entity::Invitation, 404))
        ));
    }

    #[tokio::test]
    async fn accepting_a_request_fills_and_locks_the_team() {
        let (store, machine) = fixture(&[
            (1, Gender::Male),
            (2, Gender::Male),
            (3, Gender::Male),
            (4, Gender::Male),
        ])
        .await;
        store.put_setting(TEAM_MAX_STUDENT_COUNT, "3").await;
        let team = machine.create_team(Gender::Male, None).await.unwrap();
        machine.join(1, team).await.unwrap();
        machine.join(2, team).await.unwrap();
        let from_three = machine.request(3, team).await.unwrap();
        let from_four = machine.request(4, team).await.unwrap();

        assert!(matches!(
            machine.process_request(3, from_three, true).await,
            Err(TeamError::Forbidden(3))
        ));
        assert!(matches!(
            machine.process_request(4, from_three, false).await,
            Err(TeamError::Forbidden(4))
        ));

        let outcome = machine.process_request(1, from_three, true).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Joined {
                team,
                created_team: false
            }
        );
        assert_eq!(store.request(from_three).await.unwrap().status, RecordStatus::Accepted);
        let locked = store.request(from_four).await.unwrap();
        assert_eq!(locked.status, RecordStatus::Invalidated);
        assert_eq!(locked.reason.as_deref(), Some(REASON_TEAM_FULL));
    }

    #[tokio::test]
    async fn accepting_into_a_full_team_changes_nothing() {
        let (store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Male), (3, Gender::Male)]).await;
        store.put_setting(TEAM_MAX_STUDENT_COUNT, "2").await;
        let unlocked = TeamStateMachine::new(
            store.clone(),
            TeamPolicy {
                lock_when_nearly_full: false,
                ..TeamPolicy::default()
            },
        );
        let team = machine.create_team(Gender::Male, None).await.unwrap();
        machine.join(1, team).await.unwrap();
        let request = machine.request(3, team).await.unwrap();
        unlocked.join(2, team).await.unwrap();

        let err = machine.process_request(1, request, true).await.unwrap_err();

        assert!(matches!(err, TeamError::TeamFull(t) if t == team));
        assert_eq!(store.request(request).await.unwrap().status, RecordStatus::Pending);
        assert_eq!(store.student(3).await.unwrap().team_id, None);
    }

    #[tokio::test]
    async fn request_withdrawal_and_rejection() {
        let (store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Male), (3, Gender::Male)]).await;
        let team = machine.create_team(Gender::Male, None).await.unwrap();
        machine.join(1, team).await.unwrap();

        let withdrawn = machine.request(2, team).await.unwrap();
        assert_eq!(
            machine.process_request(2, withdrawn, false).await.unwrap(),
            ProcessOutcome::Withdrawn
        );
        assert_eq!(store.request(withdrawn).await.unwrap().status, RecordStatus::Invalidated);

        let rejected = machine.request(3, team).await.unwrap();
        assert_eq!(
            machine.process_request(1, rejected, false).await.unwrap(),
            ProcessOutcome::Rejected
        );
        assert_eq!(store.request(rejected).await.unwrap().status, RecordStatus::Rejected);
    }

    #[tokio::test]
    async fn deleting_a_team_releases_members() {
        let (store, machine) = fixture(&[(1, Gender::Female), (2, Gender::Female), (3, Gender::Female)]).await;
        let team = machine.create_team(Gender::Female, Some("corner room")).await.unwrap();
        machine.join(1, team).await.unwrap();
        machine.join(2, team).await.unwrap();
        let request = machine.request(3, team).await.unwrap();

        assert_eq!(machine.delete_team(team).await.unwrap(), 2);
        assert!(store.team(team).await.is_none());
        let request = store.request(request).await.unwrap();
        assert_eq!(request.status, RecordStatus::Invalidated);
        assert_eq!(request.reason.as_deref(), Some(REASON_TEAM_DELETED));
        assert!(matches!(
            machine.delete_team(team).await,
            Err(TeamError::NotFound(Entity::Team, _))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn crossing_invitations_leave_one_pending() {
        let (store, machine) = fixture(&[(1, Gender::Male), (2, Gender::Male)]).await;
        let machine = Arc::new(machine);

        let forward = tokio::spawn({
            let machine = machine.clone();
            async move { machine.invite(1, 2).await }
        });
        let backward = tokio::spawn({
            let machine = machine.clone();
            async move { machine.invite(2, 1).await }
        });
        let results = [forward.await.unwrap(), backward.await.unwrap()];

        let sent: Vec<i64> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
        assert_eq!(sent.len(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TeamError::DuplicatePending(Entity::Invitation)))));
        assert_eq!(store.invitation(sent[0]).await.unwrap().status, RecordStatus::Pending);
    }

    mod lock_order {
        use std::collections::HashSet;
        use std::sync::Mutex;

        use async_trait::async_trait;

        use super::*;
        use crate::config::Settings;
        use crate::models::{TeamInvitation, TeamRequest, TeamRoster};
        use crate::store::SettingsStore;

        /// Row locks a transaction can hold, ranked in acquisition order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        enum Lock {
            Team(TeamId),
            Student(StudentId),
            Records,
        }

        impl Lock {
            fn key(self) -> (u8, i64) {
                match self {
                    Lock::Team(id) => (0, id),
                    Lock::Student(id) => (1, id),
                    Lock::Records => (2, 0),
                }
            }
        }

        #[derive(Default)]
        struct Audit {
            acquired: usize,
            violations: Vec<String>,
        }

        /// Wraps the memory store and checks every transaction's lock order.
        struct AuditedStore {
            inner: MemoryStore,
            audit: Arc<Mutex<Audit>>,
        }

        struct AuditedTx<'a> {
            inner: Box<dyn TeamTx + 'a>,
            audit: Arc<Mutex<Audit>>,
            held: HashSet<Lock>,
            last: Option<(u8, i64)>,
        }

        impl AuditedTx<'_> {
            fn acquire(&mut self, lock: Lock) {
                if !self.held.insert(lock) {
                    return;
                }
                let mut audit = self.audit.lock().unwrap();
                audit.acquired += 1;
                match self.last {
                    Some(last) if lock.key() < last => {
                        audit.violations.push(format!("{lock:?} taken after {last:?}"));
                    }
                    _ => self.last = Some(lock.key()),
                }
            }
        }

        #[async_trait]
        impl SettingsStore for AuditedStore {
            async fn settings(&self) -> anyhow::Result<Settings> {
                self.inner.settings().await
            }
        }

        #[async_trait]
        impl TeamStore for AuditedStore {
            async fn begin(&self) -> anyhow::Result<Box<dyn TeamTx + '_>> {
                Ok(Box::new(AuditedTx {
                    inner: self.inner.begin().await?,
                    audit: self.audit.clone(),
                    held: HashSet::new(),
                    last: None,
                }))
            }

            async fn rosters(&self) -> anyhow::Result<Vec<TeamRoster>> {
                self.inner.rosters().await
            }
        }

        #[async_trait]
        impl<'a> TeamTx for AuditedTx<'a> {
            async fn student(&mut self, id: StudentId, mode: ReadMode) -> anyhow::Result<Option<Student>> {
                if mode == ReadMode::ForUpdate {
                    self.acquire(Lock::Student(id));
                }
                self.inner.student(id, mode).await
            }

            async fn students(&mut self, ids: &[StudentId]) -> anyhow::Result<Vec<Student>> {
                let mut sorted = ids.to_vec();
                sorted.sort_unstable();
                for id in sorted {
                    self.acquire(Lock::Student(id));
                }
                self.inner.students(ids).await
            }

            async fn team(&mut self, id: TeamId, mode: ReadMode) -> anyhow::Result<Option<Team>> {
                if mode == ReadMode::ForUpdate {
                    self.acquire(Lock::Team(id));
                }
                self.inner.team(id, mode).await
            }

            async fn member_ids(&mut self, team: TeamId) -> anyhow::Result<Vec<StudentId>> {
                self.inner.member_ids(team).await
            }

            async fn invitation(&mut self, id: i64, mode: ReadMode) -> anyhow::Result<Option<TeamInvitation>> {
                if mode == ReadMode::ForUpdate {
                    self.acquire(Lock::Records);
                }
                self.inner.invitation(id, mode).await
            }

            async fn request(&mut self, id: i64, mode: ReadMode) -> anyhow::Result<Option<TeamRequest>> {
                if mode == ReadMode::ForUpdate {
                    self.acquire(Lock::Records);
                }
                self.inner.request(id, mode).await
            }

            async fn has_pending(&mut self, probe: PendingProbe) -> anyhow::Result<bool> {
                self.inner.has_pending(probe).await
            }

            async fn insert_team(&mut self, gender: Gender, description: Option<&str>) -> anyhow::Result<TeamId> {
                let id = self.inner.insert_team(gender, description).await?;
                // Nobody else can see the new row yet.
                self.held.insert(Lock::Team(id));
                Ok(id)
            }

            async fn insert_invitation(
                &mut self,
                from: StudentId,
                to: StudentId,
                team: Option<TeamId>,
            ) -> anyhow::Result<i64> {
                if let Some(team) = team {
                    self.acquire(Lock::Team(team));
                }
                self.acquire(Lock::Student(from.min(to)));
                self.acquire(Lock::Student(from.max(to)));
                self.acquire(Lock::Records);
                self.inner.insert_invitation(from, to, team).await
            }

            async fn insert_request(&mut self, student: StudentId, team: TeamId) -> anyhow::Result<i64> {
                self.acquire(Lock::Team(team));
                self.acquire(Lock::Student(student));
                self.acquire(Lock::Records);
                self.inner.insert_request(student, team).await
            }

            async fn apply(&mut self, effect: &Effect) -> anyhow::Result<u64> {
                match effect {
                    Effect::AssignTeam { student, team } => {
                        if let Some(team) = team {
                            self.acquire(Lock::Team(*team));
                        }
                        self.acquire(Lock::Student(*student));
                    }
                    Effect::DeleteTeam { team } => self.acquire(Lock::Team(*team)),
                    Effect::Invalidate { .. }
                    | Effect::ResolveInvitation { .. }
                    | Effect::ResolveRequest { .. } => self.acquire(Lock::Records),
                }
                self.inner.apply(effect).await
            }

            async fn commit(self: Box<Self>) -> anyhow::Result<()> {
                self.inner.commit().await
            }
        }

        #[tokio::test]
        async fn every_operation_locks_team_then_students_then_records() {
            let store = Arc::new(AuditedStore {
                inner: MemoryStore::new(),
                audit: Arc::new(Mutex::new(Audit::default())),
            });
            for id in 1..=7 {
                store.inner.insert_student(student(id, Gender::Male, None)).await;
            }
            let machine = TeamStateMachine::new(store.clone(), TeamPolicy::default());

            let team = machine.create_team(Gender::Male, None).await.unwrap();
            machine.join(3, team).await.unwrap();
            machine.join(1, team).await.unwrap();
            // Inviter id above invitee id, both ways round.
            let into_team = machine.invite(3, 2).await.unwrap();
            machine.process_invitation(2, into_team, true).await.unwrap();
            let teamless = machine.invite(5, 4).await.unwrap();
            let ProcessOutcome::Joined { team: pair, .. } =
                machine.process_invitation(4, teamless, true).await.unwrap()
            else {
                panic!("expected a new team");
            };
            let rejected = machine.invite(7, 6).await.unwrap();
            machine.process_invitation(6, rejected, false).await.unwrap();
            let request = machine.request(6, pair).await.unwrap();
            machine.process_request(5, request, true).await.unwrap();
            machine.leave(2).await.unwrap();
            machine.leave(4).await.unwrap();
            machine.delete_team(team).await.unwrap();

            let audit = store.audit.lock().unwrap();
            assert!(audit.acquired > 20);
            assert!(audit.violations.is_empty(), "{:?}", audit.violations);
        }
    }
}


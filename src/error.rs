use thiserror::Error;

use crate::models::{ItemId, StudentId, TeamId};

/// Failure classes callers map onto their own transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    PermissionDenied,
    AlreadyProcessed,
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Student,
    Team,
    Request,
    Invitation,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::Student => "student",
            Entity::Team => "team",
            Entity::Request => "team request",
            Entity::Invitation => "team invitation",
        })
    }
}

#[derive(Debug, Error)]
pub enum TeamError {
    #[error("{0} {1} not found")]
    NotFound(Entity, i64),
    #[error("gender mismatch: mixed-gender teams are not allowed")]
    GenderMismatch,
    #[error("team {0} is full")]
    TeamFull(TeamId),
    #[error("a pending {0} for this pair already exists")]
    DuplicatePending(Entity),
    #[error("a student cannot team up with themselves")]
    SelfReference,
    #[error("student {student} already belongs to team {team}")]
    AlreadyInTeam { student: StudentId, team: TeamId },
    #[error("student {0} has no standing on this record")]
    Forbidden(StudentId),
    #[error("{0} {1} has already been processed")]
    AlreadyProcessed(Entity, i64),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl TeamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TeamError::NotFound(..) => ErrorKind::NotFound,
            TeamError::GenderMismatch
            | TeamError::TeamFull(_)
            | TeamError::DuplicatePending(_)
            | TeamError::SelfReference
            | TeamError::AlreadyInTeam { .. } => ErrorKind::Validation,
            TeamError::Forbidden(_) => ErrorKind::PermissionDenied,
            TeamError::AlreadyProcessed(..) => ErrorKind::AlreadyProcessed,
            TeamError::Persistence(_) => ErrorKind::Persistence,
        }
    }
}

pub type TeamResult<T> = Result<T, TeamError>;

/// A single answer pair that could not be scored.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("item {item_id}: malformed answer `{answer}`: {reason}")]
    MalformedAnswer {
        item_id: ItemId,
        answer: String,
        reason: String,
    },
    #[error("item {item_id}: embedding failed: {source}")]
    Embedding {
        item_id: ItemId,
        #[source]
        source: anyhow::Error,
    },
}

impl ScoringError {
    pub fn malformed(item_id: &str, answer: &str, reason: impl Into<String>) -> Self {
        ScoringError::MalformedAnswer {
            item_id: item_id.to_string(),
            answer: answer.to_string(),
            reason: reason.into(),
        }
    }
}

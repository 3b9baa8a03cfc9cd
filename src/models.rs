use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type StudentId = i64;
pub type TeamId = i64;
pub type ItemId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Unknown,
    Male,
    Female,
}

impl Gender {
    pub fn from_code(code: i16) -> Self {
        match code {
            1 => Gender::Male,
            2 => Gender::Female,
            _ => Gender::Unknown,
        }
    }

    pub fn code(self) -> i16 {
        match self {
            Gender::Unknown => 0,
            Gender::Male => 1,
            Gender::Female => 2,
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Gender::Unknown => "unknown",
            Gender::Male => "male",
            Gender::Female => "female",
        };
        f.write_str(label)
    }
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "male" | "m" | "1" => Ok(Gender::Male),
            "female" | "f" | "2" => Ok(Gender::Female),
            "unknown" | "0" => Ok(Gender::Unknown),
            other => Err(format!("unknown gender `{other}`")),
        }
    }
}

/// Declared encoding of a questionnaire item's answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Text,
    Number,
    Time,
    Date,
    NumberArray,
    TimeArray,
    DateArray,
    TextArray,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Number => "number",
            DataType::Time => "time",
            DataType::Date => "date",
            DataType::NumberArray => "number_array",
            DataType::TimeArray => "time_array",
            DataType::DateArray => "date_array",
            DataType::TextArray => "text_array",
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "text" => Ok(DataType::Text),
            "number" | "integer" => Ok(DataType::Number),
            "time" => Ok(DataType::Time),
            "date" => Ok(DataType::Date),
            "number_array" => Ok(DataType::NumberArray),
            "time_array" => Ok(DataType::TimeArray),
            "date_array" => Ok(DataType::DateArray),
            "text_array" => Ok(DataType::TextArray),
            other => Err(format!("unknown data type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Student {
    pub id: StudentId,
    pub name: String,
    pub gender: Gender,
    pub contact: Option<String>,
    pub team_id: Option<TeamId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionnaireItem {
    pub id: ItemId,
    pub title: String,
    pub data_type: DataType,
    /// Negative pins every answer to the magnitude; zero drops the item from scoring.
    pub weight: f64,
    /// Free-text items flagged here are matched through embeddings.
    pub embed: bool,
    pub display_index: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionnaireAnswer {
    pub id: i64,
    pub student_id: StudentId,
    pub item_id: ItemId,
    pub answer: String,
    pub weight: f64,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: TeamId,
    pub gender: Gender,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Pending,
    Accepted,
    Rejected,
    Invalidated,
}

impl RecordStatus {
    pub fn from_code(code: i16) -> Self {
        match code {
            1 => RecordStatus::Accepted,
            -1 => RecordStatus::Rejected,
            -2 => RecordStatus::Invalidated,
            _ => RecordStatus::Pending,
        }
    }

    pub fn code(self) -> i16 {
        match self {
            RecordStatus::Pending => 0,
            RecordStatus::Accepted => 1,
            RecordStatus::Rejected => -1,
            RecordStatus::Invalidated => -2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != RecordStatus::Pending
    }
}

/// A student asking to join a team.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamRequest {
    pub id: i64,
    pub student_id: StudentId,
    pub team_id: Option<TeamId>,
    pub status: RecordStatus,
    pub reason: Option<String>,
}

/// A student inviting an unaffiliated student, into their team or into a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamInvitation {
    pub id: i64,
    pub from_student_id: StudentId,
    pub to_student_id: StudentId,
    pub team_id: Option<TeamId>,
    pub status: RecordStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchingScore {
    pub from_student_id: StudentId,
    pub to_student_id: StudentId,
    pub score: f64,
}

/// A student joined with the answers they gave, sorted by item id.
#[derive(Debug, Clone)]
pub struct Respondent {
    pub student: Student,
    pub answers: Vec<QuestionnaireAnswer>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub student_id: StudentId,
    pub name: String,
    pub contact: Option<String>,
    pub score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct TeamRoster {
    pub team: Team,
    pub members: Vec<Student>,
}

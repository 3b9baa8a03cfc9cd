//! Questionnaire answer submission.
//!
//! Works out which answers actually change so the store only writes those
//! and only throws away a student's scores when something moved.

use std::collections::HashMap;

use serde::Deserialize;

use crate::models::{ItemId, QuestionnaireAnswer, QuestionnaireItem};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnswerInput {
    pub item_id: ItemId,
    pub answer: String,
    /// Falls back to the item's default when absent.
    #[serde(default)]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnswerUpsert {
    pub existing_id: Option<i64>,
    pub item_id: ItemId,
    pub answer: String,
    pub weight: f64,
    /// The text changed, so any stored embedding is stale.
    pub clear_embedding: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerPlan {
    pub upserts: Vec<AnswerUpsert>,
    pub unknown_items: Vec<ItemId>,
}

impl AnswerPlan {
    pub fn changes_anything(&self) -> bool {
        !self.upserts.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOutcome {
    pub saved: usize,
    pub unknown_items: Vec<ItemId>,
    pub scores_invalidated: u64,
}

/// Weight stored on a fresh or edited answer.
pub fn stored_weight(item: &QuestionnaireItem, requested: Option<f64>) -> f64 {
    if item.weight < 0.0 {
        return item.weight.abs();
    }
    match requested {
        Some(weight) if weight.is_finite() => weight,
        _ => item.weight,
    }
}

pub fn plan_answers(
    items: &[QuestionnaireItem],
    existing: &[QuestionnaireAnswer],
    inputs: &[AnswerInput],
) -> AnswerPlan {
    let items: HashMap<&str, &QuestionnaireItem> =
        items.iter().map(|item| (item.id.as_str(), item)).collect();
    let existing: HashMap<&str, &QuestionnaireAnswer> = existing
        .iter()
        .map(|answer| (answer.item_id.as_str(), answer))
        .collect();

    let mut plan = AnswerPlan::default();
    for input in inputs {
        let Some(item) = items.get(input.item_id.as_str()) else {
            plan.unknown_items.push(input.item_id.clone());
            continue;
        };
        let weight = stored_weight(item, input.weight);

        match existing.get(input.item_id.as_str()) {
            Some(current) if current.answer == input.answer && current.weight == weight => {}
            Some(current) => plan.upserts.push(AnswerUpsert {
                existing_id: Some(current.id),
                item_id: input.item_id.clone(),
                answer: input.answer.clone(),
                weight,
                clear_embedding: current.answer != input.answer,
            }),
            None => plan.upserts.push(AnswerUpsert {
                existing_id: None,
                item_id: input.item_id.clone(),
                answer: input.answer.clone(),
                weight,
                clear_embedding: true,
            }),
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataType;

    fn item(id: &str, weight: f64) -> QuestionnaireItem {
        QuestionnaireItem {
            id: id.to_string(),
            title: id.to_string(),
            data_type: DataType::Number,
            weight,
            embed: false,
            display_index: 1,
        }
    }

    fn input(item_id: &str, answer: &str, weight: Option<f64>) -> AnswerInput {
        AnswerInput {
            item_id: item_id.to_string(),
            answer: answer.to_string(),
            weight,
        }
    }

    #[test]
    fn unknown_items_are_reported() {
        let plan = plan_answers(&[item("sleep", 1.0)], &[], &[input("ghost", "1", None)]);
        assert_eq!(plan.unknown_items, vec!["ghost".to_string()]);
        assert!(!plan.changes_anything());
    }

    #[test]
    fn negative_default_pins_weight() {
        let plan = plan_answers(&[item("pets", -2.5)], &[], &[input("pets", "1", Some(9.0))]);
        assert_eq!(plan.upserts[0].weight, 2.5);
        assert_eq!(stored_weight(&item("noise", 1.0), Some(3.0)), 3.0);
        assert_eq!(stored_weight(&item("noise", 1.5), None), 1.5);
    }

    #[test]
    fn unchanged_answers_are_skipped() {
        let existing = QuestionnaireAnswer {
            id: 5,
            student_id: 1,
            item_id: "sleep".to_string(),
            answer: "7".to_string(),
            weight: 1.0,
            embedding: Some(vec![1.0]),
        };
        let items = [item("sleep", 1.0)];

        let same = plan_answers(&items, std::slice::from_ref(&existing), &[input("sleep", "7", None)]);
        assert!(!same.changes_anything());

        let reweighted = plan_answers(&items, std::slice::from_ref(&existing), &[input("sleep", "7", Some(2.0))]);
        assert_eq!(reweighted.upserts[0].existing_id, Some(5));
        assert!(!reweighted.upserts[0].clear_embedding);

        let edited = plan_answers(&items, std::slice::from_ref(&existing), &[input("sleep", "8", None)]);
        assert!(edited.upserts[0].clear_embedding);
    }
}

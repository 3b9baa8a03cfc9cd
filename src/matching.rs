//! Incremental computation of directed compatibility scores.
//!
//! A scan only fills in missing `(from, to)` edges inside each gender bucket,
//! so an interrupted run is finished by the next one and a complete run is a
//! no-op. Scores are dropped by answer edits, never updated in place.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDateTime;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::embedding::{EmbeddingCache, Encoder};
use crate::error::ScoringError;
use crate::models::{
    Gender, ItemId, MatchingScore, QuestionnaireItem, Recommendation, Respondent, StudentId,
};
use crate::scoring::{cosine_contribution, effective_weight, ItemRule, Similarity, SimilarityScorer};
use crate::store::MatchStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub students: usize,
    pub computed: usize,
    pub skipped: usize,
    pub embedded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    OutsideWindow,
    Completed(ScanSummary),
}

pub struct MatchEngine<S> {
    store: Arc<S>,
    encoder: Arc<dyn Encoder>,
    scorer: SimilarityScorer,
}

impl<S: MatchStore> MatchEngine<S> {
    pub fn new(store: Arc<S>, encoder: Arc<dyn Encoder>, scorer: SimilarityScorer) -> Self {
        Self {
            store,
            encoder,
            scorer,
        }
    }

    pub async fn run_once(&self, now: NaiveDateTime) -> anyhow::Result<ScanOutcome> {
        let settings = self.store.settings().await?;
        if !settings.in_matching_window(now) {
            info!("{now} is outside the matching window, skipping scan");
            return Ok(ScanOutcome::OutsideWindow);
        }

        let run_id = Uuid::new_v4();
        let items: HashMap<ItemId, QuestionnaireItem> = self
            .store
            .items()
            .await?
            .into_iter()
            .map(|item| (item.id.clone(), item))
            .collect();
        let mut respondents = self.store.respondents().await?;
        for respondent in respondents.iter_mut() {
            // The merge walk compares ids by byte order.
            respondent
                .answers
                .sort_unstable_by(|a, b| a.item_id.cmp(&b.item_id));
        }
        info!(%run_id, students = respondents.len(), "matching scan started");

        let mut buckets: HashMap<Gender, Vec<usize>> = HashMap::new();
        for (idx, respondent) in respondents.iter().enumerate() {
            buckets.entry(respondent.student.gender).or_default().push(idx);
        }

        let mut cache = EmbeddingCache::new(Arc::clone(&self.encoder));
        cache.preload(respondents.iter().flat_map(|r| r.answers.iter()));

        let mut summary = ScanSummary {
            run_id,
            students: respondents.len(),
            computed: 0,
            skipped: 0,
            embedded: 0,
        };

        for from in respondents.iter() {
            let from_id = from.student.id;
            let existing = self.store.scored_targets(from_id).await?;
            let peers = buckets.get(&from.student.gender).map(Vec::as_slice).unwrap_or_default();

            let mut batch = Vec::new();
            for &idx in peers {
                let to = &respondents[idx];
                let to_id = to.student.id;
                if to_id == from_id || existing.contains(&to_id) {
                    continue;
                }
                match self.score_pair(&items, from, to, &mut cache).await {
                    Ok(score) => batch.push(MatchingScore {
                        from_student_id: from_id,
                        to_student_id: to_id,
                        score,
                    }),
                    Err(err) => {
                        warn!(%run_id, from = from_id, to = to_id, "skipping pair: {err}");
                        summary.skipped += 1;
                    }
                }
            }

            let fresh = cache.take_fresh();
            if batch.is_empty() && fresh.is_empty() {
                continue;
            }
            debug!(%run_id, from = from_id, scores = batch.len(), embeddings = fresh.len(), "saving batch");
            self.store
                .save_scores(&batch, &fresh)
                .await
                .with_context(|| format!("saving scores for student {from_id}"))?;
            summary.computed += batch.len();
            summary.embedded += fresh.len();
        }

        info!(
            %run_id,
            computed = summary.computed,
            skipped = summary.skipped,
            embedded = summary.embedded,
            "matching scan finished"
        );
        Ok(ScanOutcome::Completed(summary))
    }

    /// Weighted average similarity of `from` toward `to`, on a 0..=100 scale.
    async fn score_pair(
        &self,
        items: &HashMap<ItemId, QuestionnaireItem>,
        from: &Respondent,
        to: &Respondent,
        cache: &mut EmbeddingCache,
    ) -> Result<f64, ScoringError> {
        let (a, b) = (&from.answers, &to.answers);
        let (mut i, mut j) = (0, 0);
        let mut weighted = 0.0;
        let mut total_weight = 0.0;

        while i < a.len() && j < b.len() {
            match a[i].item_id.cmp(&b[j].item_id) {
                CmpOrdering::Less => i += 1,
                CmpOrdering::Greater => j += 1,
                CmpOrdering::Equal => {
                    let (mine, theirs) = (&a[i], &b[j]);
                    i += 1;
                    j += 1;

                    let Some(item) = items.get(&mine.item_id) else {
                        continue;
                    };
                    let rule = ItemRule::for_item(item);
                    if rule == ItemRule::Skip {
                        continue;
                    }
                    let Some(weight) = effective_weight(item, theirs) else {
                        continue;
                    };

                    let contribution =
                        match self.scorer.compare(rule, &item.id, &mine.answer, &theirs.answer)? {
                            None => continue,
                            Some(Similarity::Contribution(value)) => value,
                            Some(Similarity::NeedsEmbedding) => {
                                let embed_err = |source| ScoringError::Embedding {
                                    item_id: item.id.clone(),
                                    source,
                                };
                                let left = cache.vector(mine).await.map_err(embed_err)?;
                                let right = cache.vector(theirs).await.map_err(embed_err)?;
                                cosine_contribution(&left, &right)
                            }
                        };

                    weighted += contribution * weight;
                    total_weight += weight;
                }
            }
        }

        Ok(finalize_score(weighted, total_weight))
    }
}

/// Scales to 0..=100 and rounds to two decimals; no shared weight scores zero.
pub fn finalize_score(weighted: f64, total_weight: f64) -> f64 {
    if total_weight <= 0.0 {
        return 0.0;
    }
    let score = (weighted / total_weight * 100.0).clamp(0.0, 100.0);
    (score * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran(ScanOutcome),
    /// A scan was already in progress; this tick was dropped.
    Coalesced,
}

/// Periodic driver that never lets two scans overlap.
pub struct MatchDriver<S> {
    engine: Arc<MatchEngine<S>>,
    scanning: AtomicBool,
}

struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: MatchStore> MatchDriver<S> {
    pub fn new(engine: Arc<MatchEngine<S>>) -> Self {
        Self {
            engine,
            scanning: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> DriverState {
        if self.scanning.load(Ordering::Acquire) {
            DriverState::Scanning
        } else {
            DriverState::Idle
        }
    }

    pub async fn tick(&self, now: NaiveDateTime) -> anyhow::Result<TickOutcome> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("scan still running, dropping tick");
            return Ok(TickOutcome::Coalesced);
        }
        let _guard = ScanGuard(&self.scanning);
        self.engine.run_once(now).await.map(TickOutcome::Ran)
    }

    /// Ticks every `every` until `shutdown` resolves. Failed scans are retried on the next tick.
    pub async fn run(&self, every: Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("matching driver started (interval: {every:?})");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("matching driver stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let now = chrono::Local::now().naive_local();
                    if let Err(err) = self.tick(now).await {
                        error!("matching scan failed: {err:#}");
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recommendations {
    pub scored: Vec<Recommendation>,
    pub unscored: Vec<Recommendation>,
}

/// Same-gender students ranked by how well they score toward `student`.
pub async fn recommend_teammates<S: MatchStore + ?Sized>(
    store: &S,
    student: StudentId,
) -> anyhow::Result<Recommendations> {
    let me = store
        .student(student)
        .await?
        .with_context(|| format!("student {student} not found"))?;
    let peers: HashMap<StudentId, _> = store
        .students_by_gender(me.gender)
        .await?
        .into_iter()
        .filter(|s| s.id != student)
        .map(|s| (s.id, s))
        .collect();

    let mut scored: Vec<Recommendation> = store
        .scores_toward(student)
        .await?
        .into_iter()
        .filter_map(|score| {
            peers.get(&score.from_student_id).map(|peer| Recommendation {
                student_id: peer.id,
                name: peer.name.clone(),
                contact: peer.contact.clone(),
                score: Some(score.score),
            })
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(CmpOrdering::Equal)
            .then(a.student_id.cmp(&b.student_id))
    });

    let mut unscored: Vec<Recommendation> = peers
        .values()
        .filter(|peer| !scored.iter().any(|r| r.student_id == peer.id))
        .map(|peer| Recommendation {
            student_id: peer.id,
            name: peer.name.clone(),
            contact: peer.contact.clone(),
            score: None,
        })
        .collect();
    unscored.sort_by_key(|r| r.student_id);

    Ok(Recommendations { scored, unscored })
}

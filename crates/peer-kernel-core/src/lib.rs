use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Course id used when no platform course context is available (workbench
/// and local test runs).
pub const WORKBENCH_COURSE_ID: &str = "workbench/PI-101/demo";

/// Upper bound on real answers retained per option bucket; the oldest
/// candidate is evicted first once the bound is reached.
pub const DEFAULT_POOL_CAPACITY_PER_OPTION: usize = 50;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ExerciseError {
    #[error("out-of-order submission: {0}")]
    OutOfOrder(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no student identity is available")]
    MissingStudentIdentity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CandidateId(pub Ulid);

impl CandidateId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CandidateId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CandidateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two points in the exercise flow at which an answer is committed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Original,
    Revised,
}

impl Stage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Revised => "revised",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "original" => Some(Self::Original),
            "revised" => Some(Self::Revised),
            _ => None,
        }
    }
}

/// Client-claimed position in the exercise flow at submission time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    New,
    Answered,
    Revised,
}

impl SubmissionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Answered => "answered",
            Self::Revised => "revised",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "answered" => Some(Self::Answered),
            "revised" => Some(Self::Revised),
            _ => None,
        }
    }
}

/// Selection policy, fixed at configuration time. The serde names are the
/// wire-level algorithm identifiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum SelectionAlgorithm {
    #[serde(rename = "simple")]
    CoverageFirst,
    #[serde(rename = "random")]
    UniformRandom,
}

impl SelectionAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CoverageFirst => "simple",
            Self::UniformRandom => "random",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "simple" => Some(Self::CoverageFirst),
            "random" => Some(Self::UniformRandom),
            _ => None,
        }
    }

    /// Check instructor-authored seeds against the configured options.
    ///
    /// # Errors
    /// Returns [`ExerciseError::Validation`] with a human-readable message
    /// for the first violation found: a seed referencing an unknown option,
    /// a blank rationale, or (coverage-first only) an option left without a
    /// seeded example.
    pub fn validate_seeds(
        self,
        seeds: &[SeededAnswer],
        options: &[String],
    ) -> Result<(), ExerciseError> {
        for (index, seed) in seeds.iter().enumerate() {
            if !options.iter().any(|option| *option == seed.option) {
                return Err(ExerciseError::Validation(format!(
                    "seeded answer {} references option \"{}\", which is not a configured option",
                    index + 1,
                    seed.option
                )));
            }
            if seed.rationale.trim().is_empty() {
                return Err(ExerciseError::Validation(format!(
                    "seeded answer {} for option \"{}\" has an empty rationale",
                    index + 1,
                    seed.option
                )));
            }
        }

        if self == Self::CoverageFirst {
            for option in options {
                if !seeds.iter().any(|seed| seed.option == *option) {
                    return Err(ExerciseError::Validation(format!(
                        "option \"{option}\" has no seeded example; the \"simple\" algorithm needs one per option"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Produce the curated answer set for one student, updating the pool's
    /// per-student assignment so repeated calls stay stable while the pool
    /// is unchanged. The student's own candidates are never selected.
    pub fn select_for<R: Rng + ?Sized>(
        self,
        pool: &mut AnswerPool,
        seeds: &[SeededAnswer],
        options: &[String],
        student_id: &str,
        rng: &mut R,
    ) -> Vec<ShownAnswer> {
        match self {
            Self::CoverageFirst => select_coverage_first(pool, seeds, options, student_id),
            Self::UniformRandom => select_uniform_random(pool, seeds, options, student_id, rng),
        }
    }
}

/// Instructor-authored example answer used to bootstrap the peer pool.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SeededAnswer {
    pub option: String,
    pub rationale: String,
}

/// Exercise configuration, replaced wholesale by the authoring flow and
/// immutable during student interaction.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExerciseConfig {
    pub question_text: String,
    pub options: Vec<String>,
    pub correct_answer: Option<String>,
    pub algorithm: SelectionAlgorithm,
    #[serde(default)]
    pub seeded_answers: Vec<SeededAnswer>,
}

impl Default for ExerciseConfig {
    fn default() -> Self {
        Self {
            question_text: "What is 1+1?".to_string(),
            options: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            correct_answer: None,
            algorithm: SelectionAlgorithm::CoverageFirst,
            seeded_answers: Vec::new(),
        }
    }
}

impl ExerciseConfig {
    /// Validate the whole configuration, including the seed set for the
    /// configured algorithm.
    ///
    /// # Errors
    /// Returns [`ExerciseError::Validation`] when the option list is empty,
    /// contains blank or duplicate labels, when the correct answer is not a
    /// configured option, or when the seeds fail [`SelectionAlgorithm::validate_seeds`].
    pub fn validate(&self) -> Result<(), ExerciseError> {
        if self.options.is_empty() {
            return Err(ExerciseError::Validation(
                "at least one option must be configured".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for option in &self.options {
            if option.trim().is_empty() {
                return Err(ExerciseError::Validation(
                    "option labels must be non-empty".to_string(),
                ));
            }
            if !seen.insert(option.as_str()) {
                return Err(ExerciseError::Validation(format!(
                    "duplicate option label \"{option}\""
                )));
            }
        }

        if let Some(correct) = &self.correct_answer {
            if !self.options.contains(correct) {
                return Err(ExerciseError::Validation(format!(
                    "correct answer \"{correct}\" is not a configured option"
                )));
            }
        }

        self.algorithm.validate_seeds(&self.seeded_answers, &self.options)
    }
}

/// One committed answer for one stage.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StageAnswer {
    pub choice: String,
    pub rationale: String,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
}

/// Per-student record of the two answer stages. Slots are write-once; the
/// record is terminal once both are filled.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct StudentResponseRecord {
    pub original: Option<StageAnswer>,
    pub revised: Option<StageAnswer>,
}

impl StudentResponseRecord {
    #[must_use]
    pub fn status(&self) -> SubmissionStatus {
        match (&self.original, &self.revised) {
            (None, _) => SubmissionStatus::New,
            (Some(_), None) => SubmissionStatus::Answered,
            (Some(_), Some(_)) => SubmissionStatus::Revised,
        }
    }

    /// Commit an answer for the stage matching the claimed status.
    ///
    /// # Errors
    /// Returns [`ExerciseError::OutOfOrder`] when the claimed status does
    /// not correspond to the next empty slot: repeating a stage, revising
    /// before answering, or submitting against a terminal record.
    pub fn record_answer(
        &mut self,
        status: SubmissionStatus,
        choice: &str,
        rationale: &str,
        submitted_at: OffsetDateTime,
    ) -> Result<Stage, ExerciseError> {
        let answer = StageAnswer {
            choice: choice.to_string(),
            rationale: rationale.to_string(),
            submitted_at,
        };

        match status {
            SubmissionStatus::New => {
                if self.original.is_some() {
                    return Err(ExerciseError::OutOfOrder(
                        "the original answer is already recorded".to_string(),
                    ));
                }
                self.original = Some(answer);
                Ok(Stage::Original)
            }
            SubmissionStatus::Answered => {
                if self.original.is_none() {
                    return Err(ExerciseError::OutOfOrder(
                        "a revised answer needs an original answer first".to_string(),
                    ));
                }
                if self.revised.is_some() {
                    return Err(ExerciseError::OutOfOrder(
                        "the revised answer is already recorded".to_string(),
                    ));
                }
                self.revised = Some(answer);
                Ok(Stage::Revised)
            }
            SubmissionStatus::Revised => Err(ExerciseError::OutOfOrder(
                "the exercise is complete; no further submissions are accepted".to_string(),
            )),
        }
    }
}

/// Per-option submission counts for both stages, shared across the
/// students of one exercise instance. Counts only ever grow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Stats {
    pub original: BTreeMap<String, u64>,
    pub revised: BTreeMap<String, u64>,
}

impl Stats {
    pub fn record(&mut self, stage: Stage, choice: &str) {
        let counts = match stage {
            Stage::Original => &mut self.original,
            Stage::Revised => &mut self.revised,
        };
        *counts.entry(choice.to_string()).or_insert(0) += 1;
    }

    #[must_use]
    pub fn counts(&self, stage: Stage) -> &BTreeMap<String, u64> {
        match stage {
            Stage::Original => &self.original,
            Stage::Revised => &self.revised,
        }
    }
}

/// Ambient platform context as far as it is known to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct AmbientIdentity {
    pub student_id: Option<String>,
    pub course_id: Option<String>,
}

/// Identity after fallback resolution. The student id stays optional:
/// anonymous callers can still read the exercise but own no record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedIdentity {
    pub student_id: Option<String>,
    pub course_id: String,
    pub item_id: String,
}

impl ResolvedIdentity {
    #[must_use]
    pub fn resolve(ambient: &AmbientIdentity, item_id: &str) -> Self {
        Self {
            student_id: ambient
                .student_id
                .clone()
                .filter(|student_id| !student_id.trim().is_empty()),
            course_id: ambient
                .course_id
                .clone()
                .filter(|course_id| !course_id.trim().is_empty())
                .unwrap_or_else(|| WORKBENCH_COURSE_ID.to_string()),
            item_id: item_id.to_string(),
        }
    }

    /// Upgrade to a full per-student key.
    ///
    /// # Errors
    /// Returns [`ExerciseError::MissingStudentIdentity`] when no student id
    /// was resolvable; callers treat this as "no personal record possible".
    pub fn require_student(&self) -> Result<StudentItemKey, ExerciseError> {
        match &self.student_id {
            Some(student_id) => Ok(StudentItemKey {
                student_id: student_id.clone(),
                course_id: self.course_id.clone(),
                item_id: self.item_id.clone(),
            }),
            None => Err(ExerciseError::MissingStudentIdentity),
        }
    }
}

/// Stable key addressing one student's record for one exercise item.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StudentItemKey {
    pub student_id: String,
    pub course_id: String,
    pub item_id: String,
}

impl StudentItemKey {
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}|{}|{}", self.course_id, self.item_id, self.student_id)
    }
}

/// One real student answer eligible for selection to other students.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PooledAnswer {
    pub candidate_id: CandidateId,
    pub rationale: String,
    pub student_id: String,
    pub offered_at: OffsetDateTime,
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum AssignedSource {
    Seeded { seed_index: usize },
    Pooled { option: String, candidate_id: CandidateId },
}

/// Provenance of one displayed answer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerSource {
    Seeded,
    Peer { student_id: String },
}

/// One answer as surfaced to a student during the revision stage.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ShownAnswer {
    pub option: String,
    pub rationale: String,
    pub source: AnswerSource,
}

/// The evolving collection of real answers, bucketed per option, plus the
/// per-student record of what has already been selected for them.
#[derive(Debug, Clone)]
pub struct AnswerPool {
    capacity_per_option: usize,
    buckets: BTreeMap<String, Vec<PooledAnswer>>,
    assignments: BTreeMap<String, Vec<AssignedSource>>,
}

impl Default for AnswerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AnswerPool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity_per_option(DEFAULT_POOL_CAPACITY_PER_OPTION)
    }

    #[must_use]
    pub fn with_capacity_per_option(capacity_per_option: usize) -> Self {
        Self {
            capacity_per_option: capacity_per_option.max(1),
            buckets: BTreeMap::new(),
            assignments: BTreeMap::new(),
        }
    }

    /// Register a first-stage answer under its option bucket, evicting the
    /// oldest candidate once the bucket is at capacity.
    pub fn offer_answer(
        &mut self,
        choice: &str,
        rationale: &str,
        student_id: &str,
        offered_at: OffsetDateTime,
    ) -> CandidateId {
        let candidate_id = CandidateId::new();
        let bucket = self.buckets.entry(choice.to_string()).or_default();
        bucket.push(PooledAnswer {
            candidate_id,
            rationale: rationale.to_string(),
            student_id: student_id.to_string(),
            offered_at,
        });
        if bucket.len() > self.capacity_per_option {
            bucket.remove(0);
        }
        candidate_id
    }

    #[must_use]
    pub fn candidate_count(&self, option: &str) -> usize {
        self.buckets.get(option).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn total_candidates(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    fn candidate(&self, option: &str, candidate_id: CandidateId) -> Option<&PooledAnswer> {
        self.buckets
            .get(option)
            .and_then(|bucket| bucket.iter().find(|candidate| candidate.candidate_id == candidate_id))
    }

    fn oldest_other(&self, option: &str, student_id: &str) -> Option<&PooledAnswer> {
        self.buckets
            .get(option)
            .and_then(|bucket| bucket.iter().find(|candidate| candidate.student_id != student_id))
    }
}

/// Register a peer answer into the pool for future selection to other
/// students.
pub fn offer_answer(
    pool: &mut AnswerPool,
    choice: &str,
    rationale: &str,
    student_id: &str,
    offered_at: OffsetDateTime,
) -> CandidateId {
    pool.offer_answer(choice, rationale, student_id, offered_at)
}

/// Produce the curated set of other students' answers for one student under
/// the given policy.
pub fn get_other_answers<R: Rng + ?Sized>(
    pool: &mut AnswerPool,
    seeds: &[SeededAnswer],
    options: &[String],
    student_id: &str,
    algorithm: SelectionAlgorithm,
    rng: &mut R,
) -> Vec<ShownAnswer> {
    algorithm.select_for(pool, seeds, options, student_id, rng)
}

/// Check instructor-authored seeds for the given policy; `Ok(())` is the
/// explicit no-error result.
///
/// # Errors
/// See [`SelectionAlgorithm::validate_seeds`].
pub fn validate_seeded_answers(
    seeds: &[SeededAnswer],
    options: &[String],
    algorithm: SelectionAlgorithm,
) -> Result<(), ExerciseError> {
    algorithm.validate_seeds(seeds, options)
}

fn select_coverage_first(
    pool: &mut AnswerPool,
    seeds: &[SeededAnswer],
    options: &[String],
    student_id: &str,
) -> Vec<ShownAnswer> {
    let previous = pool.assignments.get(student_id).cloned().unwrap_or_default();
    let mut next = Vec::new();
    let mut shown = Vec::new();

    for option in options {
        let pinned = previous.iter().find_map(|assigned| match assigned {
            AssignedSource::Pooled { option: assigned_option, candidate_id }
                if assigned_option == option =>
            {
                Some(*candidate_id)
            }
            _ => None,
        });

        // A pinned candidate wins while it is still pooled; otherwise the
        // oldest candidate from another student; otherwise the seed.
        let candidate = pinned
            .and_then(|candidate_id| pool.candidate(option, candidate_id))
            .filter(|candidate| candidate.student_id != student_id)
            .or_else(|| pool.oldest_other(option, student_id));

        if let Some(candidate) = candidate {
            next.push(AssignedSource::Pooled {
                option: option.clone(),
                candidate_id: candidate.candidate_id,
            });
            shown.push(ShownAnswer {
                option: option.clone(),
                rationale: candidate.rationale.clone(),
                source: AnswerSource::Peer { student_id: candidate.student_id.clone() },
            });
        } else if let Some(seed_index) = seeds.iter().position(|seed| seed.option == *option) {
            next.push(AssignedSource::Seeded { seed_index });
            shown.push(ShownAnswer {
                option: option.clone(),
                rationale: seeds[seed_index].rationale.clone(),
                source: AnswerSource::Seeded,
            });
        }
    }

    pool.assignments.insert(student_id.to_string(), next);
    shown
}

fn select_uniform_random<R: Rng + ?Sized>(
    pool: &mut AnswerPool,
    seeds: &[SeededAnswer],
    options: &[String],
    student_id: &str,
    rng: &mut R,
) -> Vec<ShownAnswer> {
    let target = options.len();

    let mut chosen: Vec<AssignedSource> = pool
        .assignments
        .get(student_id)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|assigned| assignment_is_valid(pool, seeds, student_id, assigned))
        .collect();
    chosen.truncate(target);

    if chosen.len() < target {
        let mut universe: Vec<AssignedSource> = (0..seeds.len())
            .map(|seed_index| AssignedSource::Seeded { seed_index })
            .collect();
        for (option, bucket) in &pool.buckets {
            for candidate in bucket {
                if candidate.student_id != student_id {
                    universe.push(AssignedSource::Pooled {
                        option: option.clone(),
                        candidate_id: candidate.candidate_id,
                    });
                }
            }
        }
        universe.retain(|entry| !chosen.contains(entry));

        let missing = target - chosen.len();
        chosen.extend(universe.choose_multiple(rng, missing).cloned());
    }

    let shown = chosen
        .iter()
        .filter_map(|assigned| shown_answer(pool, seeds, assigned))
        .collect::<Vec<_>>();
    pool.assignments.insert(student_id.to_string(), chosen);
    shown
}

fn assignment_is_valid(
    pool: &AnswerPool,
    seeds: &[SeededAnswer],
    student_id: &str,
    assigned: &AssignedSource,
) -> bool {
    match assigned {
        AssignedSource::Seeded { seed_index } => *seed_index < seeds.len(),
        AssignedSource::Pooled { option, candidate_id } => pool
            .candidate(option, *candidate_id)
            .is_some_and(|candidate| candidate.student_id != student_id),
    }
}

fn shown_answer(
    pool: &AnswerPool,
    seeds: &[SeededAnswer],
    assigned: &AssignedSource,
) -> Option<ShownAnswer> {
    match assigned {
        AssignedSource::Seeded { seed_index } => seeds.get(*seed_index).map(|seed| ShownAnswer {
            option: seed.option.clone(),
            rationale: seed.rationale.clone(),
            source: AnswerSource::Seeded,
        }),
        AssignedSource::Pooled { option, candidate_id } => {
            pool.candidate(option, *candidate_id).map(|candidate| ShownAnswer {
                option: option.clone(),
                rationale: candidate.rationale.clone(),
                source: AnswerSource::Peer { student_id: candidate.student_id.clone() },
            })
        }
    }
}

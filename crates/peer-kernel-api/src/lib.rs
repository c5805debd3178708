use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use anyhow::{anyhow, Result};
use peer_kernel_core::{
    get_other_answers, validate_seeded_answers, AmbientIdentity, AnswerPool, ExerciseConfig,
    ExerciseError, ResolvedIdentity, SeededAnswer, SelectionAlgorithm, ShownAnswer, Stage, Stats,
    StudentItemKey, SubmissionStatus,
};
use peer_kernel_store_sqlite::SqliteStore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitAnswerRequest {
    pub answer: String,
    pub rationale: String,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidateFormRequest {
    pub seeds: Vec<SeededAnswer>,
    pub options: Vec<String>,
    pub algo: SelectionAlgorithm,
}

/// The student-facing payload: the question, the student's committed
/// answers, and, once the original stage is complete, the curated peer
/// answer set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StudentView {
    pub question_text: String,
    pub options: Vec<String>,
    pub answer_original: Option<String>,
    pub rationale_original: Option<String>,
    pub answer_revised: Option<String>,
    pub rationale_revised: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_answers: Option<Vec<ShownAnswer>>,
}

/// Shared in-memory state for one (course, item) exercise. The pool and
/// stats mutexes are held only for single read-modify-write steps.
#[derive(Debug)]
struct ExerciseInstance {
    config: RwLock<ExerciseConfig>,
    pool: Mutex<AnswerPool>,
    stats: Mutex<Stats>,
}

impl ExerciseInstance {
    fn fresh(config: ExerciseConfig) -> Self {
        Self {
            config: RwLock::new(config),
            pool: Mutex::new(AnswerPool::new()),
            stats: Mutex::new(Stats::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerInstructionApi {
    db_path: PathBuf,
    instances: Arc<Mutex<BTreeMap<(String, String), Arc<ExerciseInstance>>>>,
}

impl PeerInstructionApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path, instances: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Fetch or rehydrate the shared instance for one exercise item: the
    /// stored config (or defaults), stats recomputed from durable rows, and
    /// the pool replayed from original-stage submissions in offer order.
    fn instance(
        &self,
        course_id: &str,
        item_id: &str,
        store: &SqliteStore,
    ) -> Result<Arc<ExerciseInstance>> {
        let mut instances = lock(&self.instances)?;
        let registry_key = (course_id.to_string(), item_id.to_string());
        if let Some(instance) = instances.get(&registry_key) {
            return Ok(Arc::clone(instance));
        }

        let config = store.get_config(course_id, item_id)?.unwrap_or_default();
        let stats = store.stats_for_item(course_id, item_id)?;
        let mut pool = AnswerPool::new();
        for answer in store.list_answers_for_item(course_id, item_id)? {
            if answer.stage == Stage::Original {
                pool.offer_answer(
                    &answer.choice,
                    &answer.rationale,
                    &answer.student_id,
                    answer.submitted_at,
                );
            }
        }

        let instance = Arc::new(ExerciseInstance {
            config: RwLock::new(config),
            pool: Mutex::new(pool),
            stats: Mutex::new(stats),
        });
        instances.insert(registry_key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Record one stage submission for the resolved student and return the
    /// refreshed student view.
    ///
    /// # Errors
    /// Returns the missing-identity error for anonymous callers, the
    /// out-of-order error when the claimed status does not match the next
    /// empty slot, and storage errors unhandled.
    pub fn submit_answer(
        &self,
        ambient: &AmbientIdentity,
        item_id: &str,
        request: &SubmitAnswerRequest,
    ) -> Result<StudentView> {
        let resolved = ResolvedIdentity::resolve(ambient, item_id);
        let key = resolved.require_student().map_err(anyhow::Error::new)?;

        let mut store = self.open_store()?;
        let instance = self.instance(&resolved.course_id, item_id, &store)?;
        let config = read_lock(&instance.config)?.clone();

        let submitted_at = OffsetDateTime::now_utc();
        let stage = store.add_answer_for_student(
            &key,
            request.status,
            &request.answer,
            &request.rationale,
            submitted_at,
        )?;

        match stage {
            Stage::Original => {
                lock(&instance.stats)?.record(Stage::Original, &request.answer);
                lock(&instance.pool)?.offer_answer(
                    &request.answer,
                    &request.rationale,
                    &key.student_id,
                    submitted_at,
                );
            }
            Stage::Revised => lock(&instance.stats)?.record(Stage::Revised, &request.answer),
        }

        tracing::info!(
            key = %key.storage_key(),
            stage = stage.as_str(),
            choice = %request.answer,
            "submission accepted"
        );

        build_view(&instance, &config, &store, &key)
    }

    /// Build the student view without submitting. Anonymous callers get
    /// the question alone, with no personal record and no peer answers.
    ///
    /// # Errors
    /// Returns storage errors unhandled.
    pub fn get_student_view(
        &self,
        ambient: &AmbientIdentity,
        item_id: &str,
    ) -> Result<StudentView> {
        let resolved = ResolvedIdentity::resolve(ambient, item_id);
        let store = self.open_store()?;
        let instance = self.instance(&resolved.course_id, item_id, &store)?;
        let config = read_lock(&instance.config)?.clone();

        match resolved.require_student() {
            Ok(key) => build_view(&instance, &config, &store, &key),
            Err(ExerciseError::MissingStudentIdentity) => Ok(StudentView {
                question_text: config.question_text,
                options: config.options,
                answer_original: None,
                rationale_original: None,
                answer_revised: None,
                rationale_revised: None,
                other_answers: None,
            }),
            Err(err) => Err(anyhow::Error::new(err)),
        }
    }

    /// Replace the exercise configuration wholesale, resetting stats, pool,
    /// and stored responses for the item.
    ///
    /// # Errors
    /// Returns the validation error when the configuration is rejected, and
    /// storage errors unhandled.
    pub fn studio_submit(
        &self,
        course_id: &str,
        item_id: &str,
        config: ExerciseConfig,
    ) -> Result<()> {
        config.validate().map_err(anyhow::Error::new)?;

        let mut store = self.open_store()?;
        store.save_config(course_id, item_id, &config, OffsetDateTime::now_utc())?;
        store.delete_answers_for_item(course_id, item_id)?;

        let mut instances = lock(&self.instances)?;
        instances.insert(
            (course_id.to_string(), item_id.to_string()),
            Arc::new(ExerciseInstance::fresh(config)),
        );

        tracing::info!(course_id, item_id, "exercise reconfigured");
        Ok(())
    }

    /// Pre-submission seed validation for the authoring UI.
    ///
    /// # Errors
    /// Returns the validation error with its human-readable message.
    pub fn validate_form(&self, request: &ValidateFormRequest) -> Result<()> {
        validate_seeded_answers(&request.seeds, &request.options, request.algo)
            .map_err(anyhow::Error::new)
    }

    /// The full per-option counts for both stages, verbatim.
    ///
    /// # Errors
    /// Returns storage errors unhandled.
    pub fn get_stats(&self, course_id: &str, item_id: &str) -> Result<Stats> {
        let store = self.open_store()?;
        let instance = self.instance(course_id, item_id, &store)?;
        let stats = lock(&instance.stats)?.clone();
        Ok(stats)
    }
}

fn build_view(
    instance: &ExerciseInstance,
    config: &ExerciseConfig,
    store: &SqliteStore,
    key: &StudentItemKey,
) -> Result<StudentView> {
    let record = store.get_answers_for_student(key)?;

    let other_answers = if record.original.is_some() {
        let mut pool = lock(&instance.pool)?;
        Some(get_other_answers(
            &mut pool,
            &config.seeded_answers,
            &config.options,
            &key.student_id,
            config.algorithm,
            &mut rand::thread_rng(),
        ))
    } else {
        None
    };

    Ok(StudentView {
        question_text: config.question_text.clone(),
        options: config.options.clone(),
        answer_original: record.original.as_ref().map(|answer| answer.choice.clone()),
        rationale_original: record.original.as_ref().map(|answer| answer.rationale.clone()),
        answer_revised: record.revised.as_ref().map(|answer| answer.choice.clone()),
        rationale_revised: record.revised.as_ref().map(|answer| answer.rationale.clone()),
        other_answers,
    })
}

/// Find the typed exercise error in an error chain, if any. Used by
/// transport layers to map error classes onto status codes.
#[must_use]
pub fn exercise_error(err: &anyhow::Error) -> Option<&ExerciseError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ExerciseError>())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("shared exercise state mutex poisoned"))
}

fn read_lock<T>(rwlock: &RwLock<T>) -> Result<std::sync::RwLockReadGuard<'_, T>> {
    rwlock.read().map_err(|_| anyhow!("shared exercise config lock poisoned"))
}

#[cfg(test)]
mod tests {
    use peer_kernel_core::AnswerSource;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("peer-kernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn ambient(student_id: &str) -> AmbientIdentity {
        AmbientIdentity {
            student_id: Some(student_id.to_string()),
            course_id: Some("course-1".to_string()),
        }
    }

    fn seeded_config() -> ExerciseConfig {
        ExerciseConfig {
            question_text: "What is 1+1?".to_string(),
            options: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            correct_answer: Some("B".to_string()),
            algorithm: SelectionAlgorithm::CoverageFirst,
            seeded_answers: vec![
                SeededAnswer { option: "A".to_string(), rationale: "seed rationale a".to_string() },
                SeededAnswer { option: "B".to_string(), rationale: "seed rationale b".to_string() },
                SeededAnswer { option: "C".to_string(), rationale: "seed rationale c".to_string() },
            ],
        }
    }

    fn submit(
        api: &PeerInstructionApi,
        student: &str,
        answer: &str,
        rationale: &str,
        status: SubmissionStatus,
    ) -> Result<StudentView> {
        api.submit_answer(
            &ambient(student),
            "item-1",
            &SubmitAnswerRequest {
                answer: answer.to_string(),
                rationale: rationale.to_string(),
                status,
            },
        )
    }

    fn configured_api(path: &std::path::Path) -> PeerInstructionApi {
        let api = PeerInstructionApi::new(path.to_path_buf());
        if let Err(err) = api.studio_submit("course-1", "item-1", seeded_config()) {
            panic!("studio submit should succeed: {err}");
        }
        api
    }

    #[test]
    fn two_student_flow_matches_the_exercise_walkthrough() {
        let path = unique_temp_db_path();
        let api = configured_api(&path);

        // Student 1: original A, then revise to B.
        let view = match submit(&api, "student-1", "A", "a feels right", SubmissionStatus::New) {
            Ok(view) => view,
            Err(err) => panic!("student 1 original should be accepted: {err}"),
        };
        assert_eq!(view.answer_original.as_deref(), Some("A"));
        assert!(view.other_answers.is_some());

        let stats = match api.get_stats("course-1", "item-1") {
            Ok(stats) => stats,
            Err(err) => panic!("stats should be readable: {err}"),
        };
        assert_eq!(stats.original.get("A"), Some(&1));
        assert!(stats.revised.is_empty());

        let view = match submit(&api, "student-1", "B", "b after discussion", SubmissionStatus::Answered)
        {
            Ok(view) => view,
            Err(err) => panic!("student 1 revision should be accepted: {err}"),
        };
        assert_eq!(view.answer_revised.as_deref(), Some("B"));

        let stats = match api.get_stats("course-1", "item-1") {
            Ok(stats) => stats,
            Err(err) => panic!("stats should be readable: {err}"),
        };
        assert_eq!(stats.revised.get("B"), Some(&1));

        // Any further submission from student 1 is out of order.
        let err = match submit(&api, "student-1", "C", "late", SubmissionStatus::Answered) {
            Ok(_) => panic!("terminal record accepted a submission"),
            Err(err) => err,
        };
        assert!(matches!(exercise_error(&err), Some(ExerciseError::OutOfOrder(_))));

        // Student 2: original B; the curated set covers A and C from seeds
        // and surfaces student 1's pooled A answer.
        let view = match submit(&api, "student-2", "B", "b looks good", SubmissionStatus::New) {
            Ok(view) => view,
            Err(err) => panic!("student 2 original should be accepted: {err}"),
        };
        let shown = match view.other_answers {
            Some(shown) => shown,
            None => panic!("student 2 should see peer answers after answering"),
        };
        assert_eq!(shown.len(), 3);
        assert_eq!(shown[0].option, "A");
        assert_eq!(
            shown[0].source,
            AnswerSource::Peer { student_id: "student-1".to_string() }
        );
        assert_eq!(shown[1].option, "B");
        assert_eq!(shown[1].source, AnswerSource::Seeded);
        assert_eq!(shown[2].option, "C");
        assert_eq!(shown[2].source, AnswerSource::Seeded);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn anonymous_callers_cannot_submit_but_can_read_the_question() {
        let path = unique_temp_db_path();
        let api = configured_api(&path);
        let anonymous = AmbientIdentity { student_id: None, course_id: Some("course-1".to_string()) };

        let err = match api.submit_answer(
            &anonymous,
            "item-1",
            &SubmitAnswerRequest {
                answer: "A".to_string(),
                rationale: "anonymous".to_string(),
                status: SubmissionStatus::New,
            },
        ) {
            Ok(_) => panic!("anonymous submission should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(
            exercise_error(&err),
            Some(ExerciseError::MissingStudentIdentity)
        ));

        let view = match api.get_student_view(&anonymous, "item-1") {
            Ok(view) => view,
            Err(err) => panic!("anonymous view should succeed: {err}"),
        };
        assert_eq!(view.question_text, "What is 1+1?");
        assert_eq!(view.answer_original, None);
        assert_eq!(view.other_answers, None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn student_view_is_stable_between_reads() {
        let path = unique_temp_db_path();
        let api = configured_api(&path);

        if let Err(err) = submit(&api, "student-1", "A", "first", SubmissionStatus::New) {
            panic!("original submission should be accepted: {err}");
        }

        let first = match api.get_student_view(&ambient("student-1"), "item-1") {
            Ok(view) => view,
            Err(err) => panic!("view should succeed: {err}"),
        };
        let second = match api.get_student_view(&ambient("student-1"), "item-1") {
            Ok(view) => view,
            Err(err) => panic!("view should succeed: {err}"),
        };
        assert_eq!(first, second);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn studio_submit_rejects_uncovered_seeds_and_resets_state() {
        let path = unique_temp_db_path();
        let api = configured_api(&path);

        if let Err(err) = submit(&api, "student-1", "A", "first", SubmissionStatus::New) {
            panic!("original submission should be accepted: {err}");
        }

        let mut missing_seed = seeded_config();
        missing_seed.seeded_answers.pop();
        let err = match api.studio_submit("course-1", "item-1", missing_seed) {
            Ok(()) => panic!("invalid config should be rejected"),
            Err(err) => err,
        };
        assert!(matches!(exercise_error(&err), Some(ExerciseError::Validation(_))));

        // A valid replacement wipes stats and stored responses.
        if let Err(err) = api.studio_submit("course-1", "item-1", seeded_config()) {
            panic!("valid config should be accepted: {err}");
        }
        let stats = match api.get_stats("course-1", "item-1") {
            Ok(stats) => stats,
            Err(err) => panic!("stats should be readable: {err}"),
        };
        assert!(stats.original.is_empty());

        // The student can answer again from scratch.
        if let Err(err) = submit(&api, "student-1", "B", "fresh start", SubmissionStatus::New) {
            panic!("resubmission after reconfiguration should be accepted: {err}");
        }

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn instances_rehydrate_from_durable_rows_after_restart() {
        let path = unique_temp_db_path();
        {
            let api = configured_api(&path);
            if let Err(err) = submit(&api, "student-1", "A", "a feels right", SubmissionStatus::New)
            {
                panic!("original submission should be accepted: {err}");
            }
        }

        // A new api over the same database sees the same stats and pool.
        let api = PeerInstructionApi::new(path.clone());
        let stats = match api.get_stats("course-1", "item-1") {
            Ok(stats) => stats,
            Err(err) => panic!("stats should be readable: {err}"),
        };
        assert_eq!(stats.original.get("A"), Some(&1));

        let view = match submit(&api, "student-2", "B", "b looks good", SubmissionStatus::New) {
            Ok(view) => view,
            Err(err) => panic!("student 2 original should be accepted: {err}"),
        };
        let shown = match view.other_answers {
            Some(shown) => shown,
            None => panic!("student 2 should see peer answers after answering"),
        };
        assert_eq!(
            shown[0].source,
            AnswerSource::Peer { student_id: "student-1".to_string() }
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn validate_form_reports_the_first_violation() {
        let path = unique_temp_db_path();
        let api = PeerInstructionApi::new(path.clone());

        let request = ValidateFormRequest {
            seeds: vec![SeededAnswer {
                option: "A".to_string(),
                rationale: "seed rationale a".to_string(),
            }],
            options: vec!["A".to_string(), "B".to_string()],
            algo: SelectionAlgorithm::CoverageFirst,
        };
        let err = match api.validate_form(&request) {
            Ok(()) => panic!("uncovered options should be rejected"),
            Err(err) => err,
        };
        match exercise_error(&err) {
            Some(ExerciseError::Validation(message)) => {
                assert!(message.contains("\"B\""), "message should name the option: {message}");
            }
            other => panic!("expected a validation error, got {other:?}"),
        }

        let relaxed = ValidateFormRequest { algo: SelectionAlgorithm::UniformRandom, ..request };
        assert!(api.validate_form(&relaxed).is_ok());

        let _ = std::fs::remove_file(&path);
    }
}

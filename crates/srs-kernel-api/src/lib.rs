use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use srs_kernel_core::{
    apply_answer, build_wrong_answer_quiz, next_alarm_slot, review_window_status, streak_info,
    wrong_answer_window, AnswerTransition, BonusTier, Card, CardId, Clock, Folder, FolderId,
    FolderKind, ItemCatalog, ItemRef, KernelError, LearningCurve, ReviewWindowStatus, StreakInfo,
    TimeState, UserId, WrongAnswerId, WrongAnswerQuizItem, WRONG_ANSWER_EXPIRY_DAYS,
};
use srs_kernel_store_sqlite::{
    AddItemsOutcome, RecalcCounts, SqliteStore, SrsStatusCounts, SweepCounts,
};
use time::{Date, Duration, OffsetDateTime};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnrollRequest {
    pub user_id: UserId,
    pub items: Vec<ItemRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitAnswerRequest {
    pub user_id: UserId,
    pub folder_id: Option<FolderId>,
    pub card_id: CardId,
    pub correct: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerOutcome {
    pub status: AnswerStatus,
    pub stage: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub waiting_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_review_at: Option<OffsetDateTime>,
    pub mastered: bool,
    pub streak: StreakInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateFolderRequest {
    pub user_id: UserId,
    pub name: String,
    pub date: Option<Date>,
    pub parent_id: Option<FolderId>,
    pub kind: Option<FolderKind>,
    pub alarm_on: Option<bool>,
    pub learning_curve: Option<LearningCurve>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCardsRequest {
    pub user_id: UserId,
    pub folder_id: FolderId,
    pub card_ids: Vec<CardId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddCardsResult {
    pub added: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub folder_id: FolderId,
    pub card_id: CardId,
    pub item: ItemRef,
    pub stage: u32,
    pub learned: bool,
    pub wrong_count: u32,
    pub is_overdue: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub waiting_until: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrongAnswerView {
    pub id: WrongAnswerId,
    pub item: ItemRef,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub wrong_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub review_window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub review_window_end: OffsetDateTime,
    pub is_completed: bool,
    pub status: ReviewWindowStatus,
    pub can_review: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompleteWrongAnswerRequest {
    pub user_id: UserId,
    pub item: ItemRef,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionResult {
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeStatus {
    pub acceleration_factor: u32,
    pub day_offset_days: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub now: OffsetDateTime,
    pub is_accelerated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecalcReport {
    pub previous: TimeState,
    pub current: TimeState,
    pub counts: RecalcCounts,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderAlarm {
    pub folder_id: FolderId,
    pub user_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub next_alarm_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyReport {
    pub refreshed: Vec<FolderAlarm>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollupReport {
    pub users: usize,
    pub extended: usize,
    pub zeroed: usize,
    pub muted_alarms: usize,
    pub expired_wrong_answers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SrsStatusView {
    pub reviewable: usize,
    pub waiting: usize,
    pub total: usize,
    pub mastered: usize,
    pub mastery_rate: f64,
    pub bonus: BonusTier,
}

#[derive(Debug, Clone)]
pub struct SrsKernelApi {
    db_path: PathBuf,
    clock: Arc<Clock>,
}

impl SrsKernelApi {
    #[must_use]
    pub fn new(db_path: PathBuf, clock: Arc<Clock>) -> Self {
        Self { db_path, clock }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Ensure one card per requested item, creating missing cards at stage 0.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn enroll(&self, request: EnrollRequest) -> Result<Vec<Card>> {
        let mut store = self.open_store()?;
        store.ensure_cards(request.user_id, &request.items)
    }

    /// Delete one card and its folder memberships.
    ///
    /// # Errors
    /// Returns [`KernelError::NotFound`]/[`KernelError::Forbidden`] before any
    /// mutation, or a store error when the delete fails.
    pub fn unenroll(&self, user_id: UserId, card_id: CardId) -> Result<()> {
        let mut store = self.open_store()?;
        let _card = owned_card(&store, user_id, card_id)?;
        store.delete_card(card_id)?;
        Ok(())
    }

    /// Create a folder; a child inherits its parent's learning curve.
    ///
    /// # Errors
    /// Returns a kernel error on blank names or missing/foreign parents, or a
    /// store error when persistence fails.
    pub fn create_folder(&self, request: CreateFolderRequest) -> Result<Folder> {
        let mut store = self.open_store()?;

        let learning_curve = match request.parent_id {
            Some(parent_id) => owned_folder(&store, request.user_id, parent_id)?.learning_curve,
            None => request.learning_curve.unwrap_or(LearningCurve::ForgettingCurve),
        };

        let folder = Folder {
            id: FolderId::new(),
            user_id: request.user_id,
            parent_id: request.parent_id,
            name: request.name,
            kind: request.kind.unwrap_or(FolderKind::Custom),
            date: request.date.unwrap_or_else(|| self.clock.now().date()),
            alarm_active: request.alarm_on.unwrap_or(true),
            next_alarm_at: None,
            learning_curve,
            auto_created: false,
        };
        folder.validate()?;
        store.create_folder(&folder)?;
        Ok(folder)
    }

    /// Add cards to a folder. A duplicate membership rejects the whole batch
    /// with [`KernelError::Conflict`].
    ///
    /// # Errors
    /// Returns a kernel error for unknown/foreign folders or cards, conflict
    /// on duplicates, or a store error when persistence fails.
    pub fn add_cards_to_folder(&self, request: AddCardsRequest) -> Result<AddCardsResult> {
        let mut store = self.open_store()?;
        let _folder = owned_folder(&store, request.user_id, request.folder_id)?;
        for card_id in &request.card_ids {
            let _card = owned_card(&store, request.user_id, *card_id)?;
        }

        match store.add_folder_items(request.folder_id, &request.card_ids)? {
            AddItemsOutcome::Added(added) => Ok(AddCardsResult { added }),
            AddItemsOutcome::Duplicate(duplicates) => {
                let ids =
                    duplicates.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                Err(KernelError::Conflict(format!("cards already in folder: {ids}")).into())
            }
        }
    }

    /// Ordered unlearned folder items with card detail.
    ///
    /// # Errors
    /// Returns a kernel error for unknown/foreign folders, or a store error.
    pub fn get_queue(&self, user_id: UserId, folder_id: FolderId) -> Result<Vec<QueueItem>> {
        let store = self.open_store()?;
        let _folder = owned_folder(&store, user_id, folder_id)?;
        let items = store.queue_items(folder_id)?;
        Ok(items
            .into_iter()
            .map(|(item, card)| QueueItem {
                folder_id: item.folder_id,
                card_id: item.card_id,
                item: card.item,
                stage: card.stage,
                learned: item.learned,
                wrong_count: item.wrong_count,
                is_overdue: card.is_overdue,
                waiting_until: card.waiting_until,
            })
            .collect())
    }

    /// Process one answer. Card transition, folder item, wrong-answer entry,
    /// daily stat, and streak commit atomically.
    ///
    /// # Errors
    /// Returns a kernel error for unknown/foreign cards or folders before any
    /// mutation, or a store error when the transaction fails.
    pub fn submit_answer(&self, request: SubmitAnswerRequest) -> Result<AnswerOutcome> {
        let mut store = self.open_store()?;
        let mut card = owned_card(&store, request.user_id, request.card_id)?;

        let curve = match request.folder_id {
            Some(folder_id) => {
                let folder = owned_folder(&store, request.user_id, folder_id)?;
                if !store.has_folder_item(folder_id, request.card_id)? {
                    return Err(KernelError::NotFound(format!(
                        "card {} is not in folder {folder_id}",
                        request.card_id
                    ))
                    .into());
                }
                folder.learning_curve
            }
            None => LearningCurve::ForgettingCurve,
        };

        let now = self.clock.now();
        let snapshot = serde_json::to_value(&card)?;
        let transition: AnswerTransition =
            apply_answer(&card, curve, request.correct, &self.clock, now);
        card.apply(&transition);

        let streak = store.record_answer(
            &card,
            request.folder_id,
            request.correct,
            wrong_answer_window(&self.clock, now),
            &snapshot,
            now,
            now.date(),
        )?;

        // A fully learned folder stops alarming.
        if let Some(folder_id) = request.folder_id {
            if request.correct && store.unlearned_count(folder_id)? == 0 {
                store.set_folder_alarm(folder_id, None)?;
            }
        }

        tracing::info!(
            card = %card.id,
            correct = request.correct,
            stage = card.stage,
            mastered = card.is_mastered,
            "answer processed"
        );

        Ok(AnswerOutcome {
            status: if request.correct { AnswerStatus::Pass } else { AnswerStatus::Fail },
            stage: card.stage,
            waiting_until: card.waiting_until,
            next_review_at: card.next_review_at,
            mastered: card.is_mastered,
            streak: streak_info(&streak, now.date()),
        })
    }

    /// # Errors
    /// Returns a store error when the lookup fails.
    pub fn get_streak_info(&self, user_id: UserId) -> Result<StreakInfo> {
        let store = self.open_store()?;
        let state = store.get_streak(user_id)?;
        Ok(streak_info(&state, self.clock.now().date()))
    }

    /// # Errors
    /// Returns a store error when the lookup fails.
    pub fn get_wrong_answers(
        &self,
        user_id: UserId,
        include_completed: bool,
    ) -> Result<Vec<WrongAnswerView>> {
        let store = self.open_store()?;
        let now = self.clock.now();
        let entries = store.list_wrong_answers(user_id, include_completed)?;
        Ok(entries
            .into_iter()
            .map(|entry| {
                let status = review_window_status(&entry, now);
                WrongAnswerView {
                    id: entry.id,
                    item: entry.item,
                    attempts: entry.attempts,
                    wrong_at: entry.wrong_at,
                    review_window_start: entry.review_window_start,
                    review_window_end: entry.review_window_end,
                    is_completed: entry.is_completed,
                    status,
                    can_review: !entry.is_completed && status == ReviewWindowStatus::Available,
                }
            })
            .collect())
    }

    /// Complete an open entry, only inside its review window. Outside the
    /// window this is a typed `false`, not an error.
    ///
    /// # Errors
    /// Returns a store error when the update fails.
    pub fn complete_wrong_answer(
        &self,
        request: CompleteWrongAnswerRequest,
    ) -> Result<CompletionResult> {
        let mut store = self.open_store()?;
        let completed =
            store.complete_wrong_answer(request.user_id, request.item, self.clock.now())?;
        Ok(CompletionResult { completed })
    }

    /// Multiple-choice quiz over open entries, oldest failures first.
    ///
    /// # Errors
    /// Returns a store error when the lookup fails.
    pub fn generate_wrong_answer_quiz(
        &self,
        user_id: UserId,
        limit: usize,
        catalog: &dyn ItemCatalog,
    ) -> Result<Vec<WrongAnswerQuizItem>> {
        let store = self.open_store()?;
        let entries = store.oldest_open_wrong_answers(user_id, limit)?;
        Ok(build_wrong_answer_quiz(&entries, catalog, 4))
    }

    /// Force-complete entries whose window ended more than the accelerated
    /// expiry ago.
    ///
    /// # Errors
    /// Returns a store error when the update fails.
    pub fn expire_wrong_answers(&self) -> Result<usize> {
        let mut store = self.open_store()?;
        let now = self.clock.now();
        let cutoff = now - self.clock.accelerate(Duration::days(WRONG_ANSWER_EXPIRY_DAYS));
        store.expire_wrong_answers(cutoff, now)
    }

    /// One overdue-manager pass over waiting/overdue/frozen cards.
    ///
    /// # Errors
    /// Returns a store error when the sweep transaction fails.
    pub fn sweep_overdue(&self) -> Result<SweepCounts> {
        let mut store = self.open_store()?;
        store.sweep_overdue(&self.clock, self.clock.now())
    }

    /// Change the global acceleration factor. The recalculation pass runs to
    /// completion before this returns; on failure the previous factor is
    /// restored, keeping the change atomic with its recalculation.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] for an out-of-range factor
    /// (no state change), or the recalculation error after rollback.
    pub fn set_acceleration_factor(&self, factor: u32) -> Result<RecalcReport> {
        let previous_factor = self.clock.set_acceleration_factor(factor)?;
        let previous =
            TimeState { acceleration_factor: previous_factor, ..self.clock.state() };
        match self.recalculate() {
            Ok(counts) => Ok(self.recalc_report(previous, counts)),
            Err(err) => {
                let _ = self.clock.set_acceleration_factor(previous_factor);
                Err(err)
            }
        }
    }

    /// Change the global day offset, with the same atomicity contract as
    /// [`Self::set_acceleration_factor`].
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] for an out-of-range offset
    /// (no state change), or the recalculation error after rollback.
    pub fn set_day_offset(&self, days: i32) -> Result<RecalcReport> {
        let previous_days = self.clock.set_day_offset(days)?;
        let previous = TimeState { day_offset_days: previous_days, ..self.clock.state() };
        match self.recalculate() {
            Ok(counts) => Ok(self.recalc_report(previous, counts)),
            Err(err) => {
                let _ = self.clock.set_day_offset(previous_days);
                Err(err)
            }
        }
    }

    /// Return the offset to zero and rebase every active timer.
    ///
    /// # Errors
    /// Returns the recalculation error after rollback.
    pub fn reset_time(&self) -> Result<RecalcReport> {
        self.set_day_offset(0)
    }

    #[must_use]
    pub fn time_status(&self) -> TimeStatus {
        let state = self.clock.state();
        TimeStatus {
            acceleration_factor: state.acceleration_factor,
            day_offset_days: state.day_offset_days,
            now: self.clock.now(),
            is_accelerated: state.acceleration_factor > 1,
        }
    }

    fn recalculate(&self) -> Result<RecalcCounts> {
        let mut store = self.open_store()?;
        store.recalculate_active_timers(&self.clock, self.clock.now())
    }

    fn recalc_report(&self, previous: TimeState, counts: RecalcCounts) -> RecalcReport {
        RecalcReport {
            previous,
            current: self.clock.state(),
            counts,
            total: counts.waiting + counts.overdue + counts.frozen,
        }
    }

    /// Six-hourly alarm refresh: every alarm-active folder dated today with
    /// unlearned items gets its `next_alarm_at` moved to the next slot.
    ///
    /// # Errors
    /// Returns a store error when reads or updates fail.
    pub fn six_hourly_notify(&self) -> Result<NotifyReport> {
        let mut store = self.open_store()?;
        let now = self.clock.now();
        let candidates = store.alarm_candidates(now.date())?;
        let mut refreshed = Vec::with_capacity(candidates.len());
        for folder in candidates {
            let slot = next_alarm_slot(now);
            store.set_folder_alarm(folder.id, Some(slot))?;
            refreshed.push(FolderAlarm {
                folder_id: folder.id,
                user_id: folder.user_id,
                next_alarm_at: slot,
            });
        }
        tracing::debug!(count = refreshed.len(), "six-hourly alarm refresh");
        Ok(NotifyReport { refreshed })
    }

    /// Midnight rollup: streak accounting over yesterday's folder items,
    /// yesterday's alarms muted, stale wrong-answer windows expired.
    /// Idempotent: a second run over the same day changes nothing further.
    ///
    /// # Errors
    /// Returns a store error when any step fails.
    pub fn midnight_rollup(&self) -> Result<RollupReport> {
        let mut store = self.open_store()?;
        let today = self.clock.now().date();
        let Some(yesterday) = today.previous_day() else {
            return Ok(RollupReport::default());
        };

        let mut report = RollupReport::default();
        for user_id in store.users_with_folders_on(yesterday)? {
            let (learned, unlearned) = store.folder_learning_counts(user_id, yesterday)?;
            let before = store.get_streak(user_id)?.streak;
            let after = store.rollup_user_streak(user_id, yesterday, learned, unlearned)?;
            report.users += 1;
            if after.streak > before {
                report.extended += 1;
            } else if after.streak == 0 && before > 0 {
                report.zeroed += 1;
            }
        }

        report.muted_alarms = store.mute_alarms_for_date(yesterday)?;
        drop(store);
        report.expired_wrong_answers = self.expire_wrong_answers()?;

        tracing::info!(
            users = report.users,
            extended = report.extended,
            zeroed = report.zeroed,
            muted = report.muted_alarms,
            "midnight rollup complete"
        );
        Ok(report)
    }

    /// Dashboard counts for one user.
    ///
    /// # Errors
    /// Returns a store error when the counts cannot be read.
    pub fn srs_status(&self, user_id: UserId) -> Result<SrsStatusView> {
        let store = self.open_store()?;
        let counts: SrsStatusCounts = store.srs_status(user_id, self.clock.now())?;
        let streak = store.get_streak(user_id)?;
        #[allow(clippy::cast_precision_loss)]
        let mastery_rate = if counts.total == 0 {
            0.0
        } else {
            counts.mastered as f64 / counts.total as f64 * 100.0
        };
        Ok(SrsStatusView {
            reviewable: counts.reviewable,
            waiting: counts.waiting,
            total: counts.total,
            mastered: counts.mastered,
            mastery_rate,
            bonus: BonusTier::from_streak(streak.streak),
        })
    }
}

fn owned_card(store: &SqliteStore, user_id: UserId, card_id: CardId) -> Result<Card> {
    match store.get_card(card_id)? {
        None => Err(KernelError::NotFound(format!("card {card_id}")).into()),
        Some(card) if card.user_id != user_id => {
            Err(KernelError::Forbidden(format!("card {card_id} belongs to another user")).into())
        }
        Some(card) => Ok(card),
    }
}

fn owned_folder(store: &SqliteStore, user_id: UserId, folder_id: FolderId) -> Result<Folder> {
    match store.get_folder(folder_id)? {
        None => Err(KernelError::NotFound(format!("folder {folder_id}")).into()),
        Some(folder) if folder.user_id != user_id => {
            Err(KernelError::Forbidden(format!("folder {folder_id} belongs to another user"))
                .into())
        }
        Some(folder) => Ok(folder),
    }
}

#[cfg(test)]
mod tests {
    use srs_kernel_core::{ItemKind, StreakStatus, REQUIRED_DAILY_QUIZZES};
    use time::macros::datetime;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("srskernel-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_api() -> (SrsKernelApi, PathBuf) {
        let path = unique_temp_db_path();
        let clock = Arc::new(Clock::fixed(datetime!(2025-06-01 12:00:00 UTC)));
        (SrsKernelApi::new(path.clone(), clock), path)
    }

    fn fixture_item(item_id: i64) -> ItemRef {
        ItemRef { kind: ItemKind::Vocab, item_id }
    }

    fn must<T>(value: Result<T>) -> T {
        match value {
            Ok(value) => value,
            Err(err) => panic!("api call failed: {err}"),
        }
    }

    fn kernel_error(err: &anyhow::Error) -> Option<&KernelError> {
        err.downcast_ref::<KernelError>()
    }

    fn enroll_one(api: &SrsKernelApi, user_id: UserId) -> Card {
        let cards = must(api.enroll(EnrollRequest { user_id, items: vec![fixture_item(1)] }));
        cards.into_iter().next().map_or_else(|| panic!("expected one card"), |card| card)
    }

    fn folder_with_card(api: &SrsKernelApi, user_id: UserId) -> (Folder, Card) {
        let card = enroll_one(api, user_id);
        let folder = must(api.create_folder(CreateFolderRequest {
            user_id,
            name: "today".to_string(),
            date: None,
            parent_id: None,
            kind: None,
            alarm_on: Some(true),
            learning_curve: Some(LearningCurve::ForgettingCurve),
        }));
        must(api.add_cards_to_folder(AddCardsRequest {
            user_id,
            folder_id: folder.id,
            card_ids: vec![card.id],
        }));
        (folder, card)
    }

    #[test]
    fn duplicate_add_returns_conflict_and_keeps_one_row() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let (folder, card) = folder_with_card(&api, user_id);

        let err = match api.add_cards_to_folder(AddCardsRequest {
            user_id,
            folder_id: folder.id,
            card_ids: vec![card.id],
        }) {
            Ok(result) => panic!("duplicate add succeeded: {result:?}"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Conflict(_))));
        assert_eq!(must(api.get_queue(user_id, folder.id)).len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn foreign_card_is_forbidden_and_unknown_card_not_found() {
        let (api, path) = fixture_api();
        let owner = UserId::new();
        let intruder = UserId::new();
        let card = enroll_one(&api, owner);

        let err = match api.submit_answer(SubmitAnswerRequest {
            user_id: intruder,
            folder_id: None,
            card_id: card.id,
            correct: true,
        }) {
            Ok(outcome) => panic!("foreign answer succeeded: {outcome:?}"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Forbidden(_))));

        let err = match api.submit_answer(SubmitAnswerRequest {
            user_id: owner,
            folder_id: None,
            card_id: CardId::new(),
            correct: true,
        }) {
            Ok(outcome) => panic!("unknown answer succeeded: {outcome:?}"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::NotFound(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn correct_answer_advances_and_updates_queue_and_stat() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let (folder, card) = folder_with_card(&api, user_id);

        let outcome = must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: Some(folder.id),
            card_id: card.id,
            correct: true,
        }));

        assert_eq!(outcome.status, AnswerStatus::Pass);
        assert_eq!(outcome.stage, 1);
        assert_eq!(outcome.streak.daily_quiz_count, 1);
        assert!(must(api.get_queue(user_id, folder.id)).is_empty(), "learned item left the queue");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn wrong_answer_opens_mandatory_window_distinct_from_card_retry() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let (folder, card) = folder_with_card(&api, user_id);

        let outcome = must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: Some(folder.id),
            card_id: card.id,
            correct: false,
        }));
        assert_eq!(outcome.status, AnswerStatus::Fail);
        assert_eq!(outcome.stage, 0);

        let entries = must(api.get_wrong_answers(user_id, false));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ReviewWindowStatus::Pending);

        // The card may retry after one accelerated day; the entry's window
        // opens at the same moment but stays open for a second day.
        let retry = match outcome.waiting_until {
            Some(at) => at,
            None => panic!("wrong answer should set a retry time"),
        };
        assert_eq!(retry, entries[0].review_window_start);
        assert!(entries[0].review_window_end > retry);

        // Completing before the window opens is a typed false.
        let result = must(api.complete_wrong_answer(CompleteWrongAnswerRequest {
            user_id,
            item: card.item,
        }));
        assert!(!result.completed);

        // Inside the window it completes.
        api.clock().advance(Duration::hours(25));
        let result = must(api.complete_wrong_answer(CompleteWrongAnswerRequest {
            user_id,
            item: card.item,
        }));
        assert!(result.completed);
        assert!(must(api.get_wrong_answers(user_id, false)).is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn correct_answer_inside_window_closes_the_entry() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let card = enroll_one(&api, user_id);

        must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: None,
            card_id: card.id,
            correct: false,
        }));
        assert_eq!(must(api.get_wrong_answers(user_id, false)).len(), 1);

        // Outside the window a correct answer leaves the entry open.
        must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: None,
            card_id: card.id,
            correct: true,
        }));
        assert_eq!(must(api.get_wrong_answers(user_id, false)).len(), 1);

        // Inside the window it completes alongside the card transition.
        api.clock().advance(Duration::hours(26));
        must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: None,
            card_id: card.id,
            correct: true,
        }));
        assert!(must(api.get_wrong_answers(user_id, false)).is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn acceleration_factor_rescales_fresh_waits() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let card = enroll_one(&api, user_id);

        // Stage 0 -> 1: forgetting-curve delay of 7 days.
        let outcome = must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: None,
            card_id: card.id,
            correct: true,
        }));
        let now = api.clock().now();
        assert_eq!(outcome.waiting_until, Some(now + Duration::days(7)));

        let report = must(api.set_acceleration_factor(60));
        assert_eq!(report.current.acceleration_factor, 60);
        assert_eq!(report.counts.waiting, 1);

        let queue_card = must(api.enroll(EnrollRequest { user_id, items: vec![fixture_item(1)] }));
        let rescaled = match queue_card[0].waiting_until {
            Some(at) => at,
            None => panic!("card should still be waiting"),
        };
        assert_eq!(rescaled, now + Duration::days(7) / 60);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_range_factor_is_rejected_with_no_state_change() {
        let (api, path) = fixture_api();
        let err = match api.set_acceleration_factor(20_000) {
            Ok(report) => panic!("out-of-range factor accepted: {report:?}"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::InvalidArgument(_))));
        assert_eq!(api.time_status().acceleration_factor, 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failed_recalculation_rolls_the_factor_back() {
        let clock = Arc::new(Clock::fixed(datetime!(2025-06-01 12:00:00 UTC)));
        // A directory path cannot be opened as a database, so the
        // recalculation pass fails after the factor was staged.
        let api = SrsKernelApi::new(std::env::temp_dir(), clock);

        assert!(api.set_acceleration_factor(60).is_err());
        assert_eq!(api.time_status().acceleration_factor, 1, "change rolled back");
    }

    #[test]
    fn streak_requires_ten_daily_quizzes() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let card = enroll_one(&api, user_id);

        for _ in 0..REQUIRED_DAILY_QUIZZES {
            must(api.submit_answer(SubmitAnswerRequest {
                user_id,
                folder_id: None,
                card_id: card.id,
                correct: false,
            }));
        }
        let info = must(api.get_streak_info(user_id));
        assert_eq!(info.streak, 1);
        assert_eq!(info.status, StreakStatus::CompletedToday);

        // Next day, same volume: streak chains to 2.
        api.clock().advance(Duration::days(1));
        for _ in 0..REQUIRED_DAILY_QUIZZES {
            must(api.submit_answer(SubmitAnswerRequest {
                user_id,
                folder_id: None,
                card_id: card.id,
                correct: false,
            }));
        }
        assert_eq!(must(api.get_streak_info(user_id)).streak, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn midnight_rollup_zeroes_under_threshold_users_and_mutes_alarms() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let (folder, card) = folder_with_card(&api, user_id);

        // One answer yesterday: under threshold, with an unlearned item.
        must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: Some(folder.id),
            card_id: card.id,
            correct: false,
        }));
        must(api.six_hourly_notify());

        api.clock().advance(Duration::days(1));
        let report = must(api.midnight_rollup());
        assert_eq!(report.users, 1);
        assert_eq!(report.extended, 0);
        assert_eq!(report.muted_alarms, 1);

        assert_eq!(must(api.get_streak_info(user_id)).streak, 0);

        // A second run over the same day is a no-op.
        let again = must(api.midnight_rollup());
        assert_eq!(again.muted_alarms, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn six_hourly_notify_skips_complete_folders() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let (folder, card) = folder_with_card(&api, user_id);

        let report = must(api.six_hourly_notify());
        assert_eq!(report.refreshed.len(), 1);
        assert_eq!(report.refreshed[0].folder_id, folder.id);
        // 12:00 exactly moves to the 18:00 slot.
        assert_eq!(
            report.refreshed[0].next_alarm_at,
            datetime!(2025-06-01 18:00:00 UTC)
        );

        // Learning the only item empties the folder: no further alarms.
        must(api.submit_answer(SubmitAnswerRequest {
            user_id,
            folder_id: Some(folder.id),
            card_id: card.id,
            correct: true,
        }));
        let report = must(api.six_hourly_notify());
        assert!(report.refreshed.is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn quiz_draws_oldest_open_entries_first() {
        struct FixtureCatalog;
        impl ItemCatalog for FixtureCatalog {
            fn gloss(&self, item: ItemRef) -> Option<String> {
                Some(format!("gloss-{}", item.item_id))
            }
            fn distractors(
                &self,
                _item: ItemRef,
                count: usize,
                _exclude: &[ItemRef],
            ) -> Vec<String> {
                (0..count).map(|index| format!("other-{index}")).collect()
            }
        }

        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let cards = must(api.enroll(EnrollRequest {
            user_id,
            items: vec![fixture_item(1), fixture_item(2), fixture_item(3)],
        }));
        for card in &cards {
            must(api.submit_answer(SubmitAnswerRequest {
                user_id,
                folder_id: None,
                card_id: card.id,
                correct: false,
            }));
            api.clock().advance(Duration::minutes(1));
        }

        let quiz = must(api.generate_wrong_answer_quiz(user_id, 2, &FixtureCatalog));
        assert_eq!(quiz.len(), 2);
        assert_eq!(quiz[0].item, fixture_item(1), "oldest failure first");
        assert_eq!(quiz[1].item, fixture_item(2));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn folder_inherits_parent_learning_curve() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let parent = must(api.create_folder(CreateFolderRequest {
            user_id,
            name: "parent".to_string(),
            date: None,
            parent_id: None,
            kind: None,
            alarm_on: None,
            learning_curve: Some(LearningCurve::Short),
        }));
        let child = must(api.create_folder(CreateFolderRequest {
            user_id,
            name: "child".to_string(),
            date: None,
            parent_id: Some(parent.id),
            kind: None,
            alarm_on: None,
            // An explicit curve on a child is ignored: the parent wins.
            learning_curve: Some(LearningCurve::ForgettingCurve),
        }));
        assert_eq!(child.learning_curve, LearningCurve::Short);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unenroll_cascades_and_is_ownership_checked() {
        let (api, path) = fixture_api();
        let user_id = UserId::new();
        let (folder, card) = folder_with_card(&api, user_id);

        let err = match api.unenroll(UserId::new(), card.id) {
            Ok(()) => panic!("foreign unenroll succeeded"),
            Err(err) => err,
        };
        assert!(matches!(kernel_error(&err), Some(KernelError::Forbidden(_))));

        must(api.unenroll(user_id, card.id));
        assert!(must(api.get_queue(user_id, folder.id)).is_empty());
        let _ = std::fs::remove_file(&path);
    }
}

use std::fmt::{Display, Formatter};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, Time};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CardId(pub Ulid);

impl CardId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CardId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FolderId(pub Ulid);

impl FolderId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for FolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for FolderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WrongAnswerId(pub Ulid);

impl WrongAnswerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for WrongAnswerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WrongAnswerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Vocab,
    Idiom,
}

impl ItemKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vocab => "vocab",
            Self::Idiom => "idiom",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "vocab" => Some(Self::Vocab),
            "idiom" => Some(Self::Idiom),
            _ => None,
        }
    }
}

/// Opaque reference to a study item. The kernel never interprets the content
/// behind it; lookup and formatting live behind [`ItemCatalog`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemRef {
    pub kind: ItemKind,
    pub item_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LearningCurve {
    Short,
    ForgettingCurve,
}

const SHORT_STAGE_DELAY_DAYS: [u32; 5] = [1, 3, 7, 14, 30];
const FORGETTING_STAGE_DELAY_DAYS: [u32; 6] = [3, 7, 14, 30, 60, 120];

impl LearningCurve {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::ForgettingCurve => "forgetting_curve",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "short" => Some(Self::Short),
            "forgetting_curve" => Some(Self::ForgettingCurve),
            _ => None,
        }
    }

    #[must_use]
    pub fn stage_delay_days(self) -> &'static [u32] {
        match self {
            Self::Short => &SHORT_STAGE_DELAY_DAYS,
            Self::ForgettingCurve => &FORGETTING_STAGE_DELAY_DAYS,
        }
    }

    /// Reaching this stage masters the card; it equals the table length.
    #[must_use]
    pub fn terminal_stage(self) -> u32 {
        u32::try_from(self.stage_delay_days().len()).unwrap_or(u32::MAX)
    }
}

/// Stage-to-delay lookup. Any stage, including negative or overflow values,
/// clamps into the table; the result is non-decreasing in `stage`.
#[must_use]
pub fn delay_days_for(curve: LearningCurve, stage: i64) -> u32 {
    let table = curve.stage_delay_days();
    let last = table.len() - 1;
    let index = usize::try_from(stage.max(0)).map_or(last, |index| index.min(last));
    table[index]
}

pub const MIN_ACCELERATION_FACTOR: u32 = 1;
pub const MAX_ACCELERATION_FACTOR: u32 = 10_080;
pub const MAX_DAY_OFFSET: i32 = 3_650;
pub const MIN_DAY_OFFSET: i32 = -3_650;
pub const REVIEW_ANCHOR_HOUR: u8 = 9;
pub const ALARM_SLOT_HOURS: [u8; 4] = [0, 6, 12, 18];
pub const REQUIRED_DAILY_QUIZZES: u32 = 10;
pub const WRONG_ANSWER_EXPIRY_DAYS: i64 = 3;

const MIN_ACCELERATED_MS: i128 = 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TimeState {
    pub day_offset_days: i32,
    pub acceleration_factor: u32,
}

impl Default for TimeState {
    fn default() -> Self {
        Self { day_offset_days: 0, acceleration_factor: MIN_ACCELERATION_FACTOR }
    }
}

#[derive(Debug, Clone, Copy)]
enum ClockSource {
    System,
    Fixed(OffsetDateTime),
}

#[derive(Debug)]
struct ClockInner {
    source: ClockSource,
    state: TimeState,
}

/// Process-wide clock: wall time plus a global day offset, with an
/// acceleration factor compressing every computed wait. Injected everywhere
/// instead of ambient globals so tests can pin time with [`Clock::fixed`].
#[derive(Debug)]
pub struct Clock {
    inner: RwLock<ClockInner>,
}

impl Clock {
    #[must_use]
    pub fn system() -> Self {
        Self {
            inner: RwLock::new(ClockInner {
                source: ClockSource::System,
                state: TimeState::default(),
            }),
        }
    }

    #[must_use]
    pub fn fixed(now: OffsetDateTime) -> Self {
        Self {
            inner: RwLock::new(ClockInner {
                source: ClockSource::Fixed(now),
                state: TimeState::default(),
            }),
        }
    }

    fn read(&self) -> ClockInner {
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        ClockInner { source: guard.source, state: guard.state }
    }

    /// Offset-adjusted current time.
    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        let inner = self.read();
        let base = match inner.source {
            ClockSource::System => OffsetDateTime::now_utc(),
            ClockSource::Fixed(at) => at,
        };
        base + Duration::days(i64::from(inner.state.day_offset_days))
    }

    #[must_use]
    pub fn state(&self) -> TimeState {
        self.read().state
    }

    #[must_use]
    pub fn acceleration_factor(&self) -> u32 {
        self.read().state.acceleration_factor
    }

    #[must_use]
    pub fn day_offset(&self) -> i32 {
        self.read().state.day_offset_days
    }

    /// Set the acceleration factor, returning the previous value.
    ///
    /// The caller MUST follow a successful change with a full timer
    /// recalculation pass before treating the change as applied.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] when the factor is outside
    /// [`MIN_ACCELERATION_FACTOR`]..=[`MAX_ACCELERATION_FACTOR`]; state is
    /// unchanged.
    pub fn set_acceleration_factor(&self, factor: u32) -> Result<u32, KernelError> {
        if !(MIN_ACCELERATION_FACTOR..=MAX_ACCELERATION_FACTOR).contains(&factor) {
            return Err(KernelError::InvalidArgument(format!(
                "acceleration factor must be within [{MIN_ACCELERATION_FACTOR}, {MAX_ACCELERATION_FACTOR}], got {factor}"
            )));
        }
        let mut guard = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = guard.state.acceleration_factor;
        guard.state.acceleration_factor = factor;
        Ok(previous)
    }

    /// Set the global day offset, returning the previous value.
    ///
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] when the offset is outside
    /// [`MIN_DAY_OFFSET`]..=[`MAX_DAY_OFFSET`]; state is unchanged.
    pub fn set_day_offset(&self, days: i32) -> Result<i32, KernelError> {
        if !(MIN_DAY_OFFSET..=MAX_DAY_OFFSET).contains(&days) {
            return Err(KernelError::InvalidArgument(format!(
                "day offset must be within [{MIN_DAY_OFFSET}, {MAX_DAY_OFFSET}] days, got {days}"
            )));
        }
        let mut guard = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let previous = guard.state.day_offset_days;
        guard.state.day_offset_days = days;
        Ok(previous)
    }

    /// Compress a real duration by the active factor, floored at one second.
    #[must_use]
    pub fn accelerate(&self, real: Duration) -> Duration {
        let factor = i128::from(self.acceleration_factor());
        let accelerated_ms = (real.whole_milliseconds() / factor).max(MIN_ACCELERATED_MS);
        Duration::milliseconds(i64::try_from(accelerated_ms).unwrap_or(i64::MAX))
    }

    /// The accelerated 24h used for wrong-answer waits, overdue deadlines,
    /// and freeze windows.
    #[must_use]
    pub fn accelerated_day(&self) -> Duration {
        self.accelerate(Duration::days(1))
    }

    #[must_use]
    pub fn accelerated_stage_wait(&self, curve: LearningCurve, stage: i64) -> Duration {
        self.accelerate(Duration::days(i64::from(delay_days_for(curve, stage))))
    }

    /// Advance a fixed clock; a system clock is left untouched.
    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let ClockSource::Fixed(at) = guard.source {
            guard.source = ClockSource::Fixed(at + by);
        }
    }
}

/// Wall-clock cadence of the overdue sweep for a given acceleration factor.
/// The bands keep sweep granularity proportional to virtual time.
#[must_use]
pub fn sweep_cadence(factor: u32) -> Duration {
    match factor {
        0..=59 => Duration::minutes(10),
        60..=359 => Duration::seconds(30),
        360..=1_439 => Duration::seconds(15),
        _ => Duration::seconds(5),
    }
}

/// Next of the four fixed daily alarm slots strictly after `now`; past the
/// last slot this is the next day's midnight.
#[must_use]
pub fn next_alarm_slot(now: OffsetDateTime) -> OffsetDateTime {
    for hour in ALARM_SLOT_HOURS {
        if now.hour() < hour {
            let slot = Time::from_hms(hour, 0, 0).unwrap_or(Time::MIDNIGHT);
            return now.replace_time(slot);
        }
    }
    (now + Duration::days(1)).replace_time(Time::MIDNIGHT)
}

/// 09:00 on the given day, the hour at which day-granularity reviews open.
#[must_use]
pub fn review_anchor_on(date: Date) -> OffsetDateTime {
    let anchor = Time::from_hms(REVIEW_ANCHOR_HOUR, 0, 0).unwrap_or(Time::MIDNIGHT);
    date.with_time(anchor).assume_utc()
}

/// Folder-level review date: day granularity anchored to midnight.
#[must_use]
pub fn folder_next_review_date(base: Date, curve: LearningCurve, stage: i64) -> Date {
    base.checked_add(Duration::days(i64::from(delay_days_for(curve, stage)))).unwrap_or(base)
}

/// Card-level next review instant: the stage delay compressed by the clock.
#[must_use]
pub fn compute_next_review_at(
    clock: &Clock,
    now: OffsetDateTime,
    curve: LearningCurve,
    stage: i64,
) -> OffsetDateTime {
    now + clock.accelerated_stage_wait(curve, stage)
}

/// Card-level retry instant after a failure: one accelerated day. Distinct
/// from the wrong-answer entry's mandatory window ([`wrong_answer_window`]).
#[must_use]
pub fn compute_wrong_answer_waiting_until(clock: &Clock, now: OffsetDateTime) -> OffsetDateTime {
    now + clock.accelerated_day()
}

/// The mandatory review window for a wrong-answer entry:
/// `[now + 1 day, now + 2 days)`, both edges accelerated.
#[must_use]
pub fn wrong_answer_window(
    clock: &Clock,
    now: OffsetDateTime,
) -> (OffsetDateTime, OffsetDateTime) {
    let start = now + clock.accelerated_day();
    (start, start + clock.accelerated_day())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub id: CardId,
    pub user_id: UserId,
    pub item: ItemRef,
    pub stage: u32,
    pub correct_total: u32,
    pub wrong_total: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub waiting_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_review_at: Option<OffsetDateTime>,
    pub is_overdue: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub overdue_start_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub overdue_deadline: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub frozen_until: Option<OffsetDateTime>,
    pub is_from_wrong_answer: bool,
    pub is_mastered: bool,
    pub master_cycles: u32,
    pub folder_id: Option<FolderId>,
}

impl Card {
    /// Fresh enrollment: stage 0, immediately reviewable.
    #[must_use]
    pub fn new(user_id: UserId, item: ItemRef) -> Self {
        Self {
            id: CardId::new(),
            user_id,
            item,
            stage: 0,
            correct_total: 0,
            wrong_total: 0,
            waiting_until: None,
            next_review_at: None,
            is_overdue: false,
            overdue_start_at: None,
            overdue_deadline: None,
            frozen_until: None,
            is_from_wrong_answer: false,
            is_mastered: false,
            master_cycles: 0,
            folder_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerTransition {
    pub correct: bool,
    pub stage: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub waiting_until: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_review_at: Option<OffsetDateTime>,
    pub is_from_wrong_answer: bool,
    pub mastered_now: bool,
}

/// Compute the state transition for one answer. Pure; the caller persists it
/// atomically together with the folder-item, stat, streak, and wrong-answer
/// effects.
#[must_use]
pub fn apply_answer(
    card: &Card,
    curve: LearningCurve,
    correct: bool,
    clock: &Clock,
    now: OffsetDateTime,
) -> AnswerTransition {
    if correct {
        if card.is_mastered {
            // A mastered card stays mastered; only the wrong-answer loop
            // re-enters the schedule.
            return AnswerTransition {
                correct,
                stage: card.stage,
                waiting_until: None,
                next_review_at: None,
                is_from_wrong_answer: false,
                mastered_now: false,
            };
        }
        let stage = (card.stage + 1).min(curve.terminal_stage());
        if stage == curve.terminal_stage() {
            return AnswerTransition {
                correct,
                stage,
                waiting_until: None,
                next_review_at: None,
                is_from_wrong_answer: false,
                mastered_now: true,
            };
        }
        let due = compute_next_review_at(clock, now, curve, i64::from(stage));
        AnswerTransition {
            correct,
            stage,
            waiting_until: Some(due),
            next_review_at: Some(due),
            is_from_wrong_answer: false,
            mastered_now: false,
        }
    } else {
        let retry = compute_wrong_answer_waiting_until(clock, now);
        AnswerTransition {
            correct,
            stage: 0,
            waiting_until: Some(retry),
            next_review_at: Some(retry),
            is_from_wrong_answer: true,
            mastered_now: false,
        }
    }
}

impl Card {
    /// Fold a computed transition into the card. Overdue and frozen markers
    /// always clear: an answered card re-enters the waiting path.
    pub fn apply(&mut self, transition: &AnswerTransition) {
        self.stage = transition.stage;
        self.waiting_until = transition.waiting_until;
        self.next_review_at = transition.next_review_at;
        self.is_from_wrong_answer = transition.is_from_wrong_answer;
        self.is_overdue = false;
        self.overdue_start_at = None;
        self.overdue_deadline = None;
        self.frozen_until = None;
        if transition.correct {
            self.correct_total += 1;
        } else {
            self.wrong_total += 1;
        }
        if transition.mastered_now {
            self.is_mastered = true;
            self.master_cycles += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Waiting elapsed: the card becomes reviewable with a deadline.
    Promote { deadline: OffsetDateTime },
    /// Overdue deadline missed: freeze rather than permanently fail.
    /// The stage is preserved.
    Freeze { frozen_until: OffsetDateTime },
    /// Frozen period over: back to overdue with a fresh deadline.
    Thaw { deadline: OffsetDateTime },
}

/// Decide what the periodic sweep does with one card at `now`, if anything.
#[must_use]
pub fn sweep_action(
    card: &Card,
    curve: LearningCurve,
    clock: &Clock,
    now: OffsetDateTime,
) -> Option<SweepAction> {
    if let Some(frozen_until) = card.frozen_until {
        if frozen_until <= now {
            return Some(SweepAction::Thaw { deadline: now + clock.accelerated_day() });
        }
        return None;
    }
    if card.is_overdue {
        if card.overdue_deadline.is_some_and(|deadline| deadline <= now) {
            return Some(SweepAction::Freeze { frozen_until: now + clock.accelerated_day() });
        }
        return None;
    }
    if card.is_mastered {
        return None;
    }
    if card.waiting_until.is_some_and(|waiting_until| waiting_until <= now) {
        let deadline = if card.is_from_wrong_answer {
            now + clock.accelerated_day()
        } else {
            now + clock.accelerated_stage_wait(curve, i64::from(card.stage))
        };
        return Some(SweepAction::Promote { deadline });
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClass {
    Waiting,
    Overdue,
    Frozen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRecalculation {
    pub class: TimerClass,
    pub waiting_until: Option<OffsetDateTime>,
    pub next_review_at: Option<OffsetDateTime>,
    pub overdue_start_at: Option<OffsetDateTime>,
    pub overdue_deadline: Option<OffsetDateTime>,
    pub frozen_until: Option<OffsetDateTime>,
}

/// Rescale one card's pending timer against the clock's current factor.
/// Wrong-answer cards get a fresh accelerated 24h; correct-path cards their
/// stage-appropriate accelerated delay. Idempotent for a fixed `now`.
#[must_use]
pub fn recalculate_card(
    card: &Card,
    curve: LearningCurve,
    clock: &Clock,
    now: OffsetDateTime,
) -> Option<TimerRecalculation> {
    if let Some(frozen_until) = card.frozen_until {
        if frozen_until > now {
            return Some(TimerRecalculation {
                class: TimerClass::Frozen,
                waiting_until: card.waiting_until,
                next_review_at: card.next_review_at,
                overdue_start_at: None,
                overdue_deadline: None,
                frozen_until: Some(now + clock.accelerated_day()),
            });
        }
        return None;
    }
    if card.is_overdue {
        if card.overdue_deadline.is_some_and(|deadline| deadline > now) {
            let deadline = if card.is_from_wrong_answer {
                now + clock.accelerated_day()
            } else {
                now + clock.accelerated_stage_wait(curve, i64::from(card.stage))
            };
            return Some(TimerRecalculation {
                class: TimerClass::Overdue,
                waiting_until: card.waiting_until,
                next_review_at: card.next_review_at,
                overdue_start_at: Some(now),
                overdue_deadline: Some(deadline),
                frozen_until: None,
            });
        }
        return None;
    }
    if card.waiting_until.is_some_and(|waiting_until| waiting_until > now) {
        let waiting_until = if card.is_from_wrong_answer {
            now + clock.accelerated_day()
        } else {
            now + clock.accelerated_stage_wait(curve, i64::from(card.stage))
        };
        return Some(TimerRecalculation {
            class: TimerClass::Waiting,
            waiting_until: Some(waiting_until),
            next_review_at: Some(waiting_until),
            overdue_start_at: None,
            overdue_deadline: None,
            frozen_until: None,
        });
    }
    None
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
    Review,
    Custom,
    Auto,
}

impl FolderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Custom => "custom",
            Self::Auto => "auto",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "review" => Some(Self::Review),
            "custom" => Some(Self::Custom),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Folder {
    pub id: FolderId,
    pub user_id: UserId,
    pub parent_id: Option<FolderId>,
    pub name: String,
    pub kind: FolderKind,
    pub date: Date,
    pub alarm_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_alarm_at: Option<OffsetDateTime>,
    pub learning_curve: LearningCurve,
    pub auto_created: bool,
}

impl Folder {
    /// # Errors
    /// Returns [`KernelError::InvalidArgument`] when the name is blank.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.name.trim().is_empty() {
            return Err(KernelError::InvalidArgument(
                "folder name must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderItem {
    pub folder_id: FolderId,
    pub card_id: CardId,
    pub learned: bool,
    pub wrong_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reviewed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrongAnswerEntry {
    pub id: WrongAnswerId,
    pub user_id: UserId,
    pub item: ItemRef,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub wrong_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub review_window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub review_window_end: OffsetDateTime,
    pub is_completed: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub snapshot: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewWindowStatus {
    Pending,
    Available,
    Expired,
}

#[must_use]
pub fn review_window_status(entry: &WrongAnswerEntry, now: OffsetDateTime) -> ReviewWindowStatus {
    if now < entry.review_window_start {
        ReviewWindowStatus::Pending
    } else if now < entry.review_window_end {
        ReviewWindowStatus::Available
    } else {
        ReviewWindowStatus::Expired
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyStudyStat {
    pub user_id: UserId,
    pub date: Date,
    pub srs_solved: u32,
    pub auto_learned: u32,
    pub wrong_due_next: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStreakState {
    pub user_id: UserId,
    pub streak: u32,
    pub daily_quiz_count: u32,
    pub last_quiz_date: Option<Date>,
    pub streak_updated_at: Option<Date>,
}

impl UserStreakState {
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self { user_id, streak: 0, daily_quiz_count: 0, last_quiz_date: None, streak_updated_at: None }
    }
}

/// Register one answered quiz. The daily counter resets exactly once when
/// the calendar day changes, and crossing the threshold bumps the streak at
/// most once per day.
pub fn register_quiz(state: &mut UserStreakState, today: Date) {
    if state.last_quiz_date != Some(today) {
        state.daily_quiz_count = 0;
    }
    state.last_quiz_date = Some(today);
    state.daily_quiz_count += 1;

    if state.daily_quiz_count == REQUIRED_DAILY_QUIZZES && state.streak_updated_at != Some(today) {
        let yesterday = today.previous_day();
        state.streak = if yesterday.is_some() && state.streak_updated_at == yesterday {
            state.streak + 1
        } else {
            1
        };
        state.streak_updated_at = Some(today);
    }
}

/// Midnight rollup for one user over `yesterday`'s folder-item counts:
/// a fully learned day of sufficient volume extends the streak (unless the
/// threshold path already bumped it); anything less zeroes it.
pub fn rollup_streak(state: &mut UserStreakState, yesterday: Date, learned: u32, unlearned: u32) {
    if learned >= REQUIRED_DAILY_QUIZZES && unlearned == 0 {
        if state.streak_updated_at == Some(yesterday) {
            return;
        }
        let day_before = yesterday.previous_day();
        state.streak = if day_before.is_some() && state.streak_updated_at == day_before {
            state.streak + 1
        } else {
            1
        };
        state.streak_updated_at = Some(yesterday);
    } else {
        state.streak = 0;
    }
}

/// Derived, never persisted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BonusTier {
    None,
    Bronze,
    Silver,
    Gold,
}

impl BonusTier {
    #[must_use]
    pub fn from_streak(streak: u32) -> Self {
        match streak {
            0..=6 => Self::None,
            7..=29 => Self::Bronze,
            30..=99 => Self::Silver,
            _ => Self::Gold,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StreakStatus {
    Pending,
    CompletedToday,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StreakInfo {
    pub streak: u32,
    pub daily_quiz_count: u32,
    pub remaining_for_streak: u32,
    pub bonus: BonusTier,
    pub status: StreakStatus,
}

#[must_use]
pub fn streak_info(state: &UserStreakState, today: Date) -> StreakInfo {
    let daily_quiz_count =
        if state.last_quiz_date == Some(today) { state.daily_quiz_count } else { 0 };
    let remaining_for_streak = REQUIRED_DAILY_QUIZZES.saturating_sub(daily_quiz_count);
    let status = if remaining_for_streak == 0 {
        StreakStatus::CompletedToday
    } else {
        StreakStatus::Pending
    };
    StreakInfo {
        streak: state.streak,
        daily_quiz_count,
        remaining_for_streak,
        bonus: BonusTier::from_streak(state.streak),
        status,
    }
}

/// Content lookup boundary. Dictionary data is an external collaborator; the
/// kernel only ever asks for a gloss and same-level distractors.
pub trait ItemCatalog {
    fn gloss(&self, item: ItemRef) -> Option<String>;
    fn distractors(&self, item: ItemRef, count: usize, exclude: &[ItemRef]) -> Vec<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WrongAnswerQuizItem {
    pub wrong_answer_id: WrongAnswerId,
    pub item: ItemRef,
    pub attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub wrong_at: OffsetDateTime,
    pub choices: Vec<String>,
    pub answer_index: usize,
}

/// Build multiple-choice items from open wrong-answer entries, oldest first.
/// Entries whose gloss the catalog cannot resolve are skipped.
#[must_use]
pub fn build_wrong_answer_quiz(
    entries: &[WrongAnswerEntry],
    catalog: &dyn ItemCatalog,
    choice_count: usize,
) -> Vec<WrongAnswerQuizItem> {
    let targets: Vec<ItemRef> = entries.iter().map(|entry| entry.item).collect();
    entries
        .iter()
        .filter_map(|entry| {
            let gloss = catalog.gloss(entry.item)?;
            let mut choices =
                catalog.distractors(entry.item, choice_count.saturating_sub(1), &targets);
            choices.truncate(choice_count.saturating_sub(1));
            let slot = usize::try_from(entry.wrong_at.unix_timestamp().rem_euclid(
                i64::try_from(choices.len() + 1).unwrap_or(1),
            ))
            .unwrap_or(0);
            choices.insert(slot.min(choices.len()), gloss);
            Some(WrongAnswerQuizItem {
                wrong_answer_id: entry.id,
                item: entry.item,
                attempts: entry.attempts,
                wrong_at: entry.wrong_at,
                choices,
                answer_index: slot,
            })
        })
        .collect()
}

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use srs_kernel_core::{
    recalculate_card, register_quiz, rollup_streak, sweep_action, Card, CardId, Clock,
    DailyStudyStat, Folder, FolderId, FolderItem, FolderKind, ItemKind, ItemRef, LearningCurve,
    SweepAction, UserId, UserStreakState, WrongAnswerEntry, WrongAnswerId,
};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS srs_cards (
  card_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  item_kind TEXT NOT NULL CHECK (item_kind IN ('vocab','idiom')),
  item_id INTEGER NOT NULL,
  stage INTEGER NOT NULL CHECK (stage >= 0),
  correct_total INTEGER NOT NULL DEFAULT 0,
  wrong_total INTEGER NOT NULL DEFAULT 0,
  waiting_until TEXT,
  next_review_at TEXT,
  is_overdue INTEGER NOT NULL DEFAULT 0,
  overdue_start_at TEXT,
  overdue_deadline TEXT,
  frozen_until TEXT,
  is_from_wrong_answer INTEGER NOT NULL DEFAULT 0,
  is_mastered INTEGER NOT NULL DEFAULT 0,
  master_cycles INTEGER NOT NULL DEFAULT 0,
  folder_id TEXT,
  UNIQUE(user_id, item_kind, item_id)
);

CREATE TABLE IF NOT EXISTS srs_folders (
  folder_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  parent_id TEXT,
  name TEXT NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('review','custom','auto')),
  date TEXT NOT NULL,
  alarm_active INTEGER NOT NULL DEFAULT 1,
  next_alarm_at TEXT,
  learning_curve TEXT NOT NULL CHECK (learning_curve IN ('short','forgetting_curve')),
  auto_created INTEGER NOT NULL DEFAULT 0,
  FOREIGN KEY (parent_id) REFERENCES srs_folders(folder_id)
);

CREATE TABLE IF NOT EXISTS srs_folder_items (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  folder_id TEXT NOT NULL,
  card_id TEXT NOT NULL,
  learned INTEGER NOT NULL DEFAULT 0,
  wrong_count INTEGER NOT NULL DEFAULT 0,
  last_reviewed_at TEXT,
  UNIQUE(folder_id, card_id),
  FOREIGN KEY (folder_id) REFERENCES srs_folders(folder_id),
  FOREIGN KEY (card_id) REFERENCES srs_cards(card_id)
);

CREATE TABLE IF NOT EXISTS wrong_answers (
  wrong_answer_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  item_kind TEXT NOT NULL CHECK (item_kind IN ('vocab','idiom')),
  item_id INTEGER NOT NULL,
  attempts INTEGER NOT NULL CHECK (attempts >= 1),
  wrong_at TEXT NOT NULL,
  review_window_start TEXT NOT NULL,
  review_window_end TEXT NOT NULL,
  is_completed INTEGER NOT NULL DEFAULT 0,
  completed_at TEXT,
  snapshot_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_study_stats (
  user_id TEXT NOT NULL,
  date TEXT NOT NULL,
  srs_solved INTEGER NOT NULL DEFAULT 0,
  auto_learned INTEGER NOT NULL DEFAULT 0,
  wrong_due_next INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (user_id, date)
);

CREATE TABLE IF NOT EXISTS user_streaks (
  user_id TEXT PRIMARY KEY,
  streak INTEGER NOT NULL DEFAULT 0,
  daily_quiz_count INTEGER NOT NULL DEFAULT 0,
  last_quiz_date TEXT,
  streak_updated_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_wrong_answers_open
  ON wrong_answers(user_id, item_kind, item_id) WHERE is_completed = 0;
CREATE INDEX IF NOT EXISTS idx_srs_cards_user ON srs_cards(user_id);
CREATE INDEX IF NOT EXISTS idx_srs_cards_waiting ON srs_cards(waiting_until);
CREATE INDEX IF NOT EXISTS idx_srs_cards_deadline ON srs_cards(overdue_deadline);
CREATE INDEX IF NOT EXISTS idx_srs_cards_frozen ON srs_cards(frozen_until);
CREATE INDEX IF NOT EXISTS idx_srs_folders_user_date ON srs_folders(user_id, date);
CREATE INDEX IF NOT EXISTS idx_srs_folder_items_card ON srs_folder_items(card_id);
CREATE INDEX IF NOT EXISTS idx_wrong_answers_user ON wrong_answers(user_id, wrong_at);
";

const CARD_COLUMNS: &str = "card_id, user_id, item_kind, item_id, stage, correct_total, \
     wrong_total, waiting_until, next_review_at, is_overdue, overdue_start_at, overdue_deadline, \
     frozen_until, is_from_wrong_answer, is_mastered, master_cycles, folder_id";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

/// Outcome of a folder-item batch add: the duplicate branch carries the ids
/// that were already present so the caller can reject with a precise conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddItemsOutcome {
    Added(usize),
    Duplicate(Vec<CardId>),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepCounts {
    pub promoted: usize,
    pub frozen: usize,
    pub thawed: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecalcCounts {
    pub waiting: usize,
    pub overdue: usize,
    pub frozen: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SrsStatusCounts {
    pub reviewable: usize,
    pub waiting: usize,
    pub total: usize,
    pub mastered: usize,
}

impl SqliteStore {
    /// Open the SQLite-backed SRS store and apply the runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Ensure one card per (owner, item), creating missing cards at stage 0.
    /// Existing cards are returned untouched.
    ///
    /// # Errors
    /// Returns an error when lookup or insertion fails.
    pub fn ensure_cards(&mut self, user_id: UserId, items: &[ItemRef]) -> Result<Vec<Card>> {
        let tx = self.conn.transaction().context("failed to start enroll transaction")?;
        let mut cards = Vec::with_capacity(items.len());
        for item in items {
            let existing = find_card_by_item(&tx, user_id, *item)?;
            if let Some(card) = existing {
                cards.push(card);
                continue;
            }
            let card = Card::new(user_id, *item);
            insert_card(&tx, &card)?;
            cards.push(card);
        }
        tx.commit().context("failed to commit enroll transaction")?;
        Ok(cards)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_card(&self, card_id: CardId) -> Result<Option<Card>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {CARD_COLUMNS} FROM srs_cards WHERE card_id = ?1"))?;
        let mut rows = stmt.query(params![card_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_card(row)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_cards(&self, user_id: UserId) -> Result<Vec<Card>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CARD_COLUMNS} FROM srs_cards WHERE user_id = ?1 ORDER BY card_id ASC"
        ))?;
        let mut rows = stmt.query(params![user_id.to_string()])?;
        let mut cards = Vec::new();
        while let Some(row) = rows.next()? {
            cards.push(read_card(row)?);
        }
        Ok(cards)
    }

    /// Delete one card together with its folder memberships.
    ///
    /// # Errors
    /// Returns an error when any delete in the transaction fails.
    pub fn delete_card(&mut self, card_id: CardId) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start unenroll transaction")?;
        tx.execute(
            "DELETE FROM srs_folder_items WHERE card_id = ?1",
            params![card_id.to_string()],
        )
        .context("failed to delete folder items for card")?;
        let deleted = tx
            .execute("DELETE FROM srs_cards WHERE card_id = ?1", params![card_id.to_string()])
            .context("failed to delete card")?;
        tx.commit().context("failed to commit unenroll transaction")?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_folder(&mut self, folder: &Folder) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start folder transaction")?;
        tx.execute(
            "INSERT INTO srs_folders(
                folder_id, user_id, parent_id, name, kind, date,
                alarm_active, next_alarm_at, learning_curve, auto_created
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                folder.id.to_string(),
                folder.user_id.to_string(),
                folder.parent_id.map(|id| id.to_string()),
                folder.name,
                folder.kind.as_str(),
                date_string(folder.date)?,
                folder.alarm_active,
                folder.next_alarm_at.map(rfc3339).transpose()?,
                folder.learning_curve.as_str(),
                folder.auto_created,
            ],
        )
        .context("failed to insert folder")?;
        tx.commit().context("failed to commit folder transaction")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_folder(&self, folder_id: FolderId) -> Result<Option<Folder>> {
        let mut stmt = self.conn.prepare(
            "SELECT folder_id, user_id, parent_id, name, kind, date,
                    alarm_active, next_alarm_at, learning_curve, auto_created
             FROM srs_folders WHERE folder_id = ?1",
        )?;
        let mut rows = stmt.query(params![folder_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_folder(row)?)),
            None => Ok(None),
        }
    }

    /// Check-then-insert batch add, guarded by the UNIQUE(folder, card)
    /// constraint. Any duplicate rejects the whole batch.
    ///
    /// # Errors
    /// Returns an error when lookup or insertion fails.
    pub fn add_folder_items(
        &mut self,
        folder_id: FolderId,
        card_ids: &[CardId],
    ) -> Result<AddItemsOutcome> {
        let tx = self.conn.transaction().context("failed to start folder-item transaction")?;

        let mut duplicates = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT 1 FROM srs_folder_items WHERE folder_id = ?1 AND card_id = ?2",
            )?;
            for card_id in card_ids {
                let exists = stmt
                    .query_row(params![folder_id.to_string(), card_id.to_string()], |_| Ok(()))
                    .optional()?;
                if exists.is_some() {
                    duplicates.push(*card_id);
                }
            }
        }
        if !duplicates.is_empty() {
            return Ok(AddItemsOutcome::Duplicate(duplicates));
        }

        for card_id in card_ids {
            tx.execute(
                "INSERT INTO srs_folder_items(folder_id, card_id, learned, wrong_count)
                 VALUES (?1, ?2, 0, 0)",
                params![folder_id.to_string(), card_id.to_string()],
            )
            .context("failed to insert folder item")?;
            tx.execute(
                "UPDATE srs_cards SET folder_id = ?1 WHERE card_id = ?2",
                params![folder_id.to_string(), card_id.to_string()],
            )
            .context("failed to attach card to folder")?;
        }

        tx.commit().context("failed to commit folder-item transaction")?;
        Ok(AddItemsOutcome::Added(card_ids.len()))
    }

    /// Unlearned folder items in insertion order, each with its card.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn queue_items(&self, folder_id: FolderId) -> Result<Vec<(FolderItem, Card)>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.folder_id, i.card_id, i.learned, i.wrong_count, i.last_reviewed_at,
                    c.card_id, c.user_id, c.item_kind, c.item_id, c.stage, c.correct_total,
                    c.wrong_total, c.waiting_until, c.next_review_at, c.is_overdue,
                    c.overdue_start_at, c.overdue_deadline, c.frozen_until,
                    c.is_from_wrong_answer, c.is_mastered, c.master_cycles, c.folder_id
             FROM srs_folder_items i
             JOIN srs_cards c ON c.card_id = i.card_id
             WHERE i.folder_id = ?1 AND i.learned = 0
             ORDER BY i.id ASC",
        )?;
        let mut rows = stmt.query(params![folder_id.to_string()])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let item = FolderItem {
                folder_id: parse_folder_id(&row.get::<_, String>(0)?)?,
                card_id: parse_card_id(&row.get::<_, String>(1)?)?,
                learned: row.get(2)?,
                wrong_count: row.get(3)?,
                last_reviewed_at: parse_optional_rfc3339(row.get::<_, Option<String>>(4)?)?,
            };
            let card = read_card_at(row, 5)?;
            items.push((item, card));
        }
        Ok(items)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn has_folder_item(&self, folder_id: FolderId, card_id: CardId) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM srs_folder_items WHERE folder_id = ?1 AND card_id = ?2",
                params![folder_id.to_string(), card_id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn unlearned_count(&self, folder_id: FolderId) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM srs_folder_items WHERE folder_id = ?1 AND learned = 0",
            params![folder_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_folder_alarm(
        &mut self,
        folder_id: FolderId,
        next_alarm_at: Option<OffsetDateTime>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE srs_folders SET next_alarm_at = ?1 WHERE folder_id = ?2",
                params![next_alarm_at.map(rfc3339).transpose()?, folder_id.to_string()],
            )
            .context("failed to update folder alarm")?;
        Ok(())
    }

    /// Alarm-active folders on `date` that still hold unlearned items.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn alarm_candidates(&self, date: Date) -> Result<Vec<Folder>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.folder_id, f.user_id, f.parent_id, f.name, f.kind, f.date,
                    f.alarm_active, f.next_alarm_at, f.learning_curve, f.auto_created
             FROM srs_folders f
             WHERE f.date = ?1 AND f.alarm_active = 1
               AND EXISTS (
                 SELECT 1 FROM srs_folder_items i
                 WHERE i.folder_id = f.folder_id AND i.learned = 0
               )
             ORDER BY f.folder_id ASC",
        )?;
        let mut rows = stmt.query(params![date_string(date)?])?;
        let mut folders = Vec::new();
        while let Some(row) = rows.next()? {
            folders.push(read_folder(row)?);
        }
        Ok(folders)
    }

    /// Clear `next_alarm_at` for every folder dated `date`.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn mute_alarms_for_date(&mut self, date: Date) -> Result<usize> {
        let muted = self
            .conn
            .execute(
                "UPDATE srs_folders SET next_alarm_at = NULL
                 WHERE date = ?1 AND next_alarm_at IS NOT NULL",
                params![date_string(date)?],
            )
            .context("failed to mute folder alarms")?;
        Ok(muted)
    }

    /// Persist one answer: card state, folder item, wrong-answer entry,
    /// daily stat, and streak commit together or not at all.
    ///
    /// # Errors
    /// Returns an error when any write in the transaction fails; no partial
    /// mutation survives.
    #[allow(clippy::too_many_arguments)]
    pub fn record_answer(
        &mut self,
        card: &Card,
        folder_id: Option<FolderId>,
        correct: bool,
        window: (OffsetDateTime, OffsetDateTime),
        snapshot: &serde_json::Value,
        now: OffsetDateTime,
        today: Date,
    ) -> Result<UserStreakState> {
        let tx = self.conn.transaction().context("failed to start answer transaction")?;

        update_card(&tx, card)?;

        if let Some(folder_id) = folder_id {
            tx.execute(
                "UPDATE srs_folder_items
                 SET learned = ?1, wrong_count = wrong_count + ?2, last_reviewed_at = ?3
                 WHERE folder_id = ?4 AND card_id = ?5",
                params![
                    correct,
                    i64::from(!correct),
                    rfc3339(now)?,
                    folder_id.to_string(),
                    card.id.to_string(),
                ],
            )
            .context("failed to update folder item")?;
        }

        if correct {
            // A correct answer inside an open review window also completes
            // the wrong-answer entry.
            tx.execute(
                "UPDATE wrong_answers SET is_completed = 1, completed_at = ?1
                 WHERE user_id = ?2 AND item_kind = ?3 AND item_id = ?4
                   AND is_completed = 0
                   AND review_window_start <= ?5 AND review_window_end > ?5",
                params![
                    rfc3339(now)?,
                    card.user_id.to_string(),
                    card.item.kind.as_str(),
                    card.item.item_id,
                    rfc3339(now)?,
                ],
            )
            .context("failed to close wrong-answer entry")?;
        } else {
            upsert_wrong_answer(&tx, card.user_id, card.item, window, snapshot, now)?;
        }

        tx.execute(
            "INSERT INTO daily_study_stats(user_id, date, srs_solved, auto_learned, wrong_due_next)
             VALUES (?1, ?2, 1, 0, ?3)
             ON CONFLICT(user_id, date) DO UPDATE SET
               srs_solved = srs_solved + 1,
               wrong_due_next = wrong_due_next + ?3",
            params![card.user_id.to_string(), date_string(today)?, i64::from(!correct)],
        )
        .context("failed to upsert daily stat")?;

        let mut streak = load_streak(&tx, card.user_id)?;
        register_quiz(&mut streak, today);
        save_streak(&tx, &streak)?;

        tx.commit().context("failed to commit answer transaction")?;
        tracing::debug!(
            card = %card.id,
            correct,
            stage = card.stage,
            "answer recorded"
        );
        Ok(streak)
    }

    /// Complete the open wrong-answer entry for (user, item) when `now` lies
    /// inside its review window. Outside the window nothing is mutated.
    ///
    /// # Errors
    /// Returns an error when lookup or the update fails.
    pub fn complete_wrong_answer(
        &mut self,
        user_id: UserId,
        item: ItemRef,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let tx = self.conn.transaction().context("failed to start completion transaction")?;
        let updated = tx
            .execute(
                "UPDATE wrong_answers SET is_completed = 1, completed_at = ?1
                 WHERE user_id = ?2 AND item_kind = ?3 AND item_id = ?4
                   AND is_completed = 0
                   AND review_window_start <= ?5 AND review_window_end > ?5",
                params![
                    rfc3339(now)?,
                    user_id.to_string(),
                    item.kind.as_str(),
                    item.item_id,
                    rfc3339(now)?,
                ],
            )
            .context("failed to complete wrong-answer entry")?;
        tx.commit().context("failed to commit completion transaction")?;
        Ok(updated > 0)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_wrong_answers(
        &self,
        user_id: UserId,
        include_completed: bool,
    ) -> Result<Vec<WrongAnswerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT wrong_answer_id, user_id, item_kind, item_id, attempts, wrong_at,
                    review_window_start, review_window_end, is_completed, completed_at,
                    snapshot_json
             FROM wrong_answers
             WHERE user_id = ?1 AND (?2 OR is_completed = 0)
             ORDER BY is_completed ASC, wrong_at DESC",
        )?;
        let mut rows = stmt.query(params![user_id.to_string(), include_completed])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(read_wrong_answer(row)?);
        }
        Ok(entries)
    }

    /// Open entries ordered oldest-`wrong_at`-first, for quiz fairness.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn oldest_open_wrong_answers(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<WrongAnswerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT wrong_answer_id, user_id, item_kind, item_id, attempts, wrong_at,
                    review_window_start, review_window_end, is_completed, completed_at,
                    snapshot_json
             FROM wrong_answers
             WHERE user_id = ?1 AND is_completed = 0
             ORDER BY wrong_at ASC
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![user_id.to_string(), i64::try_from(limit).unwrap_or(i64::MAX)])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(read_wrong_answer(row)?);
        }
        Ok(entries)
    }

    /// Force-complete open entries whose window ended before `cutoff`,
    /// bounding unbounded growth.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn expire_wrong_answers(&mut self, cutoff: OffsetDateTime, now: OffsetDateTime) -> Result<usize> {
        let expired = self
            .conn
            .execute(
                "UPDATE wrong_answers SET is_completed = 1, completed_at = ?1
                 WHERE is_completed = 0 AND review_window_end < ?2",
                params![rfc3339(now)?, rfc3339(cutoff)?],
            )
            .context("failed to expire wrong-answer windows")?;
        Ok(expired)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_streak(&self, user_id: UserId) -> Result<UserStreakState> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, streak, daily_quiz_count, last_quiz_date, streak_updated_at
             FROM user_streaks WHERE user_id = ?1",
        )?;
        let mut rows = stmt.query(params![user_id.to_string()])?;
        match rows.next()? {
            Some(row) => read_streak(row),
            None => Ok(UserStreakState::new(user_id)),
        }
    }

    /// Apply the midnight rollup to one user's streak row.
    ///
    /// # Errors
    /// Returns an error when the read-modify-write transaction fails.
    pub fn rollup_user_streak(
        &mut self,
        user_id: UserId,
        yesterday: Date,
        learned: u32,
        unlearned: u32,
    ) -> Result<UserStreakState> {
        let tx = self.conn.transaction().context("failed to start rollup transaction")?;
        let mut streak = load_streak(&tx, user_id)?;
        rollup_streak(&mut streak, yesterday, learned, unlearned);
        save_streak(&tx, &streak)?;
        tx.commit().context("failed to commit rollup transaction")?;
        Ok(streak)
    }

    /// Users owning folders dated `date`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn users_with_folders_on(&self, date: Date) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT user_id FROM srs_folders WHERE date = ?1 ORDER BY user_id")?;
        let mut rows = stmt.query(params![date_string(date)?])?;
        let mut users = Vec::new();
        while let Some(row) = rows.next()? {
            users.push(parse_user_id(&row.get::<_, String>(0)?)?);
        }
        Ok(users)
    }

    /// (learned, unlearned) folder-item counts across one user's folders on
    /// `date`.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn folder_learning_counts(&self, user_id: UserId, date: Date) -> Result<(u32, u32)> {
        let (learned, unlearned): (i64, i64) = self.conn.query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN i.learned = 1 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN i.learned = 0 THEN 1 ELSE 0 END), 0)
             FROM srs_folder_items i
             JOIN srs_folders f ON f.folder_id = i.folder_id
             WHERE f.user_id = ?1 AND f.date = ?2",
            params![user_id.to_string(), date_string(date)?],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((u32::try_from(learned).unwrap_or(0), u32::try_from(unlearned).unwrap_or(0)))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get_daily_stat(&self, user_id: UserId, date: Date) -> Result<Option<DailyStudyStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, date, srs_solved, auto_learned, wrong_due_next
             FROM daily_study_stats WHERE user_id = ?1 AND date = ?2",
        )?;
        let mut rows = stmt.query(params![user_id.to_string(), date_string(date)?])?;
        match rows.next()? {
            Some(row) => Ok(Some(DailyStudyStat {
                user_id: parse_user_id(&row.get::<_, String>(0)?)?,
                date: parse_date(&row.get::<_, String>(1)?)?,
                srs_solved: row.get(2)?,
                auto_learned: row.get(3)?,
                wrong_due_next: row.get(4)?,
            })),
            None => Ok(None),
        }
    }

    /// One sweep pass over all three timer classes, in one transaction.
    ///
    /// # Errors
    /// Returns an error when candidate reads or updates fail.
    pub fn sweep_overdue(&mut self, clock: &Clock, now: OffsetDateTime) -> Result<SweepCounts> {
        let tx = self.conn.transaction().context("failed to start sweep transaction")?;
        let candidates = timer_candidates(
            &tx,
            "(c.waiting_until IS NOT NULL AND c.waiting_until <= ?1 AND c.is_overdue = 0
               AND c.frozen_until IS NULL AND c.is_mastered = 0)
             OR (c.is_overdue = 1 AND c.overdue_deadline IS NOT NULL AND c.overdue_deadline <= ?1)
             OR (c.frozen_until IS NOT NULL AND c.frozen_until <= ?1)",
            now,
        )?;

        let mut counts = SweepCounts::default();
        for (card, curve) in &candidates {
            match sweep_action(card, *curve, clock, now) {
                Some(SweepAction::Promote { deadline }) => {
                    tx.execute(
                        "UPDATE srs_cards SET
                           is_overdue = 1, overdue_start_at = ?1, overdue_deadline = ?2,
                           waiting_until = NULL
                         WHERE card_id = ?3",
                        params![rfc3339(now)?, rfc3339(deadline)?, card.id.to_string()],
                    )
                    .context("failed to promote card to overdue")?;
                    counts.promoted += 1;
                }
                Some(SweepAction::Freeze { frozen_until }) => {
                    tx.execute(
                        "UPDATE srs_cards SET
                           is_overdue = 0, overdue_start_at = NULL, overdue_deadline = NULL,
                           frozen_until = ?1
                         WHERE card_id = ?2",
                        params![rfc3339(frozen_until)?, card.id.to_string()],
                    )
                    .context("failed to freeze card")?;
                    counts.frozen += 1;
                }
                Some(SweepAction::Thaw { deadline }) => {
                    tx.execute(
                        "UPDATE srs_cards SET
                           frozen_until = NULL, is_overdue = 1,
                           overdue_start_at = ?1, overdue_deadline = ?2
                         WHERE card_id = ?3",
                        params![rfc3339(now)?, rfc3339(deadline)?, card.id.to_string()],
                    )
                    .context("failed to thaw card")?;
                    counts.thawed += 1;
                }
                None => {}
            }
        }

        tx.commit().context("failed to commit sweep transaction")?;
        if counts != SweepCounts::default() {
            tracing::info!(
                promoted = counts.promoted,
                frozen = counts.frozen,
                thawed = counts.thawed,
                "overdue sweep applied"
            );
        }
        Ok(counts)
    }

    /// Rescale every pending timer against the clock's current factor.
    /// Runs to completion inside one transaction; idempotent for a fixed
    /// `now`.
    ///
    /// # Errors
    /// Returns an error when candidate reads or updates fail.
    pub fn recalculate_active_timers(
        &mut self,
        clock: &Clock,
        now: OffsetDateTime,
    ) -> Result<RecalcCounts> {
        let tx = self.conn.transaction().context("failed to start recalculation transaction")?;
        let candidates = timer_candidates(
            &tx,
            "(c.waiting_until IS NOT NULL AND c.waiting_until > ?1 AND c.is_overdue = 0
               AND c.frozen_until IS NULL)
             OR (c.is_overdue = 1 AND c.overdue_deadline IS NOT NULL AND c.overdue_deadline > ?1)
             OR (c.frozen_until IS NOT NULL AND c.frozen_until > ?1)",
            now,
        )?;

        let mut counts = RecalcCounts::default();
        for (card, curve) in &candidates {
            let Some(update) = recalculate_card(card, *curve, clock, now) else {
                continue;
            };
            tx.execute(
                "UPDATE srs_cards SET
                   waiting_until = ?1, next_review_at = ?2,
                   overdue_start_at = ?3, overdue_deadline = ?4, frozen_until = ?5
                 WHERE card_id = ?6",
                params![
                    update.waiting_until.map(rfc3339).transpose()?,
                    update.next_review_at.map(rfc3339).transpose()?,
                    update.overdue_start_at.map(rfc3339).transpose()?,
                    update.overdue_deadline.map(rfc3339).transpose()?,
                    update.frozen_until.map(rfc3339).transpose()?,
                    card.id.to_string(),
                ],
            )
            .context("failed to rescale card timers")?;
            match update.class {
                srs_kernel_core::TimerClass::Waiting => counts.waiting += 1,
                srs_kernel_core::TimerClass::Overdue => counts.overdue += 1,
                srs_kernel_core::TimerClass::Frozen => counts.frozen += 1,
            }
        }

        tx.commit().context("failed to commit recalculation transaction")?;
        tracing::info!(
            waiting = counts.waiting,
            overdue = counts.overdue,
            frozen = counts.frozen,
            "active timers recalculated"
        );
        Ok(counts)
    }

    /// Dashboard counts for one user at `now`.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn srs_status(&self, user_id: UserId, now: OffsetDateTime) -> Result<SrsStatusCounts> {
        let now_text = rfc3339(now)?;
        let (reviewable, waiting, total, mastered): (i64, i64, i64, i64) = self.conn.query_row(
            "SELECT
               COALESCE(SUM(CASE WHEN is_overdue = 1 AND overdue_deadline > ?2 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(CASE WHEN is_overdue = 0 AND waiting_until > ?2 THEN 1 ELSE 0 END), 0),
               COUNT(*),
               COALESCE(SUM(CASE WHEN is_mastered = 1 THEN 1 ELSE 0 END), 0)
             FROM srs_cards WHERE user_id = ?1",
            params![user_id.to_string(), now_text],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(SrsStatusCounts {
            reviewable: usize::try_from(reviewable).unwrap_or(0),
            waiting: usize::try_from(waiting).unwrap_or(0),
            total: usize::try_from(total).unwrap_or(0),
            mastered: usize::try_from(mastered).unwrap_or(0),
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, rfc3339(OffsetDateTime::now_utc())?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn rfc3339(at: OffsetDateTime) -> Result<String> {
    // Whole-second precision keeps stored strings lexicographically ordered,
    // which every SQL timestamp comparison in this store relies on.
    let at = at.replace_nanosecond(0).unwrap_or(at);
    at.format(&Rfc3339).context("failed to format timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid timestamp in store: {value}"))
}

fn parse_optional_rfc3339(value: Option<String>) -> Result<Option<OffsetDateTime>> {
    value.as_deref().map(parse_rfc3339).transpose()
}

fn date_string(date: Date) -> Result<String> {
    date.format(format_description!("[year]-[month]-[day]"))
        .context("failed to format date")
}

fn parse_date(value: &str) -> Result<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .with_context(|| format!("invalid date in store: {value}"))
}

fn parse_optional_date(value: Option<String>) -> Result<Option<Date>> {
    value.as_deref().map(parse_date).transpose()
}

fn parse_ulid(value: &str) -> Result<Ulid> {
    Ulid::from_str(value).with_context(|| format!("invalid ulid in store: {value}"))
}

fn parse_user_id(value: &str) -> Result<UserId> {
    Ok(UserId(parse_ulid(value)?))
}

fn parse_card_id(value: &str) -> Result<CardId> {
    Ok(CardId(parse_ulid(value)?))
}

fn parse_folder_id(value: &str) -> Result<FolderId> {
    Ok(FolderId(parse_ulid(value)?))
}

fn parse_item(kind: &str, item_id: i64) -> Result<ItemRef> {
    let kind = ItemKind::parse(kind).ok_or_else(|| anyhow!("unknown item kind: {kind}"))?;
    Ok(ItemRef { kind, item_id })
}

fn read_card(row: &Row<'_>) -> Result<Card> {
    read_card_at(row, 0)
}

fn read_card_at(row: &Row<'_>, base: usize) -> Result<Card> {
    let kind: String = row.get(base + 2)?;
    Ok(Card {
        id: parse_card_id(&row.get::<_, String>(base)?)?,
        user_id: parse_user_id(&row.get::<_, String>(base + 1)?)?,
        item: parse_item(&kind, row.get(base + 3)?)?,
        stage: row.get(base + 4)?,
        correct_total: row.get(base + 5)?,
        wrong_total: row.get(base + 6)?,
        waiting_until: parse_optional_rfc3339(row.get(base + 7)?)?,
        next_review_at: parse_optional_rfc3339(row.get(base + 8)?)?,
        is_overdue: row.get(base + 9)?,
        overdue_start_at: parse_optional_rfc3339(row.get(base + 10)?)?,
        overdue_deadline: parse_optional_rfc3339(row.get(base + 11)?)?,
        frozen_until: parse_optional_rfc3339(row.get(base + 12)?)?,
        is_from_wrong_answer: row.get(base + 13)?,
        is_mastered: row.get(base + 14)?,
        master_cycles: row.get(base + 15)?,
        folder_id: row
            .get::<_, Option<String>>(base + 16)?
            .as_deref()
            .map(parse_folder_id)
            .transpose()?,
    })
}

fn read_folder(row: &Row<'_>) -> Result<Folder> {
    let kind: String = row.get(4)?;
    let curve: String = row.get(8)?;
    Ok(Folder {
        id: parse_folder_id(&row.get::<_, String>(0)?)?,
        user_id: parse_user_id(&row.get::<_, String>(1)?)?,
        parent_id: row.get::<_, Option<String>>(2)?.as_deref().map(parse_folder_id).transpose()?,
        name: row.get(3)?,
        kind: FolderKind::parse(&kind).ok_or_else(|| anyhow!("unknown folder kind: {kind}"))?,
        date: parse_date(&row.get::<_, String>(5)?)?,
        alarm_active: row.get(6)?,
        next_alarm_at: parse_optional_rfc3339(row.get(7)?)?,
        learning_curve: LearningCurve::parse(&curve)
            .ok_or_else(|| anyhow!("unknown learning curve: {curve}"))?,
        auto_created: row.get(9)?,
    })
}

fn read_wrong_answer(row: &Row<'_>) -> Result<WrongAnswerEntry> {
    let kind: String = row.get(2)?;
    let snapshot_json: String = row.get(10)?;
    Ok(WrongAnswerEntry {
        id: WrongAnswerId(parse_ulid(&row.get::<_, String>(0)?)?),
        user_id: parse_user_id(&row.get::<_, String>(1)?)?,
        item: parse_item(&kind, row.get(3)?)?,
        attempts: row.get(4)?,
        wrong_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
        review_window_start: parse_rfc3339(&row.get::<_, String>(6)?)?,
        review_window_end: parse_rfc3339(&row.get::<_, String>(7)?)?,
        is_completed: row.get(8)?,
        completed_at: parse_optional_rfc3339(row.get(9)?)?,
        snapshot: serde_json::from_str(&snapshot_json)
            .context("failed to deserialize wrong-answer snapshot")?,
    })
}

fn read_streak(row: &Row<'_>) -> Result<UserStreakState> {
    Ok(UserStreakState {
        user_id: parse_user_id(&row.get::<_, String>(0)?)?,
        streak: row.get(1)?,
        daily_quiz_count: row.get(2)?,
        last_quiz_date: parse_optional_date(row.get(3)?)?,
        streak_updated_at: parse_optional_date(row.get(4)?)?,
    })
}

fn find_card_by_item(tx: &Transaction<'_>, user_id: UserId, item: ItemRef) -> Result<Option<Card>> {
    let mut stmt = tx.prepare(&format!(
        "SELECT {CARD_COLUMNS} FROM srs_cards
         WHERE user_id = ?1 AND item_kind = ?2 AND item_id = ?3"
    ))?;
    let mut rows = stmt.query(params![user_id.to_string(), item.kind.as_str(), item.item_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_card(row)?)),
        None => Ok(None),
    }
}

fn insert_card(tx: &Transaction<'_>, card: &Card) -> Result<()> {
    tx.execute(
        "INSERT INTO srs_cards(
            card_id, user_id, item_kind, item_id, stage, correct_total, wrong_total,
            waiting_until, next_review_at, is_overdue, overdue_start_at, overdue_deadline,
            frozen_until, is_from_wrong_answer, is_mastered, master_cycles, folder_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            card.id.to_string(),
            card.user_id.to_string(),
            card.item.kind.as_str(),
            card.item.item_id,
            card.stage,
            card.correct_total,
            card.wrong_total,
            card.waiting_until.map(rfc3339).transpose()?,
            card.next_review_at.map(rfc3339).transpose()?,
            card.is_overdue,
            card.overdue_start_at.map(rfc3339).transpose()?,
            card.overdue_deadline.map(rfc3339).transpose()?,
            card.frozen_until.map(rfc3339).transpose()?,
            card.is_from_wrong_answer,
            card.is_mastered,
            card.master_cycles,
            card.folder_id.map(|id| id.to_string()),
        ],
    )
    .context("failed to insert card")?;
    Ok(())
}

fn update_card(tx: &Transaction<'_>, card: &Card) -> Result<()> {
    tx.execute(
        "UPDATE srs_cards SET
            stage = ?1, correct_total = ?2, wrong_total = ?3, waiting_until = ?4,
            next_review_at = ?5, is_overdue = ?6, overdue_start_at = ?7, overdue_deadline = ?8,
            frozen_until = ?9, is_from_wrong_answer = ?10, is_mastered = ?11,
            master_cycles = ?12, folder_id = ?13
         WHERE card_id = ?14",
        params![
            card.stage,
            card.correct_total,
            card.wrong_total,
            card.waiting_until.map(rfc3339).transpose()?,
            card.next_review_at.map(rfc3339).transpose()?,
            card.is_overdue,
            card.overdue_start_at.map(rfc3339).transpose()?,
            card.overdue_deadline.map(rfc3339).transpose()?,
            card.frozen_until.map(rfc3339).transpose()?,
            card.is_from_wrong_answer,
            card.is_mastered,
            card.master_cycles,
            card.folder_id.map(|id| id.to_string()),
            card.id.to_string(),
        ],
    )
    .context("failed to update card")?;
    Ok(())
}

fn upsert_wrong_answer(
    tx: &Transaction<'_>,
    user_id: UserId,
    item: ItemRef,
    window: (OffsetDateTime, OffsetDateTime),
    snapshot: &serde_json::Value,
    now: OffsetDateTime,
) -> Result<()> {
    let existing: Option<String> = tx
        .query_row(
            "SELECT wrong_answer_id FROM wrong_answers
             WHERE user_id = ?1 AND item_kind = ?2 AND item_id = ?3 AND is_completed = 0",
            params![user_id.to_string(), item.kind.as_str(), item.item_id],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(id) => {
            tx.execute(
                "UPDATE wrong_answers SET
                   attempts = attempts + 1, wrong_at = ?1,
                   review_window_start = ?2, review_window_end = ?3, snapshot_json = ?4
                 WHERE wrong_answer_id = ?5",
                params![
                    rfc3339(now)?,
                    rfc3339(window.0)?,
                    rfc3339(window.1)?,
                    serde_json::to_string(snapshot)
                        .context("failed to serialize wrong-answer snapshot")?,
                    id,
                ],
            )
            .context("failed to refresh wrong-answer entry")?;
        }
        None => {
            tx.execute(
                "INSERT INTO wrong_answers(
                    wrong_answer_id, user_id, item_kind, item_id, attempts, wrong_at,
                    review_window_start, review_window_end, is_completed, snapshot_json
                ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, 0, ?8)",
                params![
                    WrongAnswerId::new().to_string(),
                    user_id.to_string(),
                    item.kind.as_str(),
                    item.item_id,
                    rfc3339(now)?,
                    rfc3339(window.0)?,
                    rfc3339(window.1)?,
                    serde_json::to_string(snapshot)
                        .context("failed to serialize wrong-answer snapshot")?,
                ],
            )
            .context("failed to insert wrong-answer entry")?;
        }
    }
    Ok(())
}

fn load_streak(tx: &Transaction<'_>, user_id: UserId) -> Result<UserStreakState> {
    let mut stmt = tx.prepare(
        "SELECT user_id, streak, daily_quiz_count, last_quiz_date, streak_updated_at
         FROM user_streaks WHERE user_id = ?1",
    )?;
    let mut rows = stmt.query(params![user_id.to_string()])?;
    match rows.next()? {
        Some(row) => read_streak(row),
        None => Ok(UserStreakState::new(user_id)),
    }
}

fn save_streak(tx: &Transaction<'_>, streak: &UserStreakState) -> Result<()> {
    tx.execute(
        "INSERT INTO user_streaks(user_id, streak, daily_quiz_count, last_quiz_date, streak_updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id) DO UPDATE SET
           streak = excluded.streak,
           daily_quiz_count = excluded.daily_quiz_count,
           last_quiz_date = excluded.last_quiz_date,
           streak_updated_at = excluded.streak_updated_at",
        params![
            streak.user_id.to_string(),
            streak.streak,
            streak.daily_quiz_count,
            streak.last_quiz_date.map(date_string).transpose()?,
            streak.streak_updated_at.map(date_string).transpose()?,
        ],
    )
    .context("failed to save streak state")?;
    Ok(())
}

/// Candidate cards for sweep/recalculation, each joined with its folder's
/// learning curve (cards outside any folder use the forgetting curve).
fn timer_candidates(
    tx: &Transaction<'_>,
    predicate: &str,
    now: OffsetDateTime,
) -> Result<Vec<(Card, LearningCurve)>> {
    let sql = format!(
        "SELECT c.card_id, c.user_id, c.item_kind, c.item_id, c.stage, c.correct_total,
                c.wrong_total, c.waiting_until, c.next_review_at, c.is_overdue,
                c.overdue_start_at, c.overdue_deadline, c.frozen_until, c.is_from_wrong_answer,
                c.is_mastered, c.master_cycles, c.folder_id, f.learning_curve
         FROM srs_cards c
         LEFT JOIN srs_folders f ON f.folder_id = c.folder_id
         WHERE {predicate}
         ORDER BY c.card_id ASC"
    );
    let mut stmt = tx.prepare(&sql)?;
    let mut rows = stmt.query(params![rfc3339(now)?])?;
    let mut candidates = Vec::new();
    while let Some(row) = rows.next()? {
        let card = read_card(row)?;
        let curve = match row.get::<_, Option<String>>(17)? {
            Some(curve) => LearningCurve::parse(&curve)
                .ok_or_else(|| anyhow!("unknown learning curve: {curve}"))?,
            None => LearningCurve::ForgettingCurve,
        };
        candidates.push((card, curve));
    }
    Ok(candidates)
}

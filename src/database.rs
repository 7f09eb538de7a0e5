use crate::services::Persistence;
use crate::types::{
    Game, GameStatus, Lottery, LotteryStatus, RewardClaim, RewardType, UserSet,
};
use crate::utils::{from_millis, lock, to_millis};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result, Row, params, params_from_iter};
use std::sync::{Arc, Mutex};

pub fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS quiz_lotteries (
            lottery_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            allowed_winner_num INTEGER NOT NULL,
            reward_type TEXT NOT NULL,
            reward_amount INTEGER NOT NULL,
            total_quiz_num INTEGER NOT NULL,
            winner_required_correct_quiz_num INTEGER NOT NULL,
            winners TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            ended_at INTEGER,
            deleted_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS quiz_games (
            game_id TEXT PRIMARY KEY,
            lottery_id TEXT NOT NULL,
            guild_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            time_limit_sec INTEGER NOT NULL,
            send_quiz_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            question_description TEXT NOT NULL,
            answer_options TEXT NOT NULL,
            correct_answer_option TEXT NOT NULL,
            participants TEXT,
            winners TEXT,
            question_message_id TEXT,
            answer_message_id TEXT,
            deleted_at INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_quiz_games_lottery ON quiz_games (lottery_id);

        CREATE TABLE IF NOT EXISTS community_quests (
            quest_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            reward_type TEXT NOT NULL,
            reward_amount INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER NOT NULL,
            claimable_duration_hours INTEGER NOT NULL,
            whitelist_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS quest_whitelists (
            whitelist_id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS quest_whitelist_users (
            whitelist_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY (whitelist_id, user_id)
        );",
    )
}

fn invalid(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(column, message, Type::Text)
}

fn users_to_json(users: &UserSet) -> String {
    let mut users: Vec<&String> = users.iter().collect();
    users.sort();
    serde_json::to_string(&users).unwrap_or_else(|_| "[]".to_string())
}

fn users_from_json(column: usize, raw: &str) -> Result<UserSet> {
    serde_json::from_str(raw).map_err(|e| invalid(column, format!("bad user list: {e}")))
}

fn instant(column: usize, millis: i64) -> Result<DateTime<Utc>> {
    from_millis(millis).ok_or_else(|| invalid(column, format!("bad timestamp {millis}")))
}

fn optional_instant(column: usize, millis: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    millis.map(|millis| instant(column, millis)).transpose()
}

const LOTTERY_COLUMNS: &str = "lottery_id, status, allowed_winner_num, reward_type, reward_amount, \
     total_quiz_num, winner_required_correct_quiz_num, winners, created_at, ended_at, deleted_at";

fn lottery_from_row(row: &Row<'_>) -> Result<Lottery> {
    let status: String = row.get(1)?;
    let reward_type: String = row.get(3)?;
    let winners: String = row.get(7)?;
    Ok(Lottery {
        lottery_id: row.get(0)?,
        status: LotteryStatus::parse(&status)
            .ok_or_else(|| invalid(1, format!("unknown lottery status {status}")))?,
        allowed_winner_num: row.get::<_, i64>(2)?.max(0) as usize,
        reward_type: RewardType::parse(&reward_type)
            .ok_or_else(|| invalid(3, format!("unknown reward type {reward_type}")))?,
        reward_amount: row.get(4)?,
        total_quiz_num: row.get::<_, i64>(5)?.max(0) as usize,
        winner_required_correct_quiz_num: row.get::<_, i64>(6)?.max(0) as usize,
        winners: users_from_json(7, &winners)?,
        created_at: instant(8, row.get(8)?)?,
        ended_at: optional_instant(9, row.get(9)?)?,
        deleted_at: optional_instant(10, row.get(10)?)?,
    })
}

const GAME_COLUMNS: &str = "game_id, lottery_id, guild_id, channel_id, time_limit_sec, send_quiz_at, \
     status, question_description, answer_options, correct_answer_option, participants, winners, \
     question_message_id, answer_message_id, deleted_at";

fn game_from_row(row: &Row<'_>) -> Result<Game> {
    let status: String = row.get(6)?;
    let answer_options: String = row.get(8)?;
    let participants: Option<String> = row.get(10)?;
    let winners: Option<String> = row.get(11)?;
    Ok(Game {
        game_id: row.get(0)?,
        lottery_id: row.get(1)?,
        guild_id: row.get(2)?,
        channel_id: row.get(3)?,
        time_limit_sec: row.get::<_, i64>(4)?.max(0) as u64,
        send_quiz_at: instant(5, row.get(5)?)?,
        status: GameStatus::parse(&status)
            .ok_or_else(|| invalid(6, format!("unknown game status {status}")))?,
        question_description: row.get(7)?,
        answer_options: serde_json::from_str(&answer_options)
            .map_err(|e| invalid(8, format!("bad answer options: {e}")))?,
        correct_answer_option: row.get(9)?,
        participants: participants
            .map(|raw| users_from_json(10, &raw))
            .transpose()?,
        winners: winners.map(|raw| users_from_json(11, &raw)).transpose()?,
        question_message_id: row.get(12)?,
        answer_message_id: row.get(13)?,
        deleted_at: optional_instant(14, row.get(14)?)?,
    })
}

/// Inserts a lottery or updates its configuration. Status, winners and
/// `ended_at` are left alone on update.
pub fn save_lottery(conn: &Connection, lottery: &Lottery) -> Result<()> {
    conn.execute(
        "INSERT INTO quiz_lotteries (
            lottery_id, status, allowed_winner_num, reward_type, reward_amount,
            total_quiz_num, winner_required_correct_quiz_num, winners, created_at, ended_at, deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT (lottery_id) DO UPDATE SET
            allowed_winner_num = excluded.allowed_winner_num,
            reward_type = excluded.reward_type,
            reward_amount = excluded.reward_amount,
            total_quiz_num = excluded.total_quiz_num,
            winner_required_correct_quiz_num = excluded.winner_required_correct_quiz_num,
            deleted_at = excluded.deleted_at",
        params![
            lottery.lottery_id,
            lottery.status.as_str(),
            lottery.allowed_winner_num as i64,
            lottery.reward_type.as_str(),
            lottery.reward_amount,
            lottery.total_quiz_num as i64,
            lottery.winner_required_correct_quiz_num as i64,
            users_to_json(&lottery.winners),
            to_millis(lottery.created_at),
            lottery.ended_at.map(to_millis),
            lottery.deleted_at.map(to_millis),
        ],
    )?;
    Ok(())
}

pub fn save_game(conn: &Connection, game: &Game) -> Result<()> {
    let answer_options = serde_json::to_string(&game.answer_options)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    conn.execute(
        "INSERT INTO quiz_games (
            game_id, lottery_id, guild_id, channel_id, time_limit_sec, send_quiz_at, status,
            question_description, answer_options, correct_answer_option, participants, winners,
            question_message_id, answer_message_id, deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        ON CONFLICT (game_id) DO UPDATE SET
            lottery_id = excluded.lottery_id,
            guild_id = excluded.guild_id,
            channel_id = excluded.channel_id,
            time_limit_sec = excluded.time_limit_sec,
            send_quiz_at = excluded.send_quiz_at,
            status = excluded.status,
            question_description = excluded.question_description,
            answer_options = excluded.answer_options,
            correct_answer_option = excluded.correct_answer_option,
            participants = excluded.participants,
            winners = excluded.winners,
            question_message_id = excluded.question_message_id,
            answer_message_id = excluded.answer_message_id,
            deleted_at = excluded.deleted_at",
        params![
            game.game_id,
            game.lottery_id,
            game.guild_id,
            game.channel_id,
            game.time_limit_sec as i64,
            to_millis(game.send_quiz_at),
            game.status.as_str(),
            game.question_description,
            answer_options,
            game.correct_answer_option,
            game.participants.as_ref().map(users_to_json),
            game.winners.as_ref().map(users_to_json),
            game.question_message_id,
            game.answer_message_id,
            game.deleted_at.map(to_millis),
        ],
    )?;
    Ok(())
}

/// Marks the lottery finished and writes its reward quest and whitelist, all
/// or nothing. Safe to repeat.
pub fn finish_lottery(conn: &mut Connection, lottery: &Lottery, claim: &RewardClaim) -> Result<()> {
    let tx = conn.transaction()?;
    save_lottery(&tx, lottery)?;
    tx.execute(
        "UPDATE quiz_lotteries SET
            status = ?2,
            winners = ?3,
            ended_at = ?4,
            total_quiz_num = ?5,
            winner_required_correct_quiz_num = ?6
        WHERE lottery_id = ?1",
        params![
            lottery.lottery_id,
            LotteryStatus::Finished.as_str(),
            users_to_json(&lottery.winners),
            lottery.ended_at.map(to_millis),
            lottery.total_quiz_num as i64,
            lottery.winner_required_correct_quiz_num as i64,
        ],
    )?;

    tx.execute(
        "INSERT OR REPLACE INTO quest_whitelists (whitelist_id, name) VALUES (?1, ?2)",
        (&claim.whitelist_id, &claim.whitelist_name),
    )?;
    tx.execute(
        "DELETE FROM quest_whitelist_users WHERE whitelist_id = ?1",
        [&claim.whitelist_id],
    )?;
    for user_id in &claim.winners {
        tx.execute(
            "INSERT INTO quest_whitelist_users (whitelist_id, user_id) VALUES (?1, ?2)",
            (&claim.whitelist_id, user_id),
        )?;
    }
    tx.execute(
        "INSERT OR REPLACE INTO community_quests (
            quest_id, name, description, reward_type, reward_amount,
            start_time, end_time, claimable_duration_hours, whitelist_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            claim.quest_id,
            claim.quest_name,
            claim.quest_description,
            claim.reward_type.as_str(),
            claim.reward_amount,
            to_millis(claim.start_time),
            to_millis(claim.end_time),
            claim.claimable_duration_hours as i64,
            claim.whitelist_id,
        ],
    )?;
    tx.commit()
}

pub fn select_unfinished_lotteries(conn: &Connection) -> Result<Vec<Lottery>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOTTERY_COLUMNS} FROM quiz_lotteries
         WHERE status != ?1 AND deleted_at IS NULL
         ORDER BY created_at"
    ))?;
    let lottery_iter = stmt.query_map([LotteryStatus::Finished.as_str()], lottery_from_row)?;

    let mut lotteries = Vec::new();
    for lottery in lottery_iter {
        lotteries.push(lottery?);
    }
    Ok(lotteries)
}

pub fn select_games_by_lottery_ids(conn: &Connection, lottery_ids: &[String]) -> Result<Vec<Game>> {
    if lottery_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = (1..=lottery_ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {GAME_COLUMNS} FROM quiz_games
         WHERE lottery_id IN ({placeholders}) AND deleted_at IS NULL
         ORDER BY send_quiz_at"
    ))?;
    let game_iter = stmt.query_map(params_from_iter(lottery_ids.iter()), game_from_row)?;

    let mut games = Vec::new();
    for game in game_iter {
        games.push(game?);
    }
    Ok(games)
}

pub fn select_lottery(conn: &Connection, lottery_id: &str) -> Result<Option<Lottery>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {LOTTERY_COLUMNS} FROM quiz_lotteries WHERE lottery_id = ?1"
    ))?;
    stmt.query_row([lottery_id], lottery_from_row).optional()
}

pub fn select_game(conn: &Connection, game_id: &str) -> Result<Option<Game>> {
    let mut stmt = conn.prepare(&format!("SELECT {GAME_COLUMNS} FROM quiz_games WHERE game_id = ?1"))?;
    stmt.query_row([game_id], game_from_row).optional()
}

/// [`Persistence`] over one SQLite connection. Queries run on the blocking pool.
#[derive(Clone)]
pub struct SqlitePersistence {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open(database_url: &str) -> anyhow::Result<Self> {
        Ok(Self::new(crate::connection::conn(database_url)?))
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(crate::connection::in_memory()?))
    }

    async fn with_conn<T, F>(&self, query: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn);
            query(&mut conn)
        })
        .await?;
        Ok(result?)
    }
}

impl Persistence for SqlitePersistence {
    async fn save_lottery(&self, lottery: &Lottery) -> anyhow::Result<()> {
        let lottery = lottery.clone();
        self.with_conn(move |conn| save_lottery(conn, &lottery)).await
    }

    async fn save_game(&self, game: &Game) -> anyhow::Result<()> {
        let game = game.clone();
        self.with_conn(move |conn| save_game(conn, &game)).await
    }

    async fn finish_lottery(&self, lottery: &Lottery, claim: &RewardClaim) -> anyhow::Result<()> {
        let lottery = lottery.clone();
        let claim = claim.clone();
        self.with_conn(move |conn| finish_lottery(conn, &lottery, &claim))
            .await
    }

    async fn select_unfinished_lotteries(&self) -> anyhow::Result<Vec<Lottery>> {
        self.with_conn(|conn| select_unfinished_lotteries(conn)).await
    }

    async fn select_games_by_lottery_ids(&self, lottery_ids: &[String]) -> anyhow::Result<Vec<Game>> {
        let lottery_ids = lottery_ids.to_vec();
        self.with_conn(move |conn| select_games_by_lottery_ids(conn, &lottery_ids))
            .await
    }

    async fn select_lottery(&self, lottery_id: &str) -> anyhow::Result<Option<Lottery>> {
        let lottery_id = lottery_id.to_string();
        self.with_conn(move |conn| select_lottery(conn, &lottery_id)).await
    }

    async fn select_game(&self, game_id: &str) -> anyhow::Result<Option<Game>> {
        let game_id = game_id.to_string();
        self.with_conn(move |conn| select_game(conn, &game_id)).await
    }
}

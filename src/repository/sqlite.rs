//! SQLite-backed [`AnalysisRepository`].
//! One row per analysed file, its spikes, and one train row per (order, channel).

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use super::{
    AnalysisRepository, Spike, SpikeIndexValue, ThresholdOrientation, Train, TrainIndices, TrainSpikes, TrainTimes,
};
use crate::error::RepositoryError;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS spike_analyses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL UNIQUE,
        sample_rate INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS spikes (
        analysis_id INTEGER NOT NULL REFERENCES spike_analyses(id) ON DELETE CASCADE,
        channel INTEGER NOT NULL,
        sample_index INTEGER NOT NULL,
        value INTEGER NOT NULL,
        time REAL NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_spikes_channel_index
        ON spikes(analysis_id, channel, sample_index);
    CREATE TABLE IF NOT EXISTS trains (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        analysis_id INTEGER NOT NULL REFERENCES spike_analyses(id) ON DELETE CASCADE,
        channel INTEGER NOT NULL,
        train_order INTEGER NOT NULL,
        lower_threshold INTEGER NOT NULL DEFAULT 0,
        upper_threshold INTEGER NOT NULL DEFAULT 0,
        is_lower_left INTEGER NOT NULL DEFAULT 1
    );
    CREATE INDEX IF NOT EXISTS idx_trains_analysis
        ON trains(analysis_id, train_order, channel);";

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let repo = Self::with_connection(conn)?;
        info!(path = %path.display(), "spike analysis database opened");
        Ok(repo)
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, RepositoryError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn analysis_id(conn: &Connection, path: &Path) -> Result<Option<i64>, RepositoryError> {
    let id = conn
        .prepare_cached("SELECT id FROM spike_analyses WHERE file_path = ?1")?
        .query_row(params![path_key(path)], |row| row.get(0))
        .optional()?;
    Ok(id)
}

fn require_analysis(conn: &Connection, path: &Path) -> Result<i64, RepositoryError> {
    analysis_id(conn, path)?.ok_or_else(|| RepositoryError::UnknownAnalysis(path_key(path)))
}

fn trains_for(conn: &Connection, id: i64, channel: Option<u16>) -> Result<Vec<Train>, RepositoryError> {
    let mut stmt = conn.prepare_cached(
        "SELECT train_order, channel, lower_threshold, upper_threshold, is_lower_left
         FROM trains
         WHERE analysis_id = ?1 AND (?2 IS NULL OR channel = ?2)
         ORDER BY train_order, channel",
    )?;
    let trains = stmt
        .query_map(params![id, channel], |row| {
            Ok(Train {
                order: row.get(0)?,
                channel: row.get(1)?,
                lower_threshold: row.get(2)?,
                upper_threshold: row.get(3)?,
                is_lower_left: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(trains)
}

fn train_row(tx: &Transaction<'_>, id: i64, channel: u16, order: u32) -> Result<Train, RepositoryError> {
    tx.prepare_cached(
        "SELECT lower_threshold, upper_threshold, is_lower_left FROM trains
         WHERE analysis_id = ?1 AND channel = ?2 AND train_order = ?3",
    )?
    .query_row(params![id, channel, order], |row| {
        Ok(Train {
            order,
            channel,
            lower_threshold: row.get(0)?,
            upper_threshold: row.get(1)?,
            is_lower_left: row.get(2)?,
        })
    })
    .optional()?
    .ok_or(RepositoryError::UnknownTrain {
        order,
        channel: Some(channel),
    })
}

/// Column of train members, ascending by index.
fn train_members<T, F>(conn: &Connection, id: i64, train: &Train, column: &str, map: F) -> Result<Vec<T>, RepositoryError>
where
    F: Fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let sql = format!(
        "SELECT {column} FROM spikes
         WHERE analysis_id = ?1 AND channel = ?2 AND value BETWEEN ?3 AND ?4
         ORDER BY sample_index"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![id, train.channel, train.lower_threshold, train.upper_threshold],
            |row| map(row),
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

impl AnalysisRepository for SqliteRepository {
    fn spike_analysis_exists(&self, path: &Path) -> Result<bool, RepositoryError> {
        let conn = self.conn.lock();
        Ok(analysis_id(&conn, path)?.is_some())
    }

    fn save_spike_analysis(&self, path: &Path, sample_rate: u32, spikes: &[Spike]) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = match analysis_id(&tx, path)? {
            Some(id) => {
                tx.execute("DELETE FROM spikes WHERE analysis_id = ?1", params![id])?;
                tx.execute(
                    "UPDATE spike_analyses SET sample_rate = ?1 WHERE id = ?2",
                    params![sample_rate, id],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO spike_analyses (file_path, sample_rate) VALUES (?1, ?2)",
                    params![path_key(path), sample_rate],
                )?;
                tx.last_insert_rowid()
            }
        };
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO spikes (analysis_id, channel, sample_index, value, time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for spike in spikes {
                insert.execute(params![id, spike.channel, spike.index as i64, spike.value, spike.time])?;
            }
        }
        tx.commit()?;
        debug!(path = %path.display(), spikes = spikes.len(), "spike analysis saved");
        Ok(())
    }

    fn spikes_for_range(
        &self,
        path: &Path,
        channel: u16,
        start: u64,
        end: u64,
    ) -> Result<Vec<SpikeIndexValue>, RepositoryError> {
        let conn = self.conn.lock();
        let Some(id) = analysis_id(&conn, path)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT sample_index, value FROM spikes
             WHERE analysis_id = ?1 AND channel = ?2 AND sample_index >= ?3 AND sample_index < ?4
             ORDER BY sample_index",
        )?;
        let spikes = stmt
            .query_map(
                params![id, channel, start.min(i64::MAX as u64) as i64, end.min(i64::MAX as u64) as i64],
                |row| {
                    Ok(SpikeIndexValue {
                        index: row.get::<_, i64>(0)? as u64,
                        value: row.get(1)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(spikes)
    }

    fn spikes_by_trains_for_range(
        &self,
        path: &Path,
        channel: u16,
        start: u64,
        end: u64,
    ) -> Result<Vec<TrainSpikes>, RepositoryError> {
        let conn = self.conn.lock();
        let Some(id) = analysis_id(&conn, path)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare_cached(
            "SELECT sample_index, value FROM spikes
             WHERE analysis_id = ?1 AND channel = ?2 AND value BETWEEN ?3 AND ?4
               AND sample_index >= ?5 AND sample_index < ?6
             ORDER BY sample_index",
        )?;
        let (start, end) = (start.min(i64::MAX as u64) as i64, end.min(i64::MAX as u64) as i64);
        trains_for(&conn, id, Some(channel))?
            .into_iter()
            .map(|train| {
                let spikes = stmt
                    .query_map(
                        params![id, channel, train.lower_threshold, train.upper_threshold, start, end],
                        |row| {
                            Ok(SpikeIndexValue {
                                index: row.get::<_, i64>(0)? as u64,
                                value: row.get(1)?,
                            })
                        },
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TrainSpikes {
                    order: train.order,
                    channel,
                    spikes,
                })
            })
            .collect()
    }

    fn spike_analysis_trains(&self, path: &Path) -> Result<Vec<Train>, RepositoryError> {
        let conn = self.conn.lock();
        match analysis_id(&conn, path)? {
            Some(id) => trains_for(&conn, id, None),
            None => Ok(Vec::new()),
        }
    }

    fn spike_analysis_trains_by_channel(&self, path: &Path, channel: u16) -> Result<Vec<Train>, RepositoryError> {
        let conn = self.conn.lock();
        match analysis_id(&conn, path)? {
            Some(id) => trains_for(&conn, id, Some(channel)),
            None => Ok(Vec::new()),
        }
    }

    fn add_spike_analysis_train(&self, path: &Path, channel_count: u16) -> Result<u32, RepositoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = require_analysis(&tx, path)?;
        let order: u32 = tx.query_row(
            "SELECT COUNT(DISTINCT train_order) FROM trains WHERE analysis_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        {
            let mut insert =
                tx.prepare_cached("INSERT INTO trains (analysis_id, channel, train_order) VALUES (?1, ?2, ?3)")?;
            for channel in 0..channel_count.max(1) {
                insert.execute(params![id, channel, order])?;
            }
        }
        tx.commit()?;
        info!(path = %path.display(), order, "spike train added");
        Ok(order)
    }

    fn remove_spike_analysis_train(&self, path: &Path, order: u32) -> Result<(), RepositoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = require_analysis(&tx, path)?;
        let removed = tx.execute(
            "DELETE FROM trains WHERE analysis_id = ?1 AND train_order = ?2",
            params![id, order],
        )?;
        if removed == 0 {
            return Err(RepositoryError::UnknownTrain { order, channel: None });
        }
        tx.execute(
            "UPDATE trains SET train_order = train_order - 1 WHERE analysis_id = ?1 AND train_order > ?2",
            params![id, order],
        )?;
        tx.commit()?;
        info!(path = %path.display(), order, "spike train removed");
        Ok(())
    }

    fn save_spike_analysis_train(
        &self,
        path: &Path,
        channel: u16,
        order: u32,
        orientation: ThresholdOrientation,
        value: i32,
    ) -> Result<Train, RepositoryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = require_analysis(&tx, path)?;
        let train = train_row(&tx, id, channel, order)?.with_threshold(orientation, value);
        tx.execute(
            "UPDATE trains SET lower_threshold = ?1, upper_threshold = ?2, is_lower_left = ?3
             WHERE analysis_id = ?4 AND channel = ?5 AND train_order = ?6",
            params![
                train.lower_threshold,
                train.upper_threshold,
                train.is_lower_left,
                id,
                channel,
                order
            ],
        )?;
        tx.commit()?;
        Ok(train)
    }

    fn spike_times_by_trains(&self, path: &Path) -> Result<Vec<TrainTimes>, RepositoryError> {
        let conn = self.conn.lock();
        let Some(id) = analysis_id(&conn, path)? else {
            return Ok(Vec::new());
        };
        trains_for(&conn, id, None)?
            .into_iter()
            .map(|train| {
                let times = train_members(&conn, id, &train, "time", |row| row.get::<_, f64>(0))?;
                Ok(TrainTimes {
                    order: train.order,
                    channel: train.channel,
                    times,
                })
            })
            .collect()
    }

    fn spike_indices_by_trains(&self, path: &Path) -> Result<Vec<TrainIndices>, RepositoryError> {
        let conn = self.conn.lock();
        let Some(id) = analysis_id(&conn, path)? else {
            return Ok(Vec::new());
        };
        trains_for(&conn, id, None)?
            .into_iter()
            .map(|train| {
                let indices = train_members(&conn, id, &train, "sample_index", |row| {
                    Ok(row.get::<_, i64>(0)? as u64)
                })?;
                Ok(TrainIndices {
                    order: train.order,
                    channel: train.channel,
                    indices,
                })
            })
            .collect()
    }
}

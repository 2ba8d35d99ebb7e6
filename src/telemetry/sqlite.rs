use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};

use super::{TelemetrySink, TrafficResult};

pub struct SqliteTelemetrySink {
    conn: Connection,
}

impl SqliteTelemetrySink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut sink = Self { conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut sink = Self { conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS traffic_results (
              camera_location_id INTEGER NOT NULL,
              timestamp INTEGER NOT NULL,
              cars INTEGER NOT NULL,
              trucks INTEGER NOT NULL,
              people INTEGER NOT NULL,
              PRIMARY KEY (camera_location_id, timestamp)
            );
            "#,
        )?;
        Ok(())
    }

    /// Records for one location with `begin <= timestamp <= end`, oldest first.
    pub fn query_range(
        &self,
        camera_location_id: u64,
        begin: u64,
        end: u64,
    ) -> Result<Vec<TrafficResult>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, cars, trucks, people FROM traffic_results
            WHERE camera_location_id = ?1 AND timestamp BETWEEN ?2 AND ?3
            ORDER BY timestamp ASC
            "#,
        )?;
        let mut rows = stmt.query(params![
            to_i64(camera_location_id)?,
            to_i64(begin)?,
            to_i64(end)?
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let timestamp: i64 = row.get(0)?;
            let cars: u32 = row.get(1)?;
            let trucks: u32 = row.get(2)?;
            let people: u32 = row.get(3)?;
            out.push(TrafficResult {
                timestamp: timestamp as u64,
                camera_location_id,
                number_cars: cars,
                number_trucks: trucks,
                number_people: people,
            });
        }
        Ok(out)
    }
}

impl TelemetrySink for SqliteTelemetrySink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn put(&mut self, result: &TrafficResult) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO traffic_results(camera_location_id, timestamp, cars, trucks, people)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                to_i64(result.camera_location_id)?,
                to_i64(result.timestamp)?,
                result.number_cars,
                result.number_trucks,
                result.number_people
            ],
        )?;
        Ok(())
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {} exceeds i64 range", value))
}

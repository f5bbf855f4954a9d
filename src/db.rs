//! SQLite persistence for the fingerprint index.
//!
//! The in-memory [`FingerprintStore`] is what matching runs against; this
//! module only saves its entries and the track table between runs.

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::hashing::FingerprintHash;
use crate::store::{FingerprintStore, TrackId};

pub fn setup_database(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tracks (
            track_id    INTEGER PRIMARY KEY AUTOINCREMENT,
            filepath    TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fingerprints (
            hash        INTEGER NOT NULL,
            frame       INTEGER NOT NULL,
            track_id    INTEGER NOT NULL,
            FOREIGN KEY (track_id) REFERENCES tracks (track_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_hash ON fingerprints (hash)",
        [],
    )?;
    Ok(())
}

pub fn find_track(conn: &Connection, filepath: &str) -> Result<Option<TrackId>> {
    let mut stmt = conn.prepare_cached("SELECT track_id FROM tracks WHERE filepath = ?1")?;
    let id = stmt
        .query_row(params![filepath], |row| row.get::<usize, i64>(0))
        .optional()?;
    Ok(id.map(|id| TrackId(id as u32)))
}

pub fn insert_track_record(conn: &Connection, filepath: &str) -> Result<TrackId> {
    conn.execute(
        "INSERT INTO tracks (filepath) VALUES (?1)",
        params![filepath],
    )?;
    Ok(TrackId(conn.last_insert_rowid() as u32))
}

pub fn get_track_filepath(conn: &Connection, track: TrackId) -> Result<String> {
    let mut stmt = conn.prepare_cached("SELECT filepath FROM tracks WHERE track_id = ?1")?;
    Ok(stmt.query_row(params![track.0 as i64], |row| row.get(0))?)
}

pub fn list_tracks(conn: &Connection) -> Result<Vec<(TrackId, String)>> {
    let mut stmt = conn.prepare_cached("SELECT track_id, filepath FROM tracks ORDER BY track_id")?;
    let rows = stmt.query_map([], |row| {
        Ok((TrackId(row.get::<usize, i64>(0)? as u32), row.get(1)?))
    })?;
    Ok(rows.collect::<std::result::Result<_, _>>()?)
}

pub fn insert_fingerprints(
    conn: &mut Connection,
    track: TrackId,
    hashes: &[FingerprintHash],
) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt =
            tx.prepare("INSERT INTO fingerprints (hash, frame, track_id) VALUES (?1, ?2, ?3)")?;
        for fingerprint in hashes {
            stmt.execute(params![
                fingerprint.hash as i64,
                fingerprint.frame as i64,
                track.0 as i64
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Rebuilds the in-memory index from every stored fingerprint.
pub fn load_store(conn: &Connection) -> Result<FingerprintStore> {
    let store = FingerprintStore::new();
    let mut stmt = conn.prepare("SELECT hash, frame, track_id FROM fingerprints")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<usize, i64>(0)? as u32,
            row.get::<usize, i64>(1)? as usize,
            TrackId(row.get::<usize, i64>(2)? as u32),
        ))
    })?;

    for row in rows {
        let (hash, frame, track) = row?;
        store.add(track, hash, frame, false);
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn tracks_round_trip() {
        let conn = memory();
        assert_eq!(find_track(&conn, "a.wav").unwrap(), None);

        let a = insert_track_record(&conn, "a.wav").unwrap();
        let b = insert_track_record(&conn, "b.wav").unwrap();
        assert_ne!(a, b);
        assert_eq!(find_track(&conn, "a.wav").unwrap(), Some(a));
        assert_eq!(get_track_filepath(&conn, b).unwrap(), "b.wav");
        assert_eq!(
            list_tracks(&conn).unwrap(),
            vec![(a, "a.wav".to_string()), (b, "b.wav".to_string())]
        );
        assert!(insert_track_record(&conn, "a.wav").is_err());
    }

    #[test]
    fn fingerprints_load_back_per_track() {
        let mut conn = memory();
        let a = insert_track_record(&conn, "a.wav").unwrap();
        let b = insert_track_record(&conn, "b.wav").unwrap();

        let hashes: Vec<FingerprintHash> = (0..50u32)
            .map(|i| FingerprintHash {
                hash: u32::MAX - i % 7,
                frame: i as usize,
                is_variation: false,
            })
            .collect();
        insert_fingerprints(&mut conn, a, &hashes).unwrap();
        insert_fingerprints(&mut conn, b, &hashes[..10]).unwrap();

        let expected = FingerprintStore::new();
        expected.add_batch(a, &hashes);
        expected.add_batch(b, &hashes[..10]);

        let loaded = load_store(&conn).unwrap();
        assert_eq!(loaded.export(), expected.export());
        assert_eq!(loaded.stats().entries, 60);
    }

    #[test]
    fn inserted_fingerprints_are_indexed() {
        let mut conn = memory();
        let track = insert_track_record(&conn, "a.wav").unwrap();
        let hashes = vec![
            FingerprintHash {
                hash: 5,
                frame: 1,
                is_variation: false,
            },
            FingerprintHash {
                hash: 5,
                frame: 9,
                is_variation: false,
            },
        ];
        insert_fingerprints(&mut conn, track, &hashes).unwrap();

        let store = load_store(&conn).unwrap();
        assert_eq!(store.lookup(5).len(), 2);
    }
}

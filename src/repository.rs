//! Persistence collaborator.
//!
//! The engine records face sightings and clip events as side effects and
//! never queries back for reconciliation; everything downstream (tagging,
//! dashboards, cleanup) lives outside this crate. `Repository` is the
//! abstract boundary, with a SQLite implementation for production and an
//! in-memory one for tests.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, Connection};

use crate::detect::UNKNOWN_LABEL;

/// A stored face sighting.
#[derive(Clone, Debug)]
pub struct FaceRecord {
    pub id: i64,
    pub label: String,
    pub image_path: String,
    pub recorded_at: String,
}

pub trait Repository: Send {
    /// Store a face crop with its label; returns the new record id.
    fn save_face(&mut self, jpeg: &[u8], label: &str, recorded_at: DateTime<Local>) -> Result<i64>;

    /// Store an event record, optionally pointing at a clip and thumbnail.
    fn save_event(
        &mut self,
        kind: &str,
        description: &str,
        clip_path: Option<&Path>,
        thumbnail_path: Option<&Path>,
    ) -> Result<i64>;

    /// Face sightings that have not been matched to a known person.
    fn list_untagged_faces(&mut self) -> Result<Vec<FaceRecord>>;

    fn delete_face(&mut self, id: i64) -> Result<()>;
}

// ----------------------------------------------------------------------------
// SQLite implementation
// ----------------------------------------------------------------------------

pub struct SqliteRepository {
    conn: Connection,
    media_dir: PathBuf,
}

impl SqliteRepository {
    pub fn open(db_path: &str, media_dir: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut repo = Self {
            conn,
            media_dir: media_dir.to_path_buf(),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS faces (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              label TEXT NOT NULL,
              image_path TEXT NOT NULL,
              recorded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              kind TEXT NOT NULL,
              description TEXT NOT NULL,
              clip_path TEXT,
              thumbnail_path TEXT,
              recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_faces_label ON faces(label);
            CREATE INDEX IF NOT EXISTS idx_events_recorded ON events(recorded_at);
            "#,
        )?;
        Ok(())
    }
}

impl Repository for SqliteRepository {
    fn save_face(&mut self, jpeg: &[u8], label: &str, recorded_at: DateTime<Local>) -> Result<i64> {
        let faces_dir = self.media_dir.join("faces_seen");
        std::fs::create_dir_all(&faces_dir)
            .map_err(|e| anyhow!("create {}: {}", faces_dir.display(), e))?;

        // Millisecond stamp keeps rapid repeat sightings from colliding.
        let stamp = recorded_at.format("%Y%m%d_%H%M%S%3f");
        let filename = format!("{}_{}.jpg", label, stamp);
        let path = faces_dir.join(&filename);
        std::fs::write(&path, jpeg).map_err(|e| anyhow!("write {}: {}", path.display(), e))?;

        self.conn.execute(
            "INSERT INTO faces(label, image_path, recorded_at) VALUES (?1, ?2, ?3)",
            params![
                label,
                path.to_string_lossy().into_owned(),
                crate::log_stamp(recorded_at)
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn save_event(
        &mut self,
        kind: &str,
        description: &str,
        clip_path: Option<&Path>,
        thumbnail_path: Option<&Path>,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO events(kind, description, clip_path, thumbnail_path, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                kind,
                description,
                clip_path.map(|p| p.to_string_lossy().into_owned()),
                thumbnail_path.map(|p| p.to_string_lossy().into_owned()),
                crate::log_stamp(Local::now())
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn list_untagged_faces(&mut self) -> Result<Vec<FaceRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, label, image_path, recorded_at FROM faces WHERE label = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![UNKNOWN_LABEL], |row| {
            Ok(FaceRecord {
                id: row.get(0)?,
                label: row.get(1)?,
                image_path: row.get(2)?,
                recorded_at: row.get(3)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn delete_face(&mut self, id: i64) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM faces WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(anyhow!("face record {} not found", id));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// In-memory implementation for tests
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct StoredFace {
    pub id: i64,
    pub label: String,
    pub jpeg: Vec<u8>,
    pub recorded_at: DateTime<Local>,
}

#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub id: i64,
    pub kind: String,
    pub description: String,
    pub clip_path: Option<PathBuf>,
    pub thumbnail_path: Option<PathBuf>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    faces: Vec<StoredFace>,
    events: Vec<StoredEvent>,
    next_id: i64,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn faces(&self) -> &[StoredFace] {
        &self.faces
    }

    pub fn events(&self) -> &[StoredEvent] {
        &self.events
    }

    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl Repository for InMemoryRepository {
    fn save_face(&mut self, jpeg: &[u8], label: &str, recorded_at: DateTime<Local>) -> Result<i64> {
        let id = self.allocate_id();
        self.faces.push(StoredFace {
            id,
            label: label.to_string(),
            jpeg: jpeg.to_vec(),
            recorded_at,
        });
        Ok(id)
    }

    fn save_event(
        &mut self,
        kind: &str,
        description: &str,
        clip_path: Option<&Path>,
        thumbnail_path: Option<&Path>,
    ) -> Result<i64> {
        let id = self.allocate_id();
        self.events.push(StoredEvent {
            id,
            kind: kind.to_string(),
            description: description.to_string(),
            clip_path: clip_path.map(Path::to_path_buf),
            thumbnail_path: thumbnail_path.map(Path::to_path_buf),
        });
        Ok(id)
    }

    fn list_untagged_faces(&mut self) -> Result<Vec<FaceRecord>> {
        Ok(self
            .faces
            .iter()
            .filter(|f| f.label == UNKNOWN_LABEL)
            .map(|f| FaceRecord {
                id: f.id,
                label: f.label.clone(),
                image_path: String::new(),
                recorded_at: crate::log_stamp(f.recorded_at),
            })
            .collect())
    }

    fn delete_face(&mut self, id: i64) -> Result<()> {
        let before = self.faces.len();
        self.faces.retain(|f| f.id != id);
        if self.faces.len() == before {
            return Err(anyhow!("face record {} not found", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_round_trips_faces_and_events() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("sentry.db");
        let mut repo = SqliteRepository::open(db_path.to_str().unwrap(), dir.path())?;

        let known = repo.save_face(b"jpegdata", "alice", Local::now())?;
        let unknown = repo.save_face(b"jpegdata", UNKNOWN_LABEL, Local::now())?;
        repo.save_event(
            "periodic",
            "periodic buffer save",
            Some(Path::new("/tmp/clip.mp4")),
            Some(Path::new("/tmp/thumb.jpg")),
        )?;

        let untagged = repo.list_untagged_faces()?;
        assert_eq!(untagged.len(), 1);
        assert_eq!(untagged[0].id, unknown);
        assert_ne!(untagged[0].id, known);

        // The crop landed on disk under faces_seen/.
        assert!(std::path::Path::new(&untagged[0].image_path).exists());

        repo.delete_face(unknown)?;
        assert!(repo.list_untagged_faces()?.is_empty());
        assert!(repo.delete_face(unknown).is_err());

        Ok(())
    }

    #[test]
    fn in_memory_mirrors_the_trait_contract() -> Result<()> {
        let mut repo = InMemoryRepository::new();
        let id = repo.save_face(b"x", UNKNOWN_LABEL, Local::now())?;
        repo.save_event("motion", "movement detected", None, None)?;

        assert_eq!(repo.face_count(), 1);
        assert_eq!(repo.event_count(), 1);
        assert_eq!(repo.list_untagged_faces()?.len(), 1);

        repo.delete_face(id)?;
        assert_eq!(repo.face_count(), 0);
        Ok(())
    }
}

pub const SCHEMA: &str = r#"
-- Image embeddings: one row per photo, replaced in place on re-ingest
CREATE TABLE IF NOT EXISTS embeddings (
    photo_id TEXT PRIMARY KEY,
    vector BLOB NOT NULL,      -- float32 array stored as little-endian bytes
    dim INTEGER NOT NULL,
    model TEXT NOT NULL,
    pretrained TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- Faces: detections from the embedding service with cached library-service
-- metadata. Vectors are never mutated in place; a re-ingest replaces the
-- photo's whole face set.
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id TEXT NOT NULL,
    face_index INTEGER NOT NULL,
    vector BLOB NOT NULL,
    bbox_x1 REAL NOT NULL,     -- pixel corners in display space
    bbox_y1 REAL NOT NULL,
    bbox_x2 REAL NOT NULL,
    bbox_y2 REAL NOT NULL,
    det_score REAL NOT NULL,

    -- Cached library-service fields, maintained by pairing and sync
    marker_id TEXT,
    subject_id TEXT,
    subject_name TEXT,
    subject_name_norm TEXT,    -- canonical form for name-keyed filters

    -- Cached parent-photo info (raw file dimensions, EXIF orientation)
    photo_width INTEGER,
    photo_height INTEGER,
    orientation INTEGER,
    file_id TEXT,

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (photo_id, face_index)
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_subject_norm ON faces(subject_name_norm);
CREATE INDEX IF NOT EXISTS idx_faces_marker ON faces(marker_id);

-- Track which photos completed ingestion (even if 0 faces found)
CREATE TABLE IF NOT EXISTS faces_processed (
    photo_id TEXT PRIMARY KEY,
    face_count INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Idempotent migrations for databases created by older versions. Each
/// statement may fail when the column already exists; callers ignore
/// individual failures.
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE embeddings ADD COLUMN pretrained TEXT NOT NULL DEFAULT ''",
    "ALTER TABLE faces ADD COLUMN subject_name_norm TEXT",
    "ALTER TABLE faces ADD COLUMN file_id TEXT",
];

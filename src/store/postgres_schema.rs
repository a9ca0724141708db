pub const POSTGRES_SCHEMA: &str = r#"
-- PostgreSQL schema for photosense
--
-- Requires the pgvector extension for the native ANN indexes and the
-- unaccent extension for diacritic-insensitive subject comparison.

CREATE EXTENSION IF NOT EXISTS vector;
CREATE EXTENSION IF NOT EXISTS unaccent;

-- Canonical subject-name form at the SQL layer. Must mirror
-- names::normalize_subject: strip accents, lowercase, dashes to spaces,
-- collapse whitespace. Declared IMMUTABLE (with a pinned dictionary) so
-- it can back an expression index.
CREATE OR REPLACE FUNCTION subject_norm(name text) RETURNS text AS $$
    SELECT trim(regexp_replace(lower(unaccent('unaccent', replace(name, '-', ' '))), '\s+', ' ', 'g'))
$$ LANGUAGE SQL IMMUTABLE;

CREATE TABLE IF NOT EXISTS embeddings (
    photo_id TEXT PRIMARY KEY,
    vector vector(768) NOT NULL,
    dim INTEGER NOT NULL,
    model TEXT NOT NULL,
    pretrained TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT NOW()::text
);

CREATE INDEX IF NOT EXISTS idx_embeddings_vector ON embeddings
    USING hnsw (vector vector_cosine_ops) WITH (m = 16, ef_construction = 200);

CREATE TABLE IF NOT EXISTS faces (
    id BIGSERIAL PRIMARY KEY,
    photo_id TEXT NOT NULL,
    face_index INTEGER NOT NULL,
    vector vector(512) NOT NULL,
    bbox_x1 DOUBLE PRECISION NOT NULL,
    bbox_y1 DOUBLE PRECISION NOT NULL,
    bbox_x2 DOUBLE PRECISION NOT NULL,
    bbox_y2 DOUBLE PRECISION NOT NULL,
    det_score REAL NOT NULL,

    marker_id TEXT,
    subject_id TEXT,
    subject_name TEXT,

    photo_width INTEGER,
    photo_height INTEGER,
    orientation INTEGER,
    file_id TEXT,

    created_at TEXT NOT NULL DEFAULT NOW()::text,
    UNIQUE (photo_id, face_index)
);

CREATE INDEX IF NOT EXISTS idx_faces_vector ON faces
    USING hnsw (vector vector_cosine_ops) WITH (m = 16, ef_construction = 200);
CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_subject_norm ON faces (subject_norm(subject_name));
CREATE INDEX IF NOT EXISTS idx_faces_marker ON faces(marker_id);

CREATE TABLE IF NOT EXISTS faces_processed (
    photo_id TEXT PRIMARY KEY,
    face_count BIGINT NOT NULL DEFAULT 0,
    processed_at TEXT NOT NULL DEFAULT NOW()::text
);
"#;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            original_text TEXT NOT NULL,
            translation TEXT,
            added_on INTEGER NOT NULL,
            updated_on INTEGER NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS entries_added_on ON entries(added_on DESC, id);

        CREATE TABLE IF NOT EXISTS entry_stats (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            total_entry_count INTEGER NOT NULL DEFAULT 0,
            learned_entry_count INTEGER NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO entry_stats (id, total_entry_count, learned_entry_count)
        VALUES (1, 0, 0);

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS entries_ai AFTER INSERT ON entries BEGIN
            UPDATE entry_stats
            SET total_entry_count = total_entry_count + 1,
                learned_entry_count = learned_entry_count + new.archived
            WHERE id = 1;
        END;

        CREATE TRIGGER IF NOT EXISTS entries_ad AFTER DELETE ON entries BEGIN
            UPDATE entry_stats
            SET total_entry_count = total_entry_count - 1,
                learned_entry_count = learned_entry_count - old.archived
            WHERE id = 1;
        END;

        CREATE TRIGGER IF NOT EXISTS entries_au_archived AFTER UPDATE OF archived ON entries
        WHEN new.archived != old.archived
        BEGIN
            UPDATE entry_stats
            SET learned_entry_count = learned_entry_count + new.archived - old.archived
            WHERE id = 1;
        END;
        "#,
    )
    .context("applying schema migrations")?;
    Ok(())
}

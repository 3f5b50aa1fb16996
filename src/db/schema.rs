// Database schema types and query helpers

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::Result;
use crate::store::{MediaFilter, MediaItem, MediaMeta, MetaRow, OptionRow, PostRow};

/// Build `(instr(col, ?n) > 0 OR ...)` for needles bound starting at `first_param`.
fn contains_any_clause(column: &str, count: usize, first_param: usize) -> String {
    let parts: Vec<String> = (0..count)
        .map(|i| format!("instr({}, ?{}) > 0", column, first_param + i))
        .collect();
    format!("({})", parts.join(" OR "))
}

// ----- Posts -----

pub fn insert_post(conn: &Connection, title: &str, body: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO posts (title, body) VALUES (?1, ?2)",
        params![title, body],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_post_body(conn: &Connection, id: i64) -> Result<Option<String>> {
    let body = conn
        .query_row("SELECT body FROM posts WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(body)
}

pub fn list_posts_containing(
    conn: &Connection,
    needles: &[String],
    after_id: i64,
    limit: usize,
) -> Result<Vec<PostRow>> {
    if needles.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT id, body FROM posts WHERE id > ?1 AND {} ORDER BY id ASC LIMIT {}",
        contains_any_clause("body", needles.len(), 2),
        limit
    );

    let mut values: Vec<SqlValue> = vec![SqlValue::Integer(after_id)];
    values.extend(needles.iter().map(|n| SqlValue::Text(n.clone())));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(PostRow {
                id: row.get(0)?,
                body: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn update_post_body(conn: &Connection, id: i64, body: &str) -> Result<()> {
    conn.execute(
        "UPDATE posts SET body = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![body, id],
    )?;
    Ok(())
}

// ----- Media -----

pub fn insert_media(conn: &Connection, mime: &str, meta: &MediaMeta) -> Result<i64> {
    conn.execute(
        "INSERT INTO media (file, mime, width, height, sizes) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            meta.file,
            mime,
            meta.width,
            meta.height,
            serde_json::to_string(&meta.sizes)?,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

type MediaRowTuple = (i64, String, String, u32, u32, String);

fn media_from_tuple(t: MediaRowTuple) -> Result<MediaItem> {
    let (id, file, mime, width, height, sizes) = t;
    Ok(MediaItem {
        id,
        mime,
        meta: MediaMeta {
            file,
            width,
            height,
            sizes: serde_json::from_str(&sizes)?,
        },
    })
}

pub fn get_media(conn: &Connection, id: i64) -> Result<Option<MediaItem>> {
    let row: Option<MediaRowTuple> = conn
        .query_row(
            "SELECT id, file, mime, width, height, sizes FROM media WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
        )
        .optional()?;
    row.map(media_from_tuple).transpose()
}

pub fn list_media(conn: &Connection, filter: &MediaFilter) -> Result<Vec<MediaItem>> {
    let mut clauses = vec!["id > ?1".to_string()];
    let mut values: Vec<SqlValue> = vec![SqlValue::Integer(filter.after_id.unwrap_or(0))];

    if let Some(prefix) = &filter.mime_prefix {
        values.push(SqlValue::Text(prefix.clone()));
        clauses.push(format!("substr(mime, 1, length(?{0})) = ?{0}", values.len()));
    }

    for mime in &filter.mime_not_in {
        values.push(SqlValue::Text(mime.clone()));
        clauses.push(format!("mime <> ?{}", values.len()));
    }

    for folder in &filter.path_excludes {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            continue;
        }
        values.push(SqlValue::Text(format!("/{}/", folder)));
        clauses.push(format!("instr('/' || file, ?{}) = 0", values.len()));
    }

    let sql = format!(
        "SELECT id, file, mime, width, height, sizes FROM media WHERE {} ORDER BY id ASC LIMIT {}",
        clauses.join(" AND "),
        filter.limit
    );

    let mut stmt = conn.prepare(&sql)?;
    let tuples = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
        })?
        .collect::<std::result::Result<Vec<MediaRowTuple>, _>>()?;

    tuples.into_iter().map(media_from_tuple).collect()
}

pub fn update_media_meta(conn: &Connection, id: i64, meta: &MediaMeta) -> Result<()> {
    conn.execute(
        "UPDATE media SET file = ?1, width = ?2, height = ?3, sizes = ?4 WHERE id = ?5",
        params![
            meta.file,
            meta.width,
            meta.height,
            serde_json::to_string(&meta.sizes)?,
            id,
        ],
    )?;
    Ok(())
}

pub fn update_media_mime(conn: &Connection, id: i64, mime: &str) -> Result<()> {
    conn.execute("UPDATE media SET mime = ?1 WHERE id = ?2", params![mime, id])?;
    Ok(())
}

// ----- Item meta -----

pub fn insert_item_meta(conn: &Connection, item_id: i64, key: &str, value: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO item_meta (item_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
        params![item_id, key, value],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_item_meta(conn: &Connection, item_id: i64, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT meta_value FROM item_meta WHERE item_id = ?1 AND meta_key = ?2 ORDER BY id ASC LIMIT 1",
            params![item_id, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// Upsert a single-valued meta key.
pub fn set_item_meta(conn: &Connection, item_id: i64, key: &str, value: &str) -> Result<()> {
    let updated = conn.execute(
        "UPDATE item_meta SET meta_value = ?1 WHERE item_id = ?2 AND meta_key = ?3",
        params![value, item_id, key],
    )?;
    if updated == 0 {
        insert_item_meta(conn, item_id, key, value)?;
    }
    Ok(())
}

pub fn delete_item_meta(conn: &Connection, item_id: i64, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM item_meta WHERE item_id = ?1 AND meta_key = ?2",
        params![item_id, key],
    )?;
    Ok(())
}

pub fn get_meta_row(conn: &Connection, row_id: i64) -> Result<Option<MetaRow>> {
    let row = conn
        .query_row(
            "SELECT id, item_id, meta_key, meta_value FROM item_meta WHERE id = ?1",
            params![row_id],
            |row| {
                Ok(MetaRow {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    key: row.get(2)?,
                    value: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn list_meta_containing(
    conn: &Connection,
    needles: &[String],
    after_id: i64,
    limit: usize,
) -> Result<Vec<MetaRow>> {
    if needles.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT id, item_id, meta_key, meta_value FROM item_meta
         WHERE id > ?1 AND {} ORDER BY id ASC LIMIT {}",
        contains_any_clause("meta_value", needles.len(), 2),
        limit
    );

    let mut values: Vec<SqlValue> = vec![SqlValue::Integer(after_id)];
    values.extend(needles.iter().map(|n| SqlValue::Text(n.clone())));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(MetaRow {
                id: row.get(0)?,
                item_id: row.get(1)?,
                key: row.get(2)?,
                value: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub fn update_meta_row(conn: &Connection, row_id: i64, value: &str) -> Result<()> {
    conn.execute(
        "UPDATE item_meta SET meta_value = ?1 WHERE id = ?2",
        params![value, row_id],
    )?;
    Ok(())
}

pub fn list_item_meta_by_key(conn: &Connection, key: &str) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn.prepare(
        "SELECT item_id, meta_value FROM item_meta WHERE meta_key = ?1 ORDER BY item_id ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ----- Options -----

pub fn get_option(conn: &Connection, name: &str) -> Result<Option<String>> {
    let value = conn
        .query_row("SELECT value FROM options WHERE name = ?1", [name], |row| row.get(0))
        .optional()?;
    Ok(value)
}

/// Set an option value (upsert).
pub fn set_option(conn: &Connection, name: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO options (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![name, value],
    )?;
    Ok(())
}

pub fn delete_option(conn: &Connection, name: &str) -> Result<()> {
    conn.execute("DELETE FROM options WHERE name = ?1", [name])?;
    Ok(())
}

/// Compare-and-swap on one option. `expected == None` inserts only when the
/// name is free. Returns whether a row changed.
pub fn swap_option(conn: &Connection, name: &str, expected: Option<&str>, value: &str) -> Result<bool> {
    let changed = match expected {
        None => conn.execute(
            "INSERT INTO options (name, value) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
            params![name, value],
        )?,
        Some(expected) => conn.execute(
            "UPDATE options SET value = ?2 WHERE name = ?1 AND value = ?3",
            params![name, value, expected],
        )?,
    };
    Ok(changed == 1)
}

pub fn delete_option_if(conn: &Connection, name: &str, expected: &str) -> Result<bool> {
    let changed = conn.execute("DELETE FROM options WHERE name = ?1 AND value = ?2", params![name, expected])?;
    Ok(changed == 1)
}

pub fn list_options_containing(
    conn: &Connection,
    needles: &[String],
    after_name: &str,
    limit: usize,
) -> Result<Vec<OptionRow>> {
    if needles.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT name, value FROM options WHERE name > ?1 AND {} ORDER BY name ASC LIMIT {}",
        contains_any_clause("value", needles.len(), 2),
        limit
    );

    let mut values: Vec<SqlValue> = vec![SqlValue::Text(after_name.to_string())];
    values.extend(needles.iter().map(|n| SqlValue::Text(n.clone())));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(OptionRow {
                name: row.get(0)?,
                value: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

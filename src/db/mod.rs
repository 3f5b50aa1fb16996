// Database module: SQLite-backed ContentStore

pub mod migrations;
pub mod schema;

use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;
use crate::store::{ContentStore, MediaFilter, MediaId, MediaItem, MediaMeta, MetaRow, OptionRow, PostRow};

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;

    // Enable WAL mode so readers (status from another process) never block the run
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// ContentStore over a single SQLite connection. Every write is one statement,
/// so each row update is its own transaction.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self { conn: open_db(db_path)? })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

impl ContentStore for SqliteStore {
    fn list_media(&self, filter: &MediaFilter) -> Result<Vec<MediaItem>> {
        schema::list_media(&self.conn, filter)
    }

    fn get_media(&self, id: MediaId) -> Result<Option<MediaItem>> {
        schema::get_media(&self.conn, id)
    }

    fn read_media_meta(&self, id: MediaId) -> Result<Option<MediaMeta>> {
        Ok(schema::get_media(&self.conn, id)?.map(|m| m.meta))
    }

    fn write_media_meta(&self, id: MediaId, meta: &MediaMeta) -> Result<()> {
        schema::update_media_meta(&self.conn, id, meta)
    }

    fn set_media_mime(&self, id: MediaId, mime: &str) -> Result<()> {
        schema::update_media_mime(&self.conn, id, mime)
    }

    fn iter_post_bodies(&self, needles: &[String], after_id: i64, limit: usize) -> Result<Vec<PostRow>> {
        schema::list_posts_containing(&self.conn, needles, after_id, limit)
    }

    fn update_post_body(&self, id: i64, body: &str) -> Result<()> {
        schema::update_post_body(&self.conn, id, body)
    }

    fn get_post_body(&self, id: i64) -> Result<Option<String>> {
        schema::get_post_body(&self.conn, id)
    }

    fn iter_item_meta(&self, needles: &[String], after_id: i64, limit: usize) -> Result<Vec<MetaRow>> {
        schema::list_meta_containing(&self.conn, needles, after_id, limit)
    }

    fn update_item_meta(&self, row_id: i64, value: &str) -> Result<()> {
        schema::update_meta_row(&self.conn, row_id, value)
    }

    fn get_meta_row(&self, row_id: i64) -> Result<Option<MetaRow>> {
        schema::get_meta_row(&self.conn, row_id)
    }

    fn get_item_meta(&self, item_id: MediaId, key: &str) -> Result<Option<String>> {
        schema::get_item_meta(&self.conn, item_id, key)
    }

    fn set_item_meta(&self, item_id: MediaId, key: &str, value: &str) -> Result<()> {
        schema::set_item_meta(&self.conn, item_id, key, value)
    }

    fn delete_item_meta(&self, item_id: MediaId, key: &str) -> Result<()> {
        schema::delete_item_meta(&self.conn, item_id, key)
    }

    fn list_item_meta_by_key(&self, key: &str) -> Result<Vec<(MediaId, String)>> {
        schema::list_item_meta_by_key(&self.conn, key)
    }

    fn iter_options(&self, needles: &[String], after_name: &str, limit: usize) -> Result<Vec<OptionRow>> {
        schema::list_options_containing(&self.conn, needles, after_name, limit)
    }

    fn update_option(&self, name: &str, value: &str) -> Result<()> {
        schema::set_option(&self.conn, name, value)
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        schema::get_option(&self.conn, key)
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        schema::set_option(&self.conn, key, value)
    }

    fn kv_del(&self, key: &str) -> Result<()> {
        schema::delete_option(&self.conn, key)
    }

    fn kv_swap(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool> {
        schema::swap_option(&self.conn, key, expected, value)
    }

    fn kv_del_if(&self, key: &str, expected: &str) -> Result<bool> {
        schema::delete_option_if(&self.conn, key, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use crate::store::SizeVariant;

    fn meta(file: &str) -> MediaMeta {
        let mut sizes = BTreeMap::new();
        sizes.insert(
            "thumbnail".to_string(),
            SizeVariant { file: "pic-150x150.jpg".to_string(), width: 150, height: 150 },
        );
        MediaMeta { file: file.to_string(), width: 800, height: 600, sizes }
    }

    #[test]
    fn test_media_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = schema::insert_media(store.conn(), "image/jpeg", &meta("2024/01/pic.jpg")).unwrap();

        let item = store.get_media(id).unwrap().unwrap();
        assert_eq!(item.mime, "image/jpeg");
        assert_eq!(item.meta.sizes["thumbnail"].file, "pic-150x150.jpg");

        store.set_media_mime(id, "image/webp").unwrap();
        assert_eq!(store.get_media(id).unwrap().unwrap().mime, "image/webp");
    }

    #[test]
    fn test_list_media_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = schema::insert_media(store.conn(), "image/jpeg", &meta("2024/01/a.jpg")).unwrap();
        let _b = schema::insert_media(store.conn(), "image/webp", &meta("2024/01/b.webp")).unwrap();
        let _c = schema::insert_media(store.conn(), "image/png", &meta("private/c.png")).unwrap();
        let _d = schema::insert_media(store.conn(), "application/pdf", &meta("2024/01/d.pdf")).unwrap();
        let e = schema::insert_media(store.conn(), "image/gif", &meta("2024/02/e.gif")).unwrap();

        let filter = MediaFilter {
            mime_prefix: Some("image/".to_string()),
            mime_not_in: vec!["image/webp".to_string()],
            path_excludes: vec!["private".to_string()],
            after_id: None,
            limit: 10,
        };
        let ids: Vec<i64> = store.list_media(&filter).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, e]);

        let after = MediaFilter { after_id: Some(a), ..filter };
        let ids: Vec<i64> = store.list_media(&after).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![e]);
    }

    #[test]
    fn test_post_needle_paging() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p1 = schema::insert_post(store.conn(), "one", "see https://site/a.jpg").unwrap();
        let _p2 = schema::insert_post(store.conn(), "two", "nothing here").unwrap();
        let p3 = schema::insert_post(store.conn(), "three", "https://site/b.jpg").unwrap();

        let needles = vec!["https://site/a.jpg".to_string(), "https://site/b.jpg".to_string()];
        let page = store.iter_post_bodies(&needles, 0, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, p1);

        let page = store.iter_post_bodies(&needles, p1, 10).unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![p3]);

        assert!(store.iter_post_bodies(&[], 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_item_meta_upsert_and_kv() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_item_meta(7, "migrator:status", "pending").unwrap();
        store.set_item_meta(7, "migrator:status", "converted").unwrap();
        assert_eq!(store.get_item_meta(7, "migrator:status").unwrap().as_deref(), Some("converted"));
        assert_eq!(store.list_item_meta_by_key("migrator:status").unwrap().len(), 1);

        store.delete_item_meta(7, "migrator:status").unwrap();
        assert!(store.get_item_meta(7, "migrator:status").unwrap().is_none());

        store.kv_set("k", "v1").unwrap();
        store.kv_set("k", "v2").unwrap();
        assert_eq!(store.kv_get("k").unwrap().as_deref(), Some("v2"));
        store.kv_del("k").unwrap();
        assert!(store.kv_get("k").unwrap().is_none());
    }

    #[test]
    fn test_kv_swap_is_conditional() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.kv_swap("k", None, "a").unwrap());
        assert!(!store.kv_swap("k", None, "b").unwrap());
        assert!(!store.kv_swap("k", Some("stale"), "b").unwrap());
        assert_eq!(store.kv_get("k").unwrap().as_deref(), Some("a"));

        assert!(store.kv_swap("k", Some("a"), "b").unwrap());
        assert_eq!(store.kv_get("k").unwrap().as_deref(), Some("b"));

        assert!(!store.kv_del_if("k", "a").unwrap());
        assert!(store.kv_del_if("k", "b").unwrap());
        assert!(store.kv_get("k").unwrap().is_none());
    }
}

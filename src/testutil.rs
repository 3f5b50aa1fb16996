// Test fixtures shared by the scheduler and controller suites

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tempfile::TempDir;

use crate::controller::Controller;
use crate::db::{schema, SqliteStore};
use crate::error::{MigratorError, Result};
pub(crate) use crate::encoder::animation::fixtures::gif;
use crate::encoder::{compression_ratio, is_animated, target_dimensions, Dimensions, EncodeError, EncodeOptions, EncodeStats, Encoder};
use crate::logger::Logger;
use crate::scheduler::{BatchState, MigrationObserver};
use crate::settings::Settings;
use crate::store::{ContentStore, MediaFilter, MediaId, MediaItem, MediaMeta, MetaRow, OptionRow, PostRow, SizeVariant, UploadDir};

pub const BASE_URL: &str = "https://site/wp-content/uploads";

/// Encoder that understands a fake image format: a first line `IMG <w>x<h>`
/// followed by padding. Output is `<EXT> <w>x<h>`, always smaller.
#[derive(Debug, Default)]
pub struct FakeEncoder {
    /// Basenames whose encode fails.
    pub fail_on: Vec<String>,
}

impl FakeEncoder {
    pub fn failing_on(name: &str) -> Self {
        Self { fail_on: vec![name.to_string()] }
    }
}

fn parse_header(bytes: &[u8]) -> Option<Dimensions> {
    let text = std::str::from_utf8(bytes).ok()?;
    let dims = text.lines().next()?.strip_prefix("IMG ")?;
    let (w, h) = dims.split_once('x')?;
    Some(Dimensions::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
}

impl Encoder for FakeEncoder {
    fn encode(&self, source: &Path, dest: &Path, options: &EncodeOptions) -> std::result::Result<EncodeStats, EncodeError> {
        if !source.is_file() {
            return Err(EncodeError::SourceMissing(source.display().to_string()));
        }
        if options.skip_animated && is_animated(source).unwrap_or(false) {
            return Err(EncodeError::AnimatedRefused(source.display().to_string()));
        }
        let name = source.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        if self.fail_on.contains(&name) {
            return Err(EncodeError::EncodeFailed(format!("refusing {}", name)));
        }

        let bytes = fs::read(source).map_err(|e| EncodeError::DecodeFailed(e.to_string()))?;
        let original = parse_header(&bytes).ok_or_else(|| EncodeError::DecodeFailed(name.clone()))?;
        let (dims, resized) = target_dimensions(original, options);

        let out = format!("{} {}x{}", options.format.extension().to_uppercase(), dims.width, dims.height);
        fs::write(dest, &out).map_err(|e| EncodeError::EncodeFailed(e.to_string()))?;

        let original_bytes = bytes.len() as u64;
        let new_bytes = out.len() as u64;
        Ok(EncodeStats {
            original_bytes,
            new_bytes,
            original_dims: original,
            new_dims: dims,
            quality_applied: options.quality,
            resized,
            compression_ratio: compression_ratio(original_bytes, new_bytes),
        })
    }
}

/// Fake image bytes with the given dimensions.
pub fn image_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut bytes = format!("IMG {}x{}\n", width, height).into_bytes();
    bytes.extend(std::iter::repeat(b'.').take(256));
    bytes
}

/// Upload directory and database file in a temp dir.
pub struct Fixture {
    pub tmp: TempDir,
    pub db_path: PathBuf,
    pub uploads: UploadDir,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("uploads");
        fs::create_dir_all(&root).unwrap();
        let db_path = tmp.path().join("site.db");
        Self { uploads: UploadDir::new(&root, BASE_URL), db_path, tmp }
    }

    pub fn root(&self) -> &Path {
        self.uploads.basedir()
    }

    /// A fresh connection to the fixture database.
    pub fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.db_path).unwrap()
    }

    pub fn controller(&self, settings: Settings) -> Controller {
        self.controller_with(settings, FakeEncoder::default())
    }

    /// Controller over a store that fails on demand.
    pub fn faulty_controller(&self, settings: Settings, faults: &Faults) -> Controller {
        let store = FaultyStore { inner: self.store(), faults: faults.clone() };
        let controller = Controller::new(
            Box::new(store),
            Box::new(FakeEncoder::default()),
            self.uploads.clone(),
            Logger::default(),
        );
        controller.save_settings(&settings).unwrap();
        controller
    }

    pub fn controller_with(&self, settings: Settings, encoder: FakeEncoder) -> Controller {
        let controller = Controller::new(
            Box::new(self.store()),
            Box::new(encoder),
            self.uploads.clone(),
            Logger::default(),
        );
        controller.save_settings(&settings).unwrap();
        controller
    }

    pub fn write_file(&self, rel: &str, bytes: &[u8]) {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root().join(rel).exists()
    }

    /// Register an image with its master file at `file` and one variant per
    /// `(size name, width, height)`, named `<stem>-<w>x<h>.<ext>`.
    pub fn add_image(&self, file: &str, width: u32, height: u32, sizes: &[(&str, u32, u32)]) -> MediaId {
        self.write_file(file, &image_bytes(width, height));

        let name = file.rsplit('/').next().unwrap();
        let (stem, ext) = name.rsplit_once('.').unwrap();
        let dir = &file[..file.len() - name.len()];

        let mut meta = MediaMeta { file: file.to_string(), width, height, ..Default::default() };
        for (size, w, h) in sizes {
            let variant = format!("{}-{}x{}.{}", stem, w, h, ext);
            self.write_file(&format!("{}{}", dir, variant), &image_bytes(*w, *h));
            meta.sizes.insert(size.to_string(), SizeVariant { file: variant, width: *w, height: *h });
        }

        let mime = match ext {
            "png" => "image/png",
            "gif" => "image/gif",
            _ => "image/jpeg",
        };
        schema::insert_media(self.store().conn(), mime, &meta).unwrap()
    }

    /// Register a file with no size variants and arbitrary content.
    pub fn add_raw_media(&self, file: &str, mime: &str, bytes: &[u8]) -> MediaId {
        self.write_file(file, bytes);
        let meta = MediaMeta { file: file.to_string(), width: 1, height: 1, ..Default::default() };
        schema::insert_media(self.store().conn(), mime, &meta).unwrap()
    }

    pub fn add_post(&self, body: &str) -> i64 {
        schema::insert_post(self.store().conn(), "Post", body).unwrap()
    }
}

pub fn url(rel: &str) -> String {
    format!("{}/{}", BASE_URL, rel)
}

/// Names of the files directly inside `dir`, sorted.
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Every file under `root` as a sorted list of relative paths.
pub fn all_files(root: &Path) -> Vec<String> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                out.push(path.strip_prefix(root).unwrap().to_string_lossy().to_string());
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

/// Requests a stop from a second connection when `item` starts, the way
/// `migrator stop` does from another process.
pub struct StopAt {
    pub db_path: PathBuf,
    pub item: MediaId,
}

impl MigrationObserver for StopAt {
    fn on_item_start(&self, item: &MediaItem) {
        if item.id == self.item {
            let other = SqliteStore::open(&self.db_path).unwrap();
            BatchState::request_stop(&other).unwrap();
        }
    }
}

/// Switches shared between a test and the `FaultyStore` it handed out.
#[derive(Clone, Default)]
pub struct Faults {
    pub fail_meta_write: Rc<Cell<bool>>,
    pub fail_post_write: Rc<Cell<bool>>,
    /// Runs once, against the underlying store, before the next `kv_swap`.
    pub before_swap: Rc<RefCell<Option<Box<dyn FnOnce(&SqliteStore)>>>>,
}

impl Faults {
    pub fn before_next_swap(&self, hook: impl FnOnce(&SqliteStore) + 'static) {
        *self.before_swap.borrow_mut() = Some(Box::new(hook));
    }
}

fn injected(what: &str) -> MigratorError {
    MigratorError::Other(format!("{} refused", what))
}

pub struct FaultyStore {
    pub inner: SqliteStore,
    pub faults: Faults,
}

impl ContentStore for FaultyStore {
    fn list_media(&self, filter: &MediaFilter) -> Result<Vec<MediaItem>> {
        self.inner.list_media(filter)
    }
    fn get_media(&self, id: MediaId) -> Result<Option<MediaItem>> {
        self.inner.get_media(id)
    }
    fn read_media_meta(&self, id: MediaId) -> Result<Option<MediaMeta>> {
        self.inner.read_media_meta(id)
    }
    fn write_media_meta(&self, id: MediaId, meta: &MediaMeta) -> Result<()> {
        if self.faults.fail_meta_write.get() {
            return Err(injected("media metadata write"));
        }
        self.inner.write_media_meta(id, meta)
    }
    fn set_media_mime(&self, id: MediaId, mime: &str) -> Result<()> {
        self.inner.set_media_mime(id, mime)
    }
    fn iter_post_bodies(&self, needles: &[String], after_id: i64, limit: usize) -> Result<Vec<PostRow>> {
        self.inner.iter_post_bodies(needles, after_id, limit)
    }
    fn update_post_body(&self, id: i64, body: &str) -> Result<()> {
        if self.faults.fail_post_write.get() {
            return Err(injected("post write"));
        }
        self.inner.update_post_body(id, body)
    }
    fn get_post_body(&self, id: i64) -> Result<Option<String>> {
        self.inner.get_post_body(id)
    }
    fn iter_item_meta(&self, needles: &[String], after_id: i64, limit: usize) -> Result<Vec<MetaRow>> {
        self.inner.iter_item_meta(needles, after_id, limit)
    }
    fn update_item_meta(&self, row_id: i64, value: &str) -> Result<()> {
        self.inner.update_item_meta(row_id, value)
    }
    fn get_meta_row(&self, row_id: i64) -> Result<Option<MetaRow>> {
        self.inner.get_meta_row(row_id)
    }
    fn get_item_meta(&self, item_id: MediaId, key: &str) -> Result<Option<String>> {
        self.inner.get_item_meta(item_id, key)
    }
    fn set_item_meta(&self, item_id: MediaId, key: &str, value: &str) -> Result<()> {
        self.inner.set_item_meta(item_id, key, value)
    }
    fn delete_item_meta(&self, item_id: MediaId, key: &str) -> Result<()> {
        self.inner.delete_item_meta(item_id, key)
    }
    fn list_item_meta_by_key(&self, key: &str) -> Result<Vec<(MediaId, String)>> {
        self.inner.list_item_meta_by_key(key)
    }
    fn iter_options(&self, needles: &[String], after_name: &str, limit: usize) -> Result<Vec<OptionRow>> {
        self.inner.iter_options(needles, after_name, limit)
    }
    fn update_option(&self, name: &str, value: &str) -> Result<()> {
        self.inner.update_option(name, value)
    }
    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.inner.kv_get(key)
    }
    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.kv_set(key, value)
    }
    fn kv_del(&self, key: &str) -> Result<()> {
        self.inner.kv_del(key)
    }
    fn kv_swap(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool> {
        let hook = self.faults.before_swap.borrow_mut().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        self.inner.kv_swap(key, expected, value)
    }
    fn kv_del_if(&self, key: &str, expected: &str) -> Result<bool> {
        self.inner.kv_del_if(key, expected)
    }
}

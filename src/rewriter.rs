// Store rewriter
//
// Three passes over the host store for one item's URL map:
//   1. post bodies: plain substring replacement, longest key first
//   2. per-item metadata: deep replacement through the payload codecs
//   3. options: same as metadata
// Rows are fetched in pages. A failing row is recorded and skipped; the
// remaining rows are still rewritten.

use regex::Regex;

use crate::constants::{KEY_PREFIX, REWRITE_PAGE_SIZE};
use crate::error::{MigratorError, Result};
use crate::logger::Logger;
use crate::replace::{self, DeepReplacer, PayloadCodec};
use crate::report::{DiffReport, MetaChange, OptionChange, PostChange, RowError};
use crate::store::{ContentStore, MediaId};
use crate::urlmap::UrlMap;

/// Alternation of every key, longest first, so a key that is a prefix of
/// another never wins at the same position.
pub fn longest_first_pattern(map: &UrlMap) -> Result<Regex> {
    let alternation = map
        .keys_longest_first()
        .into_iter()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&alternation).map_err(|e| MigratorError::MapBuildFailed(format!("cannot compile map pattern: {}", e)))
}

/// Replace every occurrence of a map key in `text`. Returns the new text and
/// the number of replacements.
pub fn replace_text(text: &str, map: &UrlMap, pattern: &Regex) -> (String, usize) {
    let mut count = 0;
    let replaced = pattern.replace_all(text, |caps: &regex::Captures| {
        count += 1;
        let matched = &caps[0];
        map.get(matched).unwrap_or(matched).to_string()
    });
    (replaced.into_owned(), count)
}

fn is_own_key(key: &str) -> bool {
    key.starts_with(KEY_PREFIX)
}

pub struct StoreRewriter<'a> {
    store: &'a dyn ContentStore,
    logger: &'a Logger,
    codecs: Vec<Box<dyn PayloadCodec>>,
    page_size: usize,
}

impl<'a> StoreRewriter<'a> {
    pub fn new(store: &'a dyn ContentStore, logger: &'a Logger) -> Self {
        Self {
            store,
            logger,
            codecs: replace::default_codecs(),
            page_size: REWRITE_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rewrite every reference to the map's keys. Store read failures abort
    /// the pass; per-row write failures land in `DiffReport::errors`.
    pub fn apply(&self, item_id: MediaId, map: &UrlMap) -> Result<DiffReport> {
        let mut report = DiffReport::new(item_id, map);
        if map.is_empty() {
            return Ok(report);
        }

        self.rewrite_posts(item_id, map, &mut report)?;
        self.rewrite_meta(item_id, map, &mut report)?;
        self.rewrite_options(item_id, map, &mut report)?;

        report.statistics.rows_changed = report.rows_changed();
        report.statistics.replacements = report.replacements();

        self.logger.info(
            "rewrite",
            Some(item_id),
            format!(
                "{} posts, {} meta rows, {} options rewritten ({} errors)",
                report.posts.len(),
                report.meta.len(),
                report.options.len(),
                report.errors.len()
            ),
        );
        Ok(report)
    }

    fn row_failed(&self, item_id: MediaId, report: &mut DiffReport, row: String, err: &MigratorError) {
        let err = MigratorError::RewriteRowFailed { row: row.clone(), reason: err.to_string() };
        self.logger.error("rewrite_row_failed", Some(item_id), err.to_string());
        report.errors.push(RowError { row, error: err.to_string() });
    }

    fn rewrite_posts(&self, item_id: MediaId, map: &UrlMap, report: &mut DiffReport) -> Result<()> {
        let pattern = longest_first_pattern(map)?;
        let needles = map.keys();
        let mut after_id = 0;

        loop {
            let rows = self.store.iter_post_bodies(&needles, after_id, self.page_size)?;
            for row in &rows {
                after_id = row.id;
                let (body, count) = replace_text(&row.body, map, &pattern);
                if count == 0 || body == row.body {
                    continue;
                }
                match self.store.update_post_body(row.id, &body) {
                    Ok(()) => report.posts.push(PostChange {
                        id: row.id,
                        old_len: row.body.len(),
                        new_len: body.len(),
                        count,
                        after: body,
                    }),
                    Err(e) => self.row_failed(item_id, report, format!("post:{}", row.id), &e),
                }
            }
            if rows.len() < self.page_size {
                return Ok(());
            }
            self.logger.debug("rewrite_page", Some(item_id), format!("posts after id {}", after_id));
        }
    }

    fn rewrite_meta(&self, item_id: MediaId, map: &UrlMap, report: &mut DiffReport) -> Result<()> {
        let replacer = DeepReplacer::new(map, &self.codecs);
        let needles = replace::needles(map);
        let mut after_id = 0;

        loop {
            let rows = self.store.iter_item_meta(&needles, after_id, self.page_size)?;
            for row in &rows {
                after_id = row.id;
                if is_own_key(&row.key) {
                    continue;
                }
                let outcome = replacer.apply_raw(&row.value).and_then(|replaced| match replaced {
                    Some(r) => self.store.update_item_meta(row.id, &r.raw).map(|_| Some(r)),
                    None => Ok(None),
                });
                match outcome {
                    Ok(Some(r)) => report.meta.push(MetaChange {
                        id: row.id,
                        item_id: row.item_id,
                        key: row.key.clone(),
                        old_len: row.value.len(),
                        new_len: r.raw.len(),
                        count: r.count,
                        paths: r.paths,
                        after: r.raw,
                    }),
                    Ok(None) => {}
                    Err(e) => self.row_failed(item_id, report, format!("meta:{}", row.id), &e),
                }
            }
            if rows.len() < self.page_size {
                return Ok(());
            }
            self.logger.debug("rewrite_page", Some(item_id), format!("meta after id {}", after_id));
        }
    }

    fn rewrite_options(&self, item_id: MediaId, map: &UrlMap, report: &mut DiffReport) -> Result<()> {
        let replacer = DeepReplacer::new(map, &self.codecs);
        let needles = replace::needles(map);
        let mut after_name = String::new();

        loop {
            let rows = self.store.iter_options(&needles, &after_name, self.page_size)?;
            for row in &rows {
                after_name = row.name.clone();
                if is_own_key(&row.name) {
                    continue;
                }
                let outcome = replacer.apply_raw(&row.value).and_then(|replaced| match replaced {
                    Some(r) => self.store.update_option(&row.name, &r.raw).map(|_| Some(r)),
                    None => Ok(None),
                });
                match outcome {
                    Ok(Some(r)) => report.options.push(OptionChange {
                        name: row.name.clone(),
                        old_len: row.value.len(),
                        new_len: r.raw.len(),
                        count: r.count,
                        paths: r.paths,
                        after: r.raw,
                    }),
                    Ok(None) => {}
                    Err(e) => self.row_failed(item_id, report, format!("option:{}", row.name), &e),
                }
            }
            if rows.len() < self.page_size {
                return Ok(());
            }
        }
    }

    /// Undo a recorded rewrite by applying the inverse map to exactly the rows
    /// the report lists. Returns a report of the reverted rows; rows that
    /// could not be reverted are in its `errors`.
    pub fn revert(&self, report: &DiffReport) -> Result<DiffReport> {
        let inverse = report.url_map()?.inverse();
        let item_id = report.item_id;
        let mut out = DiffReport::new(item_id, &inverse);
        if inverse.is_empty() {
            return Ok(out);
        }

        let pattern = longest_first_pattern(&inverse)?;
        for change in &report.posts {
            let row = format!("post:{}", change.id);
            let result = self.store.get_post_body(change.id).and_then(|body| {
                let body = body.ok_or_else(|| MigratorError::Other(format!("{} no longer exists", row)))?;
                let (reverted, count) = replace_text(&body, &inverse, &pattern);
                if count > 0 {
                    self.store.update_post_body(change.id, &reverted)?;
                }
                Ok((body.len(), reverted, count))
            });
            match result {
                Ok((_, _, 0)) => {}
                Ok((old_len, after, count)) => out.posts.push(PostChange {
                    id: change.id,
                    old_len,
                    new_len: after.len(),
                    count,
                    after,
                }),
                Err(e) => self.row_failed(item_id, &mut out, row, &e),
            }
        }

        let replacer = DeepReplacer::new(&inverse, &self.codecs);
        for change in &report.meta {
            let row = format!("meta:{}", change.id);
            let result = self.store.get_meta_row(change.id).and_then(|meta| {
                let meta = meta.ok_or_else(|| MigratorError::Other(format!("{} no longer exists", row)))?;
                let replaced = replacer.apply_raw(&meta.value)?;
                if let Some(r) = &replaced {
                    self.store.update_item_meta(change.id, &r.raw)?;
                }
                Ok((meta, replaced))
            });
            match result {
                Ok((_, None)) => {}
                Ok((meta, Some(r))) => out.meta.push(MetaChange {
                    id: meta.id,
                    item_id: meta.item_id,
                    key: meta.key,
                    old_len: meta.value.len(),
                    new_len: r.raw.len(),
                    count: r.count,
                    paths: r.paths,
                    after: r.raw,
                }),
                Err(e) => self.row_failed(item_id, &mut out, row, &e),
            }
        }

        for change in &report.options {
            let row = format!("option:{}", change.name);
            let result = self.store.kv_get(&change.name).and_then(|value| {
                let value = value.ok_or_else(|| MigratorError::Other(format!("{} no longer exists", row)))?;
                let replaced = replacer.apply_raw(&value)?;
                if let Some(r) = &replaced {
                    self.store.update_option(&change.name, &r.raw)?;
                }
                Ok((value.len(), replaced))
            });
            match result {
                Ok((_, None)) => {}
                Ok((old_len, Some(r))) => out.options.push(OptionChange {
                    name: change.name.clone(),
                    old_len,
                    new_len: r.raw.len(),
                    count: r.count,
                    paths: r.paths,
                    after: r.raw,
                }),
                Err(e) => self.row_failed(item_id, &mut out, row, &e),
            }
        }

        out.statistics.rows_changed = out.rows_changed();
        out.statistics.replacements = out.replacements();
        self.logger.info(
            "revert",
            Some(item_id),
            format!("{} rows reverted ({} errors)", out.rows_changed(), out.errors.len()),
        );
        Ok(out)
    }
}

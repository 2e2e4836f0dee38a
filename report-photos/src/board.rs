//! Photo board: the user-visible photo list plus transient upload state.
//!
//! All updates address records by id. Every entry point first collapses
//! duplicate ids through [`reconcile`], so optimistic local additions and
//! server reloads that race each other converge on one record per id.

use crate::backend::{PhotoRow, RowStatus};
use crate::error::{PipelineError, PipelineResult};
use crate::model::{PhotoId, PhotoRecord, ProcessedPhoto};
use crate::state::{UploadEvent, UploadState, UploadStatus};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Merge `delta` into `authoritative`, keyed by id. Order follows first appearance.
/// When an id repeats, non-null paths win over null and the later non-null value
/// wins over the earlier one; an existing caption is never replaced.
pub fn reconcile(authoritative: Vec<PhotoRecord>, delta: Vec<PhotoRecord>) -> Vec<PhotoRecord> {
    let mut index: HashMap<PhotoId, usize> = HashMap::new();
    let mut out: Vec<PhotoRecord> = Vec::with_capacity(authoritative.len() + delta.len());
    for rec in authoritative.into_iter().chain(delta) {
        match index.get(&rec.id) {
            Some(&i) => {
                let base = std::mem::replace(&mut out[i], PhotoRecord::new(String::new()));
                out[i] = merge_record(base, rec);
            }
            None => {
                index.insert(rec.id, out.len());
                out.push(rec);
            }
        }
    }
    out
}

fn merge_record(mut base: PhotoRecord, incoming: PhotoRecord) -> PhotoRecord {
    base.raw_path = incoming.raw_path.or(base.raw_path);
    base.optimized_path = incoming.optimized_path.or(base.optimized_path);
    base.thumbnail_path = incoming.thumbnail_path.or(base.thumbnail_path);
    base.display_url = incoming.display_url.or(base.display_url);
    base.thumbnail_url = incoming.thumbnail_url.or(base.thumbnail_url);
    if base.description.is_empty() {
        base.description = incoming.description;
    }
    if base.report_id.is_empty() {
        base.report_id = incoming.report_id;
    }
    base
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoView {
    #[serde(flatten)]
    pub record: PhotoRecord,
    pub upload: UploadState,
}

#[derive(Debug, Default)]
pub struct PhotoBoard {
    records: Vec<PhotoRecord>,
    states: HashMap<PhotoId, UploadState>,
    /// Photos a metadata row was written or fetched for.
    persisted: HashSet<PhotoId>,
}

impl PhotoBoard {
    fn dedupe(&mut self) {
        let records = std::mem::take(&mut self.records);
        self.records = reconcile(records, Vec::new());
    }

    fn position(&self, id: PhotoId) -> Option<usize> {
        self.records.iter().position(|r| r.id == id)
    }

    pub fn insert(&mut self, record: PhotoRecord) {
        let id = record.id;
        let records = std::mem::take(&mut self.records);
        self.records = reconcile(records, vec![record]);
        self.states.entry(id).or_default();
    }

    pub fn contains(&self, id: PhotoId) -> bool {
        self.position(id).is_some()
    }

    pub fn record(&self, id: PhotoId) -> Option<&PhotoRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn state(&self, id: PhotoId) -> Option<&UploadState> {
        self.states.get(&id)
    }

    pub fn mark_persisted(&mut self, id: PhotoId) {
        if self.contains(id) {
            self.persisted.insert(id);
        }
    }

    pub fn is_persisted(&self, id: PhotoId) -> bool {
        self.persisted.contains(&id)
    }

    fn is_live(&self, id: PhotoId) -> bool {
        self.states.get(&id).is_some_and(|s| {
            s.status.is_active() || matches!(s.status, UploadStatus::Queued | UploadStatus::Preparing)
        })
    }

    /// Known to the server at some point: dropped once its row disappears.
    fn is_settled(&self, rec: &PhotoRecord) -> bool {
        self.persisted.contains(&rec.id)
            || !rec.stored_paths().is_empty()
            || self
                .states
                .get(&rec.id)
                .is_some_and(|s| matches!(s.status, UploadStatus::Done | UploadStatus::Error))
    }

    pub fn views_for(&self, report_id: &str) -> Vec<PhotoView> {
        self.records
            .iter()
            .filter(|r| r.report_id == report_id)
            .map(|r| PhotoView {
                record: r.clone(),
                upload: self.states.get(&r.id).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// Run one state-machine event and let `edit` adjust the diagnostic fields.
    pub fn apply(
        &mut self,
        id: PhotoId,
        event: UploadEvent,
        edit: impl FnOnce(&mut UploadState),
    ) -> PipelineResult<UploadState> {
        self.dedupe();
        if self.position(id).is_none() {
            return Err(PipelineError::PhotoNotFound(id));
        }
        let state = self.states.entry(id).or_default();
        state.apply(event)?;
        edit(state);
        Ok(state.clone())
    }

    /// Returns the new state when progress actually moved forward.
    pub fn advance(&mut self, id: PhotoId, pct: u8) -> Option<UploadState> {
        let state = self.states.get_mut(&id)?;
        state.advance(pct).then(|| state.clone())
    }

    pub fn set_description(&mut self, id: PhotoId, text: &str) -> PipelineResult<()> {
        self.dedupe();
        let i = self.position(id).ok_or(PipelineError::PhotoNotFound(id))?;
        self.records[i].description = text.to_string();
        Ok(())
    }

    /// The handoff owns paths and url; the caption is left alone.
    pub fn apply_processed(&mut self, id: PhotoId, processed: &ProcessedPhoto) -> PipelineResult<()> {
        self.dedupe();
        let i = self.position(id).ok_or(PipelineError::PhotoNotFound(id))?;
        let rec = &mut self.records[i];
        rec.raw_path = Some(processed.raw_path.clone());
        rec.optimized_path = processed.optimized_path.clone();
        rec.thumbnail_path = processed.thumbnail_path.clone();
        rec.display_url = Some(processed.display_url.clone());
        rec.thumbnail_url = processed.thumbnail_url.clone();
        Ok(())
    }

    pub fn remove(&mut self, id: PhotoId) -> Option<PhotoRecord> {
        self.dedupe();
        self.states.remove(&id);
        self.persisted.remove(&id);
        let i = self.position(id)?;
        Some(self.records.remove(i))
    }

    /// Merge persisted rows for one report with whatever is only known locally.
    /// Records with a live upload keep their local paths. Settled records whose
    /// row is gone are dropped; their ids are returned.
    pub fn merge_remote(
        &mut self,
        report_id: &str,
        rows: Vec<PhotoRow>,
        public_url: impl Fn(&str) -> String,
    ) -> Vec<PhotoId> {
        self.dedupe();
        let listed: HashSet<PhotoId> = rows.iter().map(|r| r.id).collect();
        let gone: Vec<PhotoId> = self
            .records
            .iter()
            .filter(|r| r.report_id == report_id && !listed.contains(&r.id))
            .filter(|r| !self.is_live(r.id) && self.is_settled(r))
            .map(|r| r.id)
            .collect();
        for id in &gone {
            self.remove(*id);
        }

        let mut remote = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            let live = self.is_live(id);
            if !self.contains(id) {
                self.states.insert(id, initial_state(&row));
            }
            let mut rec = row.into_record(&public_url);
            if live {
                rec.raw_path = None;
                rec.optimized_path = None;
                rec.thumbnail_path = None;
                rec.display_url = None;
                rec.thumbnail_url = None;
            }
            remote.push(rec);
        }
        let (mine, others): (Vec<_>, Vec<_>) = std::mem::take(&mut self.records)
            .into_iter()
            .partition(|r| r.report_id == report_id);
        let mut merged = others;
        merged.extend(reconcile(mine, remote));
        self.records = merged;
        self.persisted.extend(listed);
        gone
    }
}

fn initial_state(row: &PhotoRow) -> UploadState {
    match row.status {
        RowStatus::Error => UploadState {
            status: UploadStatus::Error,
            message: row.error.clone(),
            ..Default::default()
        },
        _ if row.storage_path.is_some() => UploadState {
            status: UploadStatus::Done,
            progress: 100,
            ..Default::default()
        },
        _ => UploadState::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(report: &str) -> PhotoRecord {
        PhotoRecord::new(report)
    }

    fn row(id: PhotoId, report: &str, path: Option<&str>) -> PhotoRow {
        PhotoRow {
            id,
            report_id: report.to_string(),
            storage_path: path.map(str::to_string),
            optimized_path: None,
            thumbnail_path: None,
            description: Some("from server".into()),
            original_size: Some(10),
            status: RowStatus::Done,
            error: None,
        }
    }

    #[test]
    fn duplicate_ids_collapse_to_most_complete() {
        let mut a = rec("r");
        let mut b = a.clone();
        a.description = "caption".into();
        b.raw_path = Some("r/x/raw.jpg".into());
        b.optimized_path = Some("r/x/opt.jpg".into());
        let other = rec("r");
        let out = reconcile(vec![a.clone(), other.clone(), b], Vec::new());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, a.id);
        assert_eq!(out[0].raw_path.as_deref(), Some("r/x/raw.jpg"));
        assert_eq!(out[0].optimized_path.as_deref(), Some("r/x/opt.jpg"));
        assert_eq!(out[0].description, "caption");
        assert_eq!(out[1].id, other.id);
    }

    #[test]
    fn null_never_overwrites_a_path() {
        let mut full = rec("r");
        full.raw_path = Some("p".into());
        let mut empty = full.clone();
        empty.raw_path = None;
        let out = reconcile(vec![full], vec![empty]);
        assert_eq!(out[0].raw_path.as_deref(), Some("p"));
    }

    #[test]
    fn processed_merge_keeps_caption_edit() {
        let mut board = PhotoBoard::default();
        let r = rec("r");
        let id = r.id;
        board.insert(r);
        board.set_description(id, "north wall crack").unwrap();
        board
            .apply_processed(
                id,
                &ProcessedPhoto {
                    raw_path: "r/raw.jpg".into(),
                    optimized_path: Some("r/opt.webp".into()),
                    thumbnail_path: Some("r/thumb.webp".into()),
                    display_url: "https://cdn/r/opt.webp".into(),
                    thumbnail_url: Some("https://cdn/r/thumb.webp".into()),
                },
            )
            .unwrap();
        let got = board.record(id).unwrap();
        assert_eq!(got.description, "north wall crack");
        assert_eq!(got.display_url.as_deref(), Some("https://cdn/r/opt.webp"));
        assert_eq!(got.thumbnail_url.as_deref(), Some("https://cdn/r/thumb.webp"));
    }

    #[test]
    fn updates_follow_identity_after_reordering() {
        let mut board = PhotoBoard::default();
        let first = rec("r");
        let second = rec("r");
        let (a, b) = (first.id, second.id);
        board.insert(first);
        board.insert(second);
        board.remove(a);
        board.insert(PhotoRecord {
            id: a,
            ..rec("r")
        });
        board.set_description(b, "second").unwrap();
        assert_eq!(board.record(b).unwrap().description, "second");
        assert_eq!(board.record(a).unwrap().description, "");
    }

    #[test]
    fn missing_photo_is_reported() {
        let mut board = PhotoBoard::default();
        let err = board
            .apply(PhotoId::new(), UploadEvent::Enqueue, |_| {})
            .unwrap_err();
        assert!(matches!(err, PipelineError::PhotoNotFound(_)));
    }

    #[test]
    fn merge_remote_keeps_local_only_records() {
        let mut board = PhotoBoard::default();
        let local = rec("r");
        let local_id = local.id;
        board.insert(local);
        let persisted = PhotoId::new();
        board.merge_remote("r", vec![row(persisted, "r", Some("r/p/raw.jpg"))], |p| {
            format!("https://cdn/{p}")
        });
        let views = board.views_for("r");
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].record.id, local_id);
        assert_eq!(views[1].record.id, persisted);
        assert_eq!(
            views[1].record.display_url.as_deref(),
            Some("https://cdn/r/p/raw.jpg")
        );
        assert_eq!(views[1].upload.status, UploadStatus::Done);

        // second pass converges instead of duplicating
        board.merge_remote("r", vec![row(persisted, "r", Some("r/p/raw.jpg"))], |p| {
            p.to_string()
        });
        assert_eq!(board.views_for("r").len(), 2);
    }

    #[test]
    fn merge_remote_drops_settled_records_missing_from_rows() {
        let mut board = PhotoBoard::default();
        let fresh = rec("r");
        let fresh_id = fresh.id;
        board.insert(fresh);

        let mut uploaded = rec("r");
        uploaded.raw_path = Some("r/u/raw.jpg".into());
        let uploaded_id = uploaded.id;
        board.insert(uploaded);

        let captioned = rec("r");
        let captioned_id = captioned.id;
        board.insert(captioned);
        board.mark_persisted(captioned_id);

        let mut queued = rec("r");
        queued.raw_path = Some("r/q/raw.jpg".into());
        let queued_id = queued.id;
        board.insert(queued);
        board.apply(queued_id, UploadEvent::Enqueue, |_| {}).unwrap();

        let other = rec("elsewhere");
        let other_id = other.id;
        board.insert(other);
        board.mark_persisted(other_id);

        let mut gone = board.merge_remote("r", Vec::new(), |p| p.into());
        gone.sort_by_key(|id| id.to_string());
        let mut want = vec![uploaded_id, captioned_id];
        want.sort_by_key(|id| id.to_string());
        assert_eq!(gone, want);
        assert!(board.contains(fresh_id));
        assert!(board.contains(queued_id));
        assert!(board.contains(other_id));
        assert!(board.state(uploaded_id).is_none());
        assert!(!board.is_persisted(captioned_id));
    }

    #[test]
    fn listed_rows_become_persisted() {
        let mut board = PhotoBoard::default();
        let id = PhotoId::new();
        let mut pending = row(id, "r", None);
        pending.status = RowStatus::Pending;
        board.merge_remote("r", vec![pending], |p| p.into());
        assert!(board.is_persisted(id));
        assert_eq!(board.state(id).unwrap().status, UploadStatus::Idle);

        assert_eq!(board.merge_remote("r", Vec::new(), |p| p.into()), vec![id]);
        assert!(!board.contains(id));
    }

    #[test]
    fn merge_remote_does_not_touch_live_uploads() {
        let mut board = PhotoBoard::default();
        let mut local = rec("r");
        local.raw_path = Some("r/new.jpg".into());
        let id = local.id;
        board.insert(local);
        board.apply(id, UploadEvent::Enqueue, |_| {}).unwrap();
        board.apply(id, UploadEvent::Start, |_| {}).unwrap();
        board.merge_remote("r", vec![row(id, "r", Some("r/old.jpg"))], |p| p.into());
        assert_eq!(board.record(id).unwrap().raw_path.as_deref(), Some("r/new.jpg"));
        assert_eq!(board.state(id).unwrap().status, UploadStatus::Uploading);
    }
}

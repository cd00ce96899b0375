use std::fs::{self, File, FileTimes};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use common::{now_secs, FieldChange, LastError, Track, TrackChanges, TrackId, TrackStatus};
use metadata::TagVersion;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::jobs::ENRICH_TRACK;
use crate::lease::WriteLeases;
use crate::media::{CoverRenderer, MediaTools};
use crate::LibraryError;

/// Probed durations within this many seconds of the tag value are ignored.
pub const DEFAULT_DURATION_TOLERANCE_SECS: u32 = 2;

const NORMALIZED_TAG: TagVersion = TagVersion::Id3v2(4);

#[derive(Debug, Clone)]
pub enum EnrichOutcome {
    /// Row or file is gone; nothing to do.
    Missing,
    /// Track is not PENDING.
    Skipped(TrackStatus),
    Complete(Track),
    Failed(Track),
}

/// The slow tier: duration probe, cover renditions, tag normalization.
#[derive(Clone)]
pub struct Enricher {
    catalog: Catalog,
    media: Arc<dyn MediaTools>,
    covers: Arc<dyn CoverRenderer>,
    leases: WriteLeases,
    duration_tolerance: u32,
}

impl Enricher {
    pub fn new(
        catalog: Catalog,
        media: Arc<dyn MediaTools>,
        covers: Arc<dyn CoverRenderer>,
        leases: WriteLeases,
    ) -> Self {
        Self {
            catalog,
            media,
            covers,
            leases,
            duration_tolerance: DEFAULT_DURATION_TOLERANCE_SECS,
        }
    }

    pub fn with_duration_tolerance(mut self, secs: u32) -> Self {
        self.duration_tolerance = secs.max(1);
        self
    }

    /// Failures inside the slow tier end up on the track row, not in the
    /// returned error; only catalog failures propagate.
    pub fn enrich(&self, id: TrackId) -> Result<EnrichOutcome, LibraryError> {
        let track = match self.catalog.get_track(id)? {
            Some(track) => track,
            None => return Ok(EnrichOutcome::Missing),
        };
        if track.status != TrackStatus::Pending {
            debug!("Track {} already {}", id, track.status.as_str());
            return Ok(EnrichOutcome::Skipped(track.status));
        }
        let path = Path::new(&track.path);
        if !path.is_file() {
            debug!("Track {} file is gone: {}", id, track.path);
            return Ok(EnrichOutcome::Missing);
        }

        match self.process(&track, path) {
            Ok(()) => {
                let track = self.catalog.mark_complete(id)?;
                info!("Enriched track {} ({})", id, track.file_name());
                Ok(EnrichOutcome::Complete(track))
            }
            Err(err) => {
                warn!("Enrichment failed for track {}: {}", id, err);
                let error = LastError {
                    at: now_secs(),
                    job: ENRICH_TRACK.to_string(),
                    message: err.to_string(),
                };
                let track = self.catalog.mark_error(id, error)?;
                Ok(EnrichOutcome::Failed(track))
            }
        }
    }

    fn process(&self, track: &Track, path: &Path) -> Result<(), LibraryError> {
        if let Some(probed) = self.media.probe_duration(path)? {
            if probed.abs_diff(track.duration_secs) >= self.duration_tolerance {
                debug!(
                    "Track {} duration {}s -> {}s",
                    track.id, track.duration_secs, probed
                );
                self.catalog.refine_duration(track.id, probed)?;
            }
        }

        if let Some(data) = self.media.read_cover(path)? {
            let files = self.covers.render(&data, track.id)?;
            debug!("Track {} cover written to {:?}", track.id, files.small);
            self.catalog.set_cover(track.id, true)?;
        }

        if let Some(version) = self.media.tag_version(path)? {
            if version.is_legacy() {
                self.normalize(track, path, version)?;
            }
        }
        Ok(())
    }

    fn normalize(&self, track: &Track, path: &Path, version: TagVersion) -> Result<(), LibraryError> {
        let stat = fs::metadata(path)?;
        let accessed = stat.accessed()?;
        let modified = stat.modified()?;

        self.leases.acquire(path);
        self.media.normalize_tags(path)?;
        restore_times(path, accessed, modified)?;

        let changes = TrackChanges {
            tag_version: FieldChange::between(version.to_string(), NORMALIZED_TAG.to_string()),
            ..TrackChanges::default()
        };
        self.catalog.record_fixup(track.id, changes)?;
        debug!("Track {} tags rewritten from {}", track.id, version);
        Ok(())
    }
}

/// Puts atime/mtime back after an in-place rewrite so mtime-floored
/// rescans do not pick the file up again.
pub(crate) fn restore_times(path: &Path, accessed: SystemTime, modified: SystemTime) -> Result<(), LibraryError> {
    let file = File::options().write(true).open(path)?;
    file.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DEFAULT_HISTORY_KEEP;
    use crate::extract::extract;
    use crate::lease::DEFAULT_LEASE_TTL;
    use crate::testing::{write_fake_track, FakeCovers, FakeMedia};
    use common::HistoryEvent;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        catalog: Catalog,
        covers: Arc<FakeCovers>,
        leases: WriteLeases,
        enricher: Enricher,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog.redb"), DEFAULT_HISTORY_KEEP).unwrap();
        let covers = Arc::new(FakeCovers::new(dir.path().join("covers")));
        let leases = WriteLeases::in_memory(DEFAULT_LEASE_TTL);
        let enricher = Enricher::new(
            catalog.clone(),
            Arc::new(FakeMedia),
            covers.clone(),
            leases.clone(),
        );
        Fixture {
            dir,
            catalog,
            covers,
            leases,
            enricher,
        }
    }

    fn ingest(fixture: &Fixture, name: &str, body: &str) -> (TrackId, PathBuf) {
        let path = write_fake_track(&fixture.dir.path().join("music"), name, body);
        let record = extract(&FakeMedia, &path).unwrap();
        let id = fixture.catalog.upsert(&record).unwrap().track_id();
        (id, path)
    }

    #[test]
    fn successful_run_completes_track() {
        let fixture = fixture();
        let (id, _) = ingest(
            &fixture,
            "song.mp3",
            "title=Song\nartist=Artist\nduration=180\nprobe=187\ncover=jpegbytes\n",
        );

        let outcome = fixture.enricher.enrich(id).unwrap();
        let track = match outcome {
            EnrichOutcome::Complete(track) => track,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(track.status, TrackStatus::Complete);
        assert_eq!(track.duration_secs, 187);
        assert!(track.has_cover);
        assert_eq!(fixture.covers.rendered.lock().as_slice(), &[id]);
        assert!(fixture.dir.path().join(format!("covers/{}_small.jpg", id)).exists());

        let events: Vec<_> = fixture.catalog.history_for(id).unwrap().iter().map(|e| e.event).collect();
        assert_eq!(events, vec![HistoryEvent::MetadataFixup, HistoryEvent::InitialScan]);
    }

    #[test]
    fn small_duration_drift_is_ignored() {
        let fixture = fixture();
        let (id, _) = ingest(&fixture, "song.mp3", "duration=180\nprobe=181\n");
        fixture.enricher.enrich(id).unwrap();
        let track = fixture.catalog.get_track(id).unwrap().unwrap();
        assert_eq!(track.duration_secs, 180);
        assert_eq!(fixture.catalog.history_for(id).unwrap().len(), 1);
    }

    #[test]
    fn opaque_container_keeps_tag_duration() {
        let fixture = fixture();
        let (id, _) = ingest(&fixture, "song.ogg", "title=Song\nduration=200\nopaque=1\n");

        let track = match fixture.enricher.enrich(id).unwrap() {
            EnrichOutcome::Complete(track) => track,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(track.status, TrackStatus::Complete);
        assert_eq!(track.duration_secs, 200);
        assert_eq!(fixture.catalog.history_for(id).unwrap().len(), 1);
    }

    #[test]
    fn legacy_tags_are_rewritten_under_a_lease() {
        let fixture = fixture();
        let (id, path) = ingest(&fixture, "old.mp3", "title=Old\nduration=100\ntag=v23\n");
        let before = fs::metadata(&path).unwrap().modified().unwrap();

        let outcome = fixture.enricher.enrich(id).unwrap();
        assert!(matches!(outcome, EnrichOutcome::Complete(_)));
        assert!(fs::read_to_string(&path).unwrap().contains("tag=v24"));
        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
        assert!(fixture.leases.consume(&path));

        let history = fixture.catalog.history_for(id).unwrap();
        let change = history[0].changes.as_ref().unwrap().tag_version.clone().unwrap();
        assert_eq!(change.old, "ID3v2.3");
        assert_eq!(change.new, "ID3v2.4");
    }

    #[test]
    fn modern_tags_are_left_alone() {
        let fixture = fixture();
        let (id, path) = ingest(&fixture, "new.mp3", "title=New\nduration=100\ntag=v24\n");
        fixture.enricher.enrich(id).unwrap();
        assert!(!fixture.leases.consume(&path));
    }

    #[test]
    fn failures_land_on_the_row() {
        let fixture = fixture();
        let (id, _) = ingest(&fixture, "bad.mp3", "title=Bad\nduration=100\nprobe_error=1\n");

        let outcome = fixture.enricher.enrich(id).unwrap();
        let track = match outcome {
            EnrichOutcome::Failed(track) => track,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(track.status, TrackStatus::Error);
        let error = track.last_error.unwrap();
        assert_eq!(error.job, ENRICH_TRACK);
        assert!(error.message.contains("probe failed"));

        assert!(matches!(
            fixture.enricher.enrich(id).unwrap(),
            EnrichOutcome::Skipped(TrackStatus::Error)
        ));
    }

    #[test]
    fn broken_cover_is_an_error() {
        let fixture = fixture();
        let (id, _) = ingest(&fixture, "cover.mp3", "duration=100\ncover=broken\n");
        assert!(matches!(fixture.enricher.enrich(id).unwrap(), EnrichOutcome::Failed(_)));
        assert!(!fixture.catalog.get_track(id).unwrap().unwrap().has_cover);
    }

    #[test]
    fn missing_file_is_a_no_op() {
        let fixture = fixture();
        let (id, path) = ingest(&fixture, "gone.mp3", "duration=100\n");
        fs::remove_file(&path).unwrap();

        assert!(matches!(fixture.enricher.enrich(id).unwrap(), EnrichOutcome::Missing));
        assert!(matches!(fixture.enricher.enrich(4242).unwrap(), EnrichOutcome::Missing));
        let track = fixture.catalog.get_track(id).unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Pending);
    }

    #[test]
    fn complete_tracks_are_not_reprocessed() {
        let fixture = fixture();
        let (id, _) = ingest(&fixture, "song.mp3", "duration=100\n");
        fixture.enricher.enrich(id).unwrap();
        assert!(matches!(
            fixture.enricher.enrich(id).unwrap(),
            EnrichOutcome::Skipped(TrackStatus::Complete)
        ));
    }
}

//! Sparse song persistence: a human-editable JSON record holding only the
//! events whose switch is on. Loading builds a complete replacement song
//! before touching anything, so a bad file never leaves partial state.

use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::error::{Result, SongParseSnafu, SongReadSnafu, SongVersionSnafu, SongWriteSnafu};
use crate::song::Song;

/// Exact-match format version.
pub const SONG_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct SongFile {
    version: String,
    name: String,
    tempo: i32,
    events: Vec<EventRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventRecord {
    mode: usize,
    pattern: usize,
    track: usize,
    step: usize,
    switch: bool,
    pot0: u8,
    pot1: u8,
    pot2: u8,
    pot3: u8,
}

/// Write `song` to `path` as a sparse record. The file is written to a
/// sibling temp path and renamed into place so a crash cannot leave a
/// truncated song.
pub fn save(song: &Song, path: &Path, name: &str, tempo: i32) -> Result<()> {
    let events: Vec<EventRecord> = song
        .iter_on_events()
        .map(|(mode, pattern, track, step, event)| EventRecord {
            mode,
            pattern,
            track,
            step,
            switch: true,
            pot0: event.get_pot(0),
            pot1: event.get_pot(1),
            pot2: event.get_pot(2),
            pot3: event.get_pot(3),
        })
        .collect();
    let event_count = events.len();
    let file = SongFile {
        version: SONG_FORMAT_VERSION.to_string(),
        name: name.to_string(),
        tempo,
        events,
    };
    let json = serde_json::to_string_pretty(&file).context(SongParseSnafu { path })?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json).context(SongWriteSnafu { path: &tmp })?;
    fs::rename(&tmp, path).context(SongWriteSnafu { path })?;
    info!(
        "[persist] saved '{}' ({} events) to {}",
        name,
        event_count,
        path.display()
    );
    Ok(())
}

/// Read a song from `path`. Returns the rebuilt song plus its name and
/// tempo; the caller swaps it in only on success. Records with out-of-range
/// coordinates are dropped silently, matching the store's write semantics.
pub fn load(path: &Path) -> Result<(Song, String, i32)> {
    let text = fs::read_to_string(path).context(SongReadSnafu { path })?;
    let file: SongFile = serde_json::from_str(&text).context(SongParseSnafu { path })?;
    if file.version != SONG_FORMAT_VERSION {
        return SongVersionSnafu {
            path,
            found: file.version,
            expected: SONG_FORMAT_VERSION,
        }
        .fail();
    }

    let mut song = Song::new();
    for record in &file.events {
        song.with_event_mut(
            record.mode,
            record.pattern,
            record.track,
            record.step,
            |event| {
                event.set_switch(record.switch);
                event.set_pot(0, record.pot0 as i32);
                event.set_pot(1, record.pot1 as i32);
                event.set_pot(2, record.pot2 as i32);
                event.set_pot(3, record.pot3 as i32);
            },
        );
    }
    info!(
        "[persist] loaded '{}' ({} events) from {}",
        file.name,
        file.events.len(),
        path.display()
    );
    Ok((song, file.name, file.tempo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn programmed_song() -> Song {
        let mut song = Song::new();
        for (mode, step, pitch) in [(1, 0, 60), (1, 4, 64), (14, 15, 127)] {
            song.with_event_mut(mode, 0, 0, step, |event| {
                event.set_switch(true);
                event.set_pot(0, pitch);
                event.set_pot(3, 100);
            });
        }
        song
    }

    #[test]
    fn songs_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.json");
        let song = programmed_song();

        save(&song, &path, "test groove", 133).unwrap();
        let (loaded, name, tempo) = load(&path).unwrap();
        assert_eq!(song, loaded);
        assert_eq!("test groove", name);
        assert_eq!(133, tempo);
    }

    #[test]
    fn serialized_form_is_sparse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.json");
        let song = programmed_song();

        save(&song, &path, "sparse", 120).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            song.count_on_events(),
            parsed["events"].as_array().unwrap().len()
        );
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.json");
        fs::write(
            &path,
            r#"{"version":"0.9","name":"old","tempo":120,"events":[]}"#,
        )
        .unwrap();
        match load(&path) {
            Err(Error::SongVersion { found, .. }) => assert_eq!("0.9", found),
            other => panic!("expected version error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn malformed_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.json");
        fs::write(&path, "not a song").unwrap();
        assert!(matches!(load(&path), Err(Error::SongParse { .. })));
    }

    #[test]
    fn out_of_range_records_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.json");
        fs::write(
            &path,
            r#"{"version":"1.0","name":"oob","tempo":120,"events":[
                {"mode":99,"pattern":0,"track":0,"step":0,"switch":true,
                 "pot0":1,"pot1":2,"pot2":3,"pot3":4}]}"#,
        )
        .unwrap();
        let (song, _, _) = load(&path).unwrap();
        assert_eq!(0, song.count_on_events());
    }

    #[test]
    fn empty_song_round_trips_with_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("song.json");
        save(&Song::new(), &path, "empty", 120).unwrap();
        let (song, _, _) = load(&path).unwrap();
        assert_eq!(0, song.count_on_events());
    }
}

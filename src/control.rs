// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! The `start` and `stop` commands and the stop files they manage.
//!
//! `stop` writes `<lock-path>/all.stop` (or `<stanza>.stop`); every
//! mutating command checks for these before acquiring its lock, so an
//! operator can fence off a stanza (or the whole host) from cron-driven
//! activity. `start` removes the file again.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Options;
use crate::{Error, Result};

fn stop_file(lock_path: &Path, stanza: Option<&str>) -> PathBuf {
    match stanza {
        Some(stanza) => lock_path.join(format!("{stanza}.stop")),
        None => lock_path.join("all.stop"),
    }
}

/// Fail with a stop error if this stanza (or everything) is stopped.
pub fn check_stopped(options: &Options) -> Result<()> {
    let all = stop_file(&options.lock_path, None);
    if all.exists() {
        return Err(Error::Stop("all stanzas".into()));
    }
    if let Some(stanza) = &options.stanza {
        if stop_file(&options.lock_path, Some(stanza)).exists() {
            return Err(Error::Stop(stanza.clone()));
        }
    }
    Ok(())
}

/// True when the stanza is explicitly stopped (used by stanza-delete).
pub fn is_stopped(options: &Options, stanza: &str) -> bool {
    stop_file(&options.lock_path, Some(stanza)).exists()
        || stop_file(&options.lock_path, None).exists()
}

/// The `stop` command.
pub fn stop(options: &Options) -> Result<()> {
    std::fs::create_dir_all(&options.lock_path).map_err(|source| Error::FileWrite {
        path: options.lock_path.clone(),
        source,
    })?;
    let path = stop_file(&options.lock_path, options.stanza.as_deref());
    std::fs::write(&path, b"").map_err(|source| Error::FileWrite {
        path: path.clone(),
        source,
    })?;
    info!("wrote stop file {path:?}");
    Ok(())
}

/// The `start` command.
pub fn start(options: &Options) -> Result<()> {
    let path = stop_file(&options.lock_path, options.stanza.as_deref());
    match std::fs::remove_file(&path) {
        Ok(()) => {
            info!("removed stop file {path:?}");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("stop file {path:?} does not exist");
            Ok(())
        }
        Err(source) => Err(Error::FileWrite { path, source }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::ScratchRepo;

    #[test]
    fn stop_then_start_round_trip() {
        let fixture = ScratchRepo::new();
        let options = fixture.options();
        check_stopped(options).unwrap();

        stop(options).unwrap();
        assert_eq!(check_stopped(options).unwrap_err().code(), 56);
        assert!(is_stopped(options, "main"));

        start(options).unwrap();
        check_stopped(options).unwrap();
    }

    #[test]
    fn stop_all_fences_every_stanza() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.stanza = None;
        stop(&options).unwrap();

        let mut other = options.clone();
        other.stanza = Some("other".to_owned());
        assert!(check_stopped(&other).is_err());

        start(&options).unwrap();
        check_stopped(&other).unwrap();
    }
}

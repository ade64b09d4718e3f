//! # Tail command
//!
//! This module provides the long-running command following a log file and
//! printing its lines to the standard output, the way `tail -f` does

use std::{path::Path, time::Duration};

use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::info;

use crate::sidecar::Error;

// -----------------------------------------------------------------------------
// Constants

/// pause before polling the file again once the end is reached
const POLL_INTERVAL: Duration = Duration::from_millis(500);

// -----------------------------------------------------------------------------
// Entrypoint

/// follow the file at the given path forever, the path must already exist
pub async fn run(path: &Path) -> Result<(), Error> {
    if !path.exists() {
        return Err(Error::FileNotFound(path.to_owned()));
    }

    info!(file = path.display().to_string(), "prepare to tail the file");

    let file = File::open(path).await.map_err(Error::Follow)?;
    let mut reader = BufReader::new(file);
    let mut line = String::new();

    loop {
        let read = reader.read_line(&mut line).await.map_err(Error::Follow)?;

        if read == 0 {
            // end of file for now, the writer may append more
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        print!("{}", line);
        line.clear();
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_missing_file_is_an_error() {
        let result = run(Path::new("/definitely/not/a/log/file")).await;

        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }
}

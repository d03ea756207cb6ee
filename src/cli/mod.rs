//! CLI module
//!
//! Operator shim over a session: argument parsing, offline state commands and
//! progress output.

pub mod args;
pub mod offline;
pub mod progress;

pub use args::CliArgs;
pub use offline::{list_downloads, stop_download};
pub use progress::{DownloadStats, ProgressDisplay};

use crate::error::ErrorKind;

/// Process exit status for a failed run
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match ErrorKind::of(err) {
        ErrorKind::NetworkError | ErrorKind::IoError => 2,
        ErrorKind::StateCorruption => 3,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TorrentError;

    #[test]
    fn test_exit_codes() {
        let config: anyhow::Error = TorrentError::config_invalid("bad port").into();
        let bind: anyhow::Error = TorrentError::network_error_with_address("address in use", "0.0.0.0:7762").into();
        let state: anyhow::Error = TorrentError::state_corruption("not JSON", "/s/config").into();
        assert_eq!(exit_code(&config), 1);
        assert_eq!(exit_code(&bind), 2);
        assert_eq!(exit_code(&state), 3);
    }
}

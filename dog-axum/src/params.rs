use std::str::FromStr;

use dog_blob::{RelayResult, TransferMode};
use serde::Deserialize;

/// Query parameters accepted by the file routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferParams {
    /// `stream` or `buffer`; overrides the route's default mode.
    pub mode: Option<String>,
}

impl TransferParams {
    /// The mode for this request. An unknown value is a bad request, not
    /// a silent fallback.
    pub fn mode_or(&self, default: TransferMode) -> RelayResult<TransferMode> {
        match self.mode.as_deref() {
            None | Some("") => Ok(default),
            Some(mode) => TransferMode::from_str(mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_overrides_route_default() {
        let params = TransferParams {
            mode: Some("buffer".into()),
        };
        assert_eq!(params.mode_or(TransferMode::Stream).unwrap(), TransferMode::Buffer);
        assert_eq!(
            TransferParams::default().mode_or(TransferMode::Buffer).unwrap(),
            TransferMode::Buffer
        );
        assert!(TransferParams {
            mode: Some("teleport".into())
        }
        .mode_or(TransferMode::Stream)
        .is_err());
    }
}

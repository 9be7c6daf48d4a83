use std::str::FromStr;

use dog_blob::{BlobConfig, RelayError, RelayResult, TransferMode};
use dog_core::DogConfigSnapshot;
use reqwest::Url;

use crate::PoolConfig;

/// One configured hop: `name=url` or `name=url@mode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopSpec {
    pub name: String,
    pub url: Url,
    /// Pinned mode for this hop; `None` follows the request.
    pub mode: Option<TransferMode>,
}

impl FromStr for HopSpec {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| RelayError::invalid(format!("hop `{s}` must look like name=url[@mode]")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(RelayError::invalid(format!("hop `{s}` has no name")));
        }

        // `@` may legitimately appear in a URL's userinfo, so only a
        // trailing `@stream`/`@buffer` is read as a mode.
        let (url, mode) = match rest.rsplit_once('@') {
            Some((url, mode)) if mode.trim().parse::<TransferMode>().is_ok() => {
                (url, Some(mode.trim().parse::<TransferMode>()?))
            }
            _ => (rest, None),
        };

        let url = Url::parse(url.trim())
            .map_err(|e| RelayError::invalid(format!("hop `{name}` has a bad url: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            url,
            mode,
        })
    }
}

/// Everything a relay node needs besides its backing store.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Mode used by streaming download routes.
    pub mode: TransferMode,
    pub hops: Vec<HopSpec>,
    pub pool: PoolConfig,
    pub blob: BlobConfig,
    /// Disposition every hop stamps on outbound metadata.
    pub disposition: Option<String>,
}

impl RelayConfig {
    /// Read the `relay.*` keys.
    pub fn from_snapshot(config: &DogConfigSnapshot) -> RelayResult<Self> {
        let mode = match config.get("relay.mode") {
            Some(mode) => mode.parse()?,
            None => TransferMode::default(),
        };
        let hops = config
            .get_list("relay.hops")
            .iter()
            .map(|h| h.parse())
            .collect::<RelayResult<Vec<HopSpec>>>()?;

        Ok(Self {
            mode,
            hops,
            pool: PoolConfig::from_snapshot(config),
            blob: BlobConfig::from_snapshot(config),
            disposition: config.get_string("relay.disposition"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dog_core::DogConfig;

    #[test]
    fn parses_hop_specs() {
        let hop: HopSpec = "edge=http://10.0.0.2:3030/api/files/relay".parse().unwrap();
        assert_eq!(hop.name, "edge");
        assert_eq!(hop.url.as_str(), "http://10.0.0.2:3030/api/files/relay");
        assert_eq!(hop.mode, None);

        let pinned: HopSpec = "core = http://core:3030/api/files/relay@buffer".parse().unwrap();
        assert_eq!(pinned.name, "core");
        assert_eq!(pinned.mode, Some(TransferMode::Buffer));

        let userinfo: HopSpec = "auth=http://user@host:1/relay".parse().unwrap();
        assert_eq!(userinfo.url.username(), "user");
        assert_eq!(userinfo.mode, None);

        assert!("no-url".parse::<HopSpec>().is_err());
        assert!("=http://x/".parse::<HopSpec>().is_err());
        assert!("x=not a url".parse::<HopSpec>().is_err());
    }

    #[test]
    fn reads_relay_keys() {
        let mut config = DogConfig::new();
        config.set("relay.mode", "buffer");
        config.set("relay.hops", "a=http://a:1/relay, b=http://b:2/relay@stream");
        config.set("relay.disposition", "inline");

        let relay = RelayConfig::from_snapshot(&config.snapshot()).unwrap();
        assert_eq!(relay.mode, TransferMode::Buffer);
        assert_eq!(relay.hops.len(), 2);
        assert_eq!(relay.hops[1].mode, Some(TransferMode::Stream));
        assert_eq!(relay.disposition.as_deref(), Some("inline"));
    }

    #[test]
    fn bad_mode_is_rejected() {
        let mut config = DogConfig::new();
        config.set("relay.mode", "sideways");
        assert!(RelayConfig::from_snapshot(&config.snapshot()).is_err());
    }
}

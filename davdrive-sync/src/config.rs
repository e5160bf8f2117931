const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// Engine knobs, overridable through `DAVDRIVE_*` environment variables.
///
/// Bandwidth limits are signed per direction: `0` = unlimited, `> 0` =
/// bytes/sec, strictly between -100 and 0 = percent of the measured line
/// rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub upload_limit: i64,
    pub download_limit: i64,
    pub chunk_size: u64,
    /// When a MOVE succeeds but the follow-up metadata refresh fails,
    /// finish the item `SoftError` (retry metadata next run) instead of
    /// `NormalError`.
    pub soft_rename_metadata: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_limit: 0,
            download_limit: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            soft_rename_metadata: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            upload_limit: parse_i64(
                "DAVDRIVE_UPLOAD_LIMIT",
                std::env::var("DAVDRIVE_UPLOAD_LIMIT").ok(),
                defaults.upload_limit,
            )?,
            download_limit: parse_i64(
                "DAVDRIVE_DOWNLOAD_LIMIT",
                std::env::var("DAVDRIVE_DOWNLOAD_LIMIT").ok(),
                defaults.download_limit,
            )?,
            chunk_size: parse_chunk_size(
                std::env::var("DAVDRIVE_CHUNK_SIZE").ok(),
                defaults.chunk_size,
            )?,
            soft_rename_metadata: parse_bool(
                "DAVDRIVE_SOFT_RENAME_METADATA",
                std::env::var("DAVDRIVE_SOFT_RENAME_METADATA").ok(),
                defaults.soft_rename_metadata,
            )?,
        })
    }
}

fn parse_i64(name: &str, value: Option<String>, default: i64) -> anyhow::Result<i64> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be an integer, got {raw:?}")),
    }
}

fn parse_chunk_size(value: Option<String>, default: u64) -> anyhow::Result<u64> {
    match value {
        None => Ok(default),
        Some(raw) => match raw.parse::<u64>() {
            Ok(size) if size > 0 => Ok(size),
            _ => anyhow::bail!("DAVDRIVE_CHUNK_SIZE must be a positive integer, got {raw:?}"),
        },
    }
}

fn parse_bool(name: &str, value: Option<String>, default: bool) -> anyhow::Result<bool> {
    match value.as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(raw) => anyhow::bail!("{name} must be a boolean, got {raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_unlimited_with_ten_mib_chunks() {
        let config = EngineConfig::default();
        assert_eq!(config.upload_limit, 0);
        assert_eq!(config.download_limit, 0);
        assert_eq!(config.chunk_size, 10 * 1024 * 1024);
        assert!(config.soft_rename_metadata);
    }

    #[test]
    fn integer_values_parse_or_fail_loudly() {
        assert_eq!(parse_i64("X", None, 7).unwrap(), 7);
        assert_eq!(parse_i64("X", Some("-50".into()), 0).unwrap(), -50);
        assert!(parse_i64("X", Some("fast".into()), 0).is_err());
    }

    #[test]
    fn chunk_size_must_be_positive() {
        assert_eq!(parse_chunk_size(Some("1024".into()), 1).unwrap(), 1024);
        assert!(parse_chunk_size(Some("0".into()), 1).is_err());
    }

    #[test]
    fn booleans_accept_the_usual_spellings() {
        assert!(parse_bool("X", Some("yes".into()), false).unwrap());
        assert!(!parse_bool("X", Some("0".into()), true).unwrap());
        assert!(parse_bool("X", Some("maybe".into()), true).is_err());
    }
}

//! Configuration handed to the applier by the owning storage driver.

use std::collections::HashMap;
use std::path::PathBuf;

use strata_toc::FileMetadata;

use crate::error::ApplyError;

/// Pull option enabling partial pulls at all.
pub const OPTION_ENABLE_PARTIAL_IMAGES: &str = "enable_partial_images";
/// Pull option enabling the raw→chunked conversion fallback.
pub const OPTION_CONVERT_IMAGES: &str = "convert_images";
/// Pull option enabling hard-link deduplication against prior layers.
pub const OPTION_USE_HARD_LINKS: &str = "use_hard_links";
/// Pull option listing object repositories to deduplicate from.
pub const OPTION_OSTREE_REPOS: &str = "ostree_repos";

/// Map-like store configuration, as read from the storage driver's
/// `pull_options` table.
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    pull_options: HashMap<String, String>,
}

impl StoreOptions {
    /// Wraps a pull-option table.
    pub fn new(pull_options: HashMap<String, String>) -> Self {
        Self { pull_options }
    }

    /// Reads a boolean pull option. Only the case-insensitive string
    /// `"true"` enables an option; a missing key yields `default`.
    pub fn bool_option(&self, name: &str, default: bool) -> bool {
        match self.pull_options.get(name) {
            Some(value) => value.eq_ignore_ascii_case("true"),
            None => default,
        }
    }

    /// The configured object repositories, from the colon-separated
    /// `ostree_repos` option.
    pub fn object_repos(&self) -> Vec<PathBuf> {
        self.pull_options
            .get(OPTION_OSTREE_REPOS)
            .map(|value| {
                value
                    .split(':')
                    .filter(|part| !part.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// One range of a uid or gid mapping between host and container ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// First id inside the container.
    pub container_id: u32,
    /// First id on the host.
    pub host_id: u32,
    /// Number of ids covered by this range.
    pub size: u32,
}

/// Maps a host id to its container-side counterpart.
fn to_container(maps: &[IdMap], id: u32) -> Option<u32> {
    maps.iter()
        .find(|m| id >= m.host_id && id - m.host_id < m.size)
        .map(|m| m.container_id + (id - m.host_id))
}

/// A fixed owner forced onto every entry, overriding the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChownOverride {
    /// User id to assign.
    pub uid: u32,
    /// Group id to assign.
    pub gid: u32,
}

/// Filesystem operations the applier offers to a whiteout converter. All
/// paths are resolved under the destination root.
pub trait WhiteoutOps {
    /// Sets an extended attribute on `path`, creating it as a directory if
    /// missing.
    fn set_xattr(&mut self, path: &str, name: &str, value: &[u8]) -> Result<(), ApplyError>;

    /// Creates a device node at `path`.
    fn mknod(&mut self, path: &str, mode: u32, dev: u64) -> Result<(), ApplyError>;

    /// Changes the owner of `path`.
    fn chown(&mut self, path: &str, uid: u32, gid: u32) -> Result<(), ApplyError>;
}

/// Translates whiteout entries into the backing filesystem's native
/// encoding. The policy lives with the storage driver; the applier only
/// provides the mechanism through [`WhiteoutOps`].
pub trait WhiteoutConverter: Send + Sync {
    /// Offers an entry to the converter. Returns `false` when the entry was
    /// fully handled and must not be materialized as a file.
    fn convert(&self, meta: &FileMetadata, ops: &mut dyn WhiteoutOps) -> Result<bool, ApplyError>;
}

/// Options equivalent to the ones accepted by a tar unpacker, controlling
/// ownership and mode handling.
#[derive(Default)]
pub struct TarOptions {
    /// Uid mappings from host to container.
    pub uid_maps: Vec<IdMap>,
    /// Gid mappings from host to container.
    pub gid_maps: Vec<IdMap>,
    /// Forces this owner on every entry.
    pub chown: Option<ChownOverride>,
    /// Suppresses chown failures instead of aborting.
    pub ignore_chown_errors: bool,
    /// Forces this mode on every inode, stashing the original owner/mode in
    /// an extended attribute.
    pub force_mask: Option<u32>,
    /// Converts whiteout entries for the backing filesystem.
    pub whiteout_converter: Option<Box<dyn WhiteoutConverter>>,
}

impl TarOptions {
    /// Rewrites entry ownership according to the chown override or the
    /// configured id mappings.
    pub(crate) fn remap_entries(&self, entries: &mut [FileMetadata]) -> Result<(), ApplyError> {
        if self.chown.is_none() && (self.uid_maps.is_empty() || self.gid_maps.is_empty()) {
            return Ok(());
        }
        for entry in entries {
            if let Some(chown) = self.chown {
                entry.uid = chown.uid;
                entry.gid = chown.gid;
            } else {
                let unmapped = ApplyError::IdNotMapped {
                    uid: entry.uid,
                    gid: entry.gid,
                };
                entry.uid = to_container(&self.uid_maps, entry.uid).ok_or(unmapped)?;
                entry.gid = to_container(&self.gid_maps, entry.gid).ok_or_else(|| {
                    ApplyError::IdNotMapped {
                        uid: entry.uid,
                        gid: entry.gid,
                    }
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("true", true)]
    #[case("TRUE", true)]
    #[case("True", true)]
    #[case("false", false)]
    #[case("1", false)]
    #[case("yes", false)]
    fn test_bool_option_accepts_only_true(#[case] value: &str, #[case] expected: bool) {
        let opts = StoreOptions::new(
            [("enable_partial_images".to_owned(), value.to_owned())].into(),
        );
        assert_eq!(opts.bool_option(OPTION_ENABLE_PARTIAL_IMAGES, false), expected);
    }

    #[test]
    fn test_bool_option_default() {
        let opts = StoreOptions::default();
        assert!(opts.bool_option(OPTION_ENABLE_PARTIAL_IMAGES, true));
        assert!(!opts.bool_option(OPTION_CONVERT_IMAGES, false));
    }

    #[test]
    fn test_object_repos_split() {
        let opts = StoreOptions::new(
            [("ostree_repos".to_owned(), "/repo/a:/repo/b:".to_owned())].into(),
        );
        assert_eq!(
            opts.object_repos(),
            vec![PathBuf::from("/repo/a"), PathBuf::from("/repo/b")]
        );
    }

    #[test]
    fn test_remap_entries_with_maps() {
        let options = TarOptions {
            uid_maps: vec![IdMap {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            gid_maps: vec![IdMap {
                container_id: 0,
                host_id: 100000,
                size: 65536,
            }],
            ..TarOptions::default()
        };
        let mut entries = vec![FileMetadata::regular("a", 0, None)];
        entries[0].uid = 100123;
        entries[0].gid = 100456;
        options.remap_entries(&mut entries).unwrap();
        assert_eq!(entries[0].uid, 123);
        assert_eq!(entries[0].gid, 456);
    }

    #[test]
    fn test_remap_entries_unmapped_id_fails() {
        let options = TarOptions {
            uid_maps: vec![IdMap {
                container_id: 0,
                host_id: 0,
                size: 1000,
            }],
            gid_maps: vec![IdMap {
                container_id: 0,
                host_id: 0,
                size: 1000,
            }],
            ..TarOptions::default()
        };
        let mut entries = vec![FileMetadata::regular("a", 0, None)];
        entries[0].uid = 4242;
        assert!(options.remap_entries(&mut entries).is_err());
    }

    #[test]
    fn test_chown_override_wins() {
        let options = TarOptions {
            chown: Some(ChownOverride { uid: 7, gid: 8 }),
            ..TarOptions::default()
        };
        let mut entries = vec![FileMetadata::regular("a", 0, None)];
        entries[0].uid = 1000;
        options.remap_entries(&mut entries).unwrap();
        assert_eq!((entries[0].uid, entries[0].gid), (7, 8));
    }
}

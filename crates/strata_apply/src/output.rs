//! The record handed back to the storage driver after a successful apply.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strata_digest::ContentDigest;
use strata_toc::Toc;

/// Big-data key under which the raw manifest blob is stored.
pub const MANIFEST_BIG_DATA_KEY: &str = "zstd-chunked-manifest";

/// Big-data key under which the layer-data record is stored.
pub const LAYER_DATA_BIG_DATA_KEY: &str = "zstd-chunked-layer-data";

/// The on-disk layout the driver asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// The layer tree as described by the manifest.
    #[default]
    Dir,
    /// A flat tree of regular files named by content digest, for drivers
    /// that assemble the final tree themselves.
    Flat,
}

/// Additional information about the produced layer, persisted alongside the
/// manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LayerData {
    pub format: OutputFormat,
}

/// Everything the apply produced besides the tree itself.
#[derive(Debug, Default)]
pub struct ApplyOutput {
    /// Uids referenced by the layer, before any remapping.
    pub uids: Vec<u32>,
    /// Gids referenced by the layer, before any remapping.
    pub gids: Vec<u32>,
    /// Total uncompressed size of the layer's files.
    pub size: u64,
    /// The tar-split stream letting consumers rebuild the original tar.
    pub tar_split: Vec<u8>,
    /// Opaque blobs for the driver to persist with the layer.
    pub big_data: HashMap<String, Vec<u8>>,
    /// The parsed table of contents.
    pub toc: Option<Toc>,
    /// Digest of the table of contents, when the layer was pulled partially.
    pub toc_digest: Option<ContentDigest>,
    /// Digest of the uncompressed layer; only known on the conversion path,
    /// where the whole stream passes through the applier.
    pub uncompressed_digest: Option<ContentDigest>,
    /// Per-file attestation digests, keyed by entry path.
    pub verity_digests: HashMap<String, String>,
    /// Mode of the layer root directory, when the manifest carries one.
    pub root_dir_mode: Option<u32>,
}

impl ApplyOutput {
    /// Serializes the layer-data record for [`LAYER_DATA_BIG_DATA_KEY`].
    pub(crate) fn layer_data_json(format: OutputFormat) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&LayerData { format })
    }
}

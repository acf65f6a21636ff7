//! Capacity planning for ext4 images.
//!
//! Picks the format parameters mke2fs would use for the declared final image
//! size, then checks that the content tree plus reserve, journal and inode
//! table fits. All divisions round up.

pub mod image;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use walkdir::WalkDir;

use crate::error::BuildError;

/// Declared image size when a layer sets none (16 GiB).
pub const DEFAULT_IMAGE_SIZE: u64 = 17_179_869_184;

/// Extra room on top of the tree, in percent of its blocks.
pub const DEFAULT_RESERVE_PERCENT: u64 = 10;

/// One row of the mke2fs size classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Category {
    pub id: u8,
    pub min_size: u64,
    /// Inclusive upper bound; `None` is unbounded.
    pub max_size: Option<u64>,
    pub usage: &'static str,
    pub block_size: u64,
    pub inode_ratio: u64,
    pub inode_size: u64,
    pub journal_blocks: u64,
}

const fn row(
    id: u8,
    min_size: u64,
    max_size: Option<u64>,
    usage: &'static str,
    inode_ratio: u64,
    inode_size: u64,
    journal_blocks: u64,
) -> Category {
    Category {
        id,
        min_size,
        max_size,
        usage,
        block_size: 4096,
        inode_ratio,
        inode_size,
        journal_blocks,
    }
}

pub const CATEGORIES: [Category; 11] = [
    row(1, 65_536, Some(2_097_151), "floppy", 8192, 128, 0),
    row(2, 2_097_152, Some(3_145_727), "floppy", 8192, 128, 1024),
    row(3, 3_145_728, Some(33_554_431), "small", 4096, 128, 1024),
    row(4, 33_554_432, Some(268_435_455), "small", 4096, 128, 4096),
    row(5, 268_435_456, Some(536_870_911), "small", 4096, 128, 8192),
    row(6, 536_870_912, Some(1_073_741_823), "default", 16384, 256, 4096),
    row(7, 1_073_741_824, Some(2_147_483_647), "default", 16384, 256, 8192),
    row(8, 2_147_483_648, Some(4_294_967_295), "default", 16384, 256, 16384),
    row(9, 4_294_967_296, Some(4_398_046_511_103), "default", 16384, 256, 32768),
    row(10, 4_398_046_511_104, Some(17_592_186_044_415), "big", 32768, 256, 32768),
    row(11, 17_592_186_044_416, None, "huge", 65536, 256, 32768),
];

impl Category {
    fn contains(&self, size: u64) -> bool {
        size >= self.min_size && self.max_size.map_or(true, |max| size <= max)
    }
}

/// Category whose inclusive range holds `declared_size`.
pub fn select_category(declared_size: u64) -> Result<&'static Category> {
    CATEGORIES
        .iter()
        .find(|c| c.contains(declared_size))
        .ok_or_else(|| {
            BuildError::Capacity(format!(
                "ImageSize '{}'B is below the smallest supported ext4 image ({}B)",
                declared_size, CATEGORIES[0].min_size
            ))
            .into()
        })
}

/// Validated format parameters for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePlan {
    pub category: Category,
    pub declared_size: u64,
    pub tree_blocks: u64,
    pub reserve_percent: u64,
    pub inode_count: u64,
    pub inode_blocks: u64,
    pub total_blocks: u64,
}

impl ImagePlan {
    pub fn block_size(&self) -> u64 {
        self.category.block_size
    }

    pub fn required_bytes(&self) -> u64 {
        self.total_blocks * self.block_size()
    }

    pub fn tree_bytes(&self) -> u64 {
        self.tree_blocks * self.block_size()
    }

    /// Reserve, journal and inode table, in bytes.
    pub fn metadata_bytes(&self) -> u64 {
        self.required_bytes() - self.tree_bytes()
    }

    /// Journal size as passed to `mke2fs -J size=`.
    pub fn journal_size_mib(&self) -> u64 {
        div_ceil(self.category.journal_blocks * self.block_size(), 1024 * 1024)
    }
}

fn div_ceil(value: u64, divisor: u64) -> u64 {
    value / divisor + u64::from(value % divisor != 0)
}

/// Blocks needed for `tree_blocks` of content under `category`, before any
/// feasibility check. Returns `(total_blocks, inode_count, inode_blocks)`.
pub fn required_blocks(tree_blocks: u64, category: &Category, reserve_percent: u64) -> (u64, u64, u64) {
    let mut total = div_ceil(tree_blocks * (100 + reserve_percent), 100);
    // Twice the journal: an empty tree otherwise yields an image too small to hold one.
    total += 2 * category.journal_blocks;
    let inodes = div_ceil(total * category.block_size, category.inode_ratio);
    let inode_blocks = div_ceil(inodes * category.inode_size, category.block_size);
    (total + inode_blocks, inodes, inode_blocks)
}

/// Plan an image for a tree of `tree_blocks` and a declared size.
///
/// Fails with [`BuildError::Capacity`] naming the overage when the result
/// does not fit; nothing has been allocated at that point.
pub fn plan(tree_blocks: u64, declared_size: u64, reserve_percent: u64) -> Result<ImagePlan> {
    let category = *select_category(declared_size)?;
    let (total_blocks, inode_count, inode_blocks) =
        required_blocks(tree_blocks, &category, reserve_percent);

    let plan = ImagePlan {
        category,
        declared_size,
        tree_blocks,
        reserve_percent,
        inode_count,
        inode_blocks,
        total_blocks,
    };

    tracing::debug!(
        "capacity: category {} ({}), tree {} blocks, total {} blocks of {}B",
        category.id,
        category.usage,
        tree_blocks,
        total_blocks,
        category.block_size
    );

    if plan.required_bytes() > declared_size {
        return Err(BuildError::Capacity(format!(
            "tree size '{}'B + metadata size '{}'B is larger than ImageSize '{}'B by '{}'B",
            plan.tree_bytes(),
            plan.metadata_bytes(),
            declared_size,
            plan.required_bytes() - declared_size
        ))
        .into());
    }

    Ok(plan)
}

/// Count the blocks a tree occupies.
///
/// Every entry below `root` (files, directories, symlinks, by `lstat` size)
/// is rounded up to whole blocks. Hardlinked inodes are counted once.
pub fn tree_blocks(root: &Path, block_size: u64) -> Result<u64> {
    let mut seen_links: HashSet<(u64, u64)> = HashSet::new();
    let mut blocks = 0u64;

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        let meta = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("Failed to stat {}", entry.path().display()))?;

        if meta.nlink() > 1 && !meta.is_dir() && !seen_links.insert((meta.dev(), meta.ino())) {
            continue;
        }
        blocks += div_ceil(meta.len(), block_size);
    }

    Ok(blocks)
}

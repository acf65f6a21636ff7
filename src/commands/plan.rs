//! Plan command - capacity plan for an existing tree, nothing allocated.

use anyhow::Result;
use std::path::Path;

use crate::capacity::{self, image};

/// Print the image plan for `tree` at `image_size` bytes.
pub fn cmd_plan(tree: &Path, image_size: u64, reserve_percent: u64) -> Result<()> {
    let category = capacity::select_category(image_size)?;
    let blocks = capacity::tree_blocks(tree, category.block_size)?;
    let plan = capacity::plan(blocks, image_size, reserve_percent)?;

    println!("Capacity plan for {}:", tree.display());
    println!("  Category:        {} ({})", plan.category.id, plan.category.usage);
    println!("  Block size:      {}", plan.block_size());
    println!("  Inode ratio:     {}", plan.category.inode_ratio);
    println!("  Inode size:      {}", plan.category.inode_size);
    println!("  Journal:         {} blocks ({} MiB)", plan.category.journal_blocks, plan.journal_size_mib());
    println!("  Tree blocks:     {}", plan.tree_blocks);
    println!("  Reserve:         {}%", plan.reserve_percent);
    println!("  Inodes:          {} ({} blocks)", plan.inode_count, plan.inode_blocks);
    println!("  Total blocks:    {}", plan.total_blocks);
    println!("  Required:        {} of {} bytes", plan.required_bytes(), image_size);

    let version = image::e2fsprogs_version();
    let args = image::mke2fs_args(&plan, Path::new("<image>"), version.as_deref());
    println!("\n  mke2fs {}", args.join(" "));
    Ok(())
}

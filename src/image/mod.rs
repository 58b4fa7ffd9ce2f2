//! Disk image construction pipeline.
//!
//! create → partition → (map, format, mount) → populate → instrument → patch
//! → release. Everything after partitioning happens inside one mount scope.

mod create;
pub mod edit;
pub mod populate;

pub use create::{create_image, format_partition, partition, FDISK_SCRIPT};
pub use populate::{inject_instrumentation, patch_filesystem, populate, Instrumentation};

use crate::archive::RootfsArchive;
use crate::error::{Error, Stage};
use crate::mount::MountManager;
use anyhow::Result;
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};

/// Default image file name inside the work directory.
pub const IMAGE_NAME: &str = "image.raw";

/// Everything the pipeline needs besides the mount manager.
pub struct ImageRecipe<'a> {
    pub archive: &'a dyn RootfsArchive,
    pub instrumentation: Instrumentation,
    pub busybox: PathBuf,
    pub fix_script: PathBuf,
    pub size_bytes: u64,
}

fn stage<T>(stage: Stage, result: Result<T>) -> Result<T> {
    result.map_err(|e| Error::pipeline(stage, e).into())
}

/// Leave stage errors alone, tag anything else as a mount failure.
fn mount_stage<T>(result: Result<T>) -> Result<T> {
    result.map_err(|e| {
        if matches!(e.downcast_ref::<Error>(), Some(Error::Pipeline { .. })) {
            e
        } else {
            Error::pipeline(Stage::Mount, e).into()
        }
    })
}

fn fill(root: &Path, recipe: &ImageRecipe<'_>) -> Result<()> {
    stage(Stage::Populate, populate(root, recipe.archive))?;
    stage(
        Stage::Instrument,
        inject_instrumentation(root, &recipe.instrumentation),
    )?;
    stage(
        Stage::Patch,
        patch_filesystem(root, &recipe.busybox, &recipe.fix_script),
    )
}

/// Build a bootable image at `image`. On failure the partial image file is
/// removed.
pub fn build_image(
    mounts: &mut MountManager,
    recipe: &ImageRecipe<'_>,
    image: &Path,
    work_dir: &Path,
) -> Result<()> {
    info!("building image {} from {}", image.display(), recipe.archive.source().display());

    let result = build_steps(mounts, recipe, image, work_dir);
    if result.is_err() && image.exists() {
        if let Err(e) = fs::remove_file(image) {
            warn!("removing partial image {}: {}", image.display(), e);
        }
    }
    result
}

fn build_steps(
    mounts: &mut MountManager,
    recipe: &ImageRecipe<'_>,
    image: &Path,
    work_dir: &Path,
) -> Result<()> {
    stage(Stage::CreateImage, create_image(image, recipe.size_bytes))?;
    stage(Stage::Partition, partition(image))?;
    mount_stage(mounts.with_fresh_mount(image, work_dir, |handle| {
        fill(&handle.mount_point, recipe)
    }))?;
    info!("image ready: {}", image.display());
    Ok(())
}

/// Repeat populate → instrument → patch on an already partitioned image.
pub fn reinstrument(
    mounts: &mut MountManager,
    recipe: &ImageRecipe<'_>,
    image: &Path,
    work_dir: &Path,
) -> Result<()> {
    mount_stage(mounts.with_mount(image, work_dir, |handle| {
        fill(&handle.mount_point, recipe)
    }))
}

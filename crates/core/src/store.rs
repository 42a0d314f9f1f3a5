//! Output storage: an n-dimensional f32 store that lives either in memory
//! or in a memory-mapped file inside a cache directory, plus the scoped
//! cache-directory resource itself.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn, SliceInfoElem};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::ExecError;

/// Stores above this size go to disk even without a caller-supplied cache
/// directory.
pub const IN_MEMORY_LIMIT_BYTES: usize = 512 << 20;

/// Scratch space for disk-backed stores.
///
/// A caller-supplied directory is cleared of stale entries up front and
/// retained after the run; an anonymous scratch directory is removed on
/// every exit path when this value drops.
#[derive(Debug)]
pub enum CacheDir {
    Scratch(TempDir),
    User(PathBuf),
}

impl CacheDir {
    pub fn prepare(user_dir: Option<&Path>) -> Result<Self, ExecError> {
        match user_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                clear_directory(dir)?;
                Ok(CacheDir::User(dir.to_path_buf()))
            }
            None => Ok(CacheDir::Scratch(TempDir::with_prefix("tessera-cache-")?)),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            CacheDir::Scratch(dir) => dir.path(),
            CacheDir::User(path) => path,
        }
    }

    pub fn is_user_supplied(&self) -> bool {
        matches!(self, CacheDir::User(_))
    }
}

fn clear_directory(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(error) = removed {
            warn!(path = %path.display(), %error, "Failed to clear stale cache entry");
        }
    }
    Ok(())
}

/// An n-dimensional f32 result store.
#[derive(Debug)]
pub enum OutputStore {
    Memory(ArrayD<f32>),
    Disk(DiskStore),
}

/// File-mapped store. The backing file is removed when the store drops.
#[derive(Debug)]
pub struct DiskStore {
    map: MmapMut,
    shape: Vec<usize>,
    path: PathBuf,
    _file: File,
}

impl OutputStore {
    /// Allocates a zeroed store for `shape`, going to disk when a
    /// user-supplied cache directory is in play or the store would exceed
    /// the in-memory limit.
    pub fn allocate(shape: &[usize], cache: &CacheDir, tag: &str) -> Result<Self, ExecError> {
        let elements: usize = shape.iter().product();
        let bytes = elements * std::mem::size_of::<f32>();
        if cache.is_user_supplied() || bytes > IN_MEMORY_LIMIT_BYTES {
            let path = cache.path().join(format!("{tag}.f32"));
            debug!(path = %path.display(), bytes, "Allocating disk-backed output store");
            Ok(OutputStore::Disk(DiskStore::create(&path, shape, bytes)?))
        } else {
            Ok(OutputStore::Memory(ArrayD::zeros(IxDyn(shape))))
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            OutputStore::Memory(array) => array.shape(),
            OutputStore::Disk(store) => &store.shape,
        }
    }

    pub fn view(&self) -> ArrayViewD<'_, f32> {
        match self {
            OutputStore::Memory(array) => array.view(),
            OutputStore::Disk(store) => store.view(),
        }
    }

    pub fn view_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        match self {
            OutputStore::Memory(array) => array.view_mut(),
            OutputStore::Disk(store) => store.view_mut(),
        }
    }

    /// Writes `block` at the region whose low corner is `starts`.
    pub fn assign_region(&mut self, starts: &[usize], block: &ArrayViewD<'_, f32>) {
        let slices: Vec<SliceInfoElem> = starts
            .iter()
            .zip(block.shape())
            .map(|(&start, &len)| SliceInfoElem::Slice {
                start: start as isize,
                end: Some((start + len) as isize),
                step: 1,
            })
            .collect();
        let mut view = self.view_mut();
        view.slice_collapse(slices.as_slice());
        view.assign(block);
    }
}

impl DiskStore {
    fn create(path: &Path, shape: &[usize], bytes: usize) -> Result<Self, ExecError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        // A zero-length mapping is rejected by the OS.
        file.set_len(bytes.max(std::mem::size_of::<f32>()) as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            map,
            shape: shape.to_vec(),
            path: path.to_path_buf(),
            _file: file,
        })
    }

    fn view(&self) -> ArrayViewD<'_, f32> {
        let ptr = self.map.as_ptr() as *const f32;
        // The mapping is page-aligned and sized for the shape at creation.
        unsafe { ArrayViewD::from_shape_ptr(IxDyn(&self.shape), ptr) }
    }

    fn view_mut(&mut self) -> ArrayViewMutD<'_, f32> {
        let ptr = self.map.as_mut_ptr() as *mut f32;
        unsafe { ArrayViewMutD::from_shape_ptr(IxDyn(&self.shape), ptr) }
    }
}

impl Drop for DiskStore {
    fn drop(&mut self) {
        if let Err(error) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %error, "Failed to remove output store file");
        }
    }
}

/// A finished output: the store plus the extents it should be read at
/// (expansion introduced during fitting and grid coverage cropped away).
#[derive(Debug)]
pub struct CompletedOutput {
    name: String,
    store: OutputStore,
    crop: Vec<usize>,
}

impl CompletedOutput {
    pub(crate) fn new(name: String, store: OutputStore, crop: Vec<usize>) -> Self {
        Self { name, store, crop }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.crop
    }

    /// Cropped read view. Disk-backed stores are read in place; nothing is
    /// copied until the caller asks for an owned array.
    pub fn view(&self) -> ArrayViewD<'_, f32> {
        let slices: Vec<SliceInfoElem> = self
            .crop
            .iter()
            .map(|&len| SliceInfoElem::Slice {
                start: 0,
                end: Some(len as isize),
                step: 1,
            })
            .collect();
        let mut view = self.store.view();
        view.slice_collapse(slices.as_slice());
        view
    }

    pub fn to_array(&self) -> ArrayD<f32> {
        self.view().to_owned()
    }
}
